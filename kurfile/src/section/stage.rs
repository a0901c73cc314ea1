//! Pieces of the `train`/`validate`/`test`/`evaluate` sections.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{KurfileError, Result};
use crate::value::Value;

/// One entry of a `data` list: a supplier kind and its resolved settings.
#[derive(Serialize, Clone, PartialEq, Eq, Debug)]
pub struct DataSource {
    pub supplier: String,
    pub config: Value,
}

impl DataSource {
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Map(map) if map.len() == 1 => {
                let (supplier, config) = map.into_iter().next().ok_or_else(|| {
                    KurfileError::malformed("data source has no supplier")
                })?;
                Ok(Self { supplier, config })
            }
            Value::Map(map) => Err(KurfileError::malformed(format!(
                "data source must name exactly one supplier, found {}",
                map.len()
            ))),
            other => Err(KurfileError::malformed(format!(
                "data source must be a mapping, found {}",
                other.type_name()
            ))),
        }
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.config.pointer(key)
    }
}

/// Batch provider settings. Local additions such as `sortagrad` sit
/// alongside the fields inherited from a shared definition.
#[derive(Serialize, Clone, PartialEq, Eq, Debug, Default)]
#[serde(transparent)]
pub struct ProviderConfig {
    fields: BTreeMap<String, Value>,
}

impl ProviderConfig {
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Map(fields) => Ok(Self { fields }),
            other => Err(KurfileError::malformed(format!(
                "provider must be a mapping, found {}",
                other.type_name()
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn batch_size(&self) -> Option<u64> {
        self.get("batch_size").and_then(|v| v.get_as::<u64>())
    }

    pub fn force_batch_size(&self) -> bool {
        self.get("force_batch_size")
            .and_then(|v| v.get_as::<bool>())
            .unwrap_or(false)
    }

    pub fn sortagrad(&self) -> Option<&str> {
        self.get("sortagrad").and_then(Value::as_str)
    }
}

#[derive(Serialize, Clone, PartialEq, Eq, Debug, Default)]
pub struct WeightsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<String>,
    pub must_exist: bool,
}

impl WeightsConfig {
    /// A bare path is read as both the initial and the best weights.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(path) => Ok(Self {
                initial: Some(path.clone()),
                best: Some(path),
                ..Self::default()
            }),
            Value::Map(mut map) => {
                let mut path = |key: &str| -> Result<Option<String>> {
                    match map.remove(key) {
                        None | Some(Value::Null) => Ok(None),
                        Some(Value::String(path)) => Ok(Some(path)),
                        Some(other) => Err(KurfileError::malformed(format!(
                            "weights `{}` must be a path, found {}",
                            key,
                            other.type_name()
                        ))),
                    }
                };
                let initial = path("initial")?;
                let best = path("best")?;
                let last = path("last")?;
                let must_exist = match map.remove("must_exist") {
                    None => false,
                    Some(flag) => flag.get_as::<bool>().ok_or_else(|| {
                        KurfileError::malformed("weights `must_exist` must be a boolean")
                    })?,
                };
                if let Some(unknown) = map.keys().next() {
                    return Err(KurfileError::malformed(format!(
                        "weights has unknown field `{}`",
                        unknown
                    )));
                }
                Ok(Self {
                    initial,
                    best,
                    last,
                    must_exist,
                })
            }
            other => Err(KurfileError::malformed(format!(
                "weights must be a path or a mapping, found {}",
                other.type_name()
            ))),
        }
    }
}

#[derive(Serialize, Clone, PartialEq, Eq, Debug)]
pub struct OptimizerConfig {
    pub name: String,
    #[serde(flatten)]
    pub params: BTreeMap<String, Value>,
}

impl OptimizerConfig {
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(name) => Ok(Self {
                name,
                params: BTreeMap::new(),
            }),
            Value::Map(mut params) => match params.remove("name") {
                Some(Value::String(name)) => Ok(Self { name, params }),
                Some(other) => Err(KurfileError::malformed(format!(
                    "optimizer `name` must be a string, found {}",
                    other.type_name()
                ))),
                None => Err(KurfileError::malformed("optimizer is missing `name`")),
            },
            other => Err(KurfileError::malformed(format!(
                "optimizer must be a name or a mapping, found {}",
                other.type_name()
            ))),
        }
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }
}

#[derive(Serialize, Clone, PartialEq, Eq, Debug)]
pub struct Hook {
    pub name: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub config: Value,
}

impl Hook {
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(name) => Ok(Self {
                name,
                config: Value::Null,
            }),
            Value::Map(map) if map.len() == 1 => {
                let (name, config) = map
                    .into_iter()
                    .next()
                    .ok_or_else(|| KurfileError::malformed("hook has no name"))?;
                Ok(Self { name, config })
            }
            other => Err(KurfileError::malformed(format!(
                "hook must be a name or a single-key mapping, found {}",
                other.type_name()
            ))),
        }
    }
}
