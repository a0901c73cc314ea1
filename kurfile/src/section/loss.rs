use std::collections::BTreeMap;

use ordered_float::OrderedFloat;
use serde::Serialize;

use crate::error::{KurfileError, Result};
use crate::value::Value;

/// Fields of a loss entry that name a tensor.
pub const TENSOR_FIELDS: [&str; 5] = [
    "target",
    "input_length",
    "relative_to",
    "output_length",
    "output",
];

#[derive(Serialize, Clone, PartialEq, Eq, Debug)]
pub struct LossSpec {
    pub target: String,
    /// Loss function, e.g. `ctc` or `categorical_crossentropy`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_length: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_length: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<OrderedFloat<f64>>,
    #[serde(flatten)]
    pub options: BTreeMap<String, Value>,
}

impl LossSpec {
    pub fn from_value(value: Value) -> Result<Self> {
        let mut map = match value {
            Value::Map(map) => map,
            other => {
                return Err(KurfileError::malformed(format!(
                    "loss entry must be a mapping, found {}",
                    other.type_name()
                )));
            }
        };

        let mut name_field = |key: &str| -> Result<Option<String>> {
            match map.remove(key) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(name)) => Ok(Some(name)),
                Some(other) => Err(KurfileError::malformed(format!(
                    "loss `{}` must be a name, found {}",
                    key,
                    other.type_name()
                ))
                .at(key.to_string())),
            }
        };

        let target = name_field("target")?
            .ok_or_else(|| KurfileError::malformed("loss entry is missing `target`"))?;
        let name = name_field("name")?;
        let input_length = name_field("input_length")?;
        let relative_to = name_field("relative_to")?;
        let output_length = name_field("output_length")?;
        let output = name_field("output")?;

        let weight = match map.remove("weight") {
            None | Some(Value::Null) => None,
            Some(weight) => Some(OrderedFloat(weight.get_as::<f64>().ok_or_else(|| {
                KurfileError::malformed("loss `weight` must be a number").at("weight")
            })?)),
        };

        Ok(Self {
            target,
            name,
            input_length,
            relative_to,
            output_length,
            output,
            weight,
            options: map,
        })
    }

    /// `(field, tensor name)` for every tensor this entry refers to.
    pub fn references(&self) -> Vec<(&'static str, &str)> {
        TENSOR_FIELDS
            .iter()
            .filter_map(|field| self.reference(field).map(|name| (*field, name)))
            .collect()
    }

    pub fn reference(&self, field: &str) -> Option<&str> {
        match field {
            "target" => Some(&self.target),
            "input_length" => self.input_length.as_deref(),
            "relative_to" => self.relative_to.as_deref(),
            "output_length" => self.output_length.as_deref(),
            "output" => self.output.as_deref(),
            _ => None,
        }
    }
}
