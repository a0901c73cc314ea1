//! Model graph nodes.
//!
//! A raw node is a mapping with exactly one recognized kind key plus the
//! optional meta keys `name` and `inputs`. A bare string such as
//! `batch_normalization` is shorthand for the kind with an empty payload.

use std::collections::BTreeMap;
use std::fmt;

use ordered_float::OrderedFloat;
use serde::Serialize;

use crate::error::{KurfileError, Result};
use crate::value::{TryGetValue, Value};

static EMPTY: Value = Value::Null;

const META_KEYS: &[&str] = &["name", "inputs"];

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum NodeKind {
    Input,
    Output,
    Convolution,
    Activation,
    Recurrent,
    Dense,
    BatchNormalization,
    Pool,
    Dropout,
    Flatten,
    Parallel,
    For,
}

impl NodeKind {
    pub const ALL: [NodeKind; 12] = [
        NodeKind::Input,
        NodeKind::Output,
        NodeKind::Convolution,
        NodeKind::Activation,
        NodeKind::Recurrent,
        NodeKind::Dense,
        NodeKind::BatchNormalization,
        NodeKind::Pool,
        NodeKind::Dropout,
        NodeKind::Flatten,
        NodeKind::Parallel,
        NodeKind::For,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Input => "input",
            NodeKind::Output => "output",
            NodeKind::Convolution => "convolution",
            NodeKind::Activation => "activation",
            NodeKind::Recurrent => "recurrent",
            NodeKind::Dense => "dense",
            NodeKind::BatchNormalization => "batch_normalization",
            NodeKind::Pool => "pool",
            NodeKind::Dropout => "dropout",
            NodeKind::Flatten => "flatten",
            NodeKind::Parallel => "parallel",
            NodeKind::For => "for",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        NodeKind::ALL.iter().copied().find(|kind| kind.as_str() == key)
    }

    // Field filled in when the payload is a scalar instead of a mapping.
    fn shorthand_field(&self) -> Option<&'static str> {
        match self {
            NodeKind::Input | NodeKind::Output | NodeKind::Activation => Some("name"),
            NodeKind::Dense => Some("size"),
            NodeKind::Dropout => Some("fraction"),
            NodeKind::Pool => Some("size"),
            _ => None,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw node split into its kind, payload and meta fields, not yet evaluated.
#[derive(Debug, Clone)]
pub struct RawNode<'a> {
    pub kind: NodeKind,
    pub payload: &'a Value,
    pub name: Option<&'a Value>,
    pub inputs: Option<&'a Value>,
}

pub fn classify(raw: &Value) -> Result<RawNode<'_>> {
    match raw {
        Value::String(key) => {
            let kind = NodeKind::from_key(key)
                .ok_or_else(|| KurfileError::malformed(format!("unknown node kind `{}`", key)))?;
            Ok(RawNode {
                kind,
                payload: &EMPTY,
                name: None,
                inputs: None,
            })
        }
        Value::Map(map) => {
            let mut found: Option<(NodeKind, &Value)> = None;
            for (key, value) in map {
                if META_KEYS.contains(&key.as_str()) {
                    continue;
                }
                let kind = NodeKind::from_key(key).ok_or_else(|| {
                    KurfileError::malformed(format!("unknown node kind `{}`", key))
                })?;
                if let Some((previous, _)) = found {
                    return Err(KurfileError::malformed(format!(
                        "node declares both `{}` and `{}`",
                        previous, kind
                    )));
                }
                found = Some((kind, value));
            }
            let (kind, payload) = found.ok_or_else(|| {
                KurfileError::malformed("node has no recognized kind key")
            })?;
            Ok(RawNode {
                kind,
                payload,
                name: map.get("name"),
                inputs: map.get("inputs"),
            })
        }
        other => Err(KurfileError::malformed(format!(
            "node must be a mapping or a kind name, found {}",
            other.type_name()
        ))),
    }
}

#[derive(Serialize, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Node {
    #[serde(flatten)]
    pub layer: Layer,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
}

impl Node {
    pub fn new(layer: Layer) -> Self {
        Self {
            layer,
            name: None,
            inputs: Vec::new(),
        }
    }

    pub fn named(layer: Layer, name: impl Into<String>) -> Self {
        Self {
            layer,
            name: Some(name.into()),
            inputs: Vec::new(),
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.layer.kind()
    }

    /// The tensor tag if this is an `input` or `output` node.
    pub fn tensor_tag(&self) -> Option<&str> {
        match &self.layer {
            Layer::Input(tag) | Layer::Output(tag) => Some(&tag.name),
            _ => None,
        }
    }

    /// Raw form accepted by the expander; expanding it again yields `self`.
    pub fn to_value(&self) -> Result<Value> {
        Ok(Value::from(serde_json::to_value(self)?))
    }
}

#[derive(Serialize, Clone, PartialEq, Eq, Hash, Debug)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Input(TensorTag),
    Output(TensorTag),
    Convolution(Convolution),
    Activation(Activation),
    Recurrent(Recurrent),
    Dense(Dense),
    BatchNormalization {},
    Pool(Pool),
    Dropout(Dropout),
    Flatten {},
    Parallel(Parallel),
}

impl Layer {
    pub fn kind(&self) -> NodeKind {
        match self {
            Layer::Input(_) => NodeKind::Input,
            Layer::Output(_) => NodeKind::Output,
            Layer::Convolution(_) => NodeKind::Convolution,
            Layer::Activation(_) => NodeKind::Activation,
            Layer::Recurrent(_) => NodeKind::Recurrent,
            Layer::Dense(_) => NodeKind::Dense,
            Layer::BatchNormalization {} => NodeKind::BatchNormalization,
            Layer::Pool(_) => NodeKind::Pool,
            Layer::Dropout(_) => NodeKind::Dropout,
            Layer::Flatten {} => NodeKind::Flatten,
            Layer::Parallel(_) => NodeKind::Parallel,
        }
    }

    /// Build a layer from an already evaluated payload.
    ///
    /// `parallel` and `for` are handled by the expander and rejected here.
    pub fn from_payload(kind: NodeKind, payload: &Value) -> Result<Layer> {
        let mut fields = Fields::new(kind, payload)?;
        let layer = match kind {
            NodeKind::Input => Layer::Input(TensorTag {
                name: fields.required("name")?,
            }),
            NodeKind::Output => Layer::Output(TensorTag {
                name: fields.required("name")?,
            }),
            NodeKind::Convolution => Layer::Convolution(Convolution {
                kernels: fields.required("kernels")?,
                size: fields.required_dims("size")?,
                strides: fields.optional_dims("strides")?.unwrap_or_else(|| vec![1]),
                border: match fields.optional::<String>("border")? {
                    Some(border) => Border::parse(&border)?,
                    None => Border::Same,
                },
            }),
            NodeKind::Activation => Layer::Activation(Activation {
                name: fields.required("name")?,
            }),
            NodeKind::Recurrent => Layer::Recurrent(Recurrent {
                size: fields.required("size")?,
                sequence: fields.optional("sequence")?.unwrap_or(true),
                cell: match fields.optional::<String>("type")? {
                    Some(cell) => RecurrentCell::parse(&cell)?,
                    None => RecurrentCell::Gru,
                },
                bidirectional: fields.optional("bidirectional")?.unwrap_or(false),
                merge: match fields.optional::<String>("merge")? {
                    Some(merge) => Some(RecurrentMerge::parse(&merge)?),
                    None => None,
                },
            }),
            NodeKind::Dense => Layer::Dense(Dense {
                size: fields.required("size")?,
            }),
            NodeKind::BatchNormalization => Layer::BatchNormalization {},
            NodeKind::Pool => Layer::Pool(Pool {
                size: fields.required_dims("size")?,
                strides: fields.optional_dims("strides")?,
                pool: match fields.optional::<String>("type")? {
                    Some(pool) => PoolType::parse(&pool)?,
                    None => PoolType::Max,
                },
            }),
            NodeKind::Dropout => Layer::Dropout(Dropout {
                fraction: OrderedFloat(fields.required::<f64>("fraction")?),
            }),
            NodeKind::Flatten => Layer::Flatten {},
            NodeKind::Parallel | NodeKind::For => {
                return Err(KurfileError::malformed(format!(
                    "`{}` is a control directive, not a layer",
                    kind
                )));
            }
        };
        fields.finish()?;
        Ok(layer)
    }
}

#[derive(Serialize, Clone, PartialEq, Eq, Hash, Debug)]
pub struct TensorTag {
    pub name: String,
}

#[derive(Serialize, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Convolution {
    pub kernels: u64,
    pub size: Vec<u64>,
    pub strides: Vec<u64>,
    pub border: Border,
}

#[derive(Serialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[serde(rename_all = "lowercase")]
pub enum Border {
    Same,
    Valid,
}

impl Border {
    fn parse(text: &str) -> Result<Self> {
        match text {
            "same" => Ok(Border::Same),
            "valid" => Ok(Border::Valid),
            other => Err(
                KurfileError::malformed(format!("unknown border mode `{}`", other)).at("border"),
            ),
        }
    }
}

#[derive(Serialize, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Activation {
    pub name: String,
}

#[derive(Serialize, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Recurrent {
    pub size: u64,
    pub sequence: bool,
    #[serde(rename = "type")]
    pub cell: RecurrentCell,
    pub bidirectional: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge: Option<RecurrentMerge>,
}

#[derive(Serialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[serde(rename_all = "lowercase")]
pub enum RecurrentCell {
    Gru,
    Lstm,
}

impl RecurrentCell {
    fn parse(text: &str) -> Result<Self> {
        match text {
            "gru" => Ok(RecurrentCell::Gru),
            "lstm" => Ok(RecurrentCell::Lstm),
            other => Err(
                KurfileError::malformed(format!("unknown recurrent type `{}`", other)).at("type"),
            ),
        }
    }
}

#[derive(Serialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[serde(rename_all = "lowercase")]
pub enum RecurrentMerge {
    Multiply,
    Add,
    Concat,
    Average,
}

impl RecurrentMerge {
    fn parse(text: &str) -> Result<Self> {
        match text {
            "multiply" => Ok(RecurrentMerge::Multiply),
            "add" => Ok(RecurrentMerge::Add),
            "concat" => Ok(RecurrentMerge::Concat),
            "average" => Ok(RecurrentMerge::Average),
            other => Err(
                KurfileError::malformed(format!("unknown merge mode `{}`", other)).at("merge"),
            ),
        }
    }
}

#[derive(Serialize, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Dense {
    pub size: u64,
}

#[derive(Serialize, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Pool {
    pub size: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strides: Option<Vec<u64>>,
    #[serde(rename = "type")]
    pub pool: PoolType,
}

#[derive(Serialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[serde(rename_all = "lowercase")]
pub enum PoolType {
    Max,
    Average,
}

impl PoolType {
    fn parse(text: &str) -> Result<Self> {
        match text {
            "max" => Ok(PoolType::Max),
            "average" => Ok(PoolType::Average),
            other => Err(
                KurfileError::malformed(format!("unknown pool type `{}`", other)).at("type"),
            ),
        }
    }
}

#[derive(Serialize, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Dropout {
    pub fraction: OrderedFloat<f64>,
}

/// Branches of a `parallel` directive, each already expanded, in source order.
#[derive(Serialize, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Parallel {
    #[serde(rename = "apply")]
    pub branches: Vec<Vec<Node>>,
}

// Consumes payload fields one by one so leftovers can be reported.
struct Fields {
    kind: NodeKind,
    map: BTreeMap<String, Value>,
}

impl Fields {
    fn new(kind: NodeKind, payload: &Value) -> Result<Self> {
        let map = match payload {
            Value::Null => BTreeMap::new(),
            Value::Map(map) => map.clone(),
            scalar => match kind.shorthand_field() {
                Some(field) => BTreeMap::from([(field.to_string(), scalar.clone())]),
                None => {
                    return Err(KurfileError::malformed(format!(
                        "`{}` expects a mapping, found {}",
                        kind,
                        scalar.type_name()
                    )));
                }
            },
        };
        Ok(Self { kind, map })
    }

    fn optional<T: TryGetValue<T>>(&mut self, field: &str) -> Result<Option<T>> {
        match self.map.remove(field) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value.get_as::<T>().map(Some).ok_or_else(|| {
                KurfileError::malformed(format!(
                    "`{}.{}` has unexpected {} value `{}`",
                    self.kind,
                    field,
                    value.type_name(),
                    value
                ))
                .at(field.to_string())
            }),
        }
    }

    fn required<T: TryGetValue<T>>(&mut self, field: &str) -> Result<T> {
        self.optional(field)?.ok_or_else(|| {
            KurfileError::malformed(format!("`{}` is missing required field `{}`", self.kind, field))
        })
    }

    // Accepts `11` as well as `[11, 11]`.
    fn optional_dims(&mut self, field: &str) -> Result<Option<Vec<u64>>> {
        match self.map.get(field) {
            Some(Value::Array(items)) => {
                let dims = items
                    .iter()
                    .map(|item| item.get_as::<u64>())
                    .collect::<Option<Vec<u64>>>()
                    .ok_or_else(|| {
                        KurfileError::malformed(format!(
                            "`{}.{}` must be a list of non-negative integers",
                            self.kind, field
                        ))
                        .at(field.to_string())
                    })?;
                self.map.remove(field);
                Ok(Some(dims))
            }
            _ => Ok(self.optional::<u64>(field)?.map(|dim| vec![dim])),
        }
    }

    fn required_dims(&mut self, field: &str) -> Result<Vec<u64>> {
        self.optional_dims(field)?.ok_or_else(|| {
            KurfileError::malformed(format!("`{}` is missing required field `{}`", self.kind, field))
        })
    }

    fn finish(self) -> Result<()> {
        match self.map.keys().next() {
            Some(field) => Err(KurfileError::malformed(format!(
                "`{}` has unknown field `{}`",
                self.kind, field
            ))),
            None => Ok(()),
        }
    }
}
