//! Resolution of individual top-level sections.
//!
//! Every section is resolved against the same immutable root scope, so the
//! sections can be resolved in any order.

pub mod loss;
pub mod stage;

use std::collections::BTreeMap;
use std::fmt;

use log::debug;
use serde::Serialize;

use crate::error::{KurfileError, Result, ResultExt};
use crate::expand::Expander;
use crate::node::Node;
use crate::options::ResolverOptions;
use crate::scope::Scope;
use crate::template::evaluate_value;
use crate::value::Value;

pub use loss::LossSpec;
pub use stage::{DataSource, Hook, OptimizerConfig, ProviderConfig, WeightsConfig};

#[derive(Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Settings,
    Model,
    Train,
    Validate,
    Test,
    Evaluate,
    Loss,
}

impl SectionKind {
    pub const ALL: [SectionKind; 7] = [
        SectionKind::Settings,
        SectionKind::Model,
        SectionKind::Train,
        SectionKind::Validate,
        SectionKind::Test,
        SectionKind::Evaluate,
        SectionKind::Loss,
    ];

    /// Sections that describe a run over data.
    pub const STAGES: [SectionKind; 4] = [
        SectionKind::Train,
        SectionKind::Validate,
        SectionKind::Test,
        SectionKind::Evaluate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SectionKind::Settings => "settings",
            SectionKind::Model => "model",
            SectionKind::Train => "train",
            SectionKind::Validate => "validate",
            SectionKind::Test => "test",
            SectionKind::Evaluate => "evaluate",
            SectionKind::Loss => "loss",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        SectionKind::ALL.iter().copied().find(|kind| kind.as_str() == key)
    }

    pub fn is_stage(&self) -> bool {
        SectionKind::STAGES.contains(self)
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved `train`, `validate`, `test` or `evaluate` section.
#[derive(Serialize, Clone, PartialEq, Eq, Debug)]
pub struct StageSection {
    #[serde(skip)]
    pub kind: SectionKind,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<DataSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<WeightsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimizer: Option<OptimizerConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<Hook>,
    /// Everything else (`epochs`, `log`, `destination`, ...), resolved.
    #[serde(flatten)]
    pub options: BTreeMap<String, Value>,
}

impl StageSection {
    pub fn empty(kind: SectionKind) -> Self {
        Self {
            kind,
            data: Vec::new(),
            provider: None,
            weights: None,
            optimizer: None,
            hooks: Vec::new(),
            options: BTreeMap::new(),
        }
    }

    pub fn option(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum Section {
    Model(Vec<Node>),
    Stage(StageSection),
    Loss(Vec<LossSpec>),
}

/// Resolve one section. `settings` is not a section in this sense; it
/// becomes the scope.
pub fn resolve_section(
    kind: SectionKind,
    raw: &Value,
    scope: &Scope<'_>,
    options: &ResolverOptions,
) -> Result<Section> {
    match kind {
        SectionKind::Model => resolve_model(raw, scope, options).map(Section::Model),
        SectionKind::Loss => resolve_loss(raw, scope, options).map(Section::Loss),
        SectionKind::Settings => Err(KurfileError::InvalidArgument(
            "settings are resolved into the scope, not as a section".to_string(),
        )),
        stage => resolve_stage(stage, raw, scope, options).map(Section::Stage),
    }
}

pub fn resolve_model(
    raw: &Value,
    scope: &Scope<'_>,
    options: &ResolverOptions,
) -> Result<Vec<Node>> {
    let mut expander = Expander::new(options);
    let nodes = expander.expand(raw, scope)?;
    debug!(
        "Resolved model into {} top-level nodes ({} in total)",
        nodes.len(),
        expander.produced()
    );
    Ok(nodes)
}

pub fn resolve_stage(
    kind: SectionKind,
    raw: &Value,
    scope: &Scope<'_>,
    options: &ResolverOptions,
) -> Result<StageSection> {
    let mut fields = match evaluate_value(raw, scope, &options.syntax)? {
        Value::Null => return Ok(StageSection::empty(kind)),
        Value::Map(fields) => fields,
        other => {
            return Err(KurfileError::malformed(format!(
                "`{}` must be a mapping, found {}",
                kind,
                other.type_name()
            )));
        }
    };

    let data = match fields.remove("data") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| DataSource::from_value(entry).at(format!("[{}]", i)))
            .collect::<Result<Vec<_>>>()
            .at("data")?,
        Some(single) => vec![DataSource::from_value(single).at("data")?],
    };

    let provider = fields
        .remove("provider")
        .map(ProviderConfig::from_value)
        .transpose()
        .at("provider")?;

    let weights = match fields.remove("weights") {
        None | Some(Value::Null) => None,
        Some(value) => Some(WeightsConfig::from_value(value).at("weights")?),
    };

    let optimizer = match fields.remove("optimizer") {
        None | Some(Value::Null) => None,
        Some(value) => Some(OptimizerConfig::from_value(value).at("optimizer")?),
    };

    let hooks = match fields.remove("hooks") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| Hook::from_value(entry).at(format!("[{}]", i)))
            .collect::<Result<Vec<_>>>()
            .at("hooks")?,
        Some(single) => vec![Hook::from_value(single).at("hooks")?],
    };

    debug!(
        "Resolved `{}`: {} data sources, {} hooks, {} extra options",
        kind,
        data.len(),
        hooks.len(),
        fields.len()
    );

    Ok(StageSection {
        kind,
        data,
        provider,
        weights,
        optimizer,
        hooks,
        options: fields,
    })
}

pub fn resolve_loss(
    raw: &Value,
    scope: &Scope<'_>,
    options: &ResolverOptions,
) -> Result<Vec<LossSpec>> {
    let entries = match raw {
        Value::Null => return Ok(Vec::new()),
        Value::Array(entries) => entries,
        other => {
            return Err(KurfileError::malformed(format!(
                "`loss` must be a sequence, found {}",
                other.type_name()
            )));
        }
    };

    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            evaluate_value(entry, scope, &options.syntax)
                .and_then(LossSpec::from_value)
                .at(format!("[{}]", i))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_map;

    fn scope() -> Scope<'static> {
        Scope::build(&value_map! {
            "root" => "~/kur",
            "batch" => 16i64,
        })
        .unwrap()
    }

    #[test]
    fn stage_fields_are_split_and_templated() {
        let raw = value_map! {
            "data" => vec![value_map! {
                "speech_recorder" => value_map! {
                    "url" => "https://kur.deepgram.com/data/lsdc-train.tar.gz",
                    "path" => "{{ root }}/data",
                },
            }],
            "provider" => value_map! {
                "batch_size" => "{{ batch }}",
                "force_batch_size" => "yes",
                "sortagrad" => "duration",
            },
            "weights" => "weights.kur",
            "optimizer" => value_map! { "name" => "adam", "learning_rate" => 0.0001 },
            "hooks" => vec![value_map! { "plot" => "loss.png" }],
            "epochs" => 20i64,
            "log" => "{{ root }}/log",
        };

        let train = resolve_stage(SectionKind::Train, &raw, &scope(), &ResolverOptions::default())
            .unwrap();

        assert_eq!(train.data.len(), 1);
        assert_eq!(train.data[0].field("path"), Some(&Value::from("~/kur/data")));

        let provider = train.provider.as_ref().unwrap();
        assert_eq!(provider.batch_size(), Some(16));
        assert!(provider.force_batch_size());
        assert_eq!(provider.sortagrad(), Some("duration"));

        assert_eq!(train.weights.as_ref().unwrap().initial.as_deref(), Some("weights.kur"));
        assert_eq!(train.optimizer.as_ref().unwrap().name, "adam");
        assert_eq!(train.hooks[0].name, "plot");
        assert_eq!(train.option("epochs"), Some(&Value::Integer(20)));
        assert_eq!(train.option("log"), Some(&Value::from("~/kur/log")));
    }

    #[test]
    fn stage_errors_point_at_the_field() {
        let raw = value_map! {
            "data" => vec![value_map! { "a" => 1i64, "b" => 2i64 }],
        };
        let err = resolve_stage(SectionKind::Test, &raw, &scope(), &ResolverOptions::default())
            .unwrap_err();
        assert_eq!(err.location(), Some("data[0]"));

        let raw = value_map! { "data" => vec![value_map! { "jsonl" => "{{ nowhere }}" }] };
        let err = resolve_stage(SectionKind::Test, &raw, &scope(), &ResolverOptions::default())
            .unwrap_err();
        assert_eq!(err.location(), Some("data[0].jsonl"));
    }

    #[test]
    fn missing_stage_is_empty() {
        let section = resolve_section(
            SectionKind::Evaluate,
            &Value::Null,
            &scope(),
            &ResolverOptions::default(),
        )
        .unwrap();
        assert_eq!(section, Section::Stage(StageSection::empty(SectionKind::Evaluate)));
    }

    #[test]
    fn loss_entries_are_templated() {
        let raw = Value::from(vec![value_map! { "target" => "asr", "weight" => "{{ batch / 4 }}" }]);
        let losses = resolve_loss(&raw, &scope(), &ResolverOptions::default()).unwrap();
        assert_eq!(losses[0].target, "asr");
        assert_eq!(losses[0].weight, Some(ordered_float::OrderedFloat(4.0)));
    }

    #[test]
    fn section_keys_round_trip() {
        for kind in SectionKind::ALL {
            assert_eq!(SectionKind::from_key(kind.as_str()), Some(kind));
        }
        assert!(SectionKind::Validate.is_stage());
        assert!(!SectionKind::Loss.is_stage());
    }
}
