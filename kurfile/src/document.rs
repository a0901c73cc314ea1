//! Top-level assembly of a Kurfile into its resolved form.

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::error::{KurfileError, Result, ResultExt};
use crate::linker::{LinkedGraph, link};
use crate::merge::merge_all;
use crate::node::Node;
use crate::options::ResolverOptions;
use crate::scope::Scope;
use crate::section::{LossSpec, SectionKind, StageSection, resolve_loss, resolve_model, resolve_stage};
use crate::value::Value;

/// The fully resolved document handed to a model-building backend.
#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct ResolvedDocument {
    pub settings: Scope<'static>,
    pub model: Vec<Node>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub train: Option<StageSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validate: Option<StageSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<StageSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluate: Option<StageSection>,
    pub loss: Vec<LossSpec>,
    pub graph: LinkedGraph,
}

impl ResolvedDocument {
    pub fn stage(&self, kind: SectionKind) -> Option<&StageSection> {
        match kind {
            SectionKind::Train => self.train.as_ref(),
            SectionKind::Validate => self.validate.as_ref(),
            SectionKind::Test => self.test.as_ref(),
            SectionKind::Evaluate => self.evaluate.as_ref(),
            _ => None,
        }
    }

    pub fn scope(&self) -> &Scope<'static> {
        &self.settings
    }

    /// Plain nested form of the IR, for debugging.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Resolver {
    options: ResolverOptions,
}

impl Resolver {
    pub fn new(options: ResolverOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    /// Resolve one raw document. The first error aborts the whole run.
    pub fn assemble(&self, raw: &Value) -> Result<ResolvedDocument> {
        let document = raw.as_map().ok_or_else(|| {
            KurfileError::malformed(format!(
                "document must be a mapping, found {}",
                raw.type_name()
            ))
        })?;

        for key in document.keys() {
            if SectionKind::from_key(key).is_none() {
                warn!("Ignoring unknown top-level key `{}`", key);
            }
        }

        let section = |kind: SectionKind| document.get(kind.as_str());
        let options = &self.options;

        let scope = Scope::build(section(SectionKind::Settings).unwrap_or(&Value::Null))
            .at(SectionKind::Settings.as_str())?;
        debug!("Built scope with {} bindings", scope.paths().count());

        let model = resolve_model(
            section(SectionKind::Model).unwrap_or(&Value::Null),
            &scope,
            options,
        )
        .at(SectionKind::Model.as_str())?;

        // Stage sections only read the shared scope, so they resolve side by
        // side; errors are still reported in section order.
        let mut stages = SectionKind::STAGES
            .par_iter()
            .map(|&kind| match section(kind) {
                None => Ok(None),
                Some(raw) => resolve_stage(kind, raw, &scope, options)
                    .map(Some)
                    .at(kind.as_str()),
            })
            .collect::<Vec<Result<Option<StageSection>>>>()
            .into_iter()
            .collect::<Result<Vec<_>>>()?
            .into_iter();

        let loss = resolve_loss(
            section(SectionKind::Loss).unwrap_or(&Value::Null),
            &scope,
            options,
        )
        .at(SectionKind::Loss.as_str())?;

        let graph = link(&model, &loss)?;

        info!(
            "Assembled Kurfile: {} model nodes, {} loss entries, {} named tensors",
            model.len(),
            loss.len(),
            graph.len()
        );

        Ok(ResolvedDocument {
            settings: scope,
            model,
            train: stages.next().flatten(),
            validate: stages.next().flatten(),
            test: stages.next().flatten(),
            evaluate: stages.next().flatten(),
            loss,
            graph,
        })
    }

    /// Merge several raw documents field by field, later ones winning,
    /// and resolve the result.
    pub fn assemble_documents<I>(&self, documents: I) -> Result<ResolvedDocument>
    where
        I: IntoIterator<Item = Value>,
    {
        let merged = merge_all(documents);
        if merged.is_null() {
            return Err(KurfileError::InvalidArgument(
                "no documents to assemble".to_string(),
            ));
        }
        self.assemble(&merged)
    }
}

/// Resolve a raw document with default options.
pub fn assemble(raw: &Value) -> Result<ResolvedDocument> {
    Resolver::default().assemble(raw)
}

/// Resolve several raw documents, merged in order, with default options.
pub fn assemble_documents<I>(documents: I) -> Result<ResolvedDocument>
where
    I: IntoIterator<Item = Value>,
{
    Resolver::default().assemble_documents(documents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Dense, Layer};
    use crate::value_map;

    fn document() -> Value {
        value_map! {
            "settings" => value_map! { "vocab" => value_map! { "size" => 28i64 } },
            "model" => vec![
                value_map! { "input" => "utterance" },
                value_map! { "dense" => "{{ vocab.size + 1 }}" },
                value_map! { "output" => "asr" },
            ],
            "train" => value_map! { "epochs" => 5i64 },
            "loss" => vec![value_map! { "target" => "asr", "name" => "ctc" }],
        }
    }

    #[test]
    fn assembles_every_section() {
        let resolved = assemble(&document()).unwrap();

        assert_eq!(resolved.model[1].layer, Layer::Dense(Dense { size: 29 }));
        assert_eq!(
            resolved.stage(SectionKind::Train).unwrap().option("epochs"),
            Some(&Value::Integer(5))
        );
        assert!(resolved.validate.is_none());
        assert_eq!(resolved.loss[0].target, "asr");
        assert_eq!(resolved.graph.outputs(), ["asr".to_string()]);
    }

    #[test]
    fn unknown_top_level_keys_are_ignored() {
        let mut raw = document();
        if let Value::Map(map) = &mut raw {
            map.insert("comments".to_string(), Value::from("free text"));
        }
        assert_eq!(assemble(&raw).unwrap(), assemble(&document()).unwrap());
    }

    #[test]
    fn section_errors_carry_the_section_name() {
        let mut raw = document();
        if let Value::Map(map) = &mut raw {
            map.insert(
                "test".to_string(),
                value_map! { "log" => "{{ missing.path }}" },
            );
        }
        let err = assemble(&raw).unwrap_err();
        assert_eq!(err.location(), Some("test.log"));
        assert!(matches!(err.root(), KurfileError::UnknownBinding { .. }));
    }

    #[test]
    fn document_must_be_a_mapping() {
        assert!(matches!(
            assemble(&Value::from("model")).unwrap_err(),
            KurfileError::MalformedNode(_)
        ));
    }

    #[test]
    fn later_documents_override_earlier_ones() {
        let overlay = value_map! {
            "settings" => value_map! { "vocab" => value_map! { "size" => 40i64 } },
        };
        let resolved = assemble_documents(vec![document(), overlay]).unwrap();
        assert_eq!(resolved.model[1].layer, Layer::Dense(Dense { size: 41 }));
        assert_eq!(resolved.loss.len(), 1);

        assert!(matches!(
            assemble_documents(Vec::new()).unwrap_err(),
            KurfileError::InvalidArgument(_)
        ));
    }

    #[test]
    fn custom_delimiters_apply_to_every_section() {
        let raw = value_map! {
            "settings" => value_map! { "depth" => 2i64 },
            "model" => vec![value_map! { "dense" => "<% depth * 8 %>" }],
            "train" => value_map! { "epochs" => "<% depth %>" },
        };
        let options = ResolverOptions {
            syntax: crate::template::TemplateSyntax::new("<%", "%>"),
            ..ResolverOptions::default()
        };
        let resolved = Resolver::new(options).assemble(&raw).unwrap();
        assert_eq!(resolved.model[0].layer, Layer::Dense(Dense { size: 16 }));
        assert_eq!(
            resolved.train.unwrap().option("epochs"),
            Some(&Value::Integer(2))
        );
    }
}
