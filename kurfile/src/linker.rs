//! Named-tensor linking.
//!
//! Collects every name the model graph declares (`input`/`output` tags and
//! layer names share one namespace) and checks that each cross reference,
//! from loss entries or from node `inputs`, lands on one of them.

use std::collections::BTreeMap;

use log::debug;
use serde::Serialize;

use crate::error::{KurfileError, Result};
use crate::node::{Layer, Node};
use crate::section::LossSpec;

#[derive(Serialize, Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[serde(rename_all = "snake_case")]
pub enum TensorRole {
    Input,
    Output,
    Layer,
}

#[derive(Serialize, Clone, PartialEq, Eq, Debug)]
pub struct NamedTensor {
    pub name: String,
    pub role: TensorRole,
    /// Position in the resolved model, e.g. `model[5].parallel.apply[0][1]`.
    pub path: String,
}

#[derive(Serialize, Clone, PartialEq, Eq, Debug, Default)]
pub struct LinkedGraph {
    tensors: BTreeMap<String, NamedTensor>,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl LinkedGraph {
    pub fn tensor(&self, name: &str) -> Option<&NamedTensor> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Input tags in model order.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Output tags in model order.
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    fn declare(&mut self, name: &str, role: TensorRole, path: &str) -> Result<()> {
        if let Some(existing) = self.tensors.get(name) {
            return Err(KurfileError::DuplicateTensorName {
                name: name.to_string(),
            }
            .at(format!("{} (first declared at {})", path, existing.path)));
        }
        match role {
            TensorRole::Input => self.inputs.push(name.to_string()),
            TensorRole::Output => self.outputs.push(name.to_string()),
            TensorRole::Layer => {}
        }
        self.tensors.insert(
            name.to_string(),
            NamedTensor {
                name: name.to_string(),
                role,
                path: path.to_string(),
            },
        );
        Ok(())
    }
}

fn walk<'n, F>(nodes: &'n [Node], prefix: &str, visit: &mut F) -> Result<()>
where
    F: FnMut(&'n Node, &str) -> Result<()>,
{
    for (i, node) in nodes.iter().enumerate() {
        let path = format!("{}[{}]", prefix, i);
        visit(node, &path)?;
        if let Layer::Parallel(parallel) = &node.layer {
            for (b, branch) in parallel.branches.iter().enumerate() {
                walk(branch, &format!("{}.parallel.apply[{}]", path, b), visit)?;
            }
        }
    }
    Ok(())
}

pub fn link(model: &[Node], loss: &[LossSpec]) -> Result<LinkedGraph> {
    let mut graph = LinkedGraph::default();

    walk(model, "model", &mut |node: &Node, path: &str| {
        if let Some(tag) = node.tensor_tag() {
            let role = match node.layer {
                Layer::Input(_) => TensorRole::Input,
                _ => TensorRole::Output,
            };
            graph.declare(tag, role, path)?;
        }
        if let Some(name) = &node.name {
            graph.declare(name, TensorRole::Layer, path)?;
        }
        Ok(())
    })?;

    walk(model, "model", &mut |node: &Node, path: &str| {
        match node.inputs.iter().find(|input| !graph.contains(input)) {
            Some(missing) => Err(KurfileError::UnresolvedReference {
                name: missing.clone(),
            }
            .at(format!("{}.inputs", path))),
            None => Ok(()),
        }
    })?;

    for (i, entry) in loss.iter().enumerate() {
        for (field, name) in entry.references() {
            if !graph.contains(name) {
                return Err(KurfileError::UnresolvedReference {
                    name: name.to_string(),
                }
                .at(format!("loss[{}].{}", i, field)));
            }
        }
    }

    debug!(
        "Linked {} named tensors ({} inputs, {} outputs) against {} loss entries",
        graph.len(),
        graph.inputs.len(),
        graph.outputs.len(),
        loss.len()
    );
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Dense, Parallel, TensorTag};
    use crate::value_map;

    fn input(name: &str) -> Node {
        Node::new(Layer::Input(TensorTag {
            name: name.to_string(),
        }))
    }

    fn output(name: &str) -> Node {
        Node::new(Layer::Output(TensorTag {
            name: name.to_string(),
        }))
    }

    fn loss(target: &str) -> LossSpec {
        LossSpec::from_value(value_map! {
            "target" => target,
            "name" => "ctc",
            "relative_to" => "utterance",
        })
        .unwrap()
    }

    #[test]
    fn loss_resolves_against_declared_tags() {
        let model = vec![
            input("utterance"),
            Node::new(Layer::Dense(Dense { size: 29 })),
            output("asr"),
        ];

        let graph = link(&model, &[loss("asr")]).unwrap();

        assert_eq!(graph.inputs(), ["utterance".to_string()]);
        assert_eq!(graph.outputs(), ["asr".to_string()]);
        assert_eq!(graph.tensor("asr").unwrap().path, "model[2]");
    }

    #[test]
    fn renamed_output_breaks_the_loss() {
        let model = vec![input("utterance"), output("transcription")];

        let err = link(&model, &[loss("asr")]).unwrap_err();

        assert!(matches!(
            err.root(),
            KurfileError::UnresolvedReference { name } if name == "asr"
        ));
        assert_eq!(err.location(), Some("loss[0].target"));
    }

    #[test]
    fn duplicate_names_are_rejected_across_branches() {
        let model = vec![
            input("utterance"),
            Node::new(Layer::Parallel(Parallel {
                branches: vec![vec![output("asr")], vec![output("asr")]],
            })),
        ];

        let err = link(&model, &[]).unwrap_err();
        assert!(matches!(
            err.root(),
            KurfileError::DuplicateTensorName { name } if name == "asr"
        ));
        assert!(
            err.location()
                .unwrap()
                .starts_with("model[1].parallel.apply[1][0]")
        );
    }

    #[test]
    fn layer_names_share_the_namespace() {
        let model = vec![
            input("utterance"),
            Node::named(Layer::Dense(Dense { size: 10 }), "utterance"),
        ];
        assert!(matches!(
            link(&model, &[]).unwrap_err().root(),
            KurfileError::DuplicateTensorName { .. }
        ));
    }

    #[test]
    fn node_inputs_must_name_something() {
        let mut dense = Node::named(Layer::Dense(Dense { size: 10 }), "hidden");
        dense.inputs = vec!["utterance".to_string()];
        let mut head = Node::new(Layer::Dense(Dense { size: 2 }));
        head.inputs = vec!["hiden".to_string()];

        let model = vec![input("utterance"), dense, head];

        let err = link(&model, &[]).unwrap_err();
        assert_eq!(err.location(), Some("model[2].inputs"));
        assert!(matches!(
            err.root(),
            KurfileError::UnresolvedReference { name } if name == "hiden"
        ));
    }
}
