//! Structural expansion of node sequences.
//!
//! `for` directives are unrolled into their bodies, one child scope per
//! iteration. `parallel` directives keep their branches, each expanded on its
//! own, as a single node. Every other node has its templated fields evaluated
//! against whatever scope is active when it is visited.

use std::collections::BTreeMap;

use log::debug;

use crate::error::{KurfileError, Result, ResultExt};
use crate::node::{Layer, Node, NodeKind, Parallel, RawNode, classify};
use crate::options::ResolverOptions;
use crate::scope::Scope;
use crate::template::evaluate_value;
use crate::value::Value;

/// Expand a raw node sequence with default options.
pub fn expand(nodes: &Value, scope: &Scope<'_>) -> Result<Vec<Node>> {
    Expander::new(&ResolverOptions::default()).expand(nodes, scope)
}

pub struct Expander<'o> {
    options: &'o ResolverOptions,
    produced: usize,
    iterations: usize,
}

impl<'o> Expander<'o> {
    pub fn new(options: &'o ResolverOptions) -> Self {
        Self {
            options,
            produced: 0,
            iterations: 0,
        }
    }

    /// Number of nodes produced so far, parallel branches included.
    pub fn produced(&self) -> usize {
        self.produced
    }

    pub fn expand(&mut self, nodes: &Value, scope: &Scope<'_>) -> Result<Vec<Node>> {
        let items = match nodes {
            Value::Null => return Ok(Vec::new()),
            Value::Array(items) => items,
            other => {
                return Err(KurfileError::malformed(format!(
                    "expected a sequence of nodes, found {}",
                    other.type_name()
                )));
            }
        };

        let mut out = Vec::with_capacity(items.len());
        for (i, raw) in items.iter().enumerate() {
            self.expand_node(raw, scope, &mut out).at(format!("[{}]", i))?;
        }
        Ok(out)
    }

    fn expand_node(&mut self, raw: &Value, scope: &Scope<'_>, out: &mut Vec<Node>) -> Result<()> {
        let node = classify(raw)?;
        match node.kind {
            NodeKind::For => self.expand_for(&node, scope, out).at("for"),
            NodeKind::Parallel => {
                let parallel = self.expand_parallel(&node, scope).at("parallel")?;
                let (name, inputs) = self.meta(&node, scope)?;
                self.push(
                    out,
                    Node {
                        layer: Layer::Parallel(parallel),
                        name,
                        inputs,
                    },
                )
            }
            kind => {
                let payload = evaluate_value(node.payload, scope, &self.options.syntax)
                    .and_then(|payload| Layer::from_payload(kind, &payload))
                    .at(kind.as_str())?;
                let (name, inputs) = self.meta(&node, scope)?;
                self.push(
                    out,
                    Node {
                        layer: payload,
                        name,
                        inputs,
                    },
                )
            }
        }
    }

    fn expand_for(&mut self, node: &RawNode<'_>, scope: &Scope<'_>, out: &mut Vec<Node>) -> Result<()> {
        if node.name.is_some() || node.inputs.is_some() {
            return Err(KurfileError::malformed(
                "`for` does not accept `name` or `inputs`",
            ));
        }
        let spec = directive_fields(node, &["range", "iterate", "with_index"])?;

        let range = spec
            .get("range")
            .ok_or_else(|| KurfileError::malformed("`for` is missing `range`"))?;
        let range = evaluate_value(range, scope, &self.options.syntax).at("range")?;
        // Sequence items are bound in turn; an integer range binds 0..count
        // without materializing the indices.
        let sequence = match &range {
            Value::Array(items) => Some(items.as_slice()),
            _ => None,
        };
        let count = match sequence {
            Some(items) => items.len(),
            None => {
                let count = range.get_as::<i64>().ok_or_else(|| {
                    KurfileError::malformed(format!(
                        "`range` must be an integer or a sequence, found {} `{}`",
                        range.type_name(),
                        range
                    ))
                    .at("range")
                })?;
                if count < 0 {
                    return Err(KurfileError::malformed(format!(
                        "`range` must not be negative, found {}",
                        count
                    ))
                    .at("range"));
                }
                usize::try_from(count).unwrap_or(usize::MAX)
            }
        };

        // Iterations are budgeted on their own as well, so loops whose bodies
        // produce nothing stay bounded.
        let limit = self.options.max_nodes;
        if count > limit.saturating_sub(self.produced)
            || count > limit.saturating_sub(self.iterations)
        {
            return Err(KurfileError::ExpansionLimit { limit }.at("range"));
        }
        self.iterations += count;

        let iterate = match spec.get("iterate") {
            Some(iterate @ Value::Array(_)) => iterate,
            Some(other) => {
                return Err(KurfileError::malformed(format!(
                    "`iterate` must be a sequence of nodes, found {}",
                    other.type_name()
                ))
                .at("iterate"));
            }
            None => return Err(KurfileError::malformed("`for` is missing `iterate`")),
        };

        let variable = match spec.get("with_index") {
            Some(Value::String(name)) if name.is_empty() || name.contains('.') => {
                return Err(KurfileError::malformed(format!(
                    "`with_index` must be a plain name, found `{}`",
                    name
                ))
                .at("with_index"));
            }
            Some(Value::String(name)) => name.clone(),
            Some(other) => {
                return Err(KurfileError::malformed(format!(
                    "`with_index` must be a name, found {}",
                    other.type_name()
                ))
                .at("with_index"));
            }
            None => self.options.loop_variable.clone(),
        };

        debug!(
            "Expanding `for` over {} iterations bound to `{}`",
            count,
            variable
        );

        for i in 0..count {
            let item = match sequence {
                Some(items) => items[i].clone(),
                None => Value::Integer(i as i64),
            };
            let child = scope.child(BTreeMap::from([(variable.clone(), item)]));
            let nodes = self.expand(iterate, &child).at("iterate")?;
            out.extend(nodes);
        }
        Ok(())
    }

    fn expand_parallel(&mut self, node: &RawNode<'_>, scope: &Scope<'_>) -> Result<Parallel> {
        let spec = directive_fields(node, &["apply"])?;
        let apply = match spec.get("apply") {
            Some(Value::Array(apply)) => apply,
            Some(other) => {
                return Err(KurfileError::malformed(format!(
                    "`apply` must be a sequence, found {}",
                    other.type_name()
                ))
                .at("apply"));
            }
            None => return Err(KurfileError::malformed("`parallel` is missing `apply`")),
        };

        let mut branches = Vec::with_capacity(apply.len());
        for (i, branch) in apply.iter().enumerate() {
            let expanded = match branch {
                Value::Array(_) => self.expand(branch, scope),
                single => {
                    let mut nodes = Vec::new();
                    self.expand_node(single, scope, &mut nodes).map(|_| nodes)
                }
            };
            branches.push(expanded.at(format!("[{}]", i)).at("apply")?);
        }

        debug!("Expanded `parallel` into {} branches", branches.len());
        Ok(Parallel { branches })
    }

    fn meta(&self, node: &RawNode<'_>, scope: &Scope<'_>) -> Result<(Option<String>, Vec<String>)> {
        let syntax = &self.options.syntax;

        let name = match node.name {
            None => None,
            Some(raw) => match evaluate_value(raw, scope, syntax).at("name")? {
                Value::String(name) => Some(name),
                other => {
                    return Err(KurfileError::malformed(format!(
                        "`name` must be a string, found {}",
                        other.type_name()
                    ))
                    .at("name"));
                }
            },
        };

        let inputs = match node.inputs {
            None => Vec::new(),
            Some(raw) => match evaluate_value(raw, scope, syntax).at("inputs")? {
                Value::String(input) => vec![input],
                Value::Array(items) => items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(input) => Ok(input),
                        other => Err(KurfileError::malformed(format!(
                            "`inputs` entries must be names, found {}",
                            other.type_name()
                        ))
                        .at("inputs")),
                    })
                    .collect::<Result<Vec<_>>>()?,
                other => {
                    return Err(KurfileError::malformed(format!(
                        "`inputs` must be a name or a list of names, found {}",
                        other.type_name()
                    ))
                    .at("inputs"));
                }
            },
        };

        Ok((name, inputs))
    }

    fn push(&mut self, out: &mut Vec<Node>, node: Node) -> Result<()> {
        self.produced += 1;
        if self.produced > self.options.max_nodes {
            return Err(KurfileError::ExpansionLimit {
                limit: self.options.max_nodes,
            });
        }
        out.push(node);
        Ok(())
    }
}

// Payload of a control directive, restricted to the given keys.
fn directive_fields<'a>(
    node: &RawNode<'a>,
    allowed: &[&str],
) -> Result<&'a BTreeMap<String, Value>> {
    let map = node.payload.as_map().ok_or_else(|| {
        KurfileError::malformed(format!(
            "`{}` expects a mapping, found {}",
            node.kind,
            node.payload.type_name()
        ))
    })?;
    if let Some(unknown) = map.keys().find(|key| !allowed.contains(&key.as_str())) {
        return Err(KurfileError::malformed(format!(
            "`{}` has unknown field `{}`",
            node.kind, unknown
        )));
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Dense, Recurrent};
    use crate::value_map;

    fn scope() -> Scope<'static> {
        Scope::build(&value_map! {
            "rnn" => value_map! { "size" => 1000i64, "depth" => 3i64 },
            "vocab" => value_map! { "size" => 28i64 },
        })
        .unwrap()
    }

    fn recurrent_loop(range: Value) -> Value {
        Value::from(vec![value_map! {
            "for" => value_map! {
                "range" => range,
                "iterate" => vec![
                    value_map! {
                        "recurrent" => value_map! { "size" => "{{ rnn.size }}", "sequence" => "yes" },
                    },
                    Value::from("batch_normalization"),
                ],
            },
        }])
    }

    #[test]
    fn for_loop_repeats_its_body_in_order() {
        let nodes = expand(&recurrent_loop(Value::from("{{ rnn.depth }}")), &scope()).unwrap();

        assert_eq!(nodes.len(), 6);
        for pair in nodes.chunks(2) {
            match &pair[0].layer {
                Layer::Recurrent(Recurrent { size, .. }) => assert_eq!(*size, 1000),
                other => panic!("expected recurrent, got {:?}", other),
            }
            assert_eq!(pair[1].kind(), NodeKind::BatchNormalization);
        }
    }

    #[test]
    fn zero_range_produces_nothing() {
        let nodes = expand(&recurrent_loop(Value::Integer(0)), &scope()).unwrap();
        assert!(nodes.is_empty());
    }

    #[test]
    fn negative_range_is_malformed() {
        let err = expand(&recurrent_loop(Value::Integer(-1)), &scope()).unwrap_err();
        assert_eq!(err.location(), Some("[0].for.range"));
    }

    #[test]
    fn loop_variable_is_scoped_to_each_iteration() {
        let raw = Value::from(vec![value_map! {
            "for" => value_map! {
                "range" => 2i64,
                "with_index" => "layer",
                "iterate" => vec![value_map! {
                    "dense" => "{{ (layer + 1) * 10 }}",
                    "name" => "dense_{{ layer }}",
                }],
            },
        }]);

        let root = scope();
        let nodes = expand(&raw, &root).unwrap();

        assert_eq!(
            nodes,
            vec![
                Node::named(Layer::Dense(Dense { size: 10 }), "dense_0"),
                Node::named(Layer::Dense(Dense { size: 20 }), "dense_1"),
            ]
        );
        assert!(!root.contains("layer"));
    }

    #[test]
    fn nested_loops_see_both_bindings() {
        let raw = Value::from(vec![value_map! {
            "for" => value_map! {
                "range" => 2i64,
                "with_index" => "outer",
                "iterate" => vec![value_map! {
                    "for" => value_map! {
                        "range" => 3i64,
                        "iterate" => vec![value_map! {
                            "dense" => "{{ outer * 10 + index }}",
                        }],
                    },
                }],
            },
        }]);

        let sizes: Vec<u64> = expand(&raw, &scope())
            .unwrap()
            .into_iter()
            .map(|node| match node.layer {
                Layer::Dense(dense) => dense.size,
                other => panic!("unexpected {:?}", other),
            })
            .collect();

        assert_eq!(sizes, vec![0, 1, 2, 10, 11, 12]);
    }

    #[test]
    fn sequence_range_binds_each_item() {
        let raw = Value::from(vec![value_map! {
            "for" => value_map! {
                "range" => vec![Value::Integer(64), Value::Integer(32)],
                "iterate" => vec![value_map! { "dense" => "{{ index }}" }],
            },
        }]);

        let nodes = expand(&raw, &scope()).unwrap();
        assert_eq!(
            nodes,
            vec![
                Node::new(Layer::Dense(Dense { size: 64 })),
                Node::new(Layer::Dense(Dense { size: 32 })),
            ]
        );
    }

    #[test]
    fn parallel_keeps_branch_boundaries() {
        let raw = Value::from(vec![value_map! {
            "parallel" => value_map! {
                "apply" => vec![
                    value_map! { "dense" => "{{ vocab.size + 1 }}" },
                    Value::from(vec![
                        value_map! { "dense" => 10i64 },
                        value_map! { "activation" => "relu" },
                    ]),
                ],
            },
            "name" => "heads",
        }]);

        let nodes = expand(&raw, &scope()).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name.as_deref(), Some("heads"));
        match &nodes[0].layer {
            Layer::Parallel(parallel) => {
                assert_eq!(parallel.branches.len(), 2);
                assert_eq!(
                    parallel.branches[0],
                    vec![Node::new(Layer::Dense(Dense { size: 29 }))]
                );
                assert_eq!(parallel.branches[1].len(), 2);
            }
            other => panic!("expected parallel, got {:?}", other),
        }
    }

    #[test]
    fn expanding_expanded_output_is_a_no_op() {
        let raw = Value::from(vec![
            value_map! { "input" => "utterance" },
            value_map! {
                "convolution" => value_map! {
                    "kernels" => 1000i64, "size" => 11i64, "strides" => 2i64, "border" => "valid",
                },
            },
            value_map! {
                "parallel" => value_map! {
                    "apply" => vec![value_map! { "dense" => "{{ vocab.size + 1 }}" }],
                },
            },
        ]);
        let mut with_loop = raw.as_array().unwrap().to_vec();
        with_loop.extend(recurrent_loop(Value::Integer(2)).as_array().unwrap().to_vec());

        let once = expand(&Value::from(with_loop), &scope()).unwrap();
        let reserialized = Value::from(
            once.iter()
                .map(|node| node.to_value().unwrap())
                .collect::<Vec<_>>(),
        );
        let twice = expand(&reserialized, &scope()).unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn expansion_limit_stops_runaway_loops() {
        let options = ResolverOptions {
            max_nodes: 5,
            ..ResolverOptions::default()
        };
        let err = Expander::new(&options)
            .expand(&recurrent_loop(Value::Integer(3)), &scope())
            .unwrap_err();
        assert!(matches!(
            err.root(),
            KurfileError::ExpansionLimit { limit: 5 }
        ));
    }

    #[test]
    fn huge_ranges_hit_the_limit_before_expanding() {
        let options = ResolverOptions {
            max_nodes: 10,
            ..ResolverOptions::default()
        };
        for (range, iterate) in [
            (4_000_000_000i64, vec![Value::from("batch_normalization")]),
            (4_000_000_000_000_000_000i64, Vec::new()),
        ] {
            let raw = Value::from(vec![value_map! {
                "for" => value_map! { "range" => range, "iterate" => iterate },
            }]);
            let err = Expander::new(&options).expand(&raw, &scope()).unwrap_err();
            assert!(matches!(
                err.root(),
                KurfileError::ExpansionLimit { limit: 10 }
            ));
            assert_eq!(err.location(), Some("[0].for.range"));
        }
    }

    #[test]
    fn nested_empty_loops_are_bounded() {
        let options = ResolverOptions {
            max_nodes: 100,
            ..ResolverOptions::default()
        };
        let raw = Value::from(vec![value_map! {
            "for" => value_map! {
                "range" => 100i64,
                "iterate" => vec![value_map! {
                    "for" => value_map! { "range" => 100i64, "iterate" => Vec::<Value>::new() },
                }],
            },
        }]);
        let err = Expander::new(&options).expand(&raw, &scope()).unwrap_err();
        assert!(matches!(
            err.root(),
            KurfileError::ExpansionLimit { limit: 100 }
        ));
    }

    #[test]
    fn dotted_loop_variables_are_rejected() {
        let raw = Value::from(vec![value_map! {
            "for" => value_map! {
                "range" => 2i64,
                "with_index" => "a.b",
                "iterate" => vec![value_map! { "dense" => "{{ a.b + 1 }}" }],
            },
        }]);
        let err = expand(&raw, &scope()).unwrap_err();
        assert!(matches!(err.root(), KurfileError::MalformedNode(_)));
        assert_eq!(err.location(), Some("[0].for.with_index"));
    }

    #[test]
    fn errors_carry_the_node_path() {
        let raw = Value::from(vec![
            value_map! { "input" => "utterance" },
            value_map! {
                "for" => value_map! {
                    "range" => 1i64,
                    "iterate" => vec![value_map! {
                        "recurrent" => value_map! { "size" => "{{ rnn.width }}" },
                    }],
                },
            },
        ]);

        let err = expand(&raw, &scope()).unwrap_err();
        assert_eq!(err.location(), Some("[1].for.iterate[0].recurrent.size"));
        assert!(matches!(err.root(), KurfileError::UnknownBinding { .. }));
    }
}
