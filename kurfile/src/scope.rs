//! Binding table for template evaluation.
//!
//! The root scope is built once from the `settings` section. Loop-local
//! bindings live in child scopes that borrow their parent, so nothing is
//! ever written back into an outer scope.

use std::collections::BTreeMap;

use serde::{Serialize, Serializer};

use crate::error::{KurfileError, Result};
use crate::value::Value;

#[derive(Debug, Clone, Default)]
pub struct Scope<'p> {
    // Top-level names as written, kept for serialization and for
    // deciding which names this layer shadows.
    tree: BTreeMap<String, Value>,
    // Every dotted path, including the paths of intermediate mappings.
    bindings: BTreeMap<String, Value>,
    parent: Option<&'p Scope<'p>>,
}

impl Scope<'static> {
    /// Build the root scope from a raw `settings` mapping.
    pub fn build(settings: &Value) -> Result<Scope<'static>> {
        let tree = match settings {
            Value::Null => BTreeMap::new(),
            Value::Map(map) => map.clone(),
            other => {
                return Err(KurfileError::malformed(format!(
                    "settings must be a mapping, found {}",
                    other.type_name()
                )));
            }
        };
        Ok(Scope::from_tree(tree, None))
    }
}

impl<'p> Scope<'p> {
    fn from_tree(tree: BTreeMap<String, Value>, parent: Option<&'p Scope<'p>>) -> Self {
        let mut bindings = BTreeMap::new();
        for (key, value) in &tree {
            flatten_into(&mut bindings, key, value);
        }
        Scope {
            tree,
            bindings,
            parent,
        }
    }

    /// A new scope layered over this one.
    ///
    /// The child shadows the parent for every path whose first segment is
    /// one of `bindings`' keys; all other lookups fall through.
    pub fn child<'s>(&'s self, bindings: BTreeMap<String, Value>) -> Scope<'s> {
        Scope::from_tree(bindings, Some(self))
    }

    pub fn resolve(&self, path: &str) -> Result<&Value> {
        self.lookup(path).ok_or_else(|| KurfileError::UnknownBinding {
            path: path.to_string(),
            expression: path.to_string(),
        })
    }

    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let head = path.split('.').next().unwrap_or(path);
        if self.tree.contains_key(head) {
            return self.bindings.get(path);
        }
        self.parent.and_then(|parent| parent.lookup(path))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lookup(path).is_some()
    }

    /// Dotted paths bound in this layer only.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    pub fn depth(&self) -> usize {
        self.parent.map_or(0, |parent| parent.depth() + 1)
    }

    /// This layer's bindings as a nested mapping.
    pub fn to_value(&self) -> Value {
        Value::Map(self.tree.clone())
    }
}

fn flatten_into(bindings: &mut BTreeMap<String, Value>, prefix: &str, value: &Value) {
    if let Value::Map(map) = value {
        for (key, nested) in map {
            flatten_into(bindings, &format!("{}.{}", prefix, key), nested);
        }
    }
    bindings.insert(prefix.to_string(), value.clone());
}

impl PartialEq for Scope<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.tree == other.tree && self.parent == other.parent
    }
}

impl Serialize for Scope<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.tree.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_map;

    fn settings() -> Value {
        value_map! {
            "vocab" => value_map! { "size" => 28i64 },
            "rnn" => value_map! { "size" => 1000i64, "depth" => 3i64 },
            "name" => "speech",
        }
    }

    #[test]
    fn dotted_paths_and_sub_mappings_resolve() {
        let scope = Scope::build(&settings()).unwrap();

        assert_eq!(scope.resolve("rnn.depth").unwrap(), &Value::Integer(3));
        assert_eq!(scope.resolve("vocab").unwrap(), &value_map! { "size" => 28i64 });
        assert_eq!(scope.resolve("name").unwrap(), &Value::from("speech"));
    }

    #[test]
    fn unknown_path_is_an_unknown_binding() {
        let scope = Scope::build(&settings()).unwrap();

        let err = scope.resolve("rnn.width").unwrap_err();
        assert!(matches!(err, KurfileError::UnknownBinding { ref path, .. } if path == "rnn.width"));
    }

    #[test]
    fn child_shadows_only_its_own_keys() {
        let root = Scope::build(&settings()).unwrap();
        let child = root.child(BTreeMap::from([
            ("index".to_string(), Value::Integer(2)),
            ("rnn".to_string(), value_map! { "size" => 10i64 }),
        ]));

        assert_eq!(child.resolve("index").unwrap(), &Value::Integer(2));
        assert_eq!(child.resolve("rnn.size").unwrap(), &Value::Integer(10));
        // `rnn` is shadowed as a whole, so the parent's depth is not visible.
        assert!(child.resolve("rnn.depth").is_err());
        assert_eq!(child.resolve("vocab.size").unwrap(), &Value::Integer(28));

        assert!(!root.contains("index"));
        assert_eq!(root.resolve("rnn.size").unwrap(), &Value::Integer(1000));
        assert_eq!(child.depth(), 1);
    }

    #[test]
    fn missing_settings_build_an_empty_scope() {
        let scope = Scope::build(&Value::Null).unwrap();
        assert_eq!(scope.paths().count(), 0);
        assert!(Scope::build(&Value::from("oops")).is_err());
    }
}
