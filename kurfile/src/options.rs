use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::template::TemplateSyntax;

/// Knobs for one resolution run.
///
/// ```toml
/// loop_variable = "index"
/// max_nodes = 100000
///
/// [syntax]
/// open = "{{"
/// close = "}}"
/// ```
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
#[serde(default)]
pub struct ResolverOptions {
    pub syntax: TemplateSyntax,
    /// Name bound to the iteration index inside `for` bodies without `with_index`.
    pub loop_variable: String,
    /// Upper bound on the number of nodes a single section may expand into,
    /// and separately on the total number of `for` iterations.
    pub max_nodes: usize,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            syntax: TemplateSyntax::default(),
            loop_variable: "index".to_string(),
            max_nodes: 100_000,
        }
    }
}

impl ResolverOptions {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}
