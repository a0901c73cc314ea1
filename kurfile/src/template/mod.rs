//! Template evaluation for Kurfile fields.
//!
//! A field such as `"{{ cnn.kernels }}"` evaluates to the native value bound
//! in the scope. When literal text surrounds the markers every expression is
//! rendered to text and the pieces are concatenated.

pub mod expr;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{KurfileError, Result};
use crate::scope::Scope;
use crate::value::Value;

/// Delimiters wrapping an expression.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
#[serde(default)]
pub struct TemplateSyntax {
    pub open: String,
    pub close: String,
}

impl Default for TemplateSyntax {
    fn default() -> Self {
        Self {
            open: "{{".to_string(),
            close: "}}".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment<'a> {
    Text(&'a str),
    Expression(&'a str),
}

impl TemplateSyntax {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
        }
    }

    pub fn is_template(&self, text: &str) -> bool {
        text.contains(self.open.as_str())
    }

    fn segments<'a>(&self, text: &'a str) -> Result<Vec<Segment<'a>>> {
        if self.open.is_empty() || self.close.is_empty() {
            return Err(KurfileError::template(text, "template delimiters must not be empty"));
        }

        let mut segments = Vec::new();
        let mut rest = text;
        while let Some(start) = rest.find(self.open.as_str()) {
            if start > 0 {
                segments.push(Segment::Text(&rest[..start]));
            }
            let after_open = &rest[start + self.open.len()..];
            let end = after_open.find(self.close.as_str()).ok_or_else(|| {
                KurfileError::template(text, format!("unclosed `{}`", self.open))
            })?;
            segments.push(Segment::Expression(after_open[..end].trim()));
            rest = &after_open[end + self.close.len()..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest));
        }
        Ok(segments)
    }
}

/// Evaluate a single field against `scope`.
pub fn evaluate(text: &str, scope: &Scope<'_>, syntax: &TemplateSyntax) -> Result<Value> {
    if !syntax.is_template(text) {
        return Ok(Value::String(text.to_string()));
    }

    let segments = syntax.segments(text)?;
    let significant: Vec<&Segment<'_>> = segments
        .iter()
        .filter(|segment| !matches!(segment, Segment::Text(t) if t.trim().is_empty()))
        .collect();

    if let [Segment::Expression(source)] = significant.as_slice() {
        return evaluate_expression(source, scope);
    }

    let mut rendered = String::new();
    for segment in &segments {
        match segment {
            Segment::Text(t) => rendered.push_str(t),
            Segment::Expression(source) => {
                rendered.push_str(&evaluate_expression(source, scope)?.to_string());
            }
        }
    }
    Ok(Value::String(rendered))
}

fn evaluate_expression(source: &str, scope: &Scope<'_>) -> Result<Value> {
    expr::parse(source)?.eval(source, scope)
}

/// Evaluate every string inside a value tree.
pub fn evaluate_value(value: &Value, scope: &Scope<'_>, syntax: &TemplateSyntax) -> Result<Value> {
    match value {
        Value::String(text) => evaluate(text, scope, syntax),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                evaluate_value(item, scope, syntax).map_err(|e| e.at(format!("[{}]", i)))
            })
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Map(map) => map
            .iter()
            .map(|(key, item)| {
                evaluate_value(item, scope, syntax)
                    .map(|v| (key.clone(), v))
                    .map_err(|e| e.at(key.clone()))
            })
            .collect::<Result<BTreeMap<String, Value>>>()
            .map(Value::Map),
        other => Ok(other.clone()),
    }
}
