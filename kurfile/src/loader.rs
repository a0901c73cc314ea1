//! YAML front end.
//!
//! Anchors and aliases are expanded by the YAML parser into independent
//! copies. `<<` merge keys are applied here with field-level semantics, so a
//! mapping that merges a shared definition can override one nested field
//! without losing its siblings.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde_yaml::Value as Yaml;

use crate::error::{KurfileError, Result, ResultExt};
use crate::merge::{deep_merge, merge_all};
use crate::value::Value;

const MERGE_KEY: &str = "<<";
const INCLUDE_KEY: &str = "include";

/// Parse a Kurfile from YAML text. `include` directives are left untouched.
pub fn load_str(text: &str) -> Result<Value> {
    let yaml: Yaml = serde_yaml::from_str(text)?;
    convert(yaml)
}

/// Read a Kurfile from disk, following `include` directives.
pub fn load_file(path: impl AsRef<Path>) -> Result<Value> {
    let mut stack = Vec::new();
    let document = load_included(path.as_ref(), &mut stack)?;
    info!("Loaded Kurfile {}", path.as_ref().display());
    Ok(document)
}

fn load_included(path: &Path, stack: &mut Vec<PathBuf>) -> Result<Value> {
    let canonical = fs::canonicalize(path).map_err(|e| {
        KurfileError::Io(e).at(path.display().to_string())
    })?;
    if stack.contains(&canonical) {
        return Err(KurfileError::IncludeCycle(canonical));
    }

    let text = fs::read_to_string(&canonical)?;
    let document = load_str(&text).at(path.display().to_string())?;

    let mut document = match document {
        Value::Map(map) => map,
        other => return Ok(other),
    };
    let includes = match document.remove(INCLUDE_KEY) {
        None | Some(Value::Null) => return Ok(Value::Map(document)),
        Some(Value::String(single)) => vec![single],
        Some(Value::Array(entries)) => entries
            .into_iter()
            .map(|entry| match entry {
                Value::String(path) => Ok(path),
                other => Err(KurfileError::malformed(format!(
                    "include entries must be paths, found {}",
                    other.type_name()
                ))),
            })
            .collect::<Result<Vec<_>>>()
            .at(INCLUDE_KEY)?,
        Some(other) => {
            return Err(KurfileError::malformed(format!(
                "include must be a path or a list of paths, found {}",
                other.type_name()
            ))
            .at(INCLUDE_KEY));
        }
    };

    let directory = canonical
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    stack.push(canonical);
    let mut layers = Vec::with_capacity(includes.len() + 1);
    for include in &includes {
        let target = directory.join(include);
        debug!("Including {}", target.display());
        layers.push(load_included(&target, stack)?);
    }
    stack.pop();

    layers.push(Value::Map(document));
    Ok(merge_all(layers))
}

fn convert(yaml: Yaml) -> Result<Value> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Bool(flag) => Ok(Value::Boolean(flag)),
        Yaml::Number(number) => {
            if let Some(int) = number.as_i64() {
                Ok(Value::Integer(int))
            } else {
                number
                    .as_f64()
                    .map(Value::from)
                    .ok_or_else(|| KurfileError::malformed(format!("unsupported number {}", number)))
            }
        }
        Yaml::String(text) => Ok(Value::String(text)),
        Yaml::Sequence(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| convert(item).at(format!("[{}]", i)))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Yaml::Mapping(mapping) => convert_mapping(mapping),
        Yaml::Tagged(tagged) => convert(tagged.value),
    }
}

fn convert_mapping(mapping: serde_yaml::Mapping) -> Result<Value> {
    let mut own = BTreeMap::new();
    let mut merged = Vec::new();

    for (key, value) in mapping {
        let key = mapping_key(key)?;
        if key == MERGE_KEY {
            match convert(value).at(MERGE_KEY)? {
                Value::Array(sources) => merged.extend(sources),
                source => merged.push(source),
            }
            continue;
        }
        let value = convert(value).at(key.clone())?;
        own.insert(key, value);
    }

    if merged.is_empty() {
        return Ok(Value::Map(own));
    }
    if let Some(bad) = merged.iter().find(|source| source.as_map().is_none()) {
        return Err(KurfileError::malformed(format!(
            "merge key expects mappings, found {}",
            bad.type_name()
        ))
        .at(MERGE_KEY));
    }

    // Earlier merge sources take precedence over later ones, and explicit
    // keys over all of them.
    let base = merge_all(merged.into_iter().rev());
    Ok(deep_merge(base, Value::Map(own)))
}

fn mapping_key(key: Yaml) -> Result<String> {
    match key {
        Yaml::String(text) => Ok(text),
        Yaml::Number(number) => Ok(number.to_string()),
        Yaml::Bool(flag) => Ok(flag.to_string()),
        Yaml::Null => Ok("null".to_string()),
        Yaml::Tagged(tagged) => mapping_key(tagged.value),
        Yaml::Sequence(_) | Yaml::Mapping(_) => Err(KurfileError::malformed(
            "mapping keys must be scalars",
        )),
    }
}
