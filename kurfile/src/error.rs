use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KurfileError {
    #[error("unknown binding `{path}` in expression `{expression}`")]
    UnknownBinding { path: String, expression: String },
    #[error("template error in `{expression}`: {reason}")]
    Template { expression: String, reason: String },
    #[error("unresolved tensor reference `{name}`")]
    UnresolvedReference { name: String },
    #[error("duplicate tensor name `{name}`")]
    DuplicateTensorName { name: String },
    #[error("malformed node: {0}")]
    MalformedNode(String),
    #[error("expansion produced more than {limit} nodes")]
    ExpansionLimit { limit: usize },
    #[error("include cycle detected at {}", .0.display())]
    IncludeCycle(PathBuf),
    #[error("{location}: {source}")]
    At {
        location: String,
        source: Box<KurfileError>,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, KurfileError>;

impl KurfileError {
    pub fn malformed(message: impl Into<String>) -> Self {
        KurfileError::MalformedNode(message.into())
    }

    pub fn template(expression: &str, reason: impl Into<String>) -> Self {
        KurfileError::Template {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }

    /// Prefix the error with a location segment such as `model`, `[3]` or `size`.
    ///
    /// Nested calls collapse into a single path, innermost segment last.
    pub fn at(self, segment: impl Into<String>) -> Self {
        let segment = segment.into();
        match self {
            KurfileError::At { location, source } => {
                let joined = if location.starts_with('[') {
                    format!("{}{}", segment, location)
                } else {
                    format!("{}.{}", segment, location)
                };
                KurfileError::At {
                    location: joined,
                    source,
                }
            }
            other => KurfileError::At {
                location: segment,
                source: Box::new(other),
            },
        }
    }

    /// The underlying error with every location wrapper removed.
    pub fn root(&self) -> &KurfileError {
        match self {
            KurfileError::At { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn location(&self) -> Option<&str> {
        match self {
            KurfileError::At { location, .. } => Some(location),
            _ => None,
        }
    }
}

/// Attach a location segment to the error side of a result.
pub trait ResultExt<T> {
    fn at(self, segment: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn at(self, segment: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.at(segment))
    }
}
