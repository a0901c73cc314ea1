pub mod document;
pub mod error;
pub mod expand;
pub mod linker;
pub mod loader;
pub mod merge;
pub mod node;
pub mod options;
pub mod scope;
pub mod section;
pub mod template;
pub mod value;

use std::fs;

use log::info;

pub use document::{ResolvedDocument, Resolver, assemble, assemble_documents};
pub use error::{KurfileError, Result};
pub use linker::{LinkedGraph, link};
pub use loader::{load_file, load_str};
pub use node::{Layer, Node, NodeKind};
pub use options::ResolverOptions;
pub use scope::Scope;
pub use section::{LossSpec, SectionKind, StageSection};
pub use template::TemplateSyntax;
pub use value::Value;

/// Entry point of the `kurfile` binary: `kurfile <Kurfile> [options.toml]`.
///
/// Loads the Kurfile, resolves it and prints the IR as pretty JSON.
pub fn run(args: Vec<String>) -> Result<()> {
    if args.len() < 2 || args.len() > 3 {
        return Err(KurfileError::InvalidArgument(format!(
            "usage: {} <Kurfile> [options.toml]",
            args.first().map(String::as_str).unwrap_or("kurfile")
        )));
    }

    let options = match args.get(2) {
        Some(path) => {
            info!("Reading resolver options from {}", path);
            ResolverOptions::from_toml_str(&fs::read_to_string(path)?)?
        }
        None => ResolverOptions::default(),
    };

    let raw = load_file(&args[1])?;
    let document = Resolver::new(options).assemble(&raw)?;
    println!("{}", document.to_json_pretty()?);
    Ok(())
}
