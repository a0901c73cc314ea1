use std::path::PathBuf;

use kurfile::node::Dense;
use kurfile::{KurfileError, Layer, Value, assemble, assemble_documents, load_file, load_str};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

#[test]
fn test_include_is_overridden_by_the_including_file() {
    let raw = load_file(fixture("overlay.yml")).expect("Failed to load overlay.yml");

    assert!(raw.pointer("include").is_none());
    assert_eq!(raw.pointer("settings.hidden"), Some(&Value::Integer(128)));
    assert_eq!(raw.pointer("settings.vocab.size"), Some(&Value::Integer(28)));

    let resolved = assemble(&raw).unwrap();
    assert_eq!(resolved.model[1].layer, Layer::Dense(Dense { size: 128 }));
    assert_eq!(resolved.model[2].layer, Layer::Dense(Dense { size: 28 }));
    assert_eq!(resolved.train.unwrap().option("epochs"), Some(&Value::Integer(3)));
}

#[test]
fn test_include_cycle_is_detected() {
    let err = load_file(fixture("cycle_a.yml")).unwrap_err();
    match err.root() {
        KurfileError::IncludeCycle(path) => assert!(path.ends_with("cycle_a.yml")),
        other => panic!("expected an include cycle, found {:?}", other),
    }
}

#[test]
fn test_missing_file_is_an_io_error() {
    let err = load_file(fixture("does_not_exist.yml")).unwrap_err();
    assert!(matches!(err.root(), KurfileError::Io(_)));
}

#[test]
fn test_documents_merge_like_includes() {
    let base = load_file(fixture("base.yml")).unwrap();
    let overlay = load_str("settings:\n  hidden: 128\n").unwrap();

    let merged = assemble_documents(vec![base, overlay]).unwrap();
    let included = assemble(&load_file(fixture("overlay.yml")).unwrap()).unwrap();

    assert_eq!(merged.model, included.model);
    assert_eq!(merged.loss, included.loss);
}

#[test]
fn test_anchors_become_independent_copies() {
    let raw = load_str(
        r#"
settings:
  size: 4
model:
  - input: x
  - &block
    dense: "{{ size }}"
  - *block
  - output: y
"#,
    )
    .unwrap();

    let resolved = assemble(&raw).unwrap();
    assert_eq!(resolved.model[1], resolved.model[2]);
    assert_eq!(resolved.model.len(), 4);
}
