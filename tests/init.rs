use std::process::Command;

#[test]
fn init_creates_valid_toml() {
    let dir = tempfile::tempdir().unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_tessera"))
        .arg("init")
        .current_dir(dir.path())
        .output()
        .unwrap();

    assert!(
        output.status.success(),
        "tessera init failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let config_path = dir.path().join(".tessera.toml");
    assert!(config_path.exists(), ".tessera.toml should exist");

    let content = std::fs::read_to_string(&config_path).unwrap();
    assert!(content.contains("[embedding]"));
    assert!(content.contains("[search.weights]"));

    // Every option is commented out, so the template parses to the defaults.
    let config: tessera_core::TesseraConfig = toml::from_str(&content).unwrap();
    config.validate().unwrap();
    assert_eq!(config.index.batch_size, 100);
    assert_eq!(config.vector_store.collection, "code");
}

#[test]
fn init_refuses_if_exists() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(".tessera.toml"), "# existing").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_tessera"))
        .arg("init")
        .current_dir(dir.path())
        .output()
        .unwrap();

    assert!(!output.status.success());
    let content = std::fs::read_to_string(dir.path().join(".tessera.toml")).unwrap();
    assert_eq!(content, "# existing");
}

#[test]
fn help_lists_subcommands() {
    let output = Command::new(env!("CARGO_BIN_EXE_tessera"))
        .arg("--help")
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for cmd in ["index", "search", "related", "status", "cache", "init"] {
        assert!(stdout.contains(cmd), "help should mention {cmd}");
    }
}
