use std::path::Path;
use std::process::{Command, Output};

use git2::Repository;

fn repository(dir: &Path) {
    let repo = Repository::init(dir).unwrap();
    std::fs::write(dir.join(".gitignore"), ".tessera/\n").unwrap();
    std::fs::create_dir_all(dir.join("src")).unwrap();
    std::fs::write(dir.join("src/auth.rs"), "pub fn login() {}\n").unwrap();

    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = git2::Signature::now("test", "test@example.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
        .unwrap();
}

fn tessera(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tessera"))
        .args(args)
        .current_dir(dir)
        .env("NO_COLOR", "1")
        .output()
        .unwrap()
}

#[test]
fn status_renders_a_markdown_table() {
    let dir = tempfile::tempdir().unwrap();
    repository(dir.path());

    let output = tessera(dir.path(), &["status", "--format", "markdown"]);
    assert!(
        output.status.success(),
        "tessera status failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("## Index status"));
    assert!(stdout.contains("| Field | Value |"));
    assert!(stdout.contains("| Last revision | `none` |"));
    assert!(stdout.contains("| Tracked files | 1 |"));
    assert!(stdout.contains("| Vector store | 0 points in `code` |"));
    assert!(!stdout.contains("Code graph"));
}

#[test]
fn status_text_is_not_markdown() {
    let dir = tempfile::tempdir().unwrap();
    repository(dir.path());

    let output = tessera(dir.path(), &["status"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Tracked files:  1"));
    assert!(!stdout.contains('|'));
}

#[test]
fn related_requires_the_graph() {
    let dir = tempfile::tempdir().unwrap();
    repository(dir.path());

    let output = tessera(dir.path(), &["related", "src/auth.rs"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("code graph is disabled"), "{stderr}");
}
