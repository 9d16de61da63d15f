use std::fs;
use std::path::Path;
use std::sync::Arc;

use git2::{Oid, Repository};
use tessera_core::IndexConfig;
use tessera_history::resolver::{ChangeMode, ChangeSetResolver, ResolverPhase};
use tessera_history::state::IndexState;
use tessera_history::vcs::GitRepository;

fn commit_all(repo: &Repository, message: &str) -> Oid {
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.update_all(["*"].iter(), None).unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = git2::Signature::now("test", "test@example.com").unwrap();
    let parents: Vec<git2::Commit> = repo
        .head()
        .ok()
        .and_then(|h| h.peel_to_commit().ok())
        .into_iter()
        .collect();
    let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
        .unwrap()
}

fn seed(dir: &Path) -> Repository {
    let repo = Repository::init(dir).unwrap();
    fs::create_dir_all(dir.join("src")).unwrap();
    fs::write(dir.join("src/lib.rs"), "pub mod auth;\n").unwrap();
    fs::write(dir.join("src/auth.rs"), "pub fn login() {}\n").unwrap();
    fs::write(dir.join("README.md"), "# demo\n").unwrap();
    commit_all(&repo, "initial");
    repo
}

fn resolver_for(dir: &Path) -> ChangeSetResolver {
    let git = Arc::new(GitRepository::open(dir).unwrap());
    ChangeSetResolver::new(
        git,
        dir.join(".tessera/index-state.json"),
        &IndexConfig::default(),
    )
}

#[tokio::test]
async fn bootstrap_then_single_file_delta() {
    let dir = tempfile::tempdir().unwrap();
    let repo = seed(dir.path());
    let root = GitRepository::open(dir.path()).unwrap();
    let root = tessera_history::vcs::VersionControl::root(&root).to_path_buf();

    let mut resolver = resolver_for(dir.path());
    let first = resolver.changed_files().await.unwrap();
    assert_eq!(first.mode, ChangeMode::Bootstrap);
    assert_eq!(
        first.files,
        vec![root.join("src/auth.rs"), root.join("src/lib.rs")]
    );
    resolver.mark_indexed(&first.files).await.unwrap();

    fs::write(dir.path().join("src/auth.rs"), "pub fn login() { check(); }\n").unwrap();
    let head = commit_all(&repo, "touch auth");

    // A fresh resolver picks up the persisted revision.
    let mut resolver = resolver_for(dir.path());
    assert_eq!(resolver.phase(), ResolverPhase::Incremental);
    let second = resolver.changed_files().await.unwrap();
    assert_eq!(second.mode, ChangeMode::Incremental);
    assert_eq!(second.revision, head.to_string());
    assert_eq!(second.files, vec![root.join("src/auth.rs")]);
}

#[tokio::test]
async fn deleted_files_do_not_appear() {
    let dir = tempfile::tempdir().unwrap();
    let repo = seed(dir.path());

    let mut resolver = resolver_for(dir.path());
    let first = resolver.changed_files().await.unwrap();
    resolver.mark_indexed(&first.files).await.unwrap();

    fs::remove_file(dir.path().join("src/auth.rs")).unwrap();
    commit_all(&repo, "drop auth");

    let second = resolver.changed_files().await.unwrap();
    assert!(second.is_empty());
}

#[tokio::test]
async fn rewritten_history_falls_back_to_bootstrap() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path());

    let state_path = dir.path().join(".tessera/index-state.json");
    let mut state = IndexState::default();
    state.record_run(
        "0123456789abcdef0123456789abcdef01234567".into(),
        chrono::Utc::now(),
        2,
        10,
    );
    state.save(&state_path).unwrap();

    let mut resolver = resolver_for(dir.path());
    let set = resolver.changed_files().await.unwrap();
    assert_eq!(set.mode, ChangeMode::Bootstrap);
    assert_eq!(set.files.len(), 2);
}

#[tokio::test]
async fn run_history_is_capped() {
    let dir = tempfile::tempdir().unwrap();
    let repo = seed(dir.path());
    let config = IndexConfig {
        history_limit: 3,
        ..IndexConfig::default()
    };
    let git = Arc::new(GitRepository::open(dir.path()).unwrap());
    let state_path = dir.path().join(".tessera/index-state.json");
    let mut resolver = ChangeSetResolver::new(git, state_path.clone(), &config);

    for i in 0..5 {
        fs::write(dir.path().join("src/auth.rs"), format!("pub fn v{i}() {{}}\n")).unwrap();
        commit_all(&repo, &format!("rev {i}"));
        let set = resolver.changed_files().await.unwrap();
        resolver.mark_indexed(&set.files).await.unwrap();
    }

    let state = IndexState::load(&state_path).unwrap().unwrap();
    assert_eq!(state.run_history.len(), 3);
    let stats = resolver.statistics().await.unwrap();
    assert_eq!(stats.total_runs, 3);
    assert_eq!(stats.tracked_files, 2);
}
