//! Fixtures shared by unit tests.

use std::path::{Path, PathBuf};

/// Initialise `<dir>/repo` on branch `main` with one commit.
pub(crate) fn init_repo(dir: &Path) -> PathBuf {
    let path = dir.join("repo");
    let mut opts = git2::RepositoryInitOptions::new();
    opts.initial_head("main");
    let repo = git2::Repository::init_opts(&path, &opts).unwrap();

    std::fs::write(path.join("README.md"), "hello\n").unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new("README.md")).unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = git2::Signature::now("atelier", "atelier@example.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
        .unwrap();
    path
}
