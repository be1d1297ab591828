//! Version-control collaborator: clone cache and worktree lifecycle.
//!
//! The target project is cloned once into the workspace cache. Each
//! approach implements in its own worktree on its own branch, so
//! concurrently running tasks never touch each other's files. Integration
//! mode merges surviving branches into one more worktree, recording
//! per-branch conflict status.

use crate::errors::GitError;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{BranchType, DiffOptions, Repository, Signature, WorktreeAddOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Summary of what an implementation changed relative to the base branch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub files_changed: usize,
    pub insertions: usize,
    pub deletions: usize,
    pub changed_files: Vec<String>,
}

/// Manages the target project's clone and per-approach worktrees.
pub struct GitManager {
    workspace_root: PathBuf,
    target_repo: String,
    default_branch: String,
    access_token: String,
    clone_dir: PathBuf,
}

impl GitManager {
    pub fn new(
        workspace_root: PathBuf,
        target_repo: &str,
        default_branch: &str,
        access_token: &str,
    ) -> Self {
        let clone_dir = workspace_root.join(".cache").join(repo_name(target_repo));
        Self {
            workspace_root,
            target_repo: target_repo.to_string(),
            default_branch: default_branch.to_string(),
            access_token: access_token.to_string(),
            clone_dir,
        }
    }

    pub fn clone_dir(&self) -> &Path {
        &self.clone_dir
    }

    /// Clone the target project if needed, otherwise fetch to sync.
    pub fn ensure_clone(&self) -> Result<PathBuf, GitError> {
        if self.target_repo.is_empty() {
            return Err(GitError::NoTargetRepo);
        }

        std::fs::create_dir_all(self.clone_dir.parent().unwrap_or(&self.workspace_root)).map_err(
            |e| GitError::CloneFailed {
                url: self.target_repo.clone(),
                message: format!("failed to create cache directory: {e}"),
            },
        )?;

        if self.clone_dir.join(".git").exists() {
            info!(dir = %self.clone_dir.display(), "Reusing existing clone, fetching");
            let repo = self.open_clone()?;
            // The token may have rotated since the clone was made.
            if !self.access_token.is_empty() {
                repo.remote_set_url("origin", &self.auth_url())?;
            }
            let mut remote = repo.find_remote("origin")?;
            remote
                .fetch(&[] as &[&str], None, None)
                .map_err(|e| GitError::CloneFailed {
                    url: self.target_repo.clone(),
                    message: format!("fetch failed: {e}"),
                })?;
        } else {
            info!(url = %self.target_repo, dir = %self.clone_dir.display(), "Cloning target project");
            RepoBuilder::new()
                .clone(&self.auth_url(), &self.clone_dir)
                .map_err(|e| GitError::CloneFailed {
                    url: self.target_repo.clone(),
                    message: e.to_string(),
                })?;
        }

        Ok(self.clone_dir.clone())
    }

    /// Branch name for one approach's implementation.
    pub fn branch_name(&self, task_id: &str, approach_id: usize) -> String {
        format!("{task_id}/impl-{approach_id}")
    }

    /// Create the isolated worktree for one approach. Returns the worktree
    /// path and its branch name.
    pub fn create_worktree(
        &self,
        task_id: &str,
        approach_id: usize,
    ) -> Result<(PathBuf, String), GitError> {
        let branch = self.branch_name(task_id, approach_id);
        let path = self
            .workspace_root
            .join("tasks")
            .join(task_id)
            .join("implementations")
            .join(format!("impl-{approach_id}"));
        let name = format!("{task_id}-impl-{approach_id}");
        self.add_worktree(&branch, &path, &name)?;
        Ok((path, branch))
    }

    /// Create the worktree the integration phase merges into.
    pub fn create_integration_worktree(
        &self,
        task_id: &str,
    ) -> Result<(PathBuf, String), GitError> {
        let branch = format!("{task_id}/integration");
        let path = self.workspace_root.join("tasks").join(task_id).join("integration");
        let name = format!("{task_id}-integration");
        self.add_worktree(&branch, &path, &name)?;
        Ok((path, branch))
    }

    fn add_worktree(
        &self,
        branch_name: &str,
        path: &Path,
        worktree_name: &str,
    ) -> Result<(), GitError> {
        if path.exists() {
            warn!(path = %path.display(), "Worktree already exists, recreating");
            self.remove_worktree(path);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GitError::WorktreeFailed {
                path: path.display().to_string(),
                message: format!("failed to create parent directory: {e}"),
            })?;
        }

        let repo = self.open_clone()?;

        // A stale registration with the same name blocks re-adding.
        if let Ok(stale) = repo.find_worktree(worktree_name) {
            let mut prune_opts = git2::WorktreePruneOptions::new();
            prune_opts.valid(true).working_tree(true).locked(true);
            let _ = stale.prune(Some(&mut prune_opts));
        }

        let base = repo
            .find_branch(
                &format!("origin/{}", self.default_branch),
                BranchType::Remote,
            )
            .map_err(|e| GitError::WorktreeFailed {
                path: path.display().to_string(),
                message: format!("base branch origin/{} not found: {e}", self.default_branch),
            })?;
        let base_commit = base.get().peel_to_commit()?;
        repo.branch(branch_name, &base_commit, true)?;

        let branch_ref = repo.find_reference(&format!("refs/heads/{branch_name}"))?;
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));

        info!(path = %path.display(), branch = %branch_name, "Creating worktree");
        repo.worktree(worktree_name, path, Some(&opts))
            .map_err(|e| GitError::WorktreeFailed {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        Ok(())
    }

    /// Remove a worktree directory and prune its registration. Failures are
    /// logged; manual cleanup stays possible.
    pub fn remove_worktree(&self, path: &Path) {
        let Ok(repo) = self.open_clone() else {
            return;
        };

        let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if let Ok(names) = repo.worktrees() {
            for name in names.iter().flatten() {
                let Ok(worktree) = repo.find_worktree(name) else {
                    continue;
                };
                let wt_path = worktree
                    .path()
                    .canonicalize()
                    .unwrap_or_else(|_| worktree.path().to_path_buf());
                if wt_path == resolved {
                    let mut prune_opts = git2::WorktreePruneOptions::new();
                    prune_opts.valid(true).working_tree(true).locked(true);
                    if let Err(e) = worktree.prune(Some(&mut prune_opts)) {
                        warn!(path = %path.display(), error = %e, "Failed to prune worktree");
                    }
                }
            }
        }

        if path.exists() {
            if let Err(e) = std::fs::remove_dir_all(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove worktree directory");
            }
        }
    }

    /// Commit all outstanding work in a worktree, leaving orchestration
    /// artifacts (settings, transcripts, metadata) out of the branch.
    /// Returns the new commit id, or `None` when there was nothing to
    /// commit.
    pub fn commit_all(
        &self,
        worktree_path: &Path,
        message: &str,
    ) -> Result<Option<String>, GitError> {
        let repo = Repository::open(worktree_path).map_err(|e| GitError::OpenFailed {
            path: worktree_path.display().to_string(),
            message: e.to_string(),
        })?;

        let mut index = repo.index()?;
        index.add_all(
            ["*"].iter(),
            git2::IndexAddOption::DEFAULT,
            Some(&mut |path: &Path, _spec: &[u8]| {
                if is_orchestration_artifact(path) {
                    1
                } else {
                    0
                }
            }),
        )?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let head_commit = repo.head()?.peel_to_commit()?;
        if head_commit.tree_id() == tree_id {
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = Signature::now("crucible", "crucible@localhost")?;
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&head_commit])?;
        info!(path = %worktree_path.display(), commit = %commit_id, "Committed worktree changes");
        Ok(Some(commit_id.to_string()))
    }

    /// Diff a worktree's branch against the base branch (committed work
    /// only; call `commit_all` first to capture loose changes).
    pub fn change_summary(&self, worktree_path: &Path) -> Result<ChangeSummary, GitError> {
        let repo = Repository::open(worktree_path).map_err(|e| GitError::OpenFailed {
            path: worktree_path.display().to_string(),
            message: e.to_string(),
        })?;

        let base = repo.find_branch(
            &format!("origin/{}", self.default_branch),
            BranchType::Remote,
        )?;
        let base_tree = base.get().peel_to_commit()?.tree()?;
        let head_tree = repo.head()?.peel_to_commit()?.tree()?;

        let mut opts = DiffOptions::new();
        let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&head_tree), Some(&mut opts))?;

        let mut changed_files: Vec<String> = diff
            .deltas()
            .filter_map(|delta| delta.new_file().path())
            .map(|p| p.display().to_string())
            .collect();
        changed_files.sort();
        changed_files.dedup();

        let stats = diff.stats()?;
        Ok(ChangeSummary {
            files_changed: changed_files.len(),
            insertions: stats.insertions(),
            deletions: stats.deletions(),
            changed_files,
        })
    }

    /// Merge a branch into the repository checked out at `into_path`.
    /// Returns true when the merge hit conflicts (the worktree is rolled
    /// back clean in that case).
    pub fn merge_branch(&self, branch_name: &str, into_path: &Path) -> Result<bool, GitError> {
        let repo = Repository::open(into_path).map_err(|e| GitError::OpenFailed {
            path: into_path.display().to_string(),
            message: e.to_string(),
        })?;

        let reference = repo
            .find_reference(&format!("refs/heads/{branch_name}"))
            .map_err(|e| GitError::MergeFailed {
                branch: branch_name.to_string(),
                message: format!("branch not found: {e}"),
            })?;
        let annotated = repo.reference_to_annotated_commit(&reference)?;

        let (analysis, _) = repo.merge_analysis(&[&annotated])?;
        if analysis.is_up_to_date() {
            info!(branch = %branch_name, "Branch already merged");
            return Ok(false);
        }

        repo.merge(&[&annotated], None, None)?;

        let mut index = repo.index()?;
        if index.has_conflicts() {
            warn!(branch = %branch_name, "Merge conflict, rolling back");
            repo.cleanup_state()?;
            let head = repo.head()?.peel(git2::ObjectType::Commit)?;
            repo.reset(&head, git2::ResetType::Hard, None)?;
            return Ok(true);
        }

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let head_commit = repo.head()?.peel_to_commit()?;
        let their_commit = reference.peel_to_commit()?;
        let sig = Signature::now("crucible", "crucible@localhost")?;
        repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            &format!("Merge branch '{branch_name}'"),
            &tree,
            &[&head_commit, &their_commit],
        )?;
        repo.cleanup_state()?;
        repo.checkout_head(Some(CheckoutBuilder::new().force()))?;

        info!(branch = %branch_name, "Branch merged");
        Ok(false)
    }

    fn open_clone(&self) -> Result<Repository, GitError> {
        Repository::open(&self.clone_dir).map_err(|e| GitError::OpenFailed {
            path: self.clone_dir.display().to_string(),
            message: e.to_string(),
        })
    }

    fn auth_url(&self) -> String {
        if self.access_token.is_empty() {
            return self.target_repo.clone();
        }
        for scheme in ["https://", "http://"] {
            if let Some(rest) = self.target_repo.strip_prefix(scheme) {
                return format!("{}{}@{}", scheme, self.access_token, rest);
            }
        }
        self.target_repo.clone()
    }
}

/// Files the orchestrator writes into worktrees that must never land on an
/// implementation branch.
fn is_orchestration_artifact(path: &Path) -> bool {
    let mut components = path.components();
    match components.next().and_then(|c| c.as_os_str().to_str()) {
        Some(".claude") | Some(".crucible") => true,
        Some("conversation.txt") => components.next().is_none(),
        _ => false,
    }
}

/// Last path segment of the repository URL, without any `.git` suffix.
fn repo_name(target_repo: &str) -> String {
    let trimmed = target_repo.trim_end_matches('/');
    let name = trimmed.rsplit('/').next().unwrap_or(trimmed);
    let name = name.strip_suffix(".git").unwrap_or(name);
    if name.is_empty() {
        "project".to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn init_origin(dir: &Path) -> PathBuf {
        let origin = dir.join("origin");
        let mut opts = git2::RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(&origin, &opts).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        std::fs::write(origin.join("README.md"), "# target project\n").unwrap();
        std::fs::write(origin.join("shared.txt"), "line one\n").unwrap();
        commit_files(&origin, "initial commit");
        origin
    }

    fn commit_files(repo_path: &Path, message: &str) {
        let repo = Repository::open(repo_path).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("test", "test@test.com").unwrap();
        match repo.head() {
            Ok(head) => {
                let parent = head.peel_to_commit().unwrap();
                repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])
                    .unwrap();
            }
            Err(_) => {
                repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[])
                    .unwrap();
            }
        };
    }

    fn manager(workspace: &Path, origin: &Path) -> GitManager {
        GitManager::new(
            workspace.to_path_buf(),
            &origin.display().to_string(),
            "main",
            "",
        )
    }

    #[test]
    fn test_repo_name_extraction() {
        assert_eq!(repo_name("https://github.com/user/my-app"), "my-app");
        assert_eq!(repo_name("https://github.com/user/my-app.git"), "my-app");
        assert_eq!(repo_name("https://github.com/user/my-app/"), "my-app");
        assert_eq!(repo_name("/local/path/project"), "project");
        assert_eq!(repo_name(""), "project");
    }

    #[test]
    fn test_auth_url_inserts_token() {
        let mgr = GitManager::new(
            PathBuf::from("/ws"),
            "https://github.com/user/repo.git",
            "main",
            "tok123",
        );
        assert_eq!(mgr.auth_url(), "https://tok123@github.com/user/repo.git");

        let mgr = GitManager::new(PathBuf::from("/ws"), "/local/repo", "main", "tok123");
        assert_eq!(mgr.auth_url(), "/local/repo");
    }

    #[test]
    fn test_ensure_clone_requires_target_repo() {
        let mgr = GitManager::new(PathBuf::from("/ws"), "", "main", "");
        assert!(matches!(mgr.ensure_clone(), Err(GitError::NoTargetRepo)));
    }

    #[test]
    fn test_ensure_clone_clones_then_fetches() {
        let dir = tempdir().unwrap();
        let origin = init_origin(dir.path());
        let workspace = dir.path().join("workspace");
        let mgr = manager(&workspace, &origin);

        let clone_path = mgr.ensure_clone().unwrap();
        assert!(clone_path.join(".git").exists());
        assert!(clone_path.join("README.md").exists());

        // Advance origin and sync again via fetch.
        std::fs::write(origin.join("new.txt"), "later\n").unwrap();
        commit_files(&origin, "second commit");
        let again = mgr.ensure_clone().unwrap();
        assert_eq!(again, clone_path);
    }

    #[test]
    fn test_create_worktree_checks_out_branch() {
        let dir = tempdir().unwrap();
        let origin = init_origin(dir.path());
        let workspace = dir.path().join("workspace");
        let mgr = manager(&workspace, &origin);
        mgr.ensure_clone().unwrap();

        let (path, branch) = mgr.create_worktree("task-20250101-120000", 1).unwrap();
        assert!(path.ends_with("tasks/task-20250101-120000/implementations/impl-1"));
        assert_eq!(branch, "task-20250101-120000/impl-1");
        assert!(path.join("README.md").exists());

        let repo = Repository::open(&path).unwrap();
        let head = repo.head().unwrap();
        assert_eq!(head.shorthand(), Some("task-20250101-120000/impl-1"));
    }

    #[test]
    fn test_create_worktree_replaces_existing() {
        let dir = tempdir().unwrap();
        let origin = init_origin(dir.path());
        let workspace = dir.path().join("workspace");
        let mgr = manager(&workspace, &origin);
        mgr.ensure_clone().unwrap();

        let (path, _) = mgr.create_worktree("task-20250101-120000", 1).unwrap();
        std::fs::write(path.join("leftover.txt"), "stale").unwrap();

        let (path2, _) = mgr.create_worktree("task-20250101-120000", 1).unwrap();
        assert_eq!(path, path2);
        assert!(!path2.join("leftover.txt").exists());
    }

    #[test]
    fn test_change_summary_counts_work() {
        let dir = tempdir().unwrap();
        let origin = init_origin(dir.path());
        let workspace = dir.path().join("workspace");
        let mgr = manager(&workspace, &origin);
        mgr.ensure_clone().unwrap();

        let (path, _) = mgr.create_worktree("task-20250101-120000", 1).unwrap();
        std::fs::write(path.join("shared.txt"), "line one\nline two\n").unwrap();
        std::fs::write(path.join("feature.rs"), "fn feature() {}\n").unwrap();
        commit_files(&path, "implement feature");

        let summary = mgr.change_summary(&path).unwrap();
        assert_eq!(summary.files_changed, 2);
        assert!(summary.changed_files.contains(&"feature.rs".to_string()));
        assert!(summary.changed_files.contains(&"shared.txt".to_string()));
        assert!(summary.insertions >= 2);
    }

    #[test]
    fn test_change_summary_clean_worktree() {
        let dir = tempdir().unwrap();
        let origin = init_origin(dir.path());
        let workspace = dir.path().join("workspace");
        let mgr = manager(&workspace, &origin);
        mgr.ensure_clone().unwrap();

        let (path, _) = mgr.create_worktree("task-20250101-120000", 1).unwrap();
        let summary = mgr.change_summary(&path).unwrap();
        assert_eq!(summary.files_changed, 0);
        assert_eq!(summary.insertions, 0);
    }

    #[test]
    fn test_merge_branches_without_conflict() {
        let dir = tempdir().unwrap();
        let origin = init_origin(dir.path());
        let workspace = dir.path().join("workspace");
        let mgr = manager(&workspace, &origin);
        mgr.ensure_clone().unwrap();

        let task = "task-20250101-120000";
        let (wt1, branch1) = mgr.create_worktree(task, 1).unwrap();
        std::fs::write(wt1.join("alpha.txt"), "alpha\n").unwrap();
        commit_files(&wt1, "add alpha");

        let (wt2, branch2) = mgr.create_worktree(task, 2).unwrap();
        std::fs::write(wt2.join("beta.txt"), "beta\n").unwrap();
        commit_files(&wt2, "add beta");

        let (integration, _) = mgr.create_integration_worktree(task).unwrap();
        assert!(!mgr.merge_branch(&branch1, &integration).unwrap());
        assert!(!mgr.merge_branch(&branch2, &integration).unwrap());
        assert!(integration.join("alpha.txt").exists());
        assert!(integration.join("beta.txt").exists());
    }

    #[test]
    fn test_merge_conflict_is_reported_and_rolled_back() {
        let dir = tempdir().unwrap();
        let origin = init_origin(dir.path());
        let workspace = dir.path().join("workspace");
        let mgr = manager(&workspace, &origin);
        mgr.ensure_clone().unwrap();

        let task = "task-20250101-120000";
        let (wt1, branch1) = mgr.create_worktree(task, 1).unwrap();
        std::fs::write(wt1.join("shared.txt"), "version from one\n").unwrap();
        commit_files(&wt1, "one edits shared");

        let (wt2, branch2) = mgr.create_worktree(task, 2).unwrap();
        std::fs::write(wt2.join("shared.txt"), "version from two\n").unwrap();
        commit_files(&wt2, "two edits shared");

        let (integration, _) = mgr.create_integration_worktree(task).unwrap();
        assert!(!mgr.merge_branch(&branch1, &integration).unwrap());
        // The second branch touches the same lines: conflict.
        assert!(mgr.merge_branch(&branch2, &integration).unwrap());

        // Rolled back to the first branch's content, no conflict markers.
        let content = std::fs::read_to_string(integration.join("shared.txt")).unwrap();
        assert_eq!(content, "version from one\n");
    }

    #[test]
    fn test_commit_all_skips_orchestration_artifacts() {
        let dir = tempdir().unwrap();
        let origin = init_origin(dir.path());
        let workspace = dir.path().join("workspace");
        let mgr = manager(&workspace, &origin);
        mgr.ensure_clone().unwrap();

        let (path, _) = mgr.create_worktree("task-20250101-120000", 1).unwrap();
        std::fs::write(path.join("real_work.rs"), "fn work() {}\n").unwrap();
        std::fs::create_dir_all(path.join(".claude")).unwrap();
        std::fs::write(path.join(".claude/settings.json"), "{}").unwrap();
        std::fs::write(path.join("conversation.txt"), "transcript").unwrap();

        let commit = mgr.commit_all(&path, "agent work").unwrap();
        assert!(commit.is_some());

        let summary = mgr.change_summary(&path).unwrap();
        assert_eq!(summary.changed_files, vec!["real_work.rs"]);

        // Nothing left to commit on a second pass.
        assert!(mgr.commit_all(&path, "again").unwrap().is_none());
    }

    #[test]
    fn test_remove_worktree() {
        let dir = tempdir().unwrap();
        let origin = init_origin(dir.path());
        let workspace = dir.path().join("workspace");
        let mgr = manager(&workspace, &origin);
        mgr.ensure_clone().unwrap();

        let (path, _) = mgr.create_worktree("task-20250101-120000", 1).unwrap();
        assert!(path.exists());
        mgr.remove_worktree(&path);
        assert!(!path.exists());
    }
}
