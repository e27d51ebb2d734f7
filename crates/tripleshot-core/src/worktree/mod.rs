//! Git worktree management for attempt isolation.
//!
//! Each attempt runs in its own git worktree: filesystem isolation without
//! full clones. Worktrees share the object store of the main repository but
//! have independent working directories and index files.
//!
//! Git does not support concurrent worktree operations on one repository
//! (it locks the shared object store), so all mutating operations here
//! serialize behind an internal mutex.
//!
//! All git plumbing funnels through [`run_git`]: one captured invocation,
//! classified per call site (exit code, known stderr markers) into either a
//! typed [`WorktreeError`] or an idempotent no-op.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Errors from worktree operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// The main repository path does not exist or is not a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// A git command failed to execute.
    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The worktree path exists but holds a different branch than expected.
    #[error("worktree path exists but has unexpected branch: expected {expected}, found {found}")]
    BranchMismatch { expected: String, found: String },

    /// Unparseable `git worktree list --porcelain` output.
    #[error("failed to parse worktree list output: {0}")]
    ParseError(String),
}

/// Result of merging a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    Success,
    /// The merge conflicted and was aborted.
    Conflict { details: String },
}

/// One registered worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    /// Branch checked out in the worktree, if any.
    pub branch: Option<String>,
    pub head_commit: String,
}

// ---------------------------------------------------------------------------
// Git plumbing
// ---------------------------------------------------------------------------

/// Captured result of one git invocation.
struct GitOutput {
    code: i32,
    stdout: String,
    stderr: String,
}

impl GitOutput {
    fn ok(&self) -> bool {
        self.code == 0
    }

    fn stderr_contains(&self, needle: &str) -> bool {
        self.stderr.contains(needle)
    }

    /// Merge-conflict markers git emits on either stream.
    fn conflicted(&self) -> bool {
        self.stdout.contains("CONFLICT")
            || self.stderr.contains("CONFLICT")
            || self.stderr.contains("Automatic merge failed")
    }

    fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }

    fn into_exit_error(self, command: &str) -> WorktreeError {
        WorktreeError::GitExit {
            command: command.to_owned(),
            code: self.code,
            stderr: self.stderr,
        }
    }
}

/// Run git in `dir` and capture the outcome. Only failure to spawn is an
/// error here; non-zero exits are returned for the caller to classify.
fn run_git(dir: &Path, args: &[&str]) -> Result<GitOutput, WorktreeError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| WorktreeError::GitCommand {
            message: format!("failed to run git {}", args.join(" ")),
            source: e,
        })?;
    Ok(GitOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Number of commits on the current HEAD of `dir` that are not on `base`.
///
/// Runs directly in the given directory, so completion checkers can count
/// commits in a worktree they only know by path.
pub fn commit_count_in_dir(dir: &Path, base: &str) -> Result<u32, WorktreeError> {
    let range = format!("{base}..HEAD");
    let out = run_git(dir, &["rev-list", "--count", &range])?;
    if !out.ok() {
        return Err(out.into_exit_error("rev-list"));
    }
    parse_count(&out.stdout)
}

fn parse_count(text: &str) -> Result<u32, WorktreeError> {
    text.trim()
        .parse::<u32>()
        .map_err(|e| WorktreeError::ParseError(format!("rev-list count {text:?}: {e}")))
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Manages git worktrees for attempt isolation.
#[derive(Debug)]
pub struct WorktreeManager {
    repo_path: PathBuf,
    worktree_base: PathBuf,
    /// Serializes git operations to avoid lock-file contention.
    git_lock: Arc<Mutex<()>>,
}

impl Clone for WorktreeManager {
    fn clone(&self) -> Self {
        Self {
            repo_path: self.repo_path.clone(),
            worktree_base: self.worktree_base.clone(),
            git_lock: Arc::clone(&self.git_lock),
        }
    }
}

impl WorktreeManager {
    /// Create a manager rooted at `repo_path`, placing worktrees under
    /// `worktree_base` (default: a sibling directory named
    /// `<repo-name>-tripleshot-worktrees`).
    ///
    /// Fails with [`WorktreeError::NotAGitRepo`] if `repo_path` is not a
    /// git repository.
    pub fn new(
        repo_path: impl Into<PathBuf>,
        worktree_base: Option<PathBuf>,
    ) -> Result<Self, WorktreeError> {
        let repo_path = repo_path.into();

        if !run_git(&repo_path, &["rev-parse", "--git-dir"])?.ok() {
            return Err(WorktreeError::NotAGitRepo(repo_path));
        }

        let worktree_base = worktree_base.unwrap_or_else(|| {
            let repo_name = repo_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("repo");
            let base_name = format!("{repo_name}-tripleshot-worktrees");
            repo_path
                .parent()
                .map(|p| p.join(&base_name))
                .unwrap_or_else(|| PathBuf::from(base_name))
        });

        Ok(Self {
            repo_path,
            worktree_base,
            git_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn worktree_base(&self) -> &Path {
        &self.worktree_base
    }

    /// Conventional branch name for one attempt of a session.
    ///
    /// Format: `tripleshot/<session-prefix>/attempt-<index>`.
    pub fn attempt_branch(session_prefix: &str, attempt_index: usize) -> String {
        format!("tripleshot/{session_prefix}/attempt-{attempt_index}")
    }

    /// Run git in the main repository. Callers hold `git_lock` when the
    /// command mutates shared state.
    fn git(&self, args: &[&str]) -> Result<GitOutput, WorktreeError> {
        run_git(&self.repo_path, args)
    }

    /// Create a worktree for `branch_name`, or return the existing one.
    ///
    /// The directory is `worktree_base/<branch with '/' -> '--'>`. The
    /// operation is idempotent: an existing worktree with the expected
    /// branch (or a detached HEAD) is returned as-is; one holding a
    /// different branch is a [`WorktreeError::BranchMismatch`].
    pub fn create_worktree(&self, branch_name: &str) -> Result<WorktreeInfo, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let worktree_path = self.worktree_base.join(branch_name.replace('/', "--"));

        if let Some(existing) = self.registered_at(&worktree_path)? {
            return match existing.branch.as_deref() {
                Some(found) if found != branch_name => Err(WorktreeError::BranchMismatch {
                    expected: branch_name.to_string(),
                    found: found.to_string(),
                }),
                _ => {
                    tracing::info!(
                        path = %worktree_path.display(),
                        branch = branch_name,
                        "reusing existing worktree"
                    );
                    Ok(existing)
                }
            };
        }

        std::fs::create_dir_all(&self.worktree_base).map_err(|e| WorktreeError::GitCommand {
            message: format!(
                "failed to create worktree base directory {}",
                self.worktree_base.display()
            ),
            source: e,
        })?;

        // An existing branch is checked out; a new one is created with -b.
        let path_arg = worktree_path.to_string_lossy().into_owned();
        let out = if self.branch_exists_locked(branch_name)? {
            self.git(&["worktree", "add", &path_arg, branch_name])?
        } else {
            self.git(&["worktree", "add", "-b", branch_name, &path_arg])?
        };
        if !out.ok() {
            // Drop any half-created directory.
            if worktree_path.exists() {
                let _ = std::fs::remove_dir_all(&worktree_path);
            }
            return Err(out.into_exit_error("worktree add"));
        }

        self.registered_at(&worktree_path)?.ok_or_else(|| {
            WorktreeError::ParseError(format!(
                "worktree {} missing from list after add",
                worktree_path.display()
            ))
        })
    }

    /// Remove a worktree by path. Idempotent: a missing worktree is a no-op.
    pub fn remove_worktree(&self, path: &Path) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        if self.registered_at(path)?.is_none() {
            // Unregistered leftover directories are swept; git state is
            // untouched.
            if path.exists() {
                tracing::warn!(
                    path = %path.display(),
                    "removing directory git does not know about"
                );
                let _ = std::fs::remove_dir_all(path);
            }
            return Ok(());
        }

        let path_arg = path.to_string_lossy().into_owned();
        let out = self.git(&["worktree", "remove", "--force", &path_arg])?;
        // A racing removal surfaces as "is not a working tree".
        if out.ok() || out.stderr_contains("is not a working tree") {
            Ok(())
        } else {
            Err(out.into_exit_error("worktree remove"))
        }
    }

    /// List all worktrees registered with the main repository.
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.list_registered()
    }

    /// Number of commits on `branch` that are not on `base`.
    pub fn commit_count(&self, branch: &str, base: &str) -> Result<u32, WorktreeError> {
        let range = format!("{base}..{branch}");
        let out = self.git(&["rev-list", "--count", &range])?;
        if !out.ok() {
            return Err(out.into_exit_error("rev-list"));
        }
        parse_count(&out.stdout)
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch_name: &str) -> Result<bool, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.branch_exists_locked(branch_name)
    }

    fn branch_exists_locked(&self, branch_name: &str) -> Result<bool, WorktreeError> {
        let refname = format!("refs/heads/{branch_name}");
        Ok(self.git(&["rev-parse", "--verify", &refname])?.ok())
    }

    /// Checkout a branch in the main repository.
    pub fn checkout(&self, branch_name: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let out = self.git(&["checkout", branch_name])?;
        if out.ok() {
            Ok(())
        } else {
            Err(out.into_exit_error("checkout"))
        }
    }

    /// Merge `branch_name` into the current branch with `--no-ff`.
    ///
    /// A conflicted merge is aborted and reported as
    /// [`MergeResult::Conflict`]; other git failures are errors.
    pub fn merge_branch(&self, branch_name: &str) -> Result<MergeResult, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let out = self.git(&["merge", "--no-ff", branch_name])?;
        if out.ok() {
            return Ok(MergeResult::Success);
        }
        if !out.conflicted() {
            return Err(out.into_exit_error("merge"));
        }

        // Leave the repository clean before reporting the conflict.
        match self.git(&["merge", "--abort"]) {
            Ok(abort) if !abort.ok() => {
                tracing::warn!(stderr = %abort.stderr, "merge --abort failed");
            }
            Err(e) => {
                tracing::warn!(error = %e, "merge --abort could not run");
            }
            _ => {}
        }
        Ok(MergeResult::Conflict {
            details: out.combined().trim().to_string(),
        })
    }

    /// Force-delete a local branch. Idempotent for missing branches.
    ///
    /// `-D` because the branch is not reachable from the current branch
    /// until an eventual `--no-ff` merge.
    pub fn delete_branch(&self, branch_name: &str) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let out = self.git(&["branch", "-D", branch_name])?;
        if out.ok() || out.stderr_contains("not found") {
            Ok(())
        } else {
            Err(out.into_exit_error("branch -D"))
        }
    }

    /// All registered worktrees, without taking the git lock. Internal
    /// callers already hold it.
    fn list_registered(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let out = self.git(&["worktree", "list", "--porcelain"])?;
        if !out.ok() {
            return Err(out.into_exit_error("worktree list"));
        }
        parse_porcelain_output(&out.stdout)
    }

    /// The worktree registered at `path`, if any.
    fn registered_at(&self, path: &Path) -> Result<Option<WorktreeInfo>, WorktreeError> {
        Ok(self
            .list_registered()?
            .into_iter()
            .find(|info| info.path == path))
    }
}

/// Parse `git worktree list --porcelain` output into [`WorktreeInfo`]s.
///
/// Entries are blank-line separated blocks of `worktree <path>`,
/// `HEAD <sha>`, and either `branch refs/heads/<name>` or `detached`.
fn parse_porcelain_output(output: &str) -> Result<Vec<WorktreeInfo>, WorktreeError> {
    let mut result = Vec::new();

    for block in output.split("\n\n").map(str::trim).filter(|b| !b.is_empty()) {
        let mut path: Option<PathBuf> = None;
        let mut head: Option<String> = None;
        let mut branch: Option<String> = None;

        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("worktree ") {
                path = Some(PathBuf::from(rest));
            } else if let Some(rest) = line.strip_prefix("HEAD ") {
                head = Some(rest.to_owned());
            } else if let Some(rest) = line.strip_prefix("branch ") {
                branch = Some(rest.strip_prefix("refs/heads/").unwrap_or(rest).to_owned());
            }
            // "detached" and unknown attributes are ignored.
        }

        let path = path
            .ok_or_else(|| WorktreeError::ParseError(format!("block missing worktree line: {block:?}")))?;
        let head_commit = head.ok_or_else(|| {
            WorktreeError::ParseError(format!("missing HEAD for {}", path.display()))
        })?;
        result.push(WorktreeInfo {
            path,
            branch,
            head_commit,
        });
    }

    Ok(result)
}
