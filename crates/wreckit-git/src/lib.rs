//! The git/gh lifecycle a phase run drives a working tree through (§4.7):
//! branch, commit, push, open-or-merge, cleanup. Every operation shells
//! out via `std::process::Command`, with the binary path overridable by
//! `WRECKIT_GIT_BIN`/`WRECKIT_GH_BIN` so tests can point at a fake binary
//! instead of a real git/gh install.

use std::env;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use wreckit_types::error::GitError;

fn git_program() -> String {
    env::var("WRECKIT_GIT_BIN").unwrap_or_else(|_| "git".to_string())
}

fn gh_program() -> String {
    env::var("WRECKIT_GH_BIN").unwrap_or_else(|_| "gh".to_string())
}

fn run_git(repo_root: &Path, args: &[&str]) -> Result<String, GitError> {
    let output = Command::new(git_program())
        .args(args)
        .current_dir(repo_root)
        .output()
        .map_err(|e| GitError::CommandFailed {
            code: None,
            stderr: format!("git {}: {e}", args.join(" ")),
        })?;

    if !output.status.success() {
        return Err(GitError::CommandFailed {
            code: output.status.code(),
            stderr: format!(
                "git {}: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub fn is_clean(repo_root: &Path) -> Result<bool, GitError> {
    let status = run_git(repo_root, &["status", "--porcelain"])?;
    Ok(status.is_empty())
}

/// Checkout `branch`, creating it from `base_branch` if it doesn't exist
/// yet. Idempotent: calling this again on a branch already checked out is
/// a no-op past the initial `rev-parse` check.
pub fn ensure_branch(repo_root: &Path, branch: &str, base_branch: &str) -> Result<(), GitError> {
    let exists = Command::new(git_program())
        .args(["rev-parse", "--verify", branch])
        .current_dir(repo_root)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);

    if exists {
        run_git(repo_root, &["checkout", branch])?;
    } else {
        run_git(repo_root, &["checkout", "-b", branch, base_branch])?;
    }
    Ok(())
}

/// Stage and commit every change in the working tree. Returns `false`
/// (without error) if there was nothing to commit, matching the fact that
/// an agent run that made no changes isn't itself a failure.
pub fn commit_all(repo_root: &Path, message: &str) -> Result<bool, GitError> {
    run_git(repo_root, &["add", "-A"])?;
    if is_clean(repo_root)? {
        return Ok(false);
    }
    run_git(repo_root, &["commit", "-m", message])?;
    Ok(true)
}

pub fn push_branch(repo_root: &Path, branch: &str) -> Result<(), GitError> {
    match run_git(repo_root, &["push", "--set-upstream", "origin", branch]) {
        Ok(_) => Ok(()),
        Err(GitError::CommandFailed { stderr, .. })
            if stderr.contains("non-fast-forward") || stderr.contains("rejected") =>
        {
            Err(GitError::PushRejected(stderr))
        }
        Err(other) => Err(other),
    }
}

#[derive(Debug, Clone)]
pub struct PullRequestHandle {
    pub url: String,
    pub number: Option<u64>,
}

/// Open a PR for `branch` against `base_branch` via the configured forge
/// CLI. Fails with [`GitError::PrToolMissing`] rather than a generic
/// command failure when the binary itself can't be found, so the caller
/// can surface a clear "install gh" message instead of a raw exit code.
pub fn open_pr(
    repo_root: &Path,
    branch: &str,
    base_branch: &str,
    title: &str,
    body: &str,
) -> Result<PullRequestHandle, GitError> {
    let program = gh_program();
    let output = Command::new(&program)
        .args([
            "pr", "create", "--head", branch, "--base", base_branch, "--title", title, "--body",
            body,
        ])
        .current_dir(repo_root)
        .output()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GitError::PrToolMissing(program.clone())
            } else {
                GitError::CommandFailed {
                    code: None,
                    stderr: format!("pr create: {e}"),
                }
            }
        })?;

    if !output.status.success() {
        return Err(GitError::CommandFailed {
            code: output.status.code(),
            stderr: format!(
                "pr create: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let number = url.rsplit('/').next().and_then(|s| s.parse().ok());
    Ok(PullRequestHandle { url, number })
}

pub fn remote_url(repo_root: &Path, remote: &str) -> Result<String, GitError> {
    run_git(repo_root, &["remote", "get-url", remote])
}

/// Minimal shell-style glob match: `*` consumes any run of characters
/// (including none), every other byte must match literally. Enough for
/// `allowed_remote_patterns` entries like `git@github.com:trusted/*`.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(pattern: &[u8], text: &[u8]) -> bool {
        match pattern.first() {
            None => text.is_empty(),
            Some(b'*') => {
                inner(&pattern[1..], text)
                    || (!text.is_empty() && inner(pattern, &text[1..]))
            }
            Some(&p) => text.first().is_some_and(|&t| t == p) && inner(&pattern[1..], &text[1..]),
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

/// Merge `branch` into `base_branch` without going through a PR. Callers
/// must check `allowed` themselves against [`wreckit_types::MergeMode`] —
/// this function exists so the "not allowed" error always comes from one
/// place rather than being re-derived at each call site. Even when
/// `allowed`, the `origin` remote URL must match one of
/// `allowed_remote_patterns` (shell-glob) or the merge is refused.
pub fn direct_merge(
    repo_root: &Path,
    branch: &str,
    base_branch: &str,
    allowed: bool,
    allowed_remote_patterns: &[String],
) -> Result<(), GitError> {
    if !allowed {
        return Err(GitError::DirectMergeNotAllowed);
    }
    let origin = remote_url(repo_root, "origin")?;
    if !allowed_remote_patterns
        .iter()
        .any(|pattern| glob_match(pattern, &origin))
    {
        return Err(GitError::DirectMergeNotAllowed);
    }
    run_git(repo_root, &["checkout", base_branch])?;
    run_git(repo_root, &["merge", "--no-ff", branch])?;
    run_git(repo_root, &["push", "origin", base_branch])?;
    Ok(())
}

pub fn cleanup_branch(repo_root: &Path, branch: &str, delete_remote: bool) -> Result<(), GitError> {
    let _ = run_git(repo_root, &["branch", "-D", branch]);
    if delete_remote {
        let _ = run_git(repo_root, &["push", "origin", "--delete", branch]);
    }
    Ok(())
}

/// Captures a `git stash` of any pre-existing dirty state before a phase
/// run starts, so a failed or interrupted phase can roll the working tree
/// back to exactly how it found it. `keep()` must be called once the
/// phase's own changes are safely committed; otherwise `Drop` pops the
/// stash back, restoring whatever was there before.
pub struct WorkingTreeStash {
    repo_root: std::path::PathBuf,
    stashed: bool,
    kept: bool,
}

impl WorkingTreeStash {
    pub fn capture(repo_root: &Path) -> Result<Self, GitError> {
        let stashed = if is_clean(repo_root)? {
            false
        } else {
            run_git(
                repo_root,
                &["stash", "push", "--include-untracked", "-m", "wreckit-autostash"],
            )?;
            true
        };
        Ok(Self {
            repo_root: repo_root.to_path_buf(),
            stashed,
            kept: false,
        })
    }

    /// The phase's changes were committed deliberately; don't restore the
    /// pre-phase stash on drop.
    pub fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for WorkingTreeStash {
    fn drop(&mut self) {
        if self.stashed && !self.kept {
            let _ = run_git(&self.repo_root, &["stash", "pop"]);
        }
    }
}

pub fn require_working_tree_clean(repo_root: &Path) -> Result<()> {
    if !is_clean(repo_root).context("failed to check working tree status")? {
        anyhow::bail!(GitError::WorkingTreeDirty);
    }
    Ok(())
}
