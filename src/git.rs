// SPDX-License-Identifier: MIT
//! Git collaborator — the version-control accessor consumed by the pipeline.
//!
//! The core depends only on the [`GitAccess`] signatures; [`Git2Access`] is
//! the default libgit2-backed implementation. Local operations only — no
//! fetch, push, or SSH.

use std::path::PathBuf;

use async_trait::async_trait;
use git2::{Repository, StatusOptions};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{GitErrorCode, ReviewError};
use crate::model::{BlameInfo, ReviewMode};

// ─── Status types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoStatus {
    pub branch: String,
    pub head_commit: String,
    /// `"path:status"` entries, sorted, feeding the status hash.
    pub files: Vec<String>,
}

impl RepoStatus {
    /// Content-derived hash identifying this working-tree state. Two runs on
    /// the same tree with the same changes produce the same hash.
    pub fn status_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.branch.as_bytes());
        hasher.update(self.head_commit.as_bytes());
        for f in &self.files {
            hasher.update(f.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

// ─── Trait ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait GitAccess: Send + Sync {
    /// Raw unified diff text for the requested mode. `Files` mode returns the
    /// full working-tree diff; the pipeline applies the file filter itself.
    async fn get_diff(&self, mode: ReviewMode) -> Result<String, ReviewError>;

    async fn get_status(&self) -> Result<RepoStatus, ReviewError>;

    async fn get_status_hash(&self) -> Result<String, ReviewError>;

    /// Blame attribution for one line. `None` when unresolvable (new file,
    /// uncommitted line) — never an error for the caller to handle.
    async fn get_blame(&self, file: &str, line: u32) -> Result<Option<BlameInfo>, ReviewError>;
}

// ─── libgit2 implementation ───────────────────────────────────────────────────

pub struct Git2Access {
    repo_path: PathBuf,
}

impl Git2Access {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    /// git2 types are not `Send`; every operation opens the repository inside
    /// `spawn_blocking` and returns owned data.
    async fn with_repo<T, F>(&self, f: F) -> Result<T, ReviewError>
    where
        T: Send + 'static,
        F: FnOnce(&Repository) -> Result<T, git2::Error> + Send + 'static,
    {
        let path = self.repo_path.clone();
        tokio::task::spawn_blocking(move || {
            let repo = Repository::open(&path).map_err(git_err)?;
            f(&repo).map_err(git_err)
        })
        .await
        .map_err(|e| ReviewError::Git {
            code: GitErrorCode::Other,
            message: format!("git worker panicked: {e}"),
        })?
    }
}

fn git_err(e: git2::Error) -> ReviewError {
    ReviewError::Git {
        code: GitErrorCode::classify(e.message()),
        message: e.message().to_string(),
    }
}

#[async_trait]
impl GitAccess for Git2Access {
    async fn get_diff(&self, mode: ReviewMode) -> Result<String, ReviewError> {
        self.with_repo(move |repo| {
            let head_tree = match repo.head() {
                Ok(h) => Some(h.peel_to_tree()?),
                Err(_) => None, // unborn branch — diff against nothing
            };
            let diff = match mode {
                ReviewMode::Staged => {
                    repo.diff_tree_to_index(head_tree.as_ref(), None, None)?
                }
                ReviewMode::Unstaged => repo.diff_index_to_workdir(None, None)?,
                ReviewMode::Files => {
                    repo.diff_tree_to_workdir_with_index(head_tree.as_ref(), None)?
                }
            };
            render_patch(&diff)
        })
        .await
    }

    async fn get_status(&self) -> Result<RepoStatus, ReviewError> {
        self.with_repo(|repo| {
            let branch = match repo.head() {
                Ok(h) if h.is_branch() => h.shorthand().unwrap_or("HEAD").to_string(),
                Ok(h) => h
                    .peel_to_commit()
                    .map(|c| format!("{:.7}", c.id()))
                    .unwrap_or_else(|_| "HEAD".to_string()),
                Err(_) => "HEAD".to_string(),
            };
            let head_commit = repo
                .head()
                .and_then(|h| h.peel_to_commit())
                .map(|c| c.id().to_string())
                .unwrap_or_default();

            let mut opts = StatusOptions::new();
            opts.include_untracked(true)
                .include_ignored(false)
                .recurse_untracked_dirs(true);
            let statuses = repo.statuses(Some(&mut opts))?;

            let mut files: Vec<String> = statuses
                .iter()
                .map(|entry| {
                    format!(
                        "{}:{:?}",
                        entry.path().unwrap_or(""),
                        entry.status()
                    )
                })
                .collect();
            files.sort_unstable();

            Ok(RepoStatus {
                branch,
                head_commit,
                files,
            })
        })
        .await
    }

    async fn get_status_hash(&self) -> Result<String, ReviewError> {
        Ok(self.get_status().await?.status_hash())
    }

    async fn get_blame(&self, file: &str, line: u32) -> Result<Option<BlameInfo>, ReviewError> {
        let file = file.to_string();
        self.with_repo(move |repo| {
            let blame = match repo.blame_file(std::path::Path::new(&file), None) {
                Ok(b) => b,
                // New or renamed files have no blame history — not an error.
                Err(_) => return Ok(None),
            };
            let Some(hunk) = blame.get_line(line as usize) else {
                return Ok(None);
            };
            let commit_id = hunk.final_commit_id();
            if commit_id.is_zero() {
                return Ok(None); // uncommitted line
            }
            let summary = repo
                .find_commit(commit_id)
                .ok()
                .and_then(|c| c.summary().map(|s| s.to_string()))
                .unwrap_or_default();
            // The signature borrows from the blame hunk; keep it in its own
            // binding so it is dropped before the hunk.
            let signature = hunk.final_signature();
            let author = signature.name().unwrap_or("unknown").to_string();
            Ok(Some(BlameInfo {
                commit: format!("{:.12}", commit_id),
                author,
                summary,
            }))
        })
        .await
    }
}

/// Render a git2 diff as standard unified-diff text.
fn render_patch(diff: &git2::Diff) -> Result<String, git2::Error> {
    let mut out = String::new();
    diff.print(git2::DiffFormat::Patch, |_delta, _hunk, line| {
        match line.origin() {
            '+' | '-' | ' ' => out.push(line.origin()),
            _ => {}
        }
        out.push_str(&String::from_utf8_lossy(line.content()));
        true
    })?;
    Ok(out)
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_hash_is_deterministic() {
        let status = RepoStatus {
            branch: "main".into(),
            head_commit: "abc123".into(),
            files: vec!["src/lib.rs:WT_MODIFIED".into()],
        };
        let again = RepoStatus {
            branch: "main".into(),
            head_commit: "abc123".into(),
            files: vec!["src/lib.rs:WT_MODIFIED".into()],
        };
        assert_eq!(status.status_hash(), again.status_hash());
        assert_eq!(status.status_hash().len(), 64);
    }

    #[test]
    fn status_hash_changes_with_tree_state() {
        let a = RepoStatus {
            branch: "main".into(),
            head_commit: "abc123".into(),
            files: vec!["src/lib.rs:WT_MODIFIED".into()],
        };
        let b = RepoStatus {
            branch: "main".into(),
            head_commit: "abc123".into(),
            files: vec![],
        };
        assert_ne!(a.status_hash(), b.status_hash());
    }
}
