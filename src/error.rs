// SPDX-License-Identifier: MIT
//! Error taxonomy for the review core.
//!
//! Every failure a client can observe carries a stable uppercase code
//! (`NO_DIFF`, `DIFF_TOO_LARGE`, ...) so UIs and scripts can dispatch on it
//! without parsing English. Input/validation and collaborator errors are
//! never retried; AI errors are surfaced per lens and aggregated by the
//! orchestrator's partial-failure policy.

use crate::ai::AiError;

// ─── Git error classification ─────────────────────────────────────────────────

/// Stable codes for failures coming out of the git collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitErrorCode {
    NotFound,
    PermissionDenied,
    Timeout,
    BufferExceeded,
    Other,
}

impl GitErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitErrorCode::NotFound => "GIT_NOT_FOUND",
            GitErrorCode::PermissionDenied => "GIT_PERMISSION_DENIED",
            GitErrorCode::Timeout => "GIT_TIMEOUT",
            GitErrorCode::BufferExceeded => "GIT_BUFFER_EXCEEDED",
            GitErrorCode::Other => "GIT_ERROR",
        }
    }

    /// Classify a raw git error message into a stable code.
    ///
    /// The underlying library surface is free-form text; the rest of the core
    /// only ever sees the code.
    pub fn classify(raw: &str) -> Self {
        let lower = raw.to_lowercase();
        if lower.contains("could not find repository")
            || lower.contains("not a git repository")
            || lower.contains("no such file")
        {
            GitErrorCode::NotFound
        } else if lower.contains("permission denied") || lower.contains("eacces") {
            GitErrorCode::PermissionDenied
        } else if lower.contains("timed out") || lower.contains("timeout") {
            GitErrorCode::Timeout
        } else if lower.contains("too large") || lower.contains("buffer") {
            GitErrorCode::BufferExceeded
        } else {
            GitErrorCode::Other
        }
    }
}

impl std::fmt::Display for GitErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── ReviewError ──────────────────────────────────────────────────────────────

/// Top-level error for pipeline, orchestrator, drilldown, and store operations.
#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    /// The requested diff is empty — a normal terminal condition, not a crash.
    #[error("nothing to review: the {mode} diff is empty")]
    NoDiff { mode: String },

    /// Diff exceeds the hard size limit. Checked before any AI call.
    #[error("diff is {actual} bytes, which exceeds the {limit}-byte review limit")]
    DiffTooLarge { actual: usize, limit: usize },

    /// An explicit file filter was given but matched nothing in the diff.
    #[error("file filter matched no changed files")]
    FilterMatchedNothing,

    /// Git collaborator failure, already classified.
    #[error("{code}: {message}")]
    Git { code: GitErrorCode, message: String },

    /// AI provider failure (per-lens failures are wrapped by the orchestrator).
    #[error(transparent)]
    Ai(#[from] AiError),

    /// Every attempted lens failed; `first` is the first failure observed.
    #[error("all {attempted} review lenses failed: {first}")]
    AllLensesFailed { attempted: usize, first: String },

    /// A lens failed and partial aggregation was not enabled.
    #[error("lens '{lens_id}' failed: {message}")]
    LensFailed { lens_id: String, message: String },

    #[error("review not found: {0}")]
    ReviewNotFound(String),

    #[error("issue not found: {0}")]
    IssueNotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// The caller's cancellation token fired. Never treated as success.
    #[error("review aborted")]
    Aborted,
}

impl ReviewError {
    /// Stable uppercase code for wire serialization and log filtering.
    pub fn code(&self) -> &'static str {
        match self {
            ReviewError::NoDiff { .. } => "NO_DIFF",
            ReviewError::DiffTooLarge { .. } => "DIFF_TOO_LARGE",
            ReviewError::FilterMatchedNothing => "INVALID_FILE_FILTER",
            ReviewError::Git { code, .. } => code.as_str(),
            ReviewError::Ai(e) => e.code.as_str(),
            ReviewError::AllLensesFailed { .. } => "ALL_LENSES_FAILED",
            ReviewError::LensFailed { .. } => "LENS_FAILED",
            ReviewError::ReviewNotFound(_) => "REVIEW_NOT_FOUND",
            ReviewError::IssueNotFound(_) => "ISSUE_NOT_FOUND",
            ReviewError::Storage(_) => "STORAGE_ERROR",
            ReviewError::Aborted => "ABORTED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_git_error_text() {
        assert_eq!(
            GitErrorCode::classify("could not find repository at '/tmp/x'"),
            GitErrorCode::NotFound
        );
        assert_eq!(
            GitErrorCode::classify("Permission denied (os error 13)"),
            GitErrorCode::PermissionDenied
        );
        assert_eq!(
            GitErrorCode::classify("operation timed out"),
            GitErrorCode::Timeout
        );
        assert_eq!(
            GitErrorCode::classify("output too large for buffer"),
            GitErrorCode::BufferExceeded
        );
        assert_eq!(GitErrorCode::classify("index is locked"), GitErrorCode::Other);
    }

    #[test]
    fn codes_are_stable() {
        let e = ReviewError::NoDiff {
            mode: "staged".into(),
        };
        assert_eq!(e.code(), "NO_DIFF");
        let e = ReviewError::DiffTooLarge {
            actual: 600_000,
            limit: 524_288,
        };
        assert_eq!(e.code(), "DIFF_TOO_LARGE");
        assert!(e.to_string().contains("600000"));
        assert!(e.to_string().contains("524288"));
        assert_eq!(ReviewError::Aborted.code(), "ABORTED");
    }
}
