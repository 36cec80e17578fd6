// SPDX-License-Identifier: MIT
//! Data models for the review core.
//!
//! All types are `Serialize`/`Deserialize` so they can cross the SSE/REST
//! boundary and be stored as `SavedReview` JSON documents.

use serde::{Deserialize, Serialize};

use crate::event::Event;

// ─── Severity ─────────────────────────────────────────────────────────────────

/// Issue severity. Ordered: `Nit < Low < Medium < High < Blocker`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Nit,
    Low,
    Medium,
    High,
    Blocker,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Nit => "nit",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Blocker => "blocker",
        }
    }

    /// Lenient parse for AI output — unknown strings downgrade to `Low`.
    pub fn parse_lenient(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "blocker" | "critical" => Severity::Blocker,
            "high" | "error" => Severity::High,
            "medium" | "warning" => Severity::Medium,
            "low" | "minor" => Severity::Low,
            "nit" | "info" | "style" => Severity::Nit,
            _ => Severity::Low,
        }
    }
}

// ─── Issues ───────────────────────────────────────────────────────────────────

/// Blame attribution attached during the enrich step. Best effort — absent
/// when the git collaborator could not resolve the line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlameInfo {
    pub commit: String,
    pub author: String,
    pub summary: String,
}

/// One finding from one lens.
///
/// Invariant: an issue delivered to a client always has non-empty `evidence`.
/// The lens executor synthesizes it from the matching file diff when the AI
/// output omits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewIssue {
    pub id: String,
    pub severity: Severity,
    /// Thematic category, e.g. `"security"`, `"performance"`.
    pub category: String,
    /// Repository-relative file path.
    pub file: String,
    pub line_start: u32,
    pub line_end: u32,
    /// Why this is a problem.
    pub rationale: String,
    /// What to do about it.
    pub recommendation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_patch: Option<String>,
    /// Model confidence in [0, 1].
    pub confidence: f64,
    /// Diff excerpts backing the finding. Never empty once final.
    pub evidence: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blame: Option<BlameInfo>,
}

/// Stable blocker-first sort; emission order is preserved for ties.
pub fn sort_by_severity(issues: &mut [ReviewIssue]) {
    issues.sort_by(|a, b| b.severity.cmp(&a.severity));
}

// ─── Lens and review results ─────────────────────────────────────────────────

/// Output of one successful lens run. Produced whole, never partially.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LensResult {
    pub lens_id: String,
    pub lens_name: String,
    pub summary: String,
    pub issues: Vec<ReviewIssue>,
}

/// Per-lens outcome reported in `orchestrator_complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LensStat {
    pub lens_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// The orchestrator's merged output after enrichment and aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewResult {
    pub summary: String,
    pub issues: Vec<ReviewIssue>,
}

// ─── Review mode ─────────────────────────────────────────────────────────────

/// Which diff the review targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewMode {
    Staged,
    Unstaged,
    Files,
}

impl ReviewMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewMode::Staged => "staged",
            ReviewMode::Unstaged => "unstaged",
            ReviewMode::Files => "files",
        }
    }
}

impl std::str::FromStr for ReviewMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "staged" => Ok(ReviewMode::Staged),
            "unstaged" => Ok(ReviewMode::Unstaged),
            "files" => Ok(ReviewMode::Files),
            other => Err(format!("unknown review mode: {other}")),
        }
    }
}

// ─── Saved review ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub blocker: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub nit: usize,
}

impl SeverityCounts {
    pub fn tally(issues: &[ReviewIssue]) -> Self {
        let mut counts = Self::default();
        for issue in issues {
            match issue.severity {
                Severity::Blocker => counts.blocker += 1,
                Severity::High => counts.high += 1,
                Severity::Medium => counts.medium += 1,
                Severity::Low => counts.low += 1,
                Severity::Nit => counts.nit += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.blocker + self.high + self.medium + self.low + self.nit
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitContext {
    pub branch: String,
    pub head_commit: String,
    pub status_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewMetadata {
    pub id: String,
    pub project_path: String,
    pub created_at: String,
    pub mode: ReviewMode,
    pub severity_counts: SeverityCounts,
    pub file_count: usize,
}

/// Deep-dive analysis of one issue, produced by a drilldown call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrilldownAnalysis {
    pub root_cause: String,
    pub impact: String,
    pub suggested_fix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrilldownRecord {
    pub issue_id: String,
    pub created_at: String,
    pub analysis: DrilldownAnalysis,
    /// `tool_call`/`tool_result` pairs for the context reads behind this
    /// analysis. Drilldowns run after the live session is gone, so the trace
    /// rides on the record instead of the event stream. Empty when the
    /// analysis fell back to stored evidence.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_trace: Vec<Event>,
}

/// The persisted review record. Created once at pipeline completion;
/// `drilldowns` grows by append only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedReview {
    pub metadata: ReviewMetadata,
    pub result: ReviewResult,
    pub git_context: GitContext,
    pub drilldowns: Vec<DrilldownRecord>,
}

// ─── Tests ────────────────────────────────────────────────────────────────────
