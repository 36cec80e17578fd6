// SPDX-License-Identifier: MIT
//! Event protocol — the wire contract between the review core and any
//! connected client.
//!
//! A single flat tagged union, dispatched on `type` alone, serialized as one
//! JSON object per event over SSE. The envelope carries correlation ids:
//! `traceId` (one per pipeline run) and `spanId`/`parentSpanId` (one per
//! agent or tool invocation). Events are immutable and append-only; within
//! one lens run they are strictly ordered as emitted.

use serde::{Deserialize, Serialize};

use crate::model::{LensStat, ReviewIssue, ReviewResult};

// ─── Envelope ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// RFC-3339 emission timestamp.
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            trace_id: None,
            span_id: None,
            parent_span_id: None,
            kind,
        }
    }

    pub fn with_trace(mut self, trace_id: &str) -> Self {
        self.trace_id = Some(trace_id.to_string());
        self
    }

    pub fn with_span(mut self, span_id: &str) -> Self {
        self.span_id = Some(span_id.to_string());
        self
    }

    pub fn with_parent_span(mut self, parent: &str) -> Self {
        self.parent_span_id = Some(parent.to_string());
        self
    }

    /// True for the two stream-terminating kinds.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Complete { .. } | EventKind::Error { .. })
    }
}

// ─── Pipeline steps ───────────────────────────────────────────────────────────

/// Review-wide phases wrapped in `step_start`/`step_complete`/`step_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepId {
    Diff,
    Context,
    Review,
    Enrich,
    Report,
}

impl StepId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepId::Diff => "diff",
            StepId::Context => "context",
            StepId::Review => "review",
            StepId::Enrich => "enrich",
            StepId::Report => "report",
        }
    }
}

// ─── Scopes ───────────────────────────────────────────────────────────────────

/// Distinguishes per-lens file scanning from whole-diff progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileScope {
    Agent,
    Orchestrator,
}

// ─── Event kinds ──────────────────────────────────────────────────────────────

/// The closed set of event kinds.
///
/// Pairing invariants: `file_start`/`file_complete` share `scope` + `file` +
/// agent id; `tool_call`/`tool_result` share the envelope `spanId`. For any
/// agent, `agent_progress` percentages are non-decreasing within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    #[serde(rename_all = "camelCase")]
    StepStart { step: StepId },
    #[serde(rename_all = "camelCase")]
    StepComplete { step: StepId, duration_ms: u64 },
    #[serde(rename_all = "camelCase")]
    StepError {
        step: StepId,
        code: String,
        message: String,
    },

    /// May be emitted twice: once with an estimate, once corrected.
    #[serde(rename_all = "camelCase")]
    ReviewStarted {
        review_id: String,
        file_total: usize,
    },

    #[serde(rename_all = "camelCase")]
    OrchestratorStart {
        lens_count: usize,
        file_total: usize,
    },
    #[serde(rename_all = "camelCase")]
    AgentQueued { agent_id: String, lens_id: String },
    #[serde(rename_all = "camelCase")]
    AgentStart {
        agent_id: String,
        lens_id: String,
        lens_name: String,
    },
    #[serde(rename_all = "camelCase")]
    AgentThinking { agent_id: String },
    #[serde(rename_all = "camelCase")]
    AgentProgress { agent_id: String, percent: u8 },
    #[serde(rename_all = "camelCase")]
    AgentError {
        agent_id: String,
        code: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    AgentComplete {
        agent_id: String,
        issue_count: usize,
        duration_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    OrchestratorComplete {
        total_issues: usize,
        lens_stats: Vec<LensStat>,
        files_analyzed: usize,
    },

    #[serde(rename_all = "camelCase")]
    FileStart {
        scope: FileScope,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        file: String,
    },
    #[serde(rename_all = "camelCase")]
    FileComplete {
        scope: FileScope,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        file: String,
    },

    #[serde(rename_all = "camelCase")]
    ToolCall { tool: String, detail: String },
    #[serde(rename_all = "camelCase")]
    ToolResult { tool: String, detail: String },

    #[serde(rename_all = "camelCase")]
    IssueFound {
        agent_id: String,
        issue: ReviewIssue,
    },

    /// Terminal success.
    #[serde(rename_all = "camelCase")]
    Complete {
        review_id: String,
        result: ReviewResult,
        duration_ms: u64,
    },
    /// Terminal failure. A stream closing without either terminal kind is
    /// itself an error condition (`STREAM_ERROR`) that clients must detect.
    #[serde(rename_all = "camelCase")]
    Error { code: String, message: String },
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_tag_on_type_with_camel_case_payload() {
        let ev = Event::new(EventKind::AgentProgress {
            agent_id: "lens-security".to_string(),
            percent: 42,
        })
        .with_trace("t-1")
        .with_span("s-1");

        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "agent_progress");
        assert_eq!(json["agentId"], "lens-security");
        assert_eq!(json["percent"], 42);
        assert_eq!(json["traceId"], "t-1");
        assert_eq!(json["spanId"], "s-1");
        assert!(json.get("parentSpanId").is_none());
    }

    #[test]
    fn step_ids_serialize_lowercase() {
        let ev = Event::new(EventKind::StepStart { step: StepId::Diff });
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "step_start");
        assert_eq!(json["step"], "diff");
    }

    #[test]
    fn terminal_detection() {
        assert!(Event::new(EventKind::Error {
            code: "NO_DIFF".into(),
            message: "empty".into()
        })
        .is_terminal());
        assert!(!Event::new(EventKind::AgentThinking {
            agent_id: "a".into()
        })
        .is_terminal());
    }

    #[test]
    fn round_trips_through_json() {
        let ev = Event::new(EventKind::FileStart {
            scope: FileScope::Agent,
            agent_id: Some("lens-tests".into()),
            file: "src/lib.rs".into(),
        });
        let json = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        match back.kind {
            EventKind::FileStart { scope, file, .. } => {
                assert_eq!(scope, FileScope::Agent);
                assert_eq!(file, "src/lib.rs");
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }
}
