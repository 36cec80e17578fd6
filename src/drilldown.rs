// SPDX-License-Identifier: MIT
//! Issue drilldown — an on-demand deep dive into one saved finding.
//!
//! Runs synchronously against the stored review (the live session is usually
//! long gone): re-reads the current diff for fresh context, makes exactly one
//! structured AI call, and appends the analysis to the review document. A
//! diff that can no longer be produced (branch moved on, file gone) degrades
//! to the issue's stored evidence; the drilldown still runs.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ai::{AiClient, AiError, AiErrorCode, GenerateRequest, OutputShape};
use crate::diff;
use crate::error::ReviewError;
use crate::event::{Event, EventKind};
use crate::git::GitAccess;
use crate::model::{DrilldownAnalysis, DrilldownRecord, ReviewIssue};
use crate::storage::ReviewStore;

const SYSTEM_PROMPT: &str = "\
You are a senior engineer performing a deep dive on a single code review \
finding. Explain the root cause, the realistic impact if merged as-is, and \
a concrete suggested fix. Be specific to the code shown; do not restate the \
finding.";

pub struct Drilldown {
    pub git: Arc<dyn GitAccess>,
    pub ai: Arc<dyn AiClient>,
    pub store: Arc<ReviewStore>,
}

impl Drilldown {
    /// Analyze one issue of one saved review and persist the result.
    pub async fn analyze(
        &self,
        review_id: &str,
        issue_id: &str,
        cancel: &CancellationToken,
    ) -> Result<DrilldownRecord, ReviewError> {
        let review = self.store.get(review_id).await?;
        let issue = review
            .result
            .issues
            .iter()
            .find(|i| i.id == issue_id)
            .ok_or_else(|| ReviewError::IssueNotFound(issue_id.to_string()))?;

        let (code_context, tool_trace) = self.fresh_context(&review.metadata.mode, issue).await;
        let request = GenerateRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt: build_prompt(issue, &code_context),
            shape: Some(output_shape()),
        };

        let value = self.ai.generate(request, cancel).await?;
        let raw: RawDrilldown = serde_json::from_value(value).map_err(|e| {
            AiError::new(
                AiErrorCode::ModelError,
                format!("drilldown output did not match the expected shape: {e}"),
            )
        })?;

        let record = DrilldownRecord {
            issue_id: issue_id.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            analysis: DrilldownAnalysis {
                root_cause: raw.root_cause,
                impact: raw.impact,
                suggested_fix: raw.suggested_fix,
            },
            tool_trace,
        };
        self.store.append_drilldown(review_id, record.clone()).await?;
        debug!(review_id, issue_id, "drilldown saved");
        Ok(record)
    }

    /// Current diff section for the issue's file, falling back to the stored
    /// evidence when the working tree no longer produces one. A successful
    /// read is recorded as a `tool_call`/`tool_result` pair sharing one span.
    async fn fresh_context(
        &self,
        mode: &crate::model::ReviewMode,
        issue: &ReviewIssue,
    ) -> (String, Vec<Event>) {
        match self.git.get_diff(*mode).await {
            Ok(raw) => {
                let parsed = diff::parse(&raw);
                if let Some(file) = parsed.file(&issue.file) {
                    let span = format!("tool-{}", &Uuid::new_v4().to_string()[..8]);
                    let trace = vec![
                        Event::new(EventKind::ToolCall {
                            tool: "read_diff".to_string(),
                            detail: file.path.clone(),
                        })
                        .with_span(&span),
                        Event::new(EventKind::ToolResult {
                            tool: "read_diff".to_string(),
                            detail: format!("{} hunk(s)", file.hunks.len()),
                        })
                        .with_span(&span),
                    ];
                    return (file.raw.clone(), trace);
                }
                debug!(file = %issue.file, "file absent from current diff, using stored evidence");
            }
            Err(e) => {
                warn!("diff unavailable for drilldown, using stored evidence: {e}");
            }
        }
        (issue.evidence.join("\n"), Vec::new())
    }
}

fn build_prompt(issue: &ReviewIssue, code_context: &str) -> String {
    format!(
        "## Finding\n\
         file: {file}\n\
         lines: {start}-{end}\n\
         severity: {severity}\n\
         rationale: {rationale}\n\
         recommendation: {recommendation}\n\n\
         ## Code\n{code}",
        file = issue.file,
        start = issue.line_start,
        end = issue.line_end,
        severity = issue.severity.as_str(),
        rationale = issue.rationale,
        recommendation = issue.recommendation,
        code = code_context,
    )
}

fn output_shape() -> OutputShape {
    OutputShape {
        name: "drilldown",
        schema: json!({
            "type": "object",
            "properties": {
                "rootCause": { "type": "string" },
                "impact": { "type": "string" },
                "suggestedFix": { "type": "string" }
            },
            "required": ["rootCause", "impact", "suggestedFix"]
        }),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDrilldown {
    #[serde(default)]
    root_cause: String,
    #[serde(default)]
    impact: String,
    #[serde(default)]
    suggested_fix: String,
}

// ─── Tests ────────────────────────────────────────────────────────────────────
