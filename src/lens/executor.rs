// SPDX-License-Identifier: MIT
//! Lens executor — runs one lens to completion.
//!
//! Event choreography per run: `agent_start` → `agent_thinking` → per file a
//! `file_start`, a synthetic `tool_call`/`tool_result` pair summarizing the
//! read, `file_complete`, and a recomputed `agent_progress` — then exactly
//! one structured AI call. The only abort-check in the scan phase sits at
//! the top of the file loop, so a cancellation mid-scan stops early without
//! breaking pairing invariants.
//!
//! While the AI call is outstanding, a best-effort heartbeat emits staged
//! progress at fixed elapsed-time checkpoints. It carries no correctness
//! weight and is cancelled on every exit path by a drop guard.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::ai::{AiClient, AiError, AiErrorCode, GenerateRequest};
use crate::diff::{DiffLineKind, FileDiff, ParsedDiff};
use crate::event::{EventKind, FileScope};
use crate::lens::{lens_output_shape, LensSpec};
use crate::model::{LensResult, ReviewIssue, Severity};
use crate::session::Emitter;

/// Heartbeat checkpoints while the AI call is outstanding: (elapsed, percent).
/// 60–100 is reserved for the AI phase; 15–50 for scanning; 0–15 for startup.
const HEARTBEAT_STAGES: &[(Duration, u8)] = &[
    (Duration::from_secs(2), 65),
    (Duration::from_secs(5), 75),
    (Duration::from_secs(8), 85),
    (Duration::from_secs(11), 92),
];

/// Max evidence lines synthesized from a file diff.
const MAX_EVIDENCE_LINES: usize = 12;

// ─── Progress ─────────────────────────────────────────────────────────────────

/// Monotonic progress emitter shared between the scan loop and the heartbeat.
/// A stale (lower or equal) percentage is silently dropped, which is what
/// makes `agent_progress` non-decreasing even when the heartbeat races the
/// main path.
#[derive(Clone)]
struct Progress {
    emitter: Emitter,
    agent_id: String,
    last: Arc<AtomicU8>,
}

impl Progress {
    fn new(emitter: Emitter, agent_id: String) -> Self {
        Self {
            emitter,
            agent_id,
            last: Arc::new(AtomicU8::new(0)),
        }
    }

    async fn emit(&self, percent: u8) {
        let percent = percent.min(100);
        let prev = self.last.fetch_max(percent, Ordering::SeqCst);
        if percent > prev {
            self.emitter
                .emit_spanned(
                    EventKind::AgentProgress {
                        agent_id: self.agent_id.clone(),
                        percent,
                    },
                    &self.agent_id,
                    None,
                )
                .await;
        }
    }
}

// ─── Heartbeat ────────────────────────────────────────────────────────────────

/// Scoped timer: started before the suspending AI call, aborted on drop.
/// Drop covers every exit path — success, AI error, propagated panic, abort —
/// so a leaked timer can never emit events after the agent finished.
struct HeartbeatGuard {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn start_heartbeat(progress: Progress) -> HeartbeatGuard {
    let handle = tokio::spawn(async move {
        let started = Instant::now();
        for (after, percent) in HEARTBEAT_STAGES {
            let elapsed = started.elapsed();
            if *after > elapsed {
                tokio::time::sleep(*after - elapsed).await;
            }
            progress.emit(*percent).await;
        }
    });
    HeartbeatGuard { handle }
}

// ─── AI output shape ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLensOutput {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    issues: Vec<RawIssue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIssue {
    #[serde(default)]
    severity: String,
    category: Option<String>,
    #[serde(default)]
    file: String,
    #[serde(default)]
    line_start: u32,
    line_end: Option<u32>,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    recommendation: String,
    suggested_patch: Option<String>,
    confidence: Option<f64>,
    #[serde(default)]
    evidence: Vec<String>,
}

// ─── Executor ─────────────────────────────────────────────────────────────────

/// Mint the agent id for one lens run. The orchestrator creates it before
/// queueing so `agent_queued` and `agent_start` share the same id.
pub fn new_agent_id(lens: &LensSpec) -> String {
    format!("{}-{}", lens.id, &Uuid::new_v4().to_string()[..8])
}

/// Run one lens over the full diff. Exactly one AI `generate` call; no
/// retries here — retry policy, if any, belongs to the AI collaborator.
#[allow(clippy::too_many_arguments)]
pub async fn run_lens(
    lens: &LensSpec,
    agent_id: &str,
    diff: &ParsedDiff,
    context: &str,
    emitter: &Emitter,
    ai: &dyn AiClient,
    ai_gate: &Semaphore,
    cancel: &CancellationToken,
) -> Result<LensResult, AiError> {
    let started = Instant::now();
    let agent_id = agent_id.to_string();

    emitter
        .emit_spanned(
            EventKind::AgentStart {
                agent_id: agent_id.clone(),
                lens_id: lens.id.to_string(),
                lens_name: lens.name.to_string(),
            },
            &agent_id,
            None,
        )
        .await;
    emitter
        .emit_spanned(
            EventKind::AgentThinking {
                agent_id: agent_id.clone(),
            },
            &agent_id,
            None,
        )
        .await;

    let progress = Progress::new(emitter.clone(), agent_id.clone());
    progress.emit(5).await;

    // ── File scan ─────────────────────────────────────────────────────────
    let files_total = diff.files.len().max(1);
    for (scanned, file) in diff.files.iter().enumerate() {
        // Abort-check at the top of the loop only: once a file_start is out,
        // its file_complete always follows.
        if cancel.is_cancelled() {
            return Err(AiError::aborted());
        }

        emitter
            .emit_spanned(
                EventKind::FileStart {
                    scope: FileScope::Agent,
                    agent_id: Some(agent_id.clone()),
                    file: file.path.clone(),
                },
                &agent_id,
                None,
            )
            .await;

        let tool_span = format!("tool-{}", &Uuid::new_v4().to_string()[..8]);
        emitter
            .emit_spanned(
                EventKind::ToolCall {
                    tool: "read_diff".to_string(),
                    detail: format!(
                        "{} (+{} -{})",
                        file.path, file.stats.additions, file.stats.deletions
                    ),
                },
                &tool_span,
                Some(&agent_id),
            )
            .await;
        emitter
            .emit_spanned(
                EventKind::ToolResult {
                    tool: "read_diff".to_string(),
                    detail: format!("{} hunk(s)", file.hunks.len()),
                },
                &tool_span,
                Some(&agent_id),
            )
            .await;

        emitter
            .emit_spanned(
                EventKind::FileComplete {
                    scope: FileScope::Agent,
                    agent_id: Some(agent_id.clone()),
                    file: file.path.clone(),
                },
                &agent_id,
                None,
            )
            .await;

        let pct = 15 + (35.0 * (scanned + 1) as f64 / files_total as f64).round() as u8;
        progress.emit(pct).await;
    }

    // ── AI call (the only throttled phase) ────────────────────────────────
    let _permit = ai_gate
        .acquire()
        .await
        .map_err(|_| AiError::aborted())?;
    if cancel.is_cancelled() {
        return Err(AiError::aborted());
    }

    let request = GenerateRequest {
        system: lens.system_prompt(),
        prompt: build_prompt(diff, context),
        shape: Some(lens_output_shape()),
    };

    let outcome = {
        let _heartbeat = start_heartbeat(progress.clone());
        ai.generate(request, cancel).await
        // guard drops here: the heartbeat can never outlive the call
    };

    let raw: Result<RawLensOutput, AiError> = outcome.and_then(|value| {
        serde_json::from_value(value).map_err(|e| {
            AiError::new(
                AiErrorCode::ModelError,
                format!("lens output did not match the expected shape: {e}"),
            )
        })
    });

    let parsed = match raw {
        Ok(parsed) => parsed,
        Err(e) if e.code == AiErrorCode::Aborted => return Err(e),
        Err(e) => {
            emitter
                .emit_spanned(
                    EventKind::AgentError {
                        agent_id: agent_id.clone(),
                        code: e.code.as_str().to_string(),
                        message: e.message.clone(),
                    },
                    &agent_id,
                    None,
                )
                .await;
            return Err(e);
        }
    };

    // ── Finalize issues ───────────────────────────────────────────────────
    let issues: Vec<ReviewIssue> = parsed
        .issues
        .into_iter()
        .map(|raw| finalize_issue(lens, diff, raw))
        .collect();

    progress.emit(100).await;
    for issue in &issues {
        emitter
            .emit_spanned(
                EventKind::IssueFound {
                    agent_id: agent_id.clone(),
                    issue: issue.clone(),
                },
                &agent_id,
                None,
            )
            .await;
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    debug!(lens = lens.id, issues = issues.len(), duration_ms, "lens complete");
    emitter
        .emit_spanned(
            EventKind::AgentComplete {
                agent_id: agent_id.clone(),
                issue_count: issues.len(),
                duration_ms,
            },
            &agent_id,
            None,
        )
        .await;

    Ok(LensResult {
        lens_id: lens.id.to_string(),
        lens_name: lens.name.to_string(),
        summary: parsed.summary,
        issues,
    })
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn build_prompt(diff: &ParsedDiff, context: &str) -> String {
    let mut prompt = String::new();
    if !context.is_empty() {
        prompt.push_str("## Project context\n");
        prompt.push_str(context);
        prompt.push_str("\n\n");
    }
    prompt.push_str("## Diff under review\n");
    for file in &diff.files {
        prompt.push_str(&file.raw);
        if !file.raw.ends_with('\n') {
            prompt.push('\n');
        }
    }
    prompt
}

/// Convert one raw AI issue into a final [`ReviewIssue`]: assign an id,
/// normalize severity/category/confidence, and — the hard invariant — make
/// sure evidence is non-empty, synthesizing it from the matching file diff
/// when the model omitted it.
fn finalize_issue(lens: &LensSpec, diff: &ParsedDiff, raw: RawIssue) -> ReviewIssue {
    let line_start = raw.line_start.max(1);
    let line_end = raw.line_end.unwrap_or(line_start).max(line_start);

    let mut evidence: Vec<String> = raw
        .evidence
        .into_iter()
        .filter(|e| !e.trim().is_empty())
        .collect();
    if evidence.is_empty() {
        evidence = synthesize_evidence(diff, &raw.file, line_start, line_end);
    }

    ReviewIssue {
        id: Uuid::new_v4().to_string(),
        severity: Severity::parse_lenient(&raw.severity),
        category: raw
            .category
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| lens.category.to_string()),
        file: raw.file,
        line_start,
        line_end,
        rationale: raw.rationale,
        recommendation: raw.recommendation,
        suggested_patch: raw.suggested_patch,
        confidence: raw.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        evidence,
        blame: None,
    }
}

/// Pull diff lines around the issue's line range; fall back to the head of
/// the file's raw section, then to the first file in the diff.
fn synthesize_evidence(
    diff: &ParsedDiff,
    file_path: &str,
    line_start: u32,
    line_end: u32,
) -> Vec<String> {
    let file = diff.file(file_path).or_else(|| diff.files.first());
    let Some(file) = file else {
        return vec!["(no diff content available)".to_string()];
    };

    let excerpt = excerpt_around(file, line_start, line_end);
    if !excerpt.is_empty() {
        return vec![excerpt];
    }
    let head: Vec<&str> = file.raw.lines().take(MAX_EVIDENCE_LINES).collect();
    vec![head.join("\n")]
}

fn excerpt_around(file: &FileDiff, line_start: u32, line_end: u32) -> String {
    let lo = line_start.saturating_sub(2);
    let hi = line_end.saturating_add(2);
    let mut lines = Vec::new();
    for hunk in &file.hunks {
        for line in &hunk.lines {
            let n = line.new_line_no.or(line.old_line_no).unwrap_or(0);
            if n < lo || n > hi {
                continue;
            }
            let origin = match line.kind {
                DiffLineKind::Added => '+',
                DiffLineKind::Removed => '-',
                DiffLineKind::Context => ' ',
            };
            lines.push(format!("{origin}{}", line.content));
            if lines.len() >= MAX_EVIDENCE_LINES {
                return lines.join("\n");
            }
        }
    }
    lines.join("\n")
}

// ─── Tests ────────────────────────────────────────────────────────────────────
