// SPDX-License-Identifier: MIT
//! Lens orchestrator — fans the lens catalogue out over the diff.
//!
//! Every requested lens is queued immediately; a shared semaphore caps how
//! many are inside their AI call at once. The scan phase is cheap and runs
//! unthrottled. Failure policy: an external abort fails the whole run; an
//! individual lens failure is aggregated per `partial_on_all_failed` — when
//! partial results are allowed, the run only fails once *every* attempted
//! lens has failed.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ai::{AiClient, AiError, AiErrorCode};
use crate::diff::ParsedDiff;
use crate::error::ReviewError;
use crate::event::EventKind;
use crate::lens::{self, executor, LensSpec};
use crate::model::{sort_by_severity, LensResult, LensStat, ReviewIssue};
use crate::session::Emitter;

/// Aggregated output of one orchestrator run.
#[derive(Debug)]
pub struct LensRunOutcome {
    /// Merged issues, severity-sorted (stable within a severity).
    pub issues: Vec<ReviewIssue>,
    /// One stat per attempted lens, in request order.
    pub lens_stats: Vec<LensStat>,
    /// Per-lens summaries from the successful lenses, in request order.
    pub summaries: Vec<(String, String)>,
    pub files_analyzed: usize,
}

impl LensRunOutcome {
    /// One-paragraph review summary stitched from the lens summaries.
    pub fn summary(&self) -> String {
        let parts: Vec<String> = self
            .summaries
            .iter()
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(name, text)| format!("{name}: {}", text.trim()))
            .collect();
        if parts.is_empty() {
            "No findings.".to_string()
        } else {
            parts.join(" ")
        }
    }
}

/// Resolve requested lens ids against the catalogue, preserving request
/// order. Unknown ids are skipped with a warning; an empty selection falls
/// back to the full catalogue.
pub fn resolve_lenses(ids: &[String]) -> Vec<&'static LensSpec> {
    let mut specs: Vec<&'static LensSpec> = Vec::with_capacity(ids.len());
    for id in ids {
        match lens::by_id(id) {
            Some(spec) => specs.push(spec),
            None => warn!(lens_id = %id, "unknown lens id skipped"),
        }
    }
    if specs.is_empty() {
        specs = lens::LENSES.iter().collect();
    }
    specs
}

/// Run the given lenses concurrently and aggregate. A non-empty `categories`
/// list narrows the merged issues to those categories (case-insensitive);
/// lens stats still count what each lens reported.
#[allow(clippy::too_many_arguments)]
pub async fn run_lenses(
    lenses: &[&'static LensSpec],
    diff: Arc<ParsedDiff>,
    context: Arc<String>,
    emitter: &Emitter,
    ai: Arc<dyn AiClient>,
    concurrency: usize,
    partial_on_all_failed: bool,
    categories: &[String],
    cancel: &CancellationToken,
) -> Result<LensRunOutcome, ReviewError> {
    let files_analyzed = diff.files.len();
    emitter
        .emit(EventKind::OrchestratorStart {
            lens_count: lenses.len(),
            file_total: files_analyzed,
        })
        .await;

    // Queue everything up front so clients see the full fan-out immediately;
    // the semaphore does the actual throttling inside the executor.
    let gate = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut handles = Vec::with_capacity(lenses.len());
    for spec in lenses {
        let agent_id = executor::new_agent_id(spec);
        emitter
            .emit_spanned(
                EventKind::AgentQueued {
                    agent_id: agent_id.clone(),
                    lens_id: spec.id.to_string(),
                },
                &agent_id,
                None,
            )
            .await;

        let spec = *spec;
        let diff = Arc::clone(&diff);
        let context = Arc::clone(&context);
        let emitter = emitter.clone();
        let ai = Arc::clone(&ai);
        let gate = Arc::clone(&gate);
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            executor::run_lens(
                spec, &agent_id, &diff, &context, &emitter, ai.as_ref(), &gate, &cancel,
            )
            .await
        }));
    }

    // join_all preserves request order, which keeps lens_stats deterministic.
    let mut results: Vec<LensResult> = Vec::new();
    let mut lens_stats: Vec<LensStat> = Vec::new();
    let mut first_failure: Option<(String, AiError)> = None;
    for (spec, joined) in lenses.iter().zip(join_all(handles).await) {
        let outcome = joined.map_err(|e| {
            ReviewError::Storage(format!("lens worker for '{}' panicked: {e}", spec.id))
        })?;
        match outcome {
            Ok(result) => {
                lens_stats.push(LensStat {
                    lens_id: spec.id.to_string(),
                    success: true,
                    issue_count: Some(result.issues.len()),
                    error_code: None,
                });
                results.push(result);
            }
            Err(e) if e.code == AiErrorCode::Aborted => {
                // Abort is an outcome of the whole run, not a lens failure.
                return Err(ReviewError::Aborted);
            }
            Err(e) => {
                warn!(lens_id = spec.id, code = e.code.as_str(), "lens failed");
                lens_stats.push(LensStat {
                    lens_id: spec.id.to_string(),
                    success: false,
                    issue_count: None,
                    error_code: Some(e.code.as_str().to_string()),
                });
                if first_failure.is_none() {
                    first_failure = Some((spec.id.to_string(), e));
                }
            }
        }
    }

    if let Some((lens_id, first)) = first_failure {
        if results.is_empty() {
            return Err(ReviewError::AllLensesFailed {
                attempted: lenses.len(),
                first: first.to_string(),
            });
        }
        if !partial_on_all_failed {
            return Err(ReviewError::LensFailed {
                lens_id,
                message: first.to_string(),
            });
        }
    }

    // Merge in lens request order, then a stable severity sort: ties keep
    // emission order across lenses.
    let mut issues: Vec<ReviewIssue> = Vec::new();
    let mut summaries: Vec<(String, String)> = Vec::new();
    for result in results {
        summaries.push((result.lens_name.clone(), result.summary.clone()));
        issues.extend(result.issues);
    }
    if !categories.is_empty() {
        issues.retain(|i| categories.iter().any(|c| c.eq_ignore_ascii_case(&i.category)));
    }
    sort_by_severity(&mut issues);

    info!(
        lenses = lenses.len(),
        issues = issues.len(),
        files = files_analyzed,
        "lens fan-out complete"
    );
    emitter
        .emit(EventKind::OrchestratorComplete {
            total_issues: issues.len(),
            lens_stats: lens_stats.clone(),
            files_analyzed,
        })
        .await;

    Ok(LensRunOutcome {
        issues,
        lens_stats,
        summaries,
        files_analyzed,
    })
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::GenerateRequest;
    use crate::event::Event;
    use crate::model::{ReviewMode, Severity};
    use crate::session::{SessionIdentity, SessionRegistry};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    /// Dispatches canned responses on the lens named in the system prompt.
    struct ScriptedAi {
        by_focus: HashMap<&'static str, Result<serde_json::Value, AiErrorCode>>,
    }

    #[async_trait]
    impl AiClient for ScriptedAi {
        async fn generate(
            &self,
            req: GenerateRequest,
            _cancel: &CancellationToken,
        ) -> Result<serde_json::Value, AiError> {
            for (needle, outcome) in &self.by_focus {
                if req.system.contains(needle) {
                    return match outcome {
                        Ok(v) => Ok(v.clone()),
                        Err(code) => Err(AiError::new(*code, "scripted failure")),
                    };
                }
            }
            Ok(json!({ "summary": "", "issues": [] }))
        }

        async fn generate_stream(
            &self,
            _req: GenerateRequest,
            _on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
            _cancel: &CancellationToken,
        ) -> Result<(), AiError> {
            Ok(())
        }
    }

    const DIFF: &str = "\
diff --git a/src/a.rs b/src/a.rs
--- a/src/a.rs
+++ b/src/a.rs
@@ -1,2 +1,3 @@
 fn f() {
+    let x = 1;
 }
";

    fn issue_json(severity: &str, rationale: &str) -> serde_json::Value {
        json!({
            "severity": severity,
            "file": "src/a.rs",
            "lineStart": 2,
            "rationale": rationale,
            "recommendation": "fix it",
            "evidence": ["+    let x = 1;"]
        })
    }

    async fn harness() -> (Arc<SessionRegistry>, Emitter) {
        let registry = Arc::new(SessionRegistry::new());
        registry
            .create(
                "r1",
                SessionIdentity {
                    project_path: "/p".into(),
                    head_commit: "h".into(),
                    status_hash: "s".into(),
                    mode: ReviewMode::Staged,
                },
            )
            .await;
        let emitter = Emitter::new(registry.clone(), "r1", "trace-1");
        (registry, emitter)
    }

    fn count(events: &[Event], pred: impl Fn(&EventKind) -> bool) -> usize {
        events.iter().filter(|e| pred(&e.kind)).count()
    }

    #[tokio::test]
    async fn merges_issues_severity_first_across_lenses() {
        let (registry, emitter) = harness().await;
        let mut by_focus = HashMap::new();
        by_focus.insert(
            "logic errors",
            Ok(json!({ "summary": "logic ok", "issues": [issue_json("low", "style nit")] })),
        );
        by_focus.insert(
            "vulnerabilities",
            Ok(json!({ "summary": "one hole", "issues": [issue_json("blocker", "sql injection")] })),
        );
        let ai = Arc::new(ScriptedAi { by_focus });

        let lenses = resolve_lenses(&["correctness".to_string(), "security".to_string()]);
        let outcome = run_lenses(
            &lenses,
            Arc::new(crate::diff::parse(DIFF)),
            Arc::new(String::new()),
            &emitter,
            ai,
            2,
            true,
            &[],
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.issues.len(), 2);
        // Blocker from the security lens sorts ahead of the earlier low.
        assert_eq!(outcome.issues[0].severity, Severity::Blocker);
        assert_eq!(outcome.issues[1].severity, Severity::Low);
        assert_eq!(outcome.lens_stats.len(), 2);
        assert!(outcome.lens_stats.iter().all(|s| s.success));
        assert!(outcome.summary().contains("Security: one hole"));

        let events = registry.events("r1").await.unwrap();
        assert_eq!(count(&events, |k| matches!(k, EventKind::AgentQueued { .. })), 2);
        assert_eq!(
            count(&events, |k| matches!(k, EventKind::OrchestratorComplete { .. })),
            1
        );
    }

    #[tokio::test]
    async fn category_filter_narrows_merged_issues() {
        let (_registry, emitter) = harness().await;
        let mut by_focus = HashMap::new();
        by_focus.insert(
            "logic errors",
            Ok(json!({ "summary": "", "issues": [issue_json("high", "bug")] })),
        );
        by_focus.insert(
            "vulnerabilities",
            Ok(json!({ "summary": "", "issues": [issue_json("blocker", "hole")] })),
        );
        let ai = Arc::new(ScriptedAi { by_focus });

        let lenses = resolve_lenses(&["correctness".to_string(), "security".to_string()]);
        let outcome = run_lenses(
            &lenses,
            Arc::new(crate::diff::parse(DIFF)),
            Arc::new(String::new()),
            &emitter,
            ai,
            2,
            true,
            &["Security".to_string()],
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // Only the security finding survives; the match ignores case.
        assert_eq!(outcome.issues.len(), 1);
        assert_eq!(outcome.issues[0].category, "security");
        // Per-lens stats keep reporting what each lens found.
        assert_eq!(outcome.lens_stats.len(), 2);
        assert!(outcome
            .lens_stats
            .iter()
            .all(|s| s.issue_count == Some(1)));
    }

    #[tokio::test]
    async fn queued_and_start_share_the_agent_id() {
        let (registry, emitter) = harness().await;
        let ai = Arc::new(ScriptedAi {
            by_focus: HashMap::new(),
        });
        let lenses = resolve_lenses(&["tests".to_string()]);
        run_lenses(
            &lenses,
            Arc::new(crate::diff::parse(DIFF)),
            Arc::new(String::new()),
            &emitter,
            ai,
            1,
            true,
            &[],
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let events = registry.events("r1").await.unwrap();
        let queued_id = events.iter().find_map(|e| match &e.kind {
            EventKind::AgentQueued { agent_id, .. } => Some(agent_id.clone()),
            _ => None,
        });
        let started_id = events.iter().find_map(|e| match &e.kind {
            EventKind::AgentStart { agent_id, .. } => Some(agent_id.clone()),
            _ => None,
        });
        assert_eq!(queued_id, started_id);
        assert!(queued_id.is_some());
    }

    #[tokio::test]
    async fn partial_failure_keeps_surviving_lens_results() {
        let (_registry, emitter) = harness().await;
        let mut by_focus = HashMap::new();
        by_focus.insert(
            "logic errors",
            Ok(json!({ "summary": "fine", "issues": [issue_json("high", "bug")] })),
        );
        by_focus.insert("vulnerabilities", Err(AiErrorCode::RateLimited));
        let ai = Arc::new(ScriptedAi { by_focus });

        let lenses = resolve_lenses(&["correctness".to_string(), "security".to_string()]);
        let outcome = run_lenses(
            &lenses,
            Arc::new(crate::diff::parse(DIFF)),
            Arc::new(String::new()),
            &emitter,
            ai,
            2,
            true,
            &[],
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.issues.len(), 1);
        let failed = &outcome.lens_stats[1];
        assert_eq!(failed.lens_id, "security");
        assert!(!failed.success);
        assert_eq!(failed.error_code.as_deref(), Some("RATE_LIMITED"));
    }

    #[tokio::test]
    async fn all_lenses_failing_is_the_hard_boundary() {
        let (_registry, emitter) = harness().await;
        let mut by_focus = HashMap::new();
        by_focus.insert("logic errors", Err(AiErrorCode::NetworkError));
        by_focus.insert("vulnerabilities", Err(AiErrorCode::RateLimited));
        let ai = Arc::new(ScriptedAi { by_focus });

        let lenses = resolve_lenses(&["correctness".to_string(), "security".to_string()]);
        let err = run_lenses(
            &lenses,
            Arc::new(crate::diff::parse(DIFF)),
            Arc::new(String::new()),
            &emitter,
            ai,
            2,
            true,
            &[],
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.code(), "ALL_LENSES_FAILED");
        match err {
            ReviewError::AllLensesFailed { attempted, .. } => assert_eq!(attempted, 2),
            other => panic!("wrong error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn strict_mode_fails_on_any_lens_failure() {
        let (_registry, emitter) = harness().await;
        let mut by_focus = HashMap::new();
        by_focus.insert(
            "logic errors",
            Ok(json!({ "summary": "fine", "issues": [] })),
        );
        by_focus.insert("vulnerabilities", Err(AiErrorCode::ModelError));
        let ai = Arc::new(ScriptedAi { by_focus });

        let lenses = resolve_lenses(&["correctness".to_string(), "security".to_string()]);
        let err = run_lenses(
            &lenses,
            Arc::new(crate::diff::parse(DIFF)),
            Arc::new(String::new()),
            &emitter,
            ai,
            2,
            false,
            &[],
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.code(), "LENS_FAILED");
    }

    #[tokio::test]
    async fn cancellation_aborts_the_whole_run() {
        let (_registry, emitter) = harness().await;
        let ai = Arc::new(ScriptedAi {
            by_focus: HashMap::new(),
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        let lenses = resolve_lenses(&["correctness".to_string()]);
        let err = run_lenses(
            &lenses,
            Arc::new(crate::diff::parse(DIFF)),
            Arc::new(String::new()),
            &emitter,
            ai,
            1,
            true,
            &[],
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ReviewError::Aborted));
    }

    #[test]
    fn unknown_ids_are_skipped_and_empty_falls_back() {
        let specs = resolve_lenses(&["security".to_string(), "vibes".to_string()]);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].id, "security");

        let all = resolve_lenses(&[]);
        assert_eq!(all.len(), lens::LENSES.len());
    }
}
