// SPDX-License-Identifier: MIT
//! Review pipeline — the five-step state machine behind every review run:
//! diff → context → review → enrich → report.
//!
//! Each step is bracketed by `step_start`/`step_complete` (or `step_error`),
//! and every run ends in exactly one terminal event: `complete` on success,
//! `error` otherwise — including aborts, which terminate with code `ABORTED`.
//! A `SavedReview` is persisted only on the success path; a failed or
//! aborted run leaves no stored record.
//!
//! Cancellation is checked at every step boundary and once more before
//! persistence, so an abort never races a half-written review into the store.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ai::AiClient;
use crate::config::ReviewConfig;
use crate::context::ContextCache;
use crate::diff::{self, ParsedDiff};
use crate::error::ReviewError;
use crate::event::{EventKind, FileScope, StepId};
use crate::git::{GitAccess, RepoStatus};
use crate::model::{
    GitContext, ReviewIssue, ReviewMetadata, ReviewMode, ReviewResult, SavedReview,
    SeverityCounts,
};
use crate::orchestrator;
use crate::session::{Emitter, SessionRegistry};
use crate::storage::ReviewStore;

/// One review request, already resolved against an open repository.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub project_path: String,
    pub mode: ReviewMode,
    /// File filter; only meaningful in [`ReviewMode::Files`].
    pub files: Vec<String>,
    /// Lens override; empty = configured default.
    pub lenses: Vec<String>,
    /// Category filter on the merged issues; empty = keep everything.
    pub categories: Vec<String>,
}

pub struct Pipeline {
    pub git: Arc<dyn GitAccess>,
    pub ai: Arc<dyn AiClient>,
    pub store: Arc<ReviewStore>,
    pub sessions: Arc<SessionRegistry>,
    pub context: Arc<ContextCache>,
    pub review_cfg: ReviewConfig,
}

impl Pipeline {
    /// Run one review to its terminal event. The session for `review_id`
    /// must already exist; this always marks it complete on the way out.
    pub async fn run(
        &self,
        review_id: &str,
        request: ReviewRequest,
        status: RepoStatus,
        cancel: CancellationToken,
    ) -> Result<SavedReview, ReviewError> {
        let trace_id = Uuid::new_v4().to_string();
        let emitter = Emitter::new(Arc::clone(&self.sessions), review_id, &trace_id);
        let started = Instant::now();

        let outcome = self
            .run_inner(review_id, &request, &status, &emitter, &cancel)
            .await;

        match &outcome {
            Ok(saved) => {
                emitter
                    .emit(EventKind::Complete {
                        review_id: review_id.to_string(),
                        result: saved.result.clone(),
                        duration_ms: started.elapsed().as_millis() as u64,
                    })
                    .await;
                info!(review_id, issues = saved.result.issues.len(), "review complete");
            }
            Err(e) => {
                emitter
                    .emit(EventKind::Error {
                        code: e.code().to_string(),
                        message: e.to_string(),
                    })
                    .await;
                warn!(review_id, code = e.code(), "review terminated: {e}");
            }
        }
        self.sessions.mark_complete(review_id).await;
        outcome
    }

    async fn run_inner(
        &self,
        review_id: &str,
        request: &ReviewRequest,
        status: &RepoStatus,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> Result<SavedReview, ReviewError> {
        // ── Step: diff ────────────────────────────────────────────────────
        let step = Instant::now();
        emitter.emit(EventKind::StepStart { step: StepId::Diff }).await;
        let parsed = match self.build_diff(request, emitter, review_id).await {
            Ok(p) => p,
            Err(e) => return Err(self.fail_step(emitter, StepId::Diff, e).await),
        };
        emitter
            .emit(EventKind::StepComplete {
                step: StepId::Diff,
                duration_ms: step.elapsed().as_millis() as u64,
            })
            .await;
        self.check_cancel(cancel)?;

        // ── Step: context ─────────────────────────────────────────────────
        let step = Instant::now();
        emitter.emit(EventKind::StepStart { step: StepId::Context }).await;
        let snapshot = self
            .context
            .get_or_build(std::path::Path::new(&request.project_path), &status.status_hash())
            .await;
        emitter
            .emit(EventKind::StepComplete {
                step: StepId::Context,
                duration_ms: step.elapsed().as_millis() as u64,
            })
            .await;
        self.check_cancel(cancel)?;

        // ── Step: review ──────────────────────────────────────────────────
        let step = Instant::now();
        emitter.emit(EventKind::StepStart { step: StepId::Review }).await;
        let lens_ids = if request.lenses.is_empty() {
            self.review_cfg.lenses.clone()
        } else {
            request.lenses.clone()
        };
        let lenses = orchestrator::resolve_lenses(&lens_ids);
        let run = orchestrator::run_lenses(
            &lenses,
            Arc::new(parsed.clone()),
            Arc::new(snapshot),
            emitter,
            Arc::clone(&self.ai),
            self.review_cfg.concurrency,
            self.review_cfg.partial_on_all_failed,
            &request.categories,
            cancel,
        )
        .await;
        let run = match run {
            Ok(r) => r,
            Err(e) => return Err(self.fail_step(emitter, StepId::Review, e).await),
        };
        emitter
            .emit(EventKind::StepComplete {
                step: StepId::Review,
                duration_ms: step.elapsed().as_millis() as u64,
            })
            .await;
        self.check_cancel(cancel)?;

        // ── Step: enrich ──────────────────────────────────────────────────
        let step = Instant::now();
        emitter.emit(EventKind::StepStart { step: StepId::Enrich }).await;
        let summary = run.summary();
        let mut issues = run.issues;
        self.enrich_blame(&mut issues, emitter, cancel).await?;
        emitter
            .emit(EventKind::StepComplete {
                step: StepId::Enrich,
                duration_ms: step.elapsed().as_millis() as u64,
            })
            .await;

        // ── Step: report ──────────────────────────────────────────────────
        let step = Instant::now();
        emitter.emit(EventKind::StepStart { step: StepId::Report }).await;
        let result = ReviewResult { summary, issues };
        let saved = SavedReview {
            metadata: ReviewMetadata {
                id: review_id.to_string(),
                project_path: request.project_path.clone(),
                created_at: chrono::Utc::now().to_rfc3339(),
                mode: request.mode,
                severity_counts: SeverityCounts::tally(&result.issues),
                file_count: run.files_analyzed,
            },
            result,
            git_context: GitContext {
                branch: status.branch.clone(),
                head_commit: status.head_commit.clone(),
                status_hash: status.status_hash(),
            },
            drilldowns: Vec::new(),
        };

        // Last abort gate: a cancelled run must not leave a stored review.
        self.check_cancel(cancel)?;
        if let Err(e) = self.store.save(&saved).await {
            return Err(self.fail_step(emitter, StepId::Report, e).await);
        }
        emitter
            .emit(EventKind::StepComplete {
                step: StepId::Report,
                duration_ms: step.elapsed().as_millis() as u64,
            })
            .await;

        Ok(saved)
    }

    /// Fetch, parse, and filter the diff; validate emptiness and size.
    async fn build_diff(
        &self,
        request: &ReviewRequest,
        emitter: &Emitter,
        review_id: &str,
    ) -> Result<ParsedDiff, ReviewError> {
        let raw = self.git.get_diff(request.mode).await?;
        let parsed = diff::parse(&raw);

        // First estimate, before filters narrow the set.
        emitter
            .emit(EventKind::ReviewStarted {
                review_id: review_id.to_string(),
                file_total: parsed.files.len(),
            })
            .await;
        self.sessions.mark_ready(review_id).await;

        let mut parsed = apply_ignore_paths(parsed, &self.review_cfg.ignore_paths);
        if request.mode == ReviewMode::Files && !request.files.is_empty() {
            let filtered = diff::filter_by_files(&parsed, &request.files);
            if filtered.is_empty() && !parsed.is_empty() {
                return Err(ReviewError::FilterMatchedNothing);
            }
            parsed = filtered;
        }

        if parsed.is_empty() {
            return Err(ReviewError::NoDiff {
                mode: request.mode.as_str().to_string(),
            });
        }
        if parsed.total_stats.bytes > self.review_cfg.max_diff_bytes {
            return Err(ReviewError::DiffTooLarge {
                actual: parsed.total_stats.bytes,
                limit: self.review_cfg.max_diff_bytes,
            });
        }

        // Corrected count once the filters have settled.
        emitter
            .emit(EventKind::ReviewStarted {
                review_id: review_id.to_string(),
                file_total: parsed.files.len(),
            })
            .await;
        Ok(parsed)
    }

    /// Best-effort blame attribution, one orchestrator-scoped file bracket
    /// per distinct file. Blame failures degrade to no attribution; only an
    /// abort stops the loop.
    async fn enrich_blame(
        &self,
        issues: &mut [ReviewIssue],
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> Result<(), ReviewError> {
        let mut files: Vec<String> = Vec::new();
        for issue in issues.iter() {
            if !files.contains(&issue.file) {
                files.push(issue.file.clone());
            }
        }

        for file in files {
            self.check_cancel(cancel)?;
            emitter
                .emit(EventKind::FileStart {
                    scope: FileScope::Orchestrator,
                    agent_id: None,
                    file: file.clone(),
                })
                .await;
            for issue in issues.iter_mut().filter(|i| i.file == file) {
                match self.git.get_blame(&issue.file, issue.line_start).await {
                    Ok(blame) => issue.blame = blame,
                    Err(e) => {
                        warn!(file = %issue.file, line = issue.line_start, "blame failed: {e}");
                    }
                }
            }
            emitter
                .emit(EventKind::FileComplete {
                    scope: FileScope::Orchestrator,
                    agent_id: None,
                    file,
                })
                .await;
        }
        Ok(())
    }

    async fn fail_step(
        &self,
        emitter: &Emitter,
        step: StepId,
        error: ReviewError,
    ) -> ReviewError {
        emitter
            .emit(EventKind::StepError {
                step,
                code: error.code().to_string(),
                message: error.to_string(),
            })
            .await;
        error
    }

    fn check_cancel(&self, cancel: &CancellationToken) -> Result<(), ReviewError> {
        if cancel.is_cancelled() {
            Err(ReviewError::Aborted)
        } else {
            Ok(())
        }
    }
}

/// Drop files whose path starts with a configured ignore prefix.
fn apply_ignore_paths(mut parsed: ParsedDiff, prefixes: &[String]) -> ParsedDiff {
    if prefixes.is_empty() {
        return parsed;
    }
    parsed
        .files
        .retain(|f| !prefixes.iter().any(|p| f.path.starts_with(p.as_str())));
    parsed.recompute_totals();
    parsed
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{AiError, GenerateRequest};
    use crate::config::ReviewConfig;
    use crate::event::Event;
    use crate::model::BlameInfo;
    use crate::session::SessionIdentity;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DIFF: &str = "\
diff --git a/src/a.rs b/src/a.rs
--- a/src/a.rs
+++ b/src/a.rs
@@ -1,2 +1,3 @@
 fn f() {
+    let x = 1;
 }
diff --git a/node_modules/pkg/index.js b/node_modules/pkg/index.js
--- a/node_modules/pkg/index.js
+++ b/node_modules/pkg/index.js
@@ -1 +1,2 @@
 x
+y
";

    struct FakeGit {
        diff: String,
        blame: Option<BlameInfo>,
    }

    #[async_trait]
    impl GitAccess for FakeGit {
        async fn get_diff(&self, _mode: ReviewMode) -> Result<String, ReviewError> {
            Ok(self.diff.clone())
        }

        async fn get_status(&self) -> Result<RepoStatus, ReviewError> {
            Ok(status())
        }

        async fn get_status_hash(&self) -> Result<String, ReviewError> {
            Ok(status().status_hash())
        }

        async fn get_blame(
            &self,
            _file: &str,
            _line: u32,
        ) -> Result<Option<BlameInfo>, ReviewError> {
            Ok(self.blame.clone())
        }
    }

    struct CountingAi {
        calls: AtomicUsize,
        value: serde_json::Value,
    }

    impl CountingAi {
        fn new(value: serde_json::Value) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                value,
            }
        }
    }

    #[async_trait]
    impl AiClient for CountingAi {
        async fn generate(
            &self,
            _req: GenerateRequest,
            _cancel: &CancellationToken,
        ) -> Result<serde_json::Value, AiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.value.clone())
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

    fn status() -> RepoStatus {
        RepoStatus {
            branch: "main".to_string(),
            head_commit: "abc123".to_string(),
            files: vec!["src/a.rs:WT_MODIFIED".to_string()],
        }
    }

    fn request() -> ReviewRequest {
        ReviewRequest {
            project_path: "/tmp/project".to_string(),
            mode: ReviewMode::Staged,
            files: vec![],
            lenses: vec!["correctness".to_string()],
            categories: vec![],
        }
    }

    struct Harness {
        pipeline: Pipeline,
        registry: Arc<SessionRegistry>,
        ai: Arc<CountingAi>,
        _tmp: tempfile::TempDir,
    }

    fn harness(git: FakeGit, ai_value: serde_json::Value) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let ai = Arc::new(CountingAi::new(ai_value));
        let pipeline = Pipeline {
            git: Arc::new(git),
            ai: ai.clone(),
            store: Arc::new(ReviewStore::new(tmp.path())),
            sessions: registry.clone(),
            context: Arc::new(ContextCache::new()),
            review_cfg: ReviewConfig::default(),
        };
        Harness {
            pipeline,
            registry,
            ai,
            _tmp: tmp,
        }
    }

    async fn create_session(registry: &Arc<SessionRegistry>, id: &str) {
        registry
            .create(
                id,
                SessionIdentity {
                    project_path: "/tmp/project".to_string(),
                    head_commit: "abc123".to_string(),
                    status_hash: status().status_hash(),
                    mode: ReviewMode::Staged,
                },
            )
            .await;
    }

    fn kinds(events: &[Event]) -> Vec<String> {
        events
            .iter()
            .map(|e| {
                serde_json::to_value(e).unwrap()["type"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect()
    }

    fn lens_output(severity: &str) -> serde_json::Value {
        json!({
            "summary": "one finding",
            "issues": [{
                "severity": severity,
                "file": "src/a.rs",
                "lineStart": 2,
                "rationale": "unused",
                "recommendation": "remove",
                "evidence": ["+    let x = 1;"]
            }]
        })
    }

    #[tokio::test]
    async fn happy_path_saves_review_and_terminates_with_complete() {
        let h = harness(
            FakeGit {
                diff: DIFF.to_string(),
                blame: Some(BlameInfo {
                    commit: "abcdef123456".to_string(),
                    author: "Sam".to_string(),
                    summary: "add x".to_string(),
                }),
            },
            lens_output("high"),
        );
        create_session(&h.registry, "r1").await;

        let saved = h
            .pipeline
            .run("r1", request(), status(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(saved.metadata.id, "r1");
        assert_eq!(saved.metadata.severity_counts.high, 1);
        // Ignored node_modules file is excluded from the analyzed set.
        assert_eq!(saved.metadata.file_count, 1);
        // Blame was attached during enrich.
        assert_eq!(
            saved.result.issues[0].blame.as_ref().unwrap().author,
            "Sam"
        );
        // And the run is durable.
        assert!(h.pipeline.store.get("r1").await.is_ok());

        let events = h.registry.events("r1").await.unwrap();
        let ks = kinds(&events);
        assert_eq!(ks.first().map(String::as_str), Some("step_start"));
        assert_eq!(ks.last().map(String::as_str), Some("complete"));
        assert!(ks.contains(&"orchestrator_complete".to_string()));
        // All five steps completed, none errored.
        assert_eq!(ks.iter().filter(|k| *k == "step_complete").count(), 5);
        assert_eq!(ks.iter().filter(|k| *k == "step_error").count(), 0);
    }

    #[tokio::test]
    async fn empty_diff_terminates_with_no_diff_and_saves_nothing() {
        let h = harness(
            FakeGit {
                diff: String::new(),
                blame: None,
            },
            lens_output("low"),
        );
        create_session(&h.registry, "r1").await;

        let err = h
            .pipeline
            .run("r1", request(), status(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NO_DIFF");
        assert_eq!(h.ai.calls.load(Ordering::SeqCst), 0);
        assert!(h.pipeline.store.get("r1").await.is_err());

        let events = h.registry.events("r1").await.unwrap();
        let ks = kinds(&events);
        assert!(ks.contains(&"step_error".to_string()));
        assert_eq!(ks.last().map(String::as_str), Some("error"));
    }

    #[tokio::test]
    async fn oversized_diff_is_rejected_before_any_ai_call() {
        let mut cfg = ReviewConfig::default();
        cfg.max_diff_bytes = 16;
        let mut h = harness(
            FakeGit {
                diff: DIFF.to_string(),
                blame: None,
            },
            lens_output("low"),
        );
        h.pipeline.review_cfg = cfg;
        create_session(&h.registry, "r1").await;

        let err = h
            .pipeline
            .run("r1", request(), status(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DIFF_TOO_LARGE");
        assert_eq!(h.ai.calls.load(Ordering::SeqCst), 0);
        assert!(h.pipeline.store.get("r1").await.is_err());
    }

    #[tokio::test]
    async fn files_filter_matching_nothing_is_invalid() {
        let h = harness(
            FakeGit {
                diff: DIFF.to_string(),
                blame: None,
            },
            lens_output("low"),
        );
        create_session(&h.registry, "r1").await;

        let mut req = request();
        req.mode = ReviewMode::Files;
        req.files = vec!["does/not/exist.rs".to_string()];
        let err = h
            .pipeline
            .run("r1", req, status(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_FILE_FILTER");
        assert_eq!(h.ai.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_run_terminates_aborted_without_saving() {
        let h = harness(
            FakeGit {
                diff: DIFF.to_string(),
                blame: None,
            },
            lens_output("low"),
        );
        create_session(&h.registry, "r1").await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = h
            .pipeline
            .run("r1", request(), status(), cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ABORTED");
        assert!(h.pipeline.store.get("r1").await.is_err());

        let events = h.registry.events("r1").await.unwrap();
        let ks = kinds(&events);
        assert_eq!(ks.last().map(String::as_str), Some("error"));
    }

    #[tokio::test]
    async fn review_started_is_corrected_after_filters() {
        let h = harness(
            FakeGit {
                diff: DIFF.to_string(),
                blame: None,
            },
            lens_output("nit"),
        );
        create_session(&h.registry, "r1").await;

        h.pipeline
            .run("r1", request(), status(), CancellationToken::new())
            .await
            .unwrap();

        let events = h.registry.events("r1").await.unwrap();
        let totals: Vec<usize> = events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::ReviewStarted { file_total, .. } => Some(*file_total),
                _ => None,
            })
            .collect();
        // Estimate includes node_modules; the corrected count does not.
        assert_eq!(totals, vec![2, 1]);
    }

    #[test]
    fn ignore_prefixes_drop_files_and_recompute_totals() {
        let parsed = diff::parse(DIFF);
        assert_eq!(parsed.files.len(), 2);
        let kept = apply_ignore_paths(parsed, &["node_modules/".to_string()]);
        assert_eq!(kept.files.len(), 1);
        assert_eq!(kept.files[0].path, "src/a.rs");
        assert_eq!(kept.total_stats, kept.files[0].stats);
    }
}
