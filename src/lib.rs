// SPDX-License-Identifier: MIT
pub mod ai;
pub mod config;
pub mod context;
pub mod diff;
pub mod drilldown;
pub mod error;
pub mod event;
pub mod git;
pub mod lens;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod rest;
pub mod session;
pub mod storage;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use ai::AiClient;
use config::RevdConfig;
use context::ContextCache;
use error::ReviewError;
use session::SessionRegistry;
use storage::ReviewStore;

/// Shared application state handed to every HTTP handler and review task.
pub struct AppContext {
    pub config: RevdConfig,
    pub store: Arc<ReviewStore>,
    pub sessions: Arc<SessionRegistry>,
    pub ai: Arc<dyn AiClient>,
    pub context: Arc<ContextCache>,
    pub started_at: Instant,
    /// Cancellation tokens for in-flight reviews, keyed by review id.
    cancels: Mutex<HashMap<String, CancellationToken>>,
}

impl AppContext {
    pub fn new(config: RevdConfig) -> Result<Self, ReviewError> {
        let ai = ai::build_client(&config.ai)?;
        let store = Arc::new(ReviewStore::new(&config.data_dir));
        let sessions = Arc::new(SessionRegistry::with_grace(Duration::from_secs(
            config.session_grace_secs,
        )));
        info!(
            data_dir = %config.data_dir.display(),
            provider = %config.ai.provider,
            model = %config.ai.model,
            "daemon context initialised"
        );
        Ok(Self {
            config,
            store,
            sessions,
            ai,
            context: Arc::new(ContextCache::new()),
            started_at: Instant::now(),
            cancels: Mutex::new(HashMap::new()),
        })
    }

    /// Mint and register the cancellation token for a new review.
    pub async fn register_cancel(&self, review_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancels
            .lock()
            .await
            .insert(review_id.to_string(), token.clone());
        token
    }

    /// Drop a finished review's token. Idempotent.
    pub async fn forget_cancel(&self, review_id: &str) {
        self.cancels.lock().await.remove(review_id);
    }

    /// Cancel an in-flight review. Returns false when no such review is
    /// running (already finished, or never existed).
    pub async fn abort(&self, review_id: &str) -> bool {
        match self.cancels.lock().await.remove(review_id) {
            Some(token) => {
                info!(review_id, "abort requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
