// SPDX-License-Identifier: MIT
//! AI collaborator interface.
//!
//! The review core consumes exactly two capabilities: "produce structured
//! output for a prompt" and "stream text for a prompt", both cancellable.
//! Retry policy, if any, lives behind this trait — the core never retries
//! AI calls itself.

pub mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use http::OpenAiClient;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiErrorCode {
    RateLimited,
    AuthInvalid,
    ModelError,
    NetworkError,
    UnsupportedProvider,
    /// Per-call timeout elapsed. A special case of cancellation, applied
    /// independently of any caller-supplied token.
    Timeout,
    /// The caller's cancellation token fired mid-call.
    Aborted,
}

impl AiErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiErrorCode::RateLimited => "RATE_LIMITED",
            AiErrorCode::AuthInvalid => "AUTH_INVALID",
            AiErrorCode::ModelError => "MODEL_ERROR",
            AiErrorCode::NetworkError => "NETWORK_ERROR",
            AiErrorCode::UnsupportedProvider => "UNSUPPORTED_PROVIDER",
            AiErrorCode::Timeout => "AI_TIMEOUT",
            AiErrorCode::Aborted => "ABORTED",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{}: {message}", code.as_str())]
pub struct AiError {
    pub code: AiErrorCode,
    pub message: String,
}

impl AiError {
    pub fn new(code: AiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn aborted() -> Self {
        Self::new(AiErrorCode::Aborted, "call aborted by caller")
    }
}

// ─── Requests ─────────────────────────────────────────────────────────────────

/// The JSON shape the structured call must return. `schema` is advisory
/// (embedded in the request for providers that support it); callers still
/// validate the parsed value.
#[derive(Debug, Clone)]
pub struct OutputShape {
    pub name: &'static str,
    pub schema: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub system: String,
    pub prompt: String,
    pub shape: Option<OutputShape>,
}

// ─── Client trait ─────────────────────────────────────────────────────────────

/// Abstract AI capability consumed by the pipeline.
///
/// Both calls must honour `cancel` promptly and surface it as
/// [`AiErrorCode::Aborted`] — never as silent success. An internal per-call
/// timeout must not mask an external cancel, and vice versa.
#[async_trait]
pub trait AiClient: Send + Sync {
    /// One structured call: returns the parsed JSON value matching the
    /// request's output shape.
    async fn generate(
        &self,
        req: GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, AiError>;

    /// Streamed text generation; `on_chunk` is invoked once per text delta.
    /// The callback lifetime is higher-ranked so implementations can hand it
    /// slices borrowed from their own decode buffers.
    async fn generate_stream(
        &self,
        req: GenerateRequest,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
        cancel: &CancellationToken,
    ) -> Result<(), AiError>;
}

// ─── Provider factory ─────────────────────────────────────────────────────────

/// Build the configured client. Unknown providers fail fast, before any
/// review starts.
pub fn build_client(cfg: &crate::config::AiConfig) -> Result<Arc<dyn AiClient>, AiError> {
    let timeout = Duration::from_secs(cfg.timeout_secs.max(1));
    let base_url = match (cfg.provider.as_str(), cfg.base_url.as_str()) {
        ("openai" | "openai_compatible", "") => "https://api.openai.com/v1",
        ("ollama", "") => "http://127.0.0.1:11434/v1",
        ("openai" | "openai_compatible" | "ollama", custom) => custom,
        (other, _) => {
            return Err(AiError::new(
                AiErrorCode::UnsupportedProvider,
                format!("unknown AI provider '{other}'"),
            ));
        }
    };
    Ok(Arc::new(
        OpenAiClient::new(base_url, &cfg.api_key, &cfg.model).with_timeout(timeout),
    ))
}
