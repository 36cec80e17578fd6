// SPDX-License-Identifier: MIT
//! OpenAI-compatible chat-completions client.
//!
//! Works against any endpoint speaking the `/chat/completions` protocol
//! (OpenAI, local gateways, vLLM). Structured calls use `response_format:
//! json_object` and parse the first choice's content as JSON, tolerating
//! markdown fences around the payload.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{AiClient, AiError, AiErrorCode, GenerateRequest};

/// Default per-call timeout. Composed with (never replacing) the caller's
/// cancellation token.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl OpenAiClient {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn body(&self, req: &GenerateRequest, stream: bool) -> Value {
        let mut system = req.system.clone();
        if let Some(shape) = &req.shape {
            // Providers without native schema support still see the shape.
            system.push_str(&format!(
                "\n\nRespond with a single JSON object named `{}` matching this schema:\n{}",
                shape.name, shape.schema
            ));
        }
        let mut body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": req.prompt },
            ],
            "stream": stream,
        });
        if req.shape.is_some() && !stream {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }

    async fn post(&self, body: Value) -> Result<reqwest::Response, AiError> {
        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AiError::new(AiErrorCode::NetworkError, e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        let code = match status.as_u16() {
            401 | 403 => AiErrorCode::AuthInvalid,
            429 => AiErrorCode::RateLimited,
            _ => AiErrorCode::ModelError,
        };
        Err(AiError::new(
            code,
            format!("{} from {}: {}", status, url, truncate(&text, 512)),
        ))
    }
}

#[async_trait]
impl AiClient for OpenAiClient {
    async fn generate(
        &self,
        req: GenerateRequest,
        cancel: &CancellationToken,
    ) -> Result<Value, AiError> {
        let call = async {
            let resp = self.post(self.body(&req, false)).await?;
            let payload: Value = resp
                .json()
                .await
                .map_err(|e| AiError::new(AiErrorCode::ModelError, e.to_string()))?;
            let content = payload["choices"][0]["message"]["content"]
                .as_str()
                .ok_or_else(|| {
                    AiError::new(AiErrorCode::ModelError, "response has no message content")
                })?;
            parse_json_content(content)
        };

        // External cancel and internal timeout compose: whichever fires first
        // wins, and neither masks the other's outcome code.
        tokio::select! {
            _ = cancel.cancelled() => Err(AiError::aborted()),
            result = tokio::time::timeout(self.timeout, call) => match result {
                Err(_) => Err(AiError::new(
                    AiErrorCode::Timeout,
                    format!("no response after {}s", self.timeout.as_secs()),
                )),
                Ok(inner) => inner,
            },
        }
    }

    async fn generate_stream(
        &self,
        req: GenerateRequest,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
        cancel: &CancellationToken,
    ) -> Result<(), AiError> {
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(AiError::aborted()),
            r = tokio::time::timeout(self.timeout, self.post(self.body(&req, true))) => match r {
                Err(_) => return Err(AiError::new(AiErrorCode::Timeout, "stream open timed out")),
                Ok(inner) => inner?,
            },
        };

        let mut stream = resp.bytes_stream();
        let mut buf = String::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(AiError::aborted()),
                c = stream.next() => match c {
                    None => break,
                    Some(Err(e)) => return Err(AiError::new(AiErrorCode::NetworkError, e.to_string())),
                    Some(Ok(bytes)) => bytes,
                },
            };
            buf.push_str(&String::from_utf8_lossy(&chunk));

            // SSE framing: one `data: {...}` JSON object per line.
            while let Some(pos) = buf.find('\n') {
                let line = buf[..pos].trim().to_string();
                buf.drain(..=pos);
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    return Ok(());
                }
                if let Ok(v) = serde_json::from_str::<Value>(data) {
                    if let Some(delta) = v["choices"][0]["delta"]["content"].as_str() {
                        on_chunk(delta);
                    }
                } else {
                    debug!(line = %truncate(data, 120), "skipping unparseable stream line");
                }
            }
        }
        Ok(())
    }
}

/// Parse the model's content as JSON, tolerating ```json fences.
fn parse_json_content(content: &str) -> Result<Value, AiError> {
    let trimmed = content.trim();
    let candidate = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```").trim())
        .unwrap_or(trimmed);
    serde_json::from_str(candidate).map_err(|e| {
        AiError::new(
            AiErrorCode::ModelError,
            format!("structured output is not valid JSON: {e}"),
        )
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
