//! Client for an OpenAI-compatible inference server plus its model-switch admin endpoint.
//!
//! Uses `/v1/chat/completions` (streaming SSE and non-streaming), `/v1/models` for listing and
//! liveness, and `/admin/switch_model` on the admin root to change the served model.

use crate::config::{self, Config, ServerConfig};
use crate::session::WireMessage;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Errors from any call against the inference server.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("inference request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("inference api error: {status} {body}")]
    Api { status: u16, body: String },
    #[error("malformed response: {0}")]
    Protocol(String),
    #[error("server did not come back online within {0:?}")]
    ServerRestartTimeout(Duration),
}

/// How a streaming completion ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// `[DONE]` (or end of body) reached; carries the concatenated text.
    Completed(String),
    /// The abort flag was observed; no terminal event should be reported.
    Aborted,
}

/// One decoded line of a streaming response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// Blank keep-alive, comment, or any line without the `data: ` prefix.
    Ignore,
    /// The `[DONE]` sentinel.
    Done,
    /// A chunk; `None` when it carried no (or empty) content.
    Delta(Option<String>),
}

/// Model entry from `/v1/models`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub id: String,
}

/// Client for the inference server. Cheap to clone.
#[derive(Clone)]
pub struct InferenceClient {
    base_url: String,
    admin_url: String,
    server: ServerConfig,
    client: reqwest::Client,
}

impl InferenceClient {
    /// Build from explicit roots (trailing slashes are trimmed) and timeouts.
    pub fn new(base_url: &str, admin_url: &str, server: ServerConfig) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            admin_url: admin_url.trim_end_matches('/').to_string(),
            server,
            client: reqwest::Client::new(),
        }
    }

    /// Build from config, honoring the PALAVER_SERVER_URL / PALAVER_ADMIN_URL overrides.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config::resolve_base_url(config),
            &config::resolve_admin_url(config),
            config.server.clone(),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn models_url(&self) -> String {
        format!("{}/v1/models", self.base_url)
    }

    /// GET /v1/models: list served models.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
        let res = self
            .client
            .get(self.models_url())
            .timeout(self.server.poll_timeout())
            .send()
            .await?;
        let res = check_status(res).await?;
        let data: ModelsResponse = res.json().await?;
        Ok(data
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|m| ModelInfo { id: m.id })
            .collect())
    }

    /// Id of the model the server is currently serving (first entry of /v1/models).
    pub async fn active_model(&self) -> Result<Option<String>, LlmError> {
        Ok(self.list_models().await?.into_iter().next().map(|m| m.id))
    }

    /// POST /v1/chat/completions with stream: false. Returns the first choice's content unmodified.
    pub async fn complete(
        &self,
        model: &str,
        messages: &[WireMessage],
        temperature: f64,
        max_tokens: Option<u32>,
    ) -> Result<String, LlmError> {
        let body = ChatRequest {
            model,
            messages,
            temperature,
            stream: false,
            max_tokens,
        };
        let res = self
            .client
            .post(self.completions_url())
            .timeout(self.server.summary_timeout())
            .json(&body)
            .send()
            .await?;
        let res = check_status(res).await?;
        let data: ChatResponse = res.json().await?;
        data.choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message)
            .map(|m| m.content.unwrap_or_default())
            .ok_or_else(|| LlmError::Protocol("completion response had no choices".to_string()))
    }

    /// POST /v1/chat/completions with stream: true. Calls `on_chunk` once per non-empty content delta,
    /// in wire order. `abort` is checked before the request and at every line boundary.
    pub async fn chat_stream(
        &self,
        model: &str,
        messages: &[WireMessage],
        temperature: f64,
        abort: &AtomicBool,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<StreamOutcome, LlmError> {
        if abort.load(Ordering::SeqCst) {
            return Ok(StreamOutcome::Aborted);
        }
        let body = ChatRequest {
            model,
            messages,
            temperature,
            stream: true,
            max_tokens: None,
        };
        let res = self
            .client
            .post(self.completions_url())
            .timeout(self.server.stream_timeout())
            .json(&body)
            .send()
            .await?;
        let res = check_status(res).await?;

        let mut stream = res.bytes_stream();
        let mut buffer = Vec::new();
        let mut content = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(LlmError::Request)?;
            buffer.extend_from_slice(&chunk);
            while let Some(i) = buffer.iter().position(|&b| b == b'\n') {
                let line_bytes: Vec<u8> = buffer.drain(..i).collect();
                buffer.drain(..1);
                if abort.load(Ordering::SeqCst) {
                    log::debug!("stream aborted at line boundary");
                    return Ok(StreamOutcome::Aborted);
                }
                let line = String::from_utf8_lossy(&line_bytes);
                match decode_sse_line(&line)? {
                    SseLine::Ignore | SseLine::Delta(None) => {}
                    SseLine::Done => return Ok(StreamOutcome::Completed(content)),
                    SseLine::Delta(Some(text)) => {
                        on_chunk(&text);
                        content.push_str(&text);
                    }
                }
            }
        }

        if abort.load(Ordering::SeqCst) {
            return Ok(StreamOutcome::Aborted);
        }
        // Body ended without a trailing newline or without [DONE].
        if !buffer.is_empty() {
            let line = String::from_utf8_lossy(&buffer);
            if let SseLine::Delta(Some(text)) = decode_sse_line(&line)? {
                on_chunk(&text);
                content.push_str(&text);
            }
        }
        log::debug!("stream ended without [DONE]");
        Ok(StreamOutcome::Completed(content))
    }

    /// POST {admin}/admin/switch_model?model={name}.
    pub async fn request_model_switch(&self, model: &str) -> Result<(), LlmError> {
        let url = format!("{}/admin/switch_model", self.admin_url);
        let res = self
            .client
            .post(&url)
            .query(&[("model", model)])
            .timeout(self.server.admin_timeout())
            .send()
            .await?;
        check_status(res).await?;
        Ok(())
    }

    /// Poll /v1/models at the configured interval until it answers successfully or the ready timeout elapses.
    pub async fn wait_for_server_ready(&self) -> Result<(), LlmError> {
        let timeout = self.server.ready_timeout();
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match self.list_models().await {
                Ok(_) => return Ok(()),
                Err(e) => log::debug!("server not ready yet: {}", e),
            }
            tokio::time::sleep(self.server.poll_interval()).await;
        }
        Err(LlmError::ServerRestartTimeout(timeout))
    }

    /// Ask the admin endpoint to switch models, then wait for the server to come back.
    pub async fn switch_model(&self, model: &str) -> Result<(), LlmError> {
        log::info!("switching server model to {}", model);
        self.request_model_switch(model).await?;
        self.wait_for_server_ready().await
    }
}

async fn check_status(res: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status().as_u16();
    let body = res.text().await.unwrap_or_default();
    Err(LlmError::Api { status, body })
}

/// Decode one line of an SSE-style completion stream. A `data: ` payload that is not JSON is a protocol error.
pub fn decode_sse_line(line: &str) -> Result<SseLine, LlmError> {
    let line = line.trim_end_matches('\r');
    let Some(data) = line.strip_prefix("data: ") else {
        return Ok(SseLine::Ignore);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|e| LlmError::Protocol(format!("bad stream chunk {:?}: {}", data, e)))?;
    let content = chunk
        .choices
        .and_then(|c| c.into_iter().next())
        .and_then(|c| c.delta)
        .and_then(|d| d.content)
        .filter(|c| !c.is_empty());
    Ok(SseLine::Delta(content))
}

// --- wire types ---

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [WireMessage],
    temperature: f64,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Option<Vec<ModelObject>>,
}

#[derive(Debug, Deserialize)]
struct ModelObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Option<Vec<Choice>>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}
