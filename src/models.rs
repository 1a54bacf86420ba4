use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::settings::EffectiveSettings;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

impl ModelRequest {
    pub fn new(prompt: impl Into<String>, settings: &EffectiveSettings) -> Self {
        Self {
            model: settings.model.clone(),
            prompt: prompt.into(),
            temperature: settings.model_params.temperature,
            max_tokens: settings.model_params.max_tokens,
            top_p: settings.model_params.top_p,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelResponse {
    pub content: String,
    pub model: String,
}

/// Incremental text fragments from a streaming generation call.
pub type TextStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, req: ModelRequest) -> anyhow::Result<ModelResponse>;

    /// `Ok(None)` when the model cannot stream; callers fall back to `generate`.
    async fn generate_stream(&self, _req: ModelRequest) -> anyhow::Result<Option<TextStream>> {
        Ok(None)
    }
}

#[derive(Clone)]
pub struct OpenAICompatible {
    pub base_url: String,
    pub api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAICompatible {
    /// `timeout` bounds each HTTP call, including the whole body of a stream.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url: base_url.into(), api_key, client })
    }

    pub fn from_env(timeout: Duration) -> anyhow::Result<Self> {
        let base_url = std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        Self::new(base_url, api_key, timeout)
    }

    fn request(&self, req: &ModelRequest, stream: bool) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = OaiChatRequest {
            model: &req.model,
            messages: vec![serde_json::json!({"role":"user","content": req.prompt})],
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            top_p: req.top_p,
            stream,
        };
        let mut rb = self.client.post(url).json(&body);
        if let Some(key) = &self.api_key {
            rb = rb.bearer_auth(key);
        }
        rb
    }
}

#[derive(Debug, Serialize)]
struct OaiChatRequest<'a> {
    model: &'a str,
    messages: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")] temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")] max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")] top_p: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")] stream: bool,
}

#[derive(Debug, Deserialize)]
struct OaiChatResponse {
    choices: Vec<OaiChoice>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct OaiChoice { message: OaiMessage }

#[derive(Debug, Deserialize)]
struct OaiMessage { content: Option<String> }

#[derive(Debug, Deserialize)]
struct OaiStreamChunk { choices: Vec<OaiStreamChoice> }

#[derive(Debug, Deserialize)]
struct OaiStreamChoice { delta: OaiDelta }

#[derive(Debug, Deserialize)]
struct OaiDelta { content: Option<String> }

#[derive(Debug, PartialEq)]
enum SseLine {
    Fragment(String),
    Done,
    Skip,
}

/// Interpret one line of an OpenAI-style server-sent event stream.
fn parse_sse_line(line: &str) -> anyhow::Result<SseLine> {
    let Some(data) = line.strip_prefix("data:") else { return Ok(SseLine::Skip) };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    let chunk: OaiStreamChunk = serde_json::from_str(data)?;
    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();
    Ok(if text.is_empty() { SseLine::Skip } else { SseLine::Fragment(text) })
}

#[async_trait]
impl LanguageModel for OpenAICompatible {
    async fn generate(&self, req: ModelRequest) -> anyhow::Result<ModelResponse> {
        let resp = self.request(&req, false).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("model call failed: {}", resp.status());
        }
        let v: OaiChatResponse = resp.json().await?;
        let content = v.choices.into_iter().next().and_then(|c| c.message.content).unwrap_or_default();
        Ok(ModelResponse { content, model: v.model })
    }

    async fn generate_stream(&self, req: ModelRequest) -> anyhow::Result<Option<TextStream>> {
        let resp = self.request(&req, true).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("model stream failed: {}", resp.status());
        }
        let mut bytes = Box::pin(resp.bytes_stream());
        let stream = async_stream::stream! {
            let mut buffer: Vec<u8> = Vec::new();
            'read: while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => buffer.extend_from_slice(&chunk),
                    Err(e) => {
                        yield Err(anyhow::Error::from(e));
                        break 'read;
                    }
                }
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    match parse_sse_line(line.trim()) {
                        Ok(SseLine::Fragment(text)) => yield Ok(text),
                        Ok(SseLine::Done) => break 'read,
                        Ok(SseLine::Skip) => {}
                        Err(e) => {
                            yield Err(e);
                            break 'read;
                        }
                    }
                }
            }
        };
        Ok(Some(Box::pin(stream)))
    }
}
