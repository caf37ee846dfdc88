//! Streaming generation provider.
//!
//! A [`GenerationProvider`] turns a chat exchange into a lazy stream of
//! [`TokenEvent`]s. The stream is finite and cannot be restarted; the
//! coordinator is responsible for timeouts between events.

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::{GenerationConfig, GenerationOptions};

/// One increment of model output.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TokenEvent {
    pub content: String,
    /// Reasoning text, present only when thinking is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<TokenEvent>> + Send>>;

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn model_name(&self) -> &str;

    /// Start generating. Errors before the first token are returned here;
    /// later failures arrive as `Err` items on the stream.
    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        options: &GenerationOptions,
        think: bool,
    ) -> Result<TokenStream>;
}

/// Chat generation through Ollama's `POST /api/chat` with `stream: true`.
///
/// The response body is newline-delimited JSON; each line carries
/// `message.content` and, for reasoning models, `message.thinking`.
pub struct OllamaGenerator {
    url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        // No overall timeout: a generation can legitimately stream for minutes.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            client,
        })
    }
}

#[async_trait]
impl GenerationProvider for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        options: &GenerationOptions,
        think: bool,
    ) -> Result<TokenStream> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "think": think,
            "options": options,
        });

        let response = self
            .client
            .post(format!("{}/api/chat", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Ollama connection error ({}): {}", self.url, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Ollama API error {}: {}", status, text);
        }

        let (tx, rx) = mpsc::channel(32);
        let mut bytes = response.bytes_stream();

        tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(item) = bytes.next().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(anyhow::anyhow!("Ollama stream error: {}", e))).await;
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    match parse_chat_line(&line) {
                        Ok(None) => {}
                        Ok(Some(ChatLine { event, done })) => {
                            if let Some(event) = event {
                                if tx.send(Ok(event)).await.is_err() {
                                    return;
                                }
                            }
                            if done {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }

            // Trailing line without a newline.
            match parse_chat_line(&buffer) {
                Ok(Some(ChatLine {
                    event: Some(event), ..
                })) => {
                    let _ = tx.send(Ok(event)).await;
                }
                Ok(_) => {}
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[derive(Debug, PartialEq)]
struct ChatLine {
    event: Option<TokenEvent>,
    done: bool,
}

/// Parse one NDJSON line. Blank lines yield `None`.
fn parse_chat_line(line: &[u8]) -> Result<Option<ChatLine>> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }

    let json: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| anyhow::anyhow!("Invalid Ollama stream line: {}", e))?;
    if let Some(err) = json.get("error").and_then(|e| e.as_str()) {
        bail!("Ollama reported an error: {}", err);
    }

    let content = json["message"]["content"].as_str().unwrap_or_default();
    let thinking = json["message"]["thinking"]
        .as_str()
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    let event = if content.is_empty() && thinking.is_none() {
        None
    } else {
        Some(TokenEvent {
            content: content.to_string(),
            thinking,
        })
    };

    Ok(Some(ChatLine {
        event,
        done: json["done"].as_bool().unwrap_or(false),
    }))
}

pub fn create_generator(config: &GenerationConfig) -> Result<Box<dyn GenerationProvider>> {
    match config.provider.as_str() {
        "ollama" => Ok(Box::new(OllamaGenerator::new(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}
