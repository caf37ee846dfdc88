//! Streaming generation coordinator.
//!
//! Each admitted request runs as its own task that moves through
//! `Admitted → Streaming → Completed`:
//!
//! 1. **Admitted**: emit a [`StreamEvent::Prompt`] right away, before the
//!    provider is called.
//! 2. **Streaming**: forward every provider token as it arrives. Each wait
//!    for the next token is bounded by the idle timeout, and a dropped
//!    receiver (client gone) ends the wait immediately.
//! 3. **Completed**: on success, append citation links, store the turn and
//!    complete the request. On failure, emit a [`StreamEvent::Error`] and
//!    complete the request with the precise error.
//!
//! The [`RequestHandle`] is consumed on the way into `Completed`, so the
//! record is completed exactly once; if the task is torn down early the
//! handle's drop guard does it instead.

use futures::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::admission::RequestHandle;
use crate::config::GenerationOptions;
use crate::error::RagError;
use crate::gateway::{now_ts, PersistenceGateway};
use crate::generation::{ChatMessage, GenerationProvider, TokenStream};
use crate::models::ConversationTurn;

/// Events delivered to the caller, serialized one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Prompt {
        conv_id: String,
        prompt: String,
    },
    Token {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        thinking: Option<String>,
    },
    /// Rendered citation links, sent once after the last token.
    Sources {
        html: String,
        files: Vec<String>,
    },
    /// Terminal; the message is safe to show to end users.
    Error {
        message: String,
    },
}

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

pub(crate) const DISCONNECTED: &str = "client disconnected";

/// Everything one generation run needs.
pub struct GenerationJob {
    pub handle: RequestHandle,
    pub conv_id: String,
    pub question: String,
    /// Shown in the first event.
    pub prompt: String,
    pub messages: Vec<ChatMessage>,
    pub options: GenerationOptions,
    pub think: bool,
    pub idle_timeout: Duration,
    /// Source files to cite; empty means no citation block.
    pub sources: Vec<String>,
    pub answer_prefix: String,
    pub citation_label: String,
    /// Store the question/answer pair on success.
    pub persist_turn: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Admitted,
    Streaming,
    Completed,
}

enum Interrupt {
    Provider(RagError),
    Disconnected,
}

pub struct StreamingCoordinator {
    generator: Arc<dyn GenerationProvider>,
    gateway: Arc<dyn PersistenceGateway>,
}

impl StreamingCoordinator {
    pub fn new(generator: Arc<dyn GenerationProvider>, gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { generator, gateway }
    }

    /// Spawn the run for `job` and return its event stream. The stream is
    /// finite and not restartable.
    pub fn start(&self, job: GenerationJob) -> EventStream {
        let (tx, rx) = mpsc::channel(64);
        let run = Run {
            generator: self.generator.clone(),
            gateway: self.gateway.clone(),
            tx,
            phase: Phase::Admitted,
        };
        tokio::spawn(run.drive(job));
        Box::pin(ReceiverStream::new(rx))
    }
}

struct Run {
    generator: Arc<dyn GenerationProvider>,
    gateway: Arc<dyn PersistenceGateway>,
    tx: mpsc::Sender<StreamEvent>,
    phase: Phase,
}

impl Run {
    fn advance(&mut self, next: Phase, request_id: i64) {
        tracing::debug!(request_id, from = ?self.phase, to = ?next, "generation phase");
        self.phase = next;
    }

    async fn drive(mut self, job: GenerationJob) {
        let GenerationJob {
            handle,
            conv_id,
            question,
            prompt,
            messages,
            options,
            think,
            idle_timeout,
            sources,
            answer_prefix,
            citation_label,
            persist_turn,
        } = job;
        let request_id = handle.id();

        if self
            .tx
            .send(StreamEvent::Prompt {
                conv_id: conv_id.clone(),
                prompt,
            })
            .await
            .is_err()
        {
            self.advance(Phase::Completed, request_id);
            handle.complete(Some(DISCONNECTED.to_string())).await;
            return;
        }

        self.advance(Phase::Streaming, request_id);
        let streamed = self
            .stream_tokens(messages, &options, think, idle_timeout)
            .await;

        match streamed {
            Ok(answer) => {
                let mut full_answer = format!("{}{}", answer_prefix, answer);
                if !sources.is_empty() {
                    let html = format!("{}{}", citation_label, render_citations(&sources));
                    full_answer.push_str("\n\n");
                    full_answer.push_str(&html);
                    // Best effort: the answer is complete even if the client left now.
                    let _ = self
                        .tx
                        .send(StreamEvent::Sources {
                            html,
                            files: sources.clone(),
                        })
                        .await;
                }

                let mut error = None;
                if persist_turn {
                    let turn = ConversationTurn {
                        conv_id,
                        user_id: handle.user_id().to_string(),
                        question,
                        answer: full_answer,
                        created_at: now_ts(),
                    };
                    if let Err(e) = self.gateway.store_turn(&turn).await {
                        tracing::error!(request_id, error = %e, "failed to store conversation turn");
                        error = Some(format!("conversation not saved: {}", e));
                    }
                }
                self.advance(Phase::Completed, request_id);
                handle.complete(error).await;
            }
            Err(Interrupt::Provider(err)) => {
                tracing::error!(request_id, error = %err, "generation failed");
                let _ = self
                    .tx
                    .send(StreamEvent::Error {
                        message: err.user_message().to_string(),
                    })
                    .await;
                self.advance(Phase::Completed, request_id);
                handle.complete(Some(err.to_string())).await;
            }
            Err(Interrupt::Disconnected) => {
                tracing::info!(request_id, "client disconnected during generation");
                self.advance(Phase::Completed, request_id);
                handle.complete(Some(DISCONNECTED.to_string())).await;
            }
        }
    }

    /// Forward provider tokens until the stream ends; returns the answer text.
    async fn stream_tokens(
        &mut self,
        messages: Vec<ChatMessage>,
        options: &GenerationOptions,
        think: bool,
        idle_timeout: Duration,
    ) -> Result<String, Interrupt> {
        let mut tokens: TokenStream = tokio::select! {
            _ = self.tx.closed() => return Err(Interrupt::Disconnected),
            started = tokio::time::timeout(idle_timeout, self.generator.generate(messages, options, think)) => {
                match started {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => return Err(Interrupt::Provider(RagError::GenerationProvider(e.to_string()))),
                    Err(_) => return Err(stalled()),
                }
            }
        };

        let mut answer = String::new();
        loop {
            let next = tokio::select! {
                _ = self.tx.closed() => return Err(Interrupt::Disconnected),
                next = tokio::time::timeout(idle_timeout, tokens.next()) => next,
            };
            let event = match next {
                Err(_) => return Err(stalled()),
                Ok(None) => return Ok(answer),
                Ok(Some(Err(e))) => {
                    return Err(Interrupt::Provider(RagError::GenerationProvider(e.to_string())))
                }
                Ok(Some(Ok(event))) => event,
            };

            answer.push_str(&event.content);
            let forwarded = StreamEvent::Token {
                content: event.content,
                thinking: event.thinking,
            };
            if self.tx.send(forwarded).await.is_err() {
                return Err(Interrupt::Disconnected);
            }
        }
    }
}

fn stalled() -> Interrupt {
    Interrupt::Provider(RagError::GenerationProvider(
        "generation provider stalled".to_string(),
    ))
}

/// Substitute the answer template's placeholders.
pub fn build_system_prompt(
    template: &str,
    context: &str,
    question: &str,
    keyword: &str,
    history: &str,
) -> String {
    template
        .replace("{context}", context)
        .replace("{question}", question)
        .replace("{keyword}", keyword)
        .replace("{history}", history)
}

/// Render earlier turns for the `{history}` placeholder.
pub fn render_history(turns: &[ConversationTurn]) -> String {
    turns
        .iter()
        .map(|t| format!("User Question: {}\nAnswer: {}", t.question, t.answer))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Markdown sources open in the viewer; anything else links to the raw
/// document.
pub fn render_citations(sources: &[String]) -> String {
    sources
        .iter()
        .map(|src| {
            let name = escape_html(src);
            if src.to_lowercase().ends_with(".md") {
                format!(r#"<a href="/md_viewer?file={0}" target="_blank">{0}</a>"#, name)
            } else {
                format!(r#"<a href="/documents/{0}" target="_blank">{0}</a>"#, name)
            }
        })
        .collect::<Vec<_>>()
        .join("、")
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
