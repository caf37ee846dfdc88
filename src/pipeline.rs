//! The query service: admission, history, retrieval and generation wired
//! together for one caller request.
//!
//! Every failure after admission completes the request handle with the
//! precise error before a generic, user-safe outcome is returned.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::admission::{Admission, AdmissionController, BusyReason, RequestHandle};
use crate::config::{Config, SharedConfig};
use crate::coordinator::{
    build_system_prompt, render_history, EventStream, GenerationJob, StreamingCoordinator,
};
use crate::gateway::PersistenceGateway;
use crate::generation::ChatMessage;
use crate::retrieval::Retriever;

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub keyword: String,
    /// Empty starts a new conversation.
    #[serde(default)]
    pub conv_id: String,
    #[serde(default)]
    pub think: bool,
}

pub enum QueryOutcome {
    /// Declined by admission control; nothing was recorded.
    Busy(BusyReason),
    /// Failed before streaming began. The message is safe to show.
    Failed { code: &'static str, message: String },
    Streaming(EventStream),
}

pub struct QueryService {
    config: Arc<SharedConfig>,
    gateway: Arc<dyn PersistenceGateway>,
    admission: AdmissionController,
    retriever: Retriever,
    coordinator: StreamingCoordinator,
}

impl QueryService {
    pub fn new(
        config: Arc<SharedConfig>,
        gateway: Arc<dyn PersistenceGateway>,
        retriever: Retriever,
        coordinator: StreamingCoordinator,
    ) -> Self {
        Self {
            admission: AdmissionController::new(gateway.clone(), config.clone()),
            config,
            gateway,
            retriever,
            coordinator,
        }
    }

    async fn admit(&self, user_id: &str, conv_id: &str, question: &str) -> Result<RequestHandle, QueryOutcome> {
        match self.admission.admit(user_id, conv_id, question).await {
            Ok(Admission::Admitted(handle)) => Ok(handle),
            Ok(Admission::Busy(reason)) => Err(QueryOutcome::Busy(reason)),
            Err(e) => {
                tracing::error!(user_id, error = %e, "admission failed");
                Err(QueryOutcome::Failed {
                    code: e.code(),
                    message: e.user_message().to_string(),
                })
            }
        }
    }

    /// Answer a question from the indexed documents.
    pub async fn ask(&self, user_id: &str, req: QueryRequest) -> QueryOutcome {
        let config = self.config.snapshot().await;
        let (conv_id, continuing) = self.owned_conversation(user_id, &req.conv_id).await;

        let handle = match self.admit(user_id, &conv_id, &req.question).await {
            Ok(handle) => handle,
            Err(outcome) => return outcome,
        };
        let request_id = handle.id();

        let history = if !continuing {
            String::new()
        } else {
            match self.gateway.conversation_turns(&conv_id, user_id).await {
                Ok(turns) => render_history(&turns),
                Err(e) => {
                    tracing::warn!(request_id, error = %e, "could not load conversation history");
                    String::new()
                }
            }
        };

        let retrieval = match self
            .retriever
            .retrieve(
                &req.question,
                &req.keyword,
                config.retrieval.result_count,
                config.retrieval.rerank_top_n,
            )
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(request_id, error = %e, "retrieval failed");
                handle.complete(Some(e.to_string())).await;
                return QueryOutcome::Failed {
                    code: e.code(),
                    message: e.user_message().to_string(),
                };
            }
        };
        tracing::info!(
            request_id,
            passages = retrieval.passages.len(),
            sources = retrieval.source_files.len(),
            "context retrieved"
        );

        let prompt = build_system_prompt(
            &config.prompts.system,
            &retrieval.context,
            &req.question,
            &req.keyword,
            &history,
        );
        let messages = vec![
            ChatMessage::system(prompt.clone()),
            ChatMessage::user(req.question.clone()),
        ];

        QueryOutcome::Streaming(self.coordinator.start(GenerationJob {
            handle,
            conv_id,
            question: req.question,
            prompt,
            messages,
            options: config.generation.options.clone(),
            think: req.think && config.generation.think_enabled,
            idle_timeout: idle_timeout(&config),
            sources: retrieval.source_files,
            answer_prefix: config.prompts.answer_prefix.clone(),
            citation_label: config.prompts.citation_label.clone(),
            persist_turn: true,
        }))
    }

    /// Explain the key terms of a text. No retrieval, citations or history.
    pub async fn analyze(&self, user_id: &str, req: QueryRequest) -> QueryOutcome {
        let config = self.config.snapshot().await;
        let (conv_id, _) = self.owned_conversation(user_id, &req.conv_id).await;

        let handle = match self.admit(user_id, &conv_id, &req.question).await {
            Ok(handle) => handle,
            Err(outcome) => return outcome,
        };

        let prompt = config.prompts.analysis.replace("{question}", &req.question);
        QueryOutcome::Streaming(self.coordinator.start(GenerationJob {
            handle,
            conv_id,
            question: req.question,
            messages: vec![ChatMessage::user(prompt.clone())],
            prompt,
            options: config.generation.options.clone(),
            think: false,
            idle_timeout: idle_timeout(&config),
            sources: Vec::new(),
            answer_prefix: String::new(),
            citation_label: String::new(),
            persist_turn: false,
        }))
    }

    /// Resolve the conversation a question belongs to, and whether it
    /// continues an existing one. A conversation id that already holds
    /// another user's turns is replaced with a fresh one.
    async fn owned_conversation(&self, user_id: &str, requested: &str) -> (String, bool) {
        if requested.is_empty() {
            return (new_conversation_id(), false);
        }
        match self.gateway.conversation_owned_by_other(requested, user_id).await {
            Ok(false) => (requested.to_string(), true),
            Ok(true) => {
                tracing::warn!(
                    user_id,
                    conv_id = requested,
                    "conversation belongs to another user, starting a new one"
                );
                (new_conversation_id(), false)
            }
            Err(e) => {
                tracing::warn!(user_id, error = %e, "could not check conversation owner");
                (new_conversation_id(), false)
            }
        }
    }
}

fn new_conversation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn idle_timeout(config: &Config) -> Duration {
    Duration::from_secs(config.generation.idle_timeout_secs)
}
