//! Fakes and fixtures shared by the integration tests.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use askdocs::config::{parse_config, GenerationOptions, SharedConfig};
use askdocs::coordinator::{StreamEvent, StreamingCoordinator};
use askdocs::embedding::EmbeddingProvider;
use askdocs::gateway::{InMemoryGateway, PersistenceGateway};
use askdocs::generation::{ChatMessage, GenerationProvider, TokenEvent, TokenStream};
use askdocs::indexing::IndexingEngine;
use askdocs::models::{RequestRecord, RequestStatus, SourceDocument};
use askdocs::pipeline::{QueryOutcome, QueryService};
use askdocs::rerank::RelevanceScorer;
use askdocs::retrieval::Retriever;
use askdocs::server::AppState;
use askdocs::store::IndexStore;

/// Three-dimensional vectors keyed on two topic words.
pub struct TopicEmbedder;

#[async_trait]
impl EmbeddingProvider for TopicEmbedder {
    fn model_name(&self) -> &str {
        "topic"
    }

    fn dims(&self) -> Option<usize> {
        Some(3)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let t = t.to_lowercase();
                vec![
                    if t.contains("vacation") { 1.0 } else { 0.0 },
                    if t.contains("expense") { 1.0 } else { 0.0 },
                    0.1,
                ]
            })
            .collect())
    }
}

/// Scores a passage by how many of the query's longer words it contains.
pub struct OverlapScorer;

#[async_trait]
impl RelevanceScorer for OverlapScorer {
    fn model_name(&self) -> &str {
        "overlap"
    }

    async fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        let words: Vec<String> = query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 3)
            .map(str::to_lowercase)
            .collect();
        Ok(passages
            .iter()
            .map(|p| {
                let p = p.to_lowercase();
                words.iter().filter(|w| p.contains(w.as_str())).count() as f32
            })
            .collect())
    }
}

/// What the fake generator does on every call.
#[derive(Clone)]
pub enum Script {
    /// Emit the tokens, then end.
    Tokens(Vec<&'static str>),
    /// Emit the tokens, then fail with the message.
    FailAfter(Vec<&'static str>, &'static str),
    /// Emit the tokens, then never produce another event.
    Hang(Vec<&'static str>),
}

pub struct ScriptedGenerator {
    script: Script,
    calls: Mutex<Vec<(Vec<ChatMessage>, bool)>>,
}

impl ScriptedGenerator {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Messages and think flag of every call so far.
    pub fn calls(&self) -> Vec<(Vec<ChatMessage>, bool)> {
        self.calls.lock().unwrap().clone()
    }
}

fn tokens(words: &[&'static str]) -> Vec<Result<TokenEvent>> {
    words
        .iter()
        .map(|w| {
            Ok(TokenEvent {
                content: w.to_string(),
                thinking: None,
            })
        })
        .collect()
}

#[async_trait]
impl GenerationProvider for ScriptedGenerator {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        _options: &GenerationOptions,
        think: bool,
    ) -> Result<TokenStream> {
        self.calls.lock().unwrap().push((messages, think));
        let stream: TokenStream = match &self.script {
            Script::Tokens(words) => Box::pin(futures::stream::iter(tokens(words))),
            Script::FailAfter(words, message) => {
                let mut items = tokens(words);
                items.push(Err(anyhow::anyhow!(*message)));
                Box::pin(futures::stream::iter(items))
            }
            Script::Hang(words) => Box::pin(
                futures::stream::iter(tokens(words)).chain(futures::stream::pending()),
            ),
        };
        Ok(stream)
    }
}

pub struct Harness {
    pub state: AppState,
    pub gateway: Arc<InMemoryGateway>,
    pub generator: Arc<ScriptedGenerator>,
    _tmp: TempDir,
}

pub struct HarnessOptions {
    pub script: Script,
    pub global_limit: u32,
    pub seed: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            script: Script::Tokens(vec!["You file ", "in the portal."]),
            global_limit: 4,
            seed: true,
        }
    }
}

pub const SYSTEM_TEMPLATE: &str = "CTX:{context}|Q:{question}|K:{keyword}|H:{history}";

pub fn seed_documents() -> Vec<SourceDocument> {
    vec![
        SourceDocument {
            content: "Vacation requests are filed in the HR portal.".to_string(),
            source_file: "vacation.md".to_string(),
            markdown_file: "vacation.md".to_string(),
        },
        SourceDocument {
            content: "Expense reports need receipts attached.".to_string(),
            source_file: "expense.pdf".to_string(),
            markdown_file: String::new(),
        },
    ]
}

pub async fn harness(opts: HarnessOptions) -> Harness {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().display().to_string();
    let config = parse_config(&format!(
        r#"
[db]
path = "{root}/askdocs.sqlite"

[store]
data_dir = "{root}/index"

[retrieval]
result_count = 3
rerank_top_n = 1

[admission]
per_user_limit = 1
global_limit = {global}

[generation]
think_enabled = true
idle_timeout_secs = 2

[prompts]
system = "{system}"
citation_label = "Sources: "

[server]
bind = "127.0.0.1:0"
"#,
        root = root,
        global = opts.global_limit,
        system = SYSTEM_TEMPLATE,
    ))
    .unwrap();
    let chunking = config.chunking.clone();
    let config = Arc::new(SharedConfig::fixed(config));

    let gateway = Arc::new(InMemoryGateway::new());
    let dyn_gateway: Arc<dyn PersistenceGateway> = gateway.clone();
    let store = Arc::new(IndexStore::open(&tmp.path().join("index"), None).unwrap());
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(TopicEmbedder);
    let generator = Arc::new(ScriptedGenerator::new(opts.script));

    let indexer = Arc::new(IndexingEngine::new(store.clone(), embedder.clone()));
    if opts.seed {
        indexer.index(&seed_documents(), &chunking).await.unwrap();
    }

    let retriever = Retriever::new(store.clone(), embedder, Arc::new(OverlapScorer));
    let coordinator = StreamingCoordinator::new(generator.clone(), dyn_gateway.clone());
    let queries = Arc::new(QueryService::new(
        config.clone(),
        dyn_gateway.clone(),
        retriever,
        coordinator,
    ));

    Harness {
        state: AppState {
            config,
            store,
            indexer,
            queries,
            gateway: dyn_gateway,
        },
        gateway,
        generator,
        _tmp: tmp,
    }
}

/// Drain a streaming outcome; panics on any other outcome.
pub async fn collect(outcome: QueryOutcome) -> Vec<StreamEvent> {
    match outcome {
        QueryOutcome::Streaming(events) => events.collect().await,
        QueryOutcome::Busy(reason) => panic!("expected a stream, got busy ({})", reason.as_str()),
        QueryOutcome::Failed { code, message } => {
            panic!("expected a stream, got failure {}: {}", code, message)
        }
    }
}

/// Poll until request `id` is completed.
pub async fn wait_completed(gateway: &InMemoryGateway, id: i64) -> RequestRecord {
    for _ in 0..100 {
        if let Some(record) = gateway.request(id).await.unwrap() {
            if record.status == RequestStatus::Completed {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("request {} never completed", id);
}
