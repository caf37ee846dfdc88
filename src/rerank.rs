//! Relevance scorers for the precision stage of retrieval.
//!
//! A scorer rates `(query, passage)` pairs; higher means more relevant.
//! Scores are only compared within one call, so their scale is up to the
//! model.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::RerankerConfig;

#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    fn model_name(&self) -> &str;

    /// Score every passage against `query`; one score per passage, in order.
    async fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f32>>;
}

/// Gives every passage the same score, so reranking keeps recall order.
pub struct NoopScorer;

#[async_trait]
impl RelevanceScorer for NoopScorer {
    fn model_name(&self) -> &str {
        "none"
    }

    async fn score_batch(&self, _query: &str, passages: &[String]) -> Result<Vec<f32>> {
        Ok(vec![0.0; passages.len()])
    }
}

/// Scorer backed by a text-embeddings-inference style `POST /rerank`.
///
/// Request: `{"query": ..., "texts": [...], "truncate": true}`.
/// Response: `[{"index": i, "score": s}, ...]` in any order.
pub struct HttpScorer {
    url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct RerankItem {
    index: usize,
    score: f32,
}

impl HttpScorer {
    pub fn new(config: &RerankerConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("reranker.url required for http reranker"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            url,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "remote".to_string()),
            client,
        })
    }
}

#[async_trait]
impl RelevanceScorer for HttpScorer {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "query": query,
            "texts": passages,
            "truncate": true,
        });
        let response = self
            .client
            .post(format!("{}/rerank", self.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Reranker API error {}: {}", status, text);
        }
        let items: Vec<RerankItem> = response.json().await?;
        scores_by_index(items, passages.len())
    }
}

/// Put `(index, score)` pairs back into passage order.
fn scores_by_index(items: Vec<RerankItem>, len: usize) -> Result<Vec<f32>> {
    let mut scores: Vec<Option<f32>> = vec![None; len];
    for item in items {
        let slot = scores
            .get_mut(item.index)
            .ok_or_else(|| anyhow::anyhow!("reranker returned out-of-range index {}", item.index))?;
        *slot = Some(item.score);
    }
    scores
        .into_iter()
        .enumerate()
        .map(|(i, s)| s.ok_or_else(|| anyhow::anyhow!("reranker returned no score for passage {}", i)))
        .collect()
}

/// In-process cross-encoder via fastembed (BGE reranker v2 m3 by default).
#[cfg(feature = "local-embeddings")]
pub struct LocalScorer {
    model_name: String,
    model: std::sync::Arc<std::sync::Mutex<Option<fastembed::TextRerank>>>,
}

#[cfg(feature = "local-embeddings")]
impl LocalScorer {
    pub fn new(config: &RerankerConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "bge-reranker-v2-m3".to_string());
        config_to_rerank_model(&model_name)?;
        Ok(Self {
            model_name,
            model: Default::default(),
        })
    }
}

#[cfg(feature = "local-embeddings")]
fn config_to_rerank_model(name: &str) -> Result<fastembed::RerankerModel> {
    match name {
        "bge-reranker-base" => Ok(fastembed::RerankerModel::BGERerankerBase),
        "bge-reranker-v2-m3" => Ok(fastembed::RerankerModel::BGERerankerV2M3),
        "jina-reranker-v2-base-multilingual" => {
            Ok(fastembed::RerankerModel::JINARerankerV2BaseMultiligual)
        }
        other => bail!(
            "Unknown local reranker model: '{}'. Supported models: \
             bge-reranker-base, bge-reranker-v2-m3, jina-reranker-v2-base-multilingual",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl RelevanceScorer for LocalScorer {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn score_batch(&self, query: &str, passages: &[String]) -> Result<Vec<f32>> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }
        let rerank_model = config_to_rerank_model(&self.model_name)?;
        let query = query.to_string();
        let passages = passages.to_vec();
        let slot = self.model.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<f32>> {
            let mut guard = slot
                .lock()
                .map_err(|_| anyhow::anyhow!("local reranker lock poisoned"))?;
            if guard.is_none() {
                let model = fastembed::TextRerank::try_new(
                    fastembed::RerankInitOptions::new(rerank_model)
                        .with_show_download_progress(true),
                )
                .map_err(|e| anyhow::anyhow!("Failed to initialize local reranker: {}", e))?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("local reranker missing"))?;
            let docs: Vec<&str> = passages.iter().map(String::as_str).collect();
            let results = model
                .rerank(query.as_str(), docs, false, None)
                .map_err(|e| anyhow::anyhow!("Local reranking failed: {}", e))?;
            let mut scores = vec![0.0f32; passages.len()];
            for r in results {
                if let Some(slot) = scores.get_mut(r.index) {
                    *slot = r.score;
                }
            }
            Ok(scores)
        })
        .await?
    }
}

/// Create the configured [`RelevanceScorer`].
///
/// | Config Value | Scorer |
/// |-------------|--------|
/// | `"none"` | [`NoopScorer`] |
/// | `"http"` | [`HttpScorer`] |
/// | `"local"` | `LocalScorer` (feature `local-embeddings`) |
pub fn create_scorer(config: &RerankerConfig) -> Result<Box<dyn RelevanceScorer>> {
    match config.provider.as_str() {
        "none" => Ok(Box::new(NoopScorer)),
        "http" => Ok(Box::new(HttpScorer::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Box::new(LocalScorer::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!("Local reranker requires --features local-embeddings"),
        other => bail!("Unknown reranker provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_scores_are_equal() {
        let scores = NoopScorer
            .score_batch("q", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(scores, vec![0.0, 0.0]);
    }

    #[test]
    fn test_scores_by_index_restores_order() {
        let items = vec![
            RerankItem { index: 2, score: 0.1 },
            RerankItem { index: 0, score: 0.9 },
            RerankItem { index: 1, score: 0.5 },
        ];
        assert_eq!(scores_by_index(items, 3).unwrap(), vec![0.9, 0.5, 0.1]);
    }

    #[test]
    fn test_scores_by_index_rejects_gaps() {
        let items = vec![RerankItem { index: 0, score: 0.9 }];
        assert!(scores_by_index(items, 2).is_err());
        let items = vec![RerankItem { index: 5, score: 0.9 }];
        assert!(scores_by_index(items, 2).is_err());
    }
}
