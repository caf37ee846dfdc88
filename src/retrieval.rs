//! Two-stage retrieval: vector recall, then cross-encoder reranking.
//!
//! Stage 1 embeds the question plus keywords and takes the `result_count`
//! nearest chunks. Stage 2 scores each candidate against the bare question
//! and keeps the `rerank_top_n` best, ties resolved by recall order.

use serde::Serialize;
use std::sync::Arc;

use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::models::Chunk;
use crate::rerank::RelevanceScorer;
use crate::store::IndexStore;

#[derive(Debug, Clone, Serialize)]
pub struct RankedPassage {
    pub chunk: Chunk,
    /// Position in the stage-1 candidate list.
    pub recall_rank: usize,
    pub distance: f32,
    pub score: f32,
}

/// Ephemeral result of one retrieval.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    /// Reranked passages, best first.
    pub passages: Vec<RankedPassage>,
    /// Passage contents concatenated in rank order.
    pub context: String,
    /// Distinct source files, in rank order of first appearance.
    pub source_files: Vec<String>,
    /// Distinct non-empty markdown artifacts, in rank order of first appearance.
    pub markdown_files: Vec<String>,
}

pub struct Retriever {
    store: Arc<IndexStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    scorer: Arc<dyn RelevanceScorer>,
}

/// The text embedded for recall: `question + " " + keyword`, or whichever
/// of the two is present.
pub fn recall_query(question: &str, keyword: &str) -> String {
    match (question.trim().is_empty(), keyword.trim().is_empty()) {
        (false, false) => format!("{} {}", question, keyword),
        (false, true) => question.to_string(),
        (true, _) => keyword.to_string(),
    }
}

impl Retriever {
    pub fn new(
        store: Arc<IndexStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        scorer: Arc<dyn RelevanceScorer>,
    ) -> Self {
        Self {
            store,
            embedder,
            scorer,
        }
    }

    pub async fn retrieve(
        &self,
        question: &str,
        keyword: &str,
        result_count: usize,
        rerank_top_n: usize,
    ) -> Result<RetrievalResult> {
        if result_count == 0 || rerank_top_n == 0 {
            return Err(RagError::InvalidArgument(
                "result_count and rerank_top_n must be >= 1".to_string(),
            ));
        }
        if self.store.is_empty().await {
            return Err(RagError::IndexNotReady);
        }

        let query = recall_query(question, keyword);
        if query.trim().is_empty() {
            return Err(RagError::InvalidArgument(
                "a question or keyword is required".to_string(),
            ));
        }

        // Stage 1: recall
        let vector = self
            .embedder
            .embed(&query)
            .await
            .map_err(RagError::embedding)?;
        let hits = match self.store.search(&vector, result_count).await {
            Ok(hits) => hits,
            // Cleared between the emptiness check and the search.
            Err(RagError::EmptyIndex) => return Err(RagError::IndexNotReady),
            Err(e) => return Err(e),
        };
        if hits.is_empty() {
            return Err(RagError::NoCandidates);
        }
        tracing::debug!(candidates = hits.len(), "recall stage complete");

        // Stage 2: precision
        let passages: Vec<String> = hits.iter().map(|h| h.chunk.content.clone()).collect();
        let scores = self
            .scorer
            .score_batch(question, &passages)
            .await
            .map_err(RagError::scoring)?;
        if scores.len() != hits.len() {
            return Err(RagError::scoring(anyhow::anyhow!(
                "scorer returned {} scores for {} passages",
                scores.len(),
                hits.len()
            )));
        }

        let mut ranked: Vec<RankedPassage> = hits
            .into_iter()
            .zip(scores)
            .enumerate()
            .map(|(recall_rank, (hit, score))| RankedPassage {
                chunk: hit.chunk,
                recall_rank,
                distance: hit.distance,
                score,
            })
            .collect();
        // sort_by is stable, so equal scores keep recall order.
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked.truncate(rerank_top_n);

        Ok(assemble(ranked))
    }
}

fn assemble(passages: Vec<RankedPassage>) -> RetrievalResult {
    let mut context = String::new();
    let mut source_files: Vec<String> = Vec::new();
    let mut markdown_files: Vec<String> = Vec::new();

    for p in &passages {
        context.push_str(&p.chunk.content);
        if !source_files.contains(&p.chunk.source_file) {
            source_files.push(p.chunk.source_file.clone());
        }
        if !p.chunk.markdown_file.is_empty() && !markdown_files.contains(&p.chunk.markdown_file) {
            markdown_files.push(p.chunk.markdown_file.clone());
        }
    }

    RetrievalResult {
        passages,
        context,
        source_files,
        markdown_files,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Embeds a text as `[number parsed from the text, 0]`.
    struct PositionEmbedder;

    #[async_trait]
    impl EmbeddingProvider for PositionEmbedder {
        fn model_name(&self) -> &str {
            "position"
        }

        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let n: f32 = t
                        .split_whitespace()
                        .find_map(|w| w.parse().ok())
                        .unwrap_or(0.0);
                    vec![n, 0.0]
                })
                .collect())
        }
    }

    /// Returns fixed scores in candidate order.
    struct FixedScorer(Vec<f32>);

    #[async_trait]
    impl RelevanceScorer for FixedScorer {
        fn model_name(&self) -> &str {
            "fixed"
        }

        async fn score_batch(&self, _query: &str, passages: &[String]) -> anyhow::Result<Vec<f32>> {
            Ok(self.0.iter().copied().take(passages.len()).collect())
        }
    }

    fn chunk(content: &str, source: &str, markdown: &str) -> Chunk {
        Chunk {
            content: content.to_string(),
            source_file: source.to_string(),
            markdown_file: markdown.to_string(),
        }
    }

    async fn seeded_store(dir: &std::path::Path) -> Arc<IndexStore> {
        let store = Arc::new(IndexStore::open(dir, None).unwrap());
        store
            .append(
                vec![
                    chunk("chunk 1 ", "a.pdf", "a.md"),
                    chunk("chunk 2 ", "b.md", "b.md"),
                    chunk("chunk 3 ", "a.pdf", "a.md"),
                    chunk("chunk 50 ", "far.pdf", ""),
                ],
                vec![
                    vec![1.0, 0.0],
                    vec![2.0, 0.0],
                    vec![3.0, 0.0],
                    vec![50.0, 0.0],
                ],
            )
            .await
            .unwrap();
        store
    }

    #[test]
    fn test_recall_query() {
        assert_eq!(recall_query("what", "kw"), "what kw");
        assert_eq!(recall_query("what", ""), "what");
        assert_eq!(recall_query("", "kw"), "kw");
    }

    #[tokio::test]
    async fn test_ties_keep_recall_order() {
        let tmp = TempDir::new().unwrap();
        let store = seeded_store(tmp.path()).await;
        let retriever = Retriever::new(
            store,
            Arc::new(PositionEmbedder),
            Arc::new(FixedScorer(vec![0.9, 0.9, 0.3])),
        );

        // Query "1" recalls chunk 1, 2, 3 in that order.
        let result = retriever.retrieve("1", "", 3, 2).await.unwrap();
        let contents: Vec<&str> = result
            .passages
            .iter()
            .map(|p| p.chunk.content.as_str())
            .collect();
        assert_eq!(contents, vec!["chunk 1 ", "chunk 2 "]);
        assert_eq!(result.context, "chunk 1 chunk 2 ");
        assert_eq!(result.source_files, vec!["a.pdf", "b.md"]);
        assert_eq!(result.markdown_files, vec!["a.md", "b.md"]);
    }

    #[tokio::test]
    async fn test_scorer_can_promote_later_candidates() {
        let tmp = TempDir::new().unwrap();
        let store = seeded_store(tmp.path()).await;
        let retriever = Retriever::new(
            store,
            Arc::new(PositionEmbedder),
            Arc::new(FixedScorer(vec![0.1, 0.2, 0.8])),
        );
        let result = retriever.retrieve("1", "", 3, 1).await.unwrap();
        assert_eq!(result.passages[0].chunk.content, "chunk 3 ");
        assert_eq!(result.passages[0].recall_rank, 2);
        assert_eq!(result.source_files, vec!["a.pdf"]);
    }

    #[tokio::test]
    async fn test_empty_store_is_not_ready() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(IndexStore::open(tmp.path(), None).unwrap());
        let retriever = Retriever::new(
            store,
            Arc::new(PositionEmbedder),
            Arc::new(FixedScorer(vec![])),
        );
        assert!(matches!(
            retriever.retrieve("anything", "", 3, 1).await,
            Err(RagError::IndexNotReady)
        ));
    }

    #[tokio::test]
    async fn test_short_score_list_is_a_scoring_failure() {
        let tmp = TempDir::new().unwrap();
        let store = seeded_store(tmp.path()).await;
        let retriever = Retriever::new(
            store,
            Arc::new(PositionEmbedder),
            Arc::new(FixedScorer(vec![0.5])),
        );
        assert!(matches!(
            retriever.retrieve("1", "", 3, 1).await,
            Err(RagError::ScoringFailure { .. })
        ));
    }
}
