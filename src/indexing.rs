//! Indexing engine: documents → chunks → vectors → store.
//!
//! Chunking and embedding finish before the store is touched, so an
//! embedding failure leaves the index exactly as it was. All chunks of a
//! call are embedded in one provider request.

use serde::Serialize;
use std::sync::Arc;

use crate::chunk::chunk_document;
use crate::config::ChunkingConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::models::{Chunk, SourceDocument};
use crate::store::IndexStore;

/// Per-document outcome, reported to the admin caller.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DocumentStatus {
    pub source_file: String,
    pub chunks: usize,
    pub status: DocumentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DocumentState {
    Indexed,
    /// No indexable text.
    Empty,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub chunks_added: usize,
    pub documents: Vec<DocumentStatus>,
}

impl IndexReport {
    /// Report for a batch that aborted with `err`: every document that had
    /// text is marked failed, since nothing was committed for any of them.
    pub fn failed(documents: &[SourceDocument], chunking: &ChunkingConfig, err: &RagError) -> Self {
        let documents = documents
            .iter()
            .map(|doc| {
                let chunks = chunk_document(doc, chunking.chunk_size, chunking.chunk_overlap).len();
                DocumentStatus {
                    source_file: doc.source_file.clone(),
                    chunks: 0,
                    status: if chunks == 0 {
                        DocumentState::Empty
                    } else {
                        DocumentState::Failed
                    },
                    error: (chunks > 0).then(|| err.to_string()),
                }
            })
            .collect();
        Self {
            chunks_added: 0,
            documents,
        }
    }
}

pub struct IndexingEngine {
    store: Arc<IndexStore>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl IndexingEngine {
    pub fn new(store: Arc<IndexStore>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { store, embedder }
    }

    /// Chunk, embed and append `documents`.
    ///
    /// Re-indexing a document appends its chunks again; nothing is
    /// deduplicated.
    pub async fn index(
        &self,
        documents: &[SourceDocument],
        chunking: &ChunkingConfig,
    ) -> Result<IndexReport> {
        let mut statuses = Vec::with_capacity(documents.len());
        let mut chunks: Vec<Chunk> = Vec::new();

        for doc in documents {
            let doc_chunks = chunk_document(doc, chunking.chunk_size, chunking.chunk_overlap);
            statuses.push(DocumentStatus {
                source_file: doc.source_file.clone(),
                chunks: doc_chunks.len(),
                status: if doc_chunks.is_empty() {
                    DocumentState::Empty
                } else {
                    DocumentState::Indexed
                },
                error: None,
            });
            chunks.extend(doc_chunks);
        }

        if chunks.is_empty() {
            tracing::info!(documents = documents.len(), "no indexable text; index unchanged");
            return Ok(IndexReport {
                chunks_added: 0,
                documents: statuses,
            });
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self
            .embedder
            .embed_batch(&texts)
            .await
            .map_err(RagError::embedding)?;

        if vectors.len() != chunks.len() {
            return Err(RagError::embedding(anyhow::anyhow!(
                "provider returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }
        if let Some(expected) = self.embedder.dims() {
            if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
                return Err(RagError::DimensionMismatch {
                    expected,
                    actual: bad.len(),
                });
            }
        }

        let chunks_added = self.store.append(chunks, vectors).await?;
        tracing::info!(
            documents = documents.len(),
            chunks_added,
            model = self.embedder.model_name(),
            "documents indexed"
        );

        Ok(IndexReport {
            chunks_added,
            documents: statuses,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Maps text to `[len, vowels]`, or fails on demand.
    struct FakeEmbedder {
        dim: usize,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeEmbedder {
        fn new(dim: usize) -> Self {
            Self {
                dim,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FakeEmbedder {
        fn model_name(&self) -> &str {
            "fake"
        }

        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("embedding backend offline");
            }
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0; self.dim];
                    v[0] = t.chars().count() as f32;
                    if self.dim > 1 {
                        v[1] = t.chars().filter(|c| "aeiou".contains(*c)).count() as f32;
                    }
                    v
                })
                .collect())
        }
    }

    fn doc(name: &str, content: &str) -> SourceDocument {
        SourceDocument {
            content: content.to_string(),
            source_file: name.to_string(),
            markdown_file: String::new(),
        }
    }

    fn small_chunks() -> ChunkingConfig {
        ChunkingConfig {
            chunk_size: 40,
            chunk_overlap: 5,
        }
    }

    #[tokio::test]
    async fn test_index_batches_all_chunks_in_one_call() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(IndexStore::open(tmp.path(), None).unwrap());
        let embedder = Arc::new(FakeEmbedder::new(2));
        let engine = IndexingEngine::new(store.clone(), embedder.clone());

        let docs = vec![
            doc("a.txt", &"alpha beta gamma delta ".repeat(6)),
            doc("b.txt", "short one"),
            doc("blank.txt", "   "),
        ];
        let report = engine.index(&docs, &small_chunks()).await.unwrap();

        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.chunks_added, store.len().await);
        assert_eq!(report.documents[1].chunks, 1);
        assert_eq!(report.documents[2].status, DocumentState::Empty);
        assert!(store.validate().await.is_ok());
    }

    #[tokio::test]
    async fn test_embedding_failure_leaves_store_untouched() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(IndexStore::open(tmp.path(), None).unwrap());
        let good = IndexingEngine::new(store.clone(), Arc::new(FakeEmbedder::new(2)));
        good.index(&[doc("a.txt", "first document")], &small_chunks())
            .await
            .unwrap();

        let mut broken = FakeEmbedder::new(2);
        broken.fail = true;
        let engine = IndexingEngine::new(store.clone(), Arc::new(broken));
        let docs = vec![doc("b.txt", "second document")];
        let err = engine.index(&docs, &small_chunks()).await.unwrap_err();
        assert!(matches!(err, RagError::EmbeddingFailure { .. }));
        assert_eq!(store.len().await, 1);

        let report = IndexReport::failed(&docs, &small_chunks(), &err);
        assert_eq!(report.documents[0].status, DocumentState::Failed);
        assert!(report.documents[0].error.as_deref().unwrap().contains("offline"));
    }

    #[tokio::test]
    async fn test_dimension_change_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(IndexStore::open(tmp.path(), None).unwrap());
        IndexingEngine::new(store.clone(), Arc::new(FakeEmbedder::new(2)))
            .index(&[doc("a.txt", "first")], &small_chunks())
            .await
            .unwrap();

        let err = IndexingEngine::new(store.clone(), Arc::new(FakeEmbedder::new(3)))
            .index(&[doc("b.txt", "second")], &small_chunks())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RagError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_reindexing_appends_duplicates() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(IndexStore::open(tmp.path(), None).unwrap());
        let engine = IndexingEngine::new(store.clone(), Arc::new(FakeEmbedder::new(2)));
        let docs = vec![doc("a.txt", "same content")];
        engine.index(&docs, &small_chunks()).await.unwrap();
        engine.index(&docs, &small_chunks()).await.unwrap();
        assert_eq!(store.len().await, 2);
    }
}
