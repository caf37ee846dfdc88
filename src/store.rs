//! The chunk store and vector index, managed as one unit.
//!
//! [`IndexStore`] owns both structures behind a single `RwLock`. Searches
//! take the read side and run concurrently; appends and clears take the
//! write side for the whole in-memory mutation *and* the following disk
//! write, so a reader never observes one side updated without the other.
//!
//! Artifacts live side by side in the data directory:
//!
//! | File | Contents |
//! |------|----------|
//! | `index.bin` | vectors, see [`crate::vector_index`] |
//! | `chunks.json` | chunk records, positionally parallel to the vectors |
//!
//! The index is written first, then the chunks. A crash between the two
//! writes leaves a count mismatch that [`IndexStore::validate`] reports and
//! [`IndexStore::search`] refuses to serve.

use anyhow::Context;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::error::{RagError, Result};
use crate::models::{Chunk, ChunkHit};
use crate::vector_index::VectorIndex;

const INDEX_FILE: &str = "index.bin";
const CHUNKS_FILE: &str = "chunks.json";

#[derive(Default)]
struct IndexState {
    /// Created lazily by the first append, sized to its embedding dimension.
    index: Option<VectorIndex>,
    chunks: Vec<Chunk>,
}

impl IndexState {
    fn vector_count(&self) -> usize {
        self.index.as_ref().map(|i| i.count()).unwrap_or(0)
    }

    fn check_consistent(&self) -> Result<()> {
        let vectors = self.vector_count();
        if vectors != self.chunks.len() {
            return Err(RagError::IndexInconsistent {
                vectors,
                chunks: self.chunks.len(),
            });
        }
        Ok(())
    }
}

/// Outcome of [`IndexStore::validate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Validation {
    Ok { vectors: usize },
    Invalid { reason: String },
}

impl Validation {
    pub fn is_ok(&self) -> bool {
        matches!(self, Validation::Ok { .. })
    }
}

/// A peek at the stored chunks for operators.
#[derive(Debug, Clone, Serialize)]
pub struct IndexSummary {
    pub count: usize,
    pub chunks: Vec<String>,
    pub index_exists: bool,
}

pub struct IndexStore {
    data_dir: PathBuf,
    markdown_dir: Option<PathBuf>,
    state: RwLock<IndexState>,
}

impl IndexStore {
    /// Open the store, loading persisted artifacts if present.
    ///
    /// An index without its chunk metadata (or the reverse) is not accepted:
    /// the store starts empty and a warning is logged. A corrupt index file is
    /// an error.
    pub fn open(data_dir: &Path, markdown_dir: Option<&Path>) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir).with_context(|| {
            format!("Failed to create data directory: {}", data_dir.display())
        })?;

        let store = Self {
            data_dir: data_dir.to_path_buf(),
            markdown_dir: markdown_dir.map(Path::to_path_buf),
            state: RwLock::new(IndexState::default()),
        };

        let index_path = store.index_path();
        let chunks_path = store.chunks_path();
        let state = match (index_path.exists(), chunks_path.exists()) {
            (false, false) => IndexState::default(),
            (true, false) => {
                tracing::warn!(
                    path = %index_path.display(),
                    "index file has no chunk metadata; starting with an empty index"
                );
                IndexState::default()
            }
            (false, true) => {
                tracing::warn!(
                    path = %chunks_path.display(),
                    "chunk metadata has no index file; starting with an empty index"
                );
                IndexState::default()
            }
            (true, true) => {
                let index = VectorIndex::read_from(&index_path)?;
                let raw = std::fs::read_to_string(&chunks_path).with_context(|| {
                    format!("Failed to read chunk metadata: {}", chunks_path.display())
                })?;
                let chunks: Vec<Chunk> = serde_json::from_str(&raw).with_context(|| {
                    format!("Failed to parse chunk metadata: {}", chunks_path.display())
                })?;
                let state = IndexState {
                    index: Some(index),
                    chunks,
                };
                match state.check_consistent() {
                    Ok(()) => tracing::info!(chunks = state.chunks.len(), "loaded index"),
                    Err(e) => tracing::error!(error = %e, "loaded an inconsistent index; queries will be refused until it is rebuilt"),
                }
                state
            }
        };

        Ok(Self {
            state: RwLock::new(state),
            ..store
        })
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(INDEX_FILE)
    }

    pub fn chunks_path(&self) -> PathBuf {
        self.data_dir.join(CHUNKS_FILE)
    }

    /// Number of chunks in the chunk store.
    pub async fn len(&self) -> usize {
        self.state.read().await.chunks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Dimension the index was created with, if any vector was ever added.
    pub async fn dim(&self) -> Option<usize> {
        self.state.read().await.index.as_ref().map(|i| i.dim())
    }

    /// Return the `k` chunks nearest to `vector`, nearest first.
    pub async fn search(&self, vector: &[f32], k: usize) -> Result<Vec<ChunkHit>> {
        if k == 0 {
            return Err(RagError::InvalidArgument("k must be >= 1".to_string()));
        }
        let state = self.state.read().await;
        let index = match state.index.as_ref() {
            Some(index) if !state.chunks.is_empty() => index,
            _ => return Err(RagError::EmptyIndex),
        };
        state.check_consistent()?;

        let hits = index
            .search(vector, k)?
            .into_iter()
            .map(|(position, distance)| ChunkHit {
                position,
                distance,
                chunk: state.chunks[position].clone(),
            })
            .collect();
        Ok(hits)
    }

    /// Append chunks and their vectors, then persist both artifacts.
    ///
    /// Every vector is checked against the index dimension before anything
    /// changes. A persistence failure after the in-memory append is returned
    /// as [`RagError::Persistence`] with `partial = true`.
    pub async fn append(&self, chunks: Vec<Chunk>, vectors: Vec<Vec<f32>>) -> Result<usize> {
        if chunks.len() != vectors.len() {
            return Err(RagError::InvalidArgument(format!(
                "{} chunks but {} vectors",
                chunks.len(),
                vectors.len()
            )));
        }
        if chunks.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.write().await;
        state.check_consistent()?;

        let dim = match state.index.as_ref() {
            Some(index) => index.dim(),
            None => vectors[0].len(),
        };
        if dim == 0 {
            return Err(RagError::InvalidArgument(
                "embedding provider returned an empty vector".to_string(),
            ));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
            return Err(RagError::DimensionMismatch {
                expected: dim,
                actual: bad.len(),
            });
        }

        let added = chunks.len();
        state
            .index
            .get_or_insert_with(|| VectorIndex::new(dim))
            .add(&vectors)?;
        state.chunks.extend(chunks);

        if let Err(source) = self.persist(&state).await {
            tracing::error!(
                partial = true,
                error = %source,
                "index updated in memory but could not be written to disk"
            );
            return Err(RagError::Persistence {
                partial: true,
                source,
            });
        }

        tracing::info!(added, total = state.chunks.len(), "index persisted");
        Ok(added)
    }

    async fn persist(&self, state: &IndexState) -> anyhow::Result<()> {
        let index = state
            .index
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no index to persist"))?;
        tokio::fs::create_dir_all(&self.data_dir).await?;
        write_atomic(&self.index_path(), &index.to_bytes()).await?;
        let json = serde_json::to_vec(&state.chunks)?;
        write_atomic(&self.chunks_path(), &json).await?;
        Ok(())
    }

    /// Drop both stores and every derived markdown artifact.
    ///
    /// Disk artifacts go first; the in-memory state is reset only once they
    /// are gone. Clearing an already-empty store is a no-op.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.write().await;

        let removal = async {
            remove_if_exists(&self.index_path()).await?;
            remove_if_exists(&self.chunks_path()).await?;
            if let Some(dir) = &self.markdown_dir {
                empty_dir(dir).await?;
            }
            anyhow::Ok(())
        };
        if let Err(source) = removal.await {
            tracing::error!(partial = false, error = %source, "failed to clear index artifacts");
            return Err(RagError::Persistence {
                partial: false,
                source,
            });
        }

        *state = IndexState::default();
        tracing::info!("index cleared");
        Ok(())
    }

    /// Check that the vector count matches the chunk count.
    pub async fn validate(&self) -> Validation {
        let state = self.state.read().await;
        let vectors = state.vector_count();
        let chunks = state.chunks.len();
        if vectors == chunks {
            Validation::Ok { vectors }
        } else {
            Validation::Invalid {
                reason: format!(
                    "index holds {} vectors but chunk store holds {} chunks",
                    vectors, chunks
                ),
            }
        }
    }

    /// Count plus the contents of the first `limit` chunks (all if `None`).
    pub async fn summary(&self, limit: Option<usize>) -> IndexSummary {
        let state = self.state.read().await;
        let take = limit.unwrap_or(state.chunks.len());
        IndexSummary {
            count: state.chunks.len(),
            chunks: state
                .chunks
                .iter()
                .take(take)
                .map(|c| c.content.clone())
                .collect(),
            index_exists: self.index_path().exists(),
        }
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

async fn empty_dir(dir: &Path) -> anyhow::Result<()> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chunk(content: &str) -> Chunk {
        Chunk {
            content: content.to_string(),
            source_file: "doc.pdf".to_string(),
            markdown_file: "doc.md".to_string(),
        }
    }

    async fn seeded(dir: &Path) -> IndexStore {
        let store = IndexStore::open(dir, None).unwrap();
        store
            .append(
                vec![chunk("alpha"), chunk("beta"), chunk("gamma")],
                vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![0.0, 3.0]],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_search_maps_rows_to_chunks() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(tmp.path()).await;
        let hits = store.search(&[0.9, 0.0], 2).await.unwrap();
        assert_eq!(hits[0].chunk.content, "beta");
        assert_eq!(hits[0].position, 1);
        assert_eq!(hits[1].chunk.content, "alpha");
    }

    #[tokio::test]
    async fn test_empty_store_rejects_search() {
        let tmp = TempDir::new().unwrap();
        let store = IndexStore::open(tmp.path(), None).unwrap();
        assert!(matches!(
            store.search(&[0.0], 1).await,
            Err(RagError::EmptyIndex)
        ));
        assert_eq!(store.validate().await, Validation::Ok { vectors: 0 });
    }

    #[tokio::test]
    async fn test_dimension_fixed_at_first_insert() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(tmp.path()).await;
        let err = store
            .append(vec![chunk("delta")], vec![vec![1.0, 2.0, 3.0]])
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { expected: 2, actual: 3 }));
        assert_eq!(store.len().await, 3);
        assert!(store.validate().await.is_ok());
    }

    #[tokio::test]
    async fn test_reload_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let query = [0.1, 2.5];
        let before = {
            let store = seeded(tmp.path()).await;
            store.search(&query, 3).await.unwrap()
        };

        let reopened = IndexStore::open(tmp.path(), None).unwrap();
        let after = reopened.search(&query, 3).await.unwrap();
        assert_eq!(reopened.len().await, 3);
        let rows = |hits: &[ChunkHit]| hits.iter().map(|h| h.position).collect::<Vec<_>>();
        assert_eq!(rows(&before[..]), rows(&after[..]));
        assert_eq!(after[0].chunk.content, "gamma");
    }

    #[tokio::test]
    async fn test_missing_metadata_means_empty() {
        let tmp = TempDir::new().unwrap();
        {
            seeded(tmp.path()).await;
        }
        std::fs::remove_file(tmp.path().join(CHUNKS_FILE)).unwrap();
        let store = IndexStore::open(tmp.path(), None).unwrap();
        assert!(store.is_empty().await);
        assert!(matches!(
            store.search(&[0.0, 0.0], 1).await,
            Err(RagError::EmptyIndex)
        ));
    }

    #[tokio::test]
    async fn test_torn_write_is_detected_not_repaired() {
        let tmp = TempDir::new().unwrap();
        {
            seeded(tmp.path()).await;
        }
        // Simulate a crash after the index write: metadata lags by one chunk.
        let stale = serde_json::to_string(&vec![chunk("alpha"), chunk("beta")]).unwrap();
        std::fs::write(tmp.path().join(CHUNKS_FILE), stale).unwrap();

        let store = IndexStore::open(tmp.path(), None).unwrap();
        let validation = store.validate().await;
        assert!(!validation.is_ok());
        assert!(matches!(
            store.search(&[0.0, 0.0], 1).await,
            Err(RagError::IndexInconsistent { vectors: 3, chunks: 2 })
        ));
        assert!(matches!(
            store.append(vec![chunk("x")], vec![vec![0.0, 0.0]]).await,
            Err(RagError::IndexInconsistent { .. })
        ));
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let md_dir = tmp.path().join("markdown");
        std::fs::create_dir_all(md_dir.join("nested")).unwrap();
        std::fs::write(md_dir.join("doc.md"), "# Doc").unwrap();
        std::fs::write(md_dir.join("nested").join("more.md"), "# More").unwrap();

        let store = IndexStore::open(tmp.path(), Some(&md_dir)).unwrap();
        store
            .append(vec![chunk("alpha")], vec![vec![1.0]])
            .await
            .unwrap();

        store.clear().await.unwrap();
        assert!(store.is_empty().await);
        assert!(!store.index_path().exists());
        assert!(!store.chunks_path().exists());
        assert_eq!(std::fs::read_dir(&md_dir).unwrap().count(), 0);

        store.clear().await.unwrap();
        assert!(store.is_empty().await);
        assert_eq!(store.validate().await, Validation::Ok { vectors: 0 });
        assert_eq!(store.dim().await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_see_a_torn_append() {
        const BATCHES: usize = 40;
        const BATCH: usize = 5;
        let tmp = TempDir::new().unwrap();
        let store = std::sync::Arc::new(IndexStore::open(tmp.path(), None).unwrap());
        store
            .append(vec![chunk("chunk 0")], vec![vec![0.0, 0.0]])
            .await
            .unwrap();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for batch in 0..BATCHES {
                    let first = 1 + batch * BATCH;
                    let chunks = (first..first + BATCH)
                        .map(|i| chunk(&format!("chunk {}", i)))
                        .collect();
                    let vectors = (first..first + BATCH).map(|i| vec![i as f32, 0.0]).collect();
                    store.append(chunks, vectors).await.unwrap();
                }
            })
        };

        let mut readers = Vec::new();
        for r in 0..3 {
            let store = store.clone();
            readers.push(tokio::spawn(async move {
                for round in 0..100 {
                    let target = ((r * 37 + round) % (BATCHES * BATCH)) as f32;
                    let hits = store.search(&[target, 0.0], 50).await.unwrap();
                    assert!(!hits.is_empty());
                    let total = store.len().await;
                    let mut seen = std::collections::HashSet::new();
                    for hit in &hits {
                        assert!(hit.position < total, "{} >= {}", hit.position, total);
                        assert_eq!(hit.chunk.content, format!("chunk {}", hit.position));
                        assert!(seen.insert(hit.position));
                    }
                    assert!(store.validate().await.is_ok());
                    tokio::task::yield_now().await;
                }
            }));
        }

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(store.len().await, 1 + BATCHES * BATCH);
        assert_eq!(
            store.validate().await,
            Validation::Ok {
                vectors: 1 + BATCHES * BATCH
            }
        );
    }

    #[tokio::test]
    async fn test_summary_limits_contents() {
        let tmp = TempDir::new().unwrap();
        let store = seeded(tmp.path()).await;
        let summary = store.summary(Some(2)).await;
        assert_eq!(summary.count, 3);
        assert_eq!(summary.chunks, vec!["alpha", "beta"]);
        assert!(summary.index_exists);
    }
}
