//! Flat nearest-neighbor index over fixed-dimension vectors.
//!
//! Search is exact squared-L2 over every stored row. Row ids are insertion
//! positions, which is what keeps the index parallel to the chunk store.
//!
//! # On-disk format
//!
//! ```text
//! magic "ADIX" | version u32 | dim u32 | count u64 | count*dim f32
//! ```
//!
//! All integers and floats are little-endian.

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::error::RagError;

const MAGIC: &[u8; 4] = b"ADIX";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;

#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    dim: usize,
    data: Vec<f32>,
}

impl VectorIndex {
    /// Create an empty index for vectors of `dim` components.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            data: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of stored vectors.
    pub fn count(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Check that every vector in `vectors` matches the index dimension.
    pub fn check_batch(&self, vectors: &[Vec<f32>]) -> Result<(), RagError> {
        for v in vectors {
            if v.len() != self.dim {
                return Err(RagError::DimensionMismatch {
                    expected: self.dim,
                    actual: v.len(),
                });
            }
        }
        Ok(())
    }

    /// Append a batch; rows get consecutive ids after the current count.
    ///
    /// The batch is checked in full before anything is appended.
    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<(), RagError> {
        self.check_batch(vectors)?;
        self.data.reserve(vectors.len() * self.dim);
        for v in vectors {
            self.data.extend_from_slice(v);
        }
        Ok(())
    }

    /// Return up to `k` `(row, distance)` pairs, nearest first.
    ///
    /// Ties keep row order, so results are deterministic.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>, RagError> {
        if k == 0 {
            return Err(RagError::InvalidArgument("k must be >= 1".to_string()));
        }
        if self.is_empty() {
            return Err(RagError::EmptyIndex);
        }
        if query.len() != self.dim {
            return Err(RagError::DimensionMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }

        let mut scored: Vec<(usize, f32)> = self
            .data
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(row, v)| (row, squared_l2(query, v)))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(k);
        Ok(scored)
    }

    /// Encode the index in the on-disk format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.data.len() * 4);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dim as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.count() as u64).to_le_bytes());
        for &v in &self.data {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    /// Decode an index produced by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[0..4] != MAGIC {
            bail!("not an index file (bad magic)");
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into()?);
        if version != FORMAT_VERSION {
            bail!("unsupported index format version {}", version);
        }
        let dim = u32::from_le_bytes(bytes[8..12].try_into()?) as usize;
        let count = u64::from_le_bytes(bytes[12..20].try_into()?) as usize;

        let body = &bytes[HEADER_LEN..];
        let expected = count
            .checked_mul(dim)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| anyhow::anyhow!("index header overflows"))?;
        if body.len() != expected {
            bail!(
                "index body is {} bytes, header promises {} vectors of dim {}",
                body.len(),
                count,
                dim
            );
        }

        let data = body
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { dim, data })
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read index file: {}", path.display()))?;
        Self::from_bytes(&bytes)
            .with_context(|| format!("Failed to decode index file: {}", path.display()))
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}
