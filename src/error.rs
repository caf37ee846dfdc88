//! Error taxonomy for the indexing and query pipeline.
//!
//! Busy signals from admission control are deliberately absent: they are a
//! normal outcome ([`crate::admission::Admission::Busy`]), not a failure.

/// Result alias for core pipeline operations.
pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Debug, thiserror::Error)]
pub enum RagError {
    /// The embedding provider failed; nothing was committed.
    #[error("embedding failed: {source}")]
    EmbeddingFailure {
        #[source]
        source: anyhow::Error,
    },

    /// A vector does not match the dimension the index was created with.
    #[error("embedding dimension mismatch: index has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A search was attempted against a store with no vectors.
    #[error("the vector index is empty")]
    EmptyIndex,

    /// Retrieval was requested before any document was indexed.
    #[error("no documents have been indexed yet")]
    IndexNotReady,

    /// Vector count and chunk count disagree (e.g. a crash between the two
    /// persistence writes). Queries fail closed until the index is rebuilt.
    #[error("index is inconsistent: {vectors} vectors but {chunks} chunks")]
    IndexInconsistent { vectors: usize, chunks: usize },

    /// The recall stage returned nothing.
    #[error("vector search returned no candidates")]
    NoCandidates,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("relevance scoring failed: {source}")]
    ScoringFailure {
        #[source]
        source: anyhow::Error,
    },

    #[error("generation provider error: {0}")]
    GenerationProvider(String),

    /// Writing index artifacts failed. `partial` is true when the in-memory
    /// state was already updated and only the durable copy is stale.
    #[error("index persistence failed (partial = {partial}): {source}")]
    Persistence {
        partial: bool,
        #[source]
        source: anyhow::Error,
    },

    /// The persistence gateway (relational backend) failed.
    #[error("persistence gateway error: {source}")]
    Gateway {
        #[source]
        source: anyhow::Error,
    },
}

impl RagError {
    pub fn embedding(source: impl Into<anyhow::Error>) -> Self {
        Self::EmbeddingFailure {
            source: source.into(),
        }
    }

    pub fn scoring(source: impl Into<anyhow::Error>) -> Self {
        Self::ScoringFailure {
            source: source.into(),
        }
    }

    pub fn gateway(source: impl Into<anyhow::Error>) -> Self {
        Self::Gateway {
            source: source.into(),
        }
    }

    /// Short machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmbeddingFailure { .. } => "embedding_failure",
            Self::DimensionMismatch { .. } => "dimension_mismatch",
            Self::EmptyIndex | Self::IndexNotReady => "index_not_ready",
            Self::IndexInconsistent { .. } => "index_inconsistent",
            Self::NoCandidates => "no_candidates",
            Self::InvalidArgument(_) => "bad_request",
            Self::ScoringFailure { .. } => "scoring_failure",
            Self::GenerationProvider(_) => "generation_error",
            Self::Persistence { .. } => "persistence_failure",
            Self::Gateway { .. } => "internal",
        }
    }

    /// A message that is safe to show to an end user.
    ///
    /// Only "not ready" conditions carry guidance; everything else collapses
    /// to a generic message. The full error goes to the log and the request
    /// record instead.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::EmptyIndex | Self::IndexNotReady => {
                "No documents have been indexed yet. Please index documents first."
            }
            _ => "A system error occurred. Please try again later.",
        }
    }
}
