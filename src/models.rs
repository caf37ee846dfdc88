//! Core data models shared by the indexing and query paths.

use serde::{Deserialize, Serialize};

/// A document handed over by the extraction step, ready to be chunked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceDocument {
    pub content: String,
    pub source_file: String,
    /// Derived markdown artifact, empty if none was produced.
    #[serde(default)]
    pub markdown_file: String,
}

/// A bounded slice of a document's text with its provenance.
///
/// Immutable once created. Its position in the chunk store is its row id in
/// the vector index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub content: String,
    pub source_file: String,
    pub markdown_file: String,
}

/// One stage-1 candidate: a chunk and its distance to the query vector.
#[derive(Debug, Clone)]
pub struct ChunkHit {
    /// Row id in the vector index / position in the chunk store.
    pub position: usize,
    /// Squared L2 distance; smaller is more similar.
    pub distance: f32,
    pub chunk: Chunk,
}

/// Lifecycle state of a generation request record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Completed,
}

impl RequestStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }
}

/// Audit record for one admitted generation request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub id: i64,
    pub user_id: String,
    pub conv_id: String,
    pub question: String,
    pub status: RequestStatus,
    /// Seconds between admission and completion.
    pub response_time: Option<f64>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A stored question/answer pair. Never mutated after creation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConversationTurn {
    pub conv_id: String,
    pub user_id: String,
    pub question: String,
    pub answer: String,
    pub created_at: i64,
}

/// Listing entry for a user's conversations.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub conv_id: String,
    /// The first question asked in the conversation.
    pub title: String,
    pub first_message_time: i64,
    pub last_message_time: i64,
    pub message_count: i64,
}
