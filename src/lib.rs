//! # askdocs
//!
//! Retrieval-augmented question answering over an indexed document corpus.
//!
//! Documents are split into overlapping chunks, embedded and appended to a
//! flat vector index kept parallel to a chunk store. Questions go through
//! admission control, two-stage retrieval (vector recall, then reranking)
//! and a streaming generation run whose request record is completed exactly
//! once, whatever happens to the stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌───────────────────────┐
//! │ Documents  │──▶│  Indexing    │──▶│ IndexStore            │
//! │            │   │ Chunk+Embed  │   │ index.bin chunks.json │
//! └────────────┘   └──────────────┘   └───────────┬───────────┘
//!                                                 │
//!   question ─▶ Admission ─▶ Retrieval ◀──────────┘
//!                  │            │
//!                  ▼            ▼
//!               SQLite ◀── Coordinator ──▶ NDJSON stream
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! askdocs init                  # create database
//! askdocs index docs/*.md       # index documents
//! askdocs validate              # check index consistency
//! askdocs serve                 # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and reload |
//! | [`models`] | Core data types |
//! | [`chunk`] | Text chunking |
//! | [`vector_index`] | Flat nearest-neighbor index |
//! | [`store`] | Index and chunk store, persisted as a pair |
//! | [`indexing`] | Indexing engine |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`rerank`] | Relevance scorers |
//! | [`retrieval`] | Two-stage retrieval |
//! | [`generation`] | Streaming generation provider |
//! | [`admission`] | Per-user and global concurrency limits |
//! | [`coordinator`] | Streaming generation state machine |
//! | [`pipeline`] | Query service |
//! | [`gateway`] | Persistence gateway trait, in-memory backend |
//! | [`sqlite_gateway`] | SQLite persistence gateway |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod admission;
pub mod chunk;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod embedding;
pub mod error;
pub mod gateway;
pub mod generation;
pub mod indexing;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod rerank;
pub mod retrieval;
pub mod server;
pub mod sqlite_gateway;
pub mod store;
pub mod vector_index;
