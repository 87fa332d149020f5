//! Semantic search over bookmark titles.
//!
//! # Architecture
//!
//! - `embeddings`: provider variants and the per-call provider registry
//! - `remote`: token-authenticated HTTP embedding APIs
//! - `local`: fastembed model on a background worker thread
//! - `protocol`: messages exchanged with the model worker
//! - `storage`: SQLite-backed vector store with schema migrations
//! - `preprocess`: title segmentation and content hashing
//! - `similarity`: cosine scoring, segment aggregation and ranking
//! - `indexer`: bulk indexing and bookmark event handling
//! - `service`: query flow and result merging

pub mod embeddings;
pub mod indexer;
pub mod local;
pub mod preprocess;
pub mod protocol;
pub mod remote;
pub mod service;
pub mod similarity;
pub mod storage;

pub use embeddings::{EmbeddingError, Provider, ProviderRegistry};
pub use indexer::{EventOutcome, IndexError, IndexProgress, IndexReport, IndexState, Indexer, SyncReport};
pub use service::{merge_results, HitSource, IndexStatus, SearchHit, SemanticResults, SemanticSearchError, SemanticSearchService};
pub use similarity::AggregationPolicy;
pub use storage::{BookmarkRecord, StoreError, VectorStore};

/// Vector store file name inside the data directory
pub const STORE_FILE_NAME: &str = "vectors.db";
