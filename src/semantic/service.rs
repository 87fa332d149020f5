//! Query side of semantic search.
//!
//! Embeds the query with the active provider, ranks every stored record
//! against it and merges the result with the browser's keyword hits.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::bookmarks::BookmarkNode;
use crate::config::{ConfigError, ProviderKind};
use crate::semantic::embeddings::{EmbeddingError, ProviderRegistry};
use crate::semantic::similarity::{rank, SimilarityError};
use crate::semantic::storage::{StoreError, VectorStore};

/// Errors that can occur during semantic search operations.
#[derive(Debug, thiserror::Error)]
pub enum SemanticSearchError {
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Query has {query} dimensions but the index holds {index}-dimensional vectors")]
    DimensionMismatch { query: usize, index: usize },
}

impl From<SimilarityError> for SemanticSearchError {
    fn from(err: SimilarityError) -> Self {
        match err {
            // rank compares the query (expected) against each record (got)
            SimilarityError::DimensionMismatch { expected, got } => SemanticSearchError::DimensionMismatch {
                query: expected,
                index: got,
            },
        }
    }
}

impl SemanticSearchError {
    /// Message suitable for showing to the user as is.
    pub fn user_message(&self) -> String {
        match self {
            SemanticSearchError::DimensionMismatch { .. } => {
                "The search index was built with a different embedding provider or model. \
                 Rebuild it with `semmark index` to search with the current one."
                    .to_string()
            }
            SemanticSearchError::Embedding(EmbeddingError::Authentication(_)) => {
                "The embedding provider rejected the request. Set a valid API token with `semmark token`."
                    .to_string()
            }
            SemanticSearchError::Embedding(e) => format!("Could not embed the query: {}", e),
            SemanticSearchError::Storage(e) => format!("Could not read the search index: {}", e),
            SemanticSearchError::Config(e) => format!("Could not read settings: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SemanticHit {
    pub id: String,
    pub title: String,
    pub url: Option<String>,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SemanticResults {
    pub hits: Vec<SemanticHit>,
    /// The index was built by another provider or model than the active one
    pub reindex_required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStatus {
    pub active_provider: ProviderKind,
    pub active_model: String,
    pub indexed_provider: Option<ProviderKind>,
    pub indexed_model: Option<String>,
    pub indexed_count: usize,
    pub dimensions: Option<usize>,
    pub schema_version: u32,
    pub reindex_required: bool,
    pub store_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HitSource {
    Keyword,
    Semantic,
}

/// One row of a merged result list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    pub source: HitSource,
}

pub struct SemanticSearchService {
    store: Arc<VectorStore>,
    registry: Arc<ProviderRegistry>,
}

impl SemanticSearchService {
    pub fn new(store: Arc<VectorStore>, registry: Arc<ProviderRegistry>) -> Self {
        Self { store, registry }
    }

    /// Search for semantically similar bookmarks.
    ///
    /// `top_k` defaults to `search.top_k` from the settings. A blank query
    /// or an empty index gives no hits without calling the provider.
    pub async fn search(
        &self,
        query: &str,
        top_k: Option<usize>,
    ) -> Result<SemanticResults, SemanticSearchError> {
        let settings = self.registry.settings().load()?;
        let reindex_required = settings.reindex_required();
        let empty = SemanticResults {
            hits: vec![],
            reindex_required,
        };

        let query = query.trim();
        if query.is_empty() {
            return Ok(empty);
        }

        let records = self.store.get_all()?;
        if records.is_empty() {
            return Ok(empty);
        }

        let provider = self.registry.build(&settings, settings.active_provider)?;
        let query_embedding = provider.embed_one(query).await?;

        let top_k = top_k.unwrap_or(settings.search.top_k);
        let ranked = rank(&query_embedding, records, top_k, settings.search.aggregation)?;

        let hits = ranked
            .into_iter()
            .filter(|scored| settings.search.threshold.map_or(true, |t| scored.score >= t))
            .map(|scored| SemanticHit {
                id: scored.record.id,
                title: scored.record.title,
                url: scored.record.url,
                score: scored.score,
            })
            .collect();

        Ok(SemanticResults {
            hits,
            reindex_required,
        })
    }

    pub fn status(&self) -> Result<IndexStatus, SemanticSearchError> {
        let settings = self.registry.settings().load()?;

        Ok(IndexStatus {
            active_provider: settings.active_provider,
            active_model: settings.index_model(settings.active_provider),
            indexed_provider: settings.indexed_provider,
            indexed_model: settings.indexed_model.clone(),
            indexed_count: self.store.count()?,
            dimensions: self.store.dimensions()?,
            schema_version: self.store.schema_version()?,
            reindex_required: settings.reindex_required(),
            store_path: self.store.path().to_path_buf(),
        })
    }
}

/// Keyword hits first, then semantic hits, each bookmark once.
pub fn merge_results(keyword: Vec<BookmarkNode>, semantic: Vec<SemanticHit>) -> Vec<SearchHit> {
    let mut seen = HashSet::new();

    let keyword = keyword.into_iter().map(|node| SearchHit {
        id: node.id,
        title: node.title,
        url: node.url,
        score: None,
        source: HitSource::Keyword,
    });
    let semantic = semantic.into_iter().map(|hit| SearchHit {
        id: hit.id,
        title: hit.title,
        url: hit.url,
        score: Some(hit.score),
        source: HitSource::Semantic,
    });

    keyword
        .chain(semantic)
        .filter(|hit| seen.insert(hit.id.clone()))
        .collect()
}
