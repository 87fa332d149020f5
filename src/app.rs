//! Composition root: owns the store, settings and providers and wires them
//! into the indexer and the search service.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use serde::Serialize;

use crate::bookmarks::{BookmarkSource, ChromeBookmarksFile};
use crate::config::SettingsStore;
use crate::semantic::{
    merge_results, Indexer, ProviderRegistry, SearchHit, SemanticSearchError, SemanticSearchService,
    VectorStore, STORE_FILE_NAME,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchOutput {
    pub hits: Vec<SearchHit>,
    pub reindex_required: bool,
    /// Why semantic hits are missing, when keyword hits are still shown
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_error: Option<String>,
}

pub struct App {
    base_path: PathBuf,
    pub settings: Arc<SettingsStore>,
    pub store: Arc<VectorStore>,
    pub registry: Arc<ProviderRegistry>,
    pub indexer: Indexer,
    pub search: SemanticSearchService,
}

impl App {
    pub fn new(base_path: &Path) -> Self {
        let settings = Arc::new(SettingsStore::new(base_path));
        let store = Arc::new(VectorStore::new(base_path.join(STORE_FILE_NAME)));
        let registry = Arc::new(ProviderRegistry::new(settings.clone(), base_path));

        Self {
            base_path: base_path.to_path_buf(),
            indexer: Indexer::new(store.clone(), registry.clone()),
            search: SemanticSearchService::new(store.clone(), registry.clone()),
            settings,
            store,
            registry,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// The bookmarks file named by `bookmarks_file`, or `override_path`.
    pub fn bookmark_source(&self, override_path: Option<PathBuf>) -> anyhow::Result<ChromeBookmarksFile> {
        let path = match override_path {
            Some(path) => path,
            None => self.settings.load()?.bookmarks_file.ok_or_else(|| {
                anyhow!(
                    "No bookmarks file configured. Pass --bookmarks or set bookmarks_file in {}",
                    self.settings.path().display()
                )
            })?,
        };
        Ok(ChromeBookmarksFile::new(path))
    }

    /// Keyword hits from `source` followed by semantic hits.
    ///
    /// A semantic failure does not hide keyword hits; its user message is
    /// returned alongside them. With `semantic_only` it is returned as the
    /// error instead.
    pub async fn search(
        &self,
        source: Option<&dyn BookmarkSource>,
        query: &str,
        top_k: Option<usize>,
        semantic_only: bool,
    ) -> anyhow::Result<SearchOutput> {
        let keyword = match (source, semantic_only) {
            (Some(source), false) => source.search(query)?,
            _ => vec![],
        };

        match self.search.search(query, top_k).await {
            Ok(results) => Ok(SearchOutput {
                hits: merge_results(keyword, results.hits),
                reindex_required: results.reindex_required,
                semantic_error: None,
            }),
            Err(e) if semantic_only => Err(anyhow!(e.user_message())),
            Err(e) => {
                log::warn!("semantic search failed: {}", e);
                Ok(SearchOutput {
                    reindex_required: matches!(e, SemanticSearchError::DimensionMismatch { .. })
                        || self.settings.load()?.reindex_required(),
                    hits: merge_results(keyword, vec![]),
                    semantic_error: Some(e.user_message()),
                })
            }
        }
    }

    /// Remove every record. The indexed-provider marker is kept.
    pub fn clear(&self) -> anyhow::Result<usize> {
        let count = self.store.count()?;
        self.store.clear()?;
        log::info!("cleared {} records from {}", count, self.store.path().display());
        Ok(count)
    }

    pub fn close(&self) -> anyhow::Result<()> {
        self.store.close()?;
        Ok(())
    }
}
