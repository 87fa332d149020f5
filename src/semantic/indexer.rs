//! Keeps the vector store in step with the bookmark tree.
//!
//! Bulk passes walk the whole tree; bookmark events (created, removed,
//! changed) are applied one at a time. Only one bulk pass runs at a time.
//! Events do not wait for it and may interleave with it; a record inserted
//! by both sides is kept once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::bookmarks::{flatten_leaves, BookmarkChange, BookmarkNode};
use crate::config::{ConfigError, ProviderKind, Settings};
use crate::semantic::embeddings::{EmbeddingError, Provider, ProviderRegistry};
use crate::semantic::preprocess::{content_hash, embedding_input};
use crate::semantic::storage::{BookmarkRecord, StoreError, VectorStore};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("An indexing pass is already running")]
    AlreadyIndexing,

    #[error("Index was built with {} but the active provider is {active}, rebuild it first", .indexed.as_deref().unwrap_or("no provider"))]
    ReindexRequired {
        active: String,
        indexed: Option<String>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Idle,
    Indexing,
}

/// Reported after every bulk-pass candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexProgress {
    /// Records in the store
    pub indexed: usize,
    /// Bookmarks in the tree being indexed
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexFailure {
    pub id: String,
    pub title: String,
    pub error: String,
}

impl IndexFailure {
    fn new(node: &BookmarkNode, error: impl ToString) -> Self {
        Self {
            id: node.id.clone(),
            title: node.title.clone(),
            error: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexReport {
    pub provider: ProviderKind,
    /// Whether the store was cleared because the provider changed
    pub cleared: bool,
    /// Bookmarks with a url in the tree
    pub total: usize,
    pub indexed: usize,
    pub already_indexed: usize,
    /// Bookmarks with no text to embed
    pub skipped: usize,
    pub failures: Vec<IndexFailure>,
    pub cancelled: bool,
}

impl IndexReport {
    fn new(provider: ProviderKind) -> Self {
        Self {
            provider,
            cleared: false,
            total: 0,
            indexed: 0,
            already_indexed: 0,
            skipped: 0,
            failures: vec![],
            cancelled: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub created: usize,
    pub removed: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub failures: Vec<IndexFailure>,
    pub cancelled: bool,
}

/// What a single bookmark event did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Indexed,
    AlreadyIndexed,
    /// Folder, or nothing to embed
    Skipped,
    Removed,
    NotIndexed,
    /// Url changed, embedding kept
    Updated,
    /// Title changed, embedding recomputed
    Reembedded,
    Unchanged,
}

pub struct Indexer {
    store: Arc<VectorStore>,
    registry: Arc<ProviderRegistry>,
    state: Mutex<IndexState>,
    progress: watch::Sender<IndexProgress>,
}

/// Marks the indexer busy until dropped.
struct PassGuard<'a> {
    state: &'a Mutex<IndexState>,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            *state = IndexState::Idle;
        }
    }
}

impl Indexer {
    pub fn new(store: Arc<VectorStore>, registry: Arc<ProviderRegistry>) -> Self {
        let (progress, _) = watch::channel(IndexProgress::default());
        Self {
            store,
            registry,
            state: Mutex::new(IndexState::Idle),
            progress,
        }
    }

    pub fn state(&self) -> IndexState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(IndexState::Idle)
    }

    /// Watch bulk-pass progress.
    pub fn subscribe(&self) -> watch::Receiver<IndexProgress> {
        self.progress.subscribe()
    }

    /// Index every bookmark in `tree` that is not indexed yet.
    ///
    /// When the active provider did not build the current index, the store
    /// is cleared and the active provider recorded as the indexed one
    /// before anything is embedded. Each candidate is tried once; failures
    /// are collected in the report and do not stop the pass. Cancelling
    /// stops before the next candidate and keeps what was inserted.
    pub async fn build_index(
        &self,
        tree: &[BookmarkNode],
        cancel: &CancellationToken,
    ) -> Result<IndexReport, IndexError> {
        let _guard = self.begin()?;

        let settings = self.registry.settings().load()?;
        let span = tracing::info_span!("build_index", provider = %settings.active_provider);

        self.run_pass(settings, tree, cancel).instrument(span).await
    }

    async fn run_pass(
        &self,
        settings: Settings,
        tree: &[BookmarkNode],
        cancel: &CancellationToken,
    ) -> Result<IndexReport, IndexError> {
        let active = settings.active_provider;
        let provider = self.registry.build(&settings, active)?;
        let mut report = IndexReport::new(active);

        if settings.reindex_required() {
            log::info!(
                "index was built with {}, rebuilding with {}",
                settings.indexed_label().unwrap_or_else(|| "no provider".to_string()),
                settings.active_label()
            );
            self.store.clear()?;
            self.registry.settings().set_indexed_provider(active)?;
            report.cleared = true;
        }

        let candidates = flatten_leaves(tree);
        report.total = candidates.len();
        self.publish(report.total);

        for node in candidates {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            match self.store.has(&node.id) {
                Ok(true) => {
                    report.already_indexed += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    log::warn!("failed to check bookmark {}: {}", node.id, e);
                    report.failures.push(IndexFailure::new(node, e));
                    continue;
                }
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                outcome = self.insert(&provider, node) => outcome,
            };

            match outcome {
                Ok(EventOutcome::Indexed) => report.indexed += 1,
                Ok(EventOutcome::AlreadyIndexed) => report.already_indexed += 1,
                Ok(_) => report.skipped += 1,
                Err(e) => {
                    log::warn!("failed to index bookmark {} '{}': {}", node.id, node.title, e);
                    report.failures.push(IndexFailure::new(node, e));
                }
            }

            self.publish(report.total);
            // let watchers run even when the provider never suspends
            tokio::task::yield_now().await;
        }

        log::info!(
            "indexed {} of {} bookmarks ({} already indexed, {} skipped, {} failed{})",
            report.indexed,
            report.total,
            report.already_indexed,
            report.skipped,
            report.failures.len(),
            if report.cancelled { ", cancelled" } else { "" }
        );

        Ok(report)
    }

    /// Bring the store in line with a snapshot of the tree: records for
    /// bookmarks that no longer exist are removed, new bookmarks are
    /// indexed and renamed ones re-embedded.
    pub async fn sync(
        &self,
        tree: &[BookmarkNode],
        cancel: &CancellationToken,
    ) -> Result<SyncReport, IndexError> {
        let _guard = self.begin()?;

        let settings = self.registry.settings().load()?;
        if settings.reindex_required() && self.store.count()? > 0 {
            return Err(IndexError::ReindexRequired {
                active: settings.active_label(),
                indexed: settings.indexed_label(),
            });
        }
        let provider = self.registry.build(&settings, settings.active_provider)?;

        let leaves: HashMap<&str, &BookmarkNode> = flatten_leaves(tree)
            .into_iter()
            .map(|node| (node.id.as_str(), node))
            .collect();
        let stored: HashMap<String, BookmarkRecord> = self
            .store
            .get_all()?
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();

        let mut report = SyncReport::default();

        for id in stored.keys().filter(|id| !leaves.contains_key(id.as_str())) {
            if self.store.delete(id)? {
                report.removed += 1;
            }
        }

        for node in flatten_leaves(tree) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let outcome = match stored.get(&node.id) {
                None => self.insert(&provider, node).await,
                Some(record) => {
                    let change = BookmarkChange {
                        title: Some(node.title.clone()),
                        url: node.url.clone(),
                    };
                    self.replace(&provider, record, change).await
                }
            };

            match outcome {
                Ok(EventOutcome::Indexed) => report.created += 1,
                Ok(EventOutcome::Reembedded | EventOutcome::Updated) => report.changed += 1,
                Ok(_) => report.unchanged += 1,
                Err(e) => {
                    log::warn!("failed to sync bookmark {} '{}': {}", node.id, node.title, e);
                    report.failures.push(IndexFailure::new(node, e));
                }
            }
        }

        log::info!(
            "sync: {} created, {} removed, {} changed, {} failed",
            report.created,
            report.removed,
            report.changed,
            report.failures.len()
        );

        Ok(report)
    }

    /// Index a newly created bookmark. Folders and already indexed
    /// bookmarks are left alone.
    pub async fn on_created(&self, node: &BookmarkNode) -> Result<EventOutcome, IndexError> {
        if node.is_folder() {
            return Ok(EventOutcome::Skipped);
        }
        if self.store.has(&node.id)? {
            return Ok(EventOutcome::AlreadyIndexed);
        }

        let provider = self.registry.resolve()?;
        self.insert(&provider, node).await
    }

    /// Drop the record of a removed bookmark. Unknown ids are a no-op.
    pub fn on_removed(&self, id: &str) -> Result<EventOutcome, IndexError> {
        if self.store.delete(id)? {
            log::debug!("removed bookmark {} from index", id);
            Ok(EventOutcome::Removed)
        } else {
            Ok(EventOutcome::NotIndexed)
        }
    }

    /// Apply a title or url change. The embedding is recomputed only when
    /// the title changed; a bookmark that was never indexed is indexed now.
    pub async fn on_changed(&self, id: &str, change: &BookmarkChange) -> Result<EventOutcome, IndexError> {
        let provider = self.registry.resolve()?;

        match self.store.get(id)? {
            Some(record) => self.replace(&provider, &record, change.clone()).await,
            None => {
                let node = BookmarkNode {
                    id: id.to_string(),
                    title: change.title.clone().unwrap_or_default(),
                    url: change.url.clone(),
                    ..Default::default()
                };
                if node.is_folder() {
                    return Ok(EventOutcome::Skipped);
                }
                self.insert(&provider, &node).await
            }
        }
    }

    fn begin(&self) -> Result<PassGuard<'_>, IndexError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| IndexError::Store(StoreError::Poisoned))?;

        if *state == IndexState::Indexing {
            return Err(IndexError::AlreadyIndexing);
        }
        *state = IndexState::Indexing;

        Ok(PassGuard { state: &self.state })
    }

    /// Send the store count to progress watchers. A failed count skips
    /// the update rather than reporting zero.
    fn publish(&self, total: usize) {
        match self.store.count() {
            Ok(indexed) => {
                self.progress.send_replace(IndexProgress { indexed, total });
            }
            Err(e) => log::warn!("failed to count indexed bookmarks: {}", e),
        }
    }

    async fn insert(&self, provider: &Provider, node: &BookmarkNode) -> Result<EventOutcome, IndexError> {
        let Some(record) = embed(provider, node, node.date_added).await? else {
            return Ok(EventOutcome::Skipped);
        };
        self.add(&record)
    }

    async fn replace(
        &self,
        provider: &Provider,
        existing: &BookmarkRecord,
        change: BookmarkChange,
    ) -> Result<EventOutcome, IndexError> {
        let title = change.title.unwrap_or_else(|| existing.title.clone());
        let url = change.url.or_else(|| existing.url.clone());

        let (record, outcome) = if content_hash(&title) != existing.content_hash {
            let node = BookmarkNode {
                id: existing.id.clone(),
                title,
                url,
                ..Default::default()
            };
            match embed(provider, &node, existing.date_added).await? {
                Some(record) => (record, EventOutcome::Reembedded),
                None => return Ok(EventOutcome::Skipped),
            }
        } else if url != existing.url || title != existing.title {
            let record = BookmarkRecord {
                title,
                url,
                ..existing.clone()
            };
            (record, EventOutcome::Updated)
        } else {
            return Ok(EventOutcome::Unchanged);
        };

        self.store.replace(&record)?;
        log::debug!("bookmark {} {:?}", record.id, outcome);
        Ok(outcome)
    }

    /// Insert, treating a record that appeared concurrently as success.
    fn add(&self, record: &BookmarkRecord) -> Result<EventOutcome, IndexError> {
        match self.store.add(record) {
            Ok(()) => Ok(EventOutcome::Indexed),
            Err(StoreError::DuplicateKey(id)) => {
                log::debug!("bookmark {} was indexed concurrently", id);
                Ok(EventOutcome::AlreadyIndexed)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Embed a bookmark's title segments. `None` when it has no text.
async fn embed(
    provider: &Provider,
    node: &BookmarkNode,
    date_added: Option<i64>,
) -> Result<Option<BookmarkRecord>, IndexError> {
    let Some(segments) = embedding_input(&node.title, node.url.as_deref()) else {
        return Ok(None);
    };

    let embedding = provider.get_embedding(&segments).await?;

    Ok(Some(BookmarkRecord {
        id: node.id.clone(),
        title: node.title.clone(),
        url: node.url.clone(),
        date_added,
        content_hash: content_hash(&node.title),
        embedding,
    }))
}
