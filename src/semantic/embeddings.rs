//! Embedding providers.
//!
//! A closed set of variants behind one capability, [`Provider::get_embedding`]:
//! - `Remote`: token-authenticated HTTP API (see [`crate::semantic::remote`])
//! - `Local`: fastembed model on a background worker (see [`crate::semantic::local`])
//! - `Fallback`: deterministic character codes, for tests only
//!
//! [`ProviderRegistry`] picks the variant per call from the settings file.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{ConfigError, ProviderKind, Settings, SettingsStore};
use crate::semantic::local::LocalModelHandle;
use crate::semantic::remote::{RemoteModel, RemoteProvider};

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("{provider} provider error: {message}")]
    Provider { provider: String, message: String },

    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Maps each character's code point into a fixed number of buckets.
///
/// Not semantically meaningful. Texts sharing characters score high, which
/// is enough to exercise the pipeline without a model or network.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FallbackProvider {
    dimensions: usize,
}

impl FallbackProvider {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for (i, c) in text.chars().enumerate() {
            vector[i % self.dimensions] += c as u32 as f32;
        }
        vector
    }
}

pub struct LocalProvider {
    handle: Arc<LocalModelHandle>,
}

impl LocalProvider {
    pub fn new(handle: Arc<LocalModelHandle>) -> Self {
        Self { handle }
    }

    pub fn model_name(&self) -> &str {
        self.handle.model_name()
    }
}

/// The provider chosen for one call.
pub enum Provider {
    Remote(RemoteProvider),
    Local(LocalProvider),
    Fallback(FallbackProvider),
}

impl Provider {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Provider::Remote(remote) => remote.kind(),
            Provider::Local(_) => ProviderKind::Local,
            Provider::Fallback(_) => ProviderKind::Fallback,
        }
    }

    /// Embed every input string; the output is aligned with the input.
    pub async fn get_embedding(&self, input: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if input.is_empty() {
            return Ok(vec![]);
        }

        let vectors = match self {
            Provider::Remote(remote) => remote.get_embedding(input).await?,
            Provider::Local(local) => local.handle.extract_features(input.to_vec()).await?,
            Provider::Fallback(fallback) => input.iter().map(|text| fallback.embed(text)).collect(),
        };

        if vectors.len() != input.len() {
            return Err(EmbeddingError::Provider {
                provider: self.kind().to_string(),
                message: format!("expected {} embeddings, got {}", input.len(), vectors.len()),
            });
        }

        Ok(vectors)
    }

    /// Embed a single string.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.get_embedding(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }
}

/// Builds the provider for whichever kind is active at call time.
///
/// The local model worker is started once and shared by every `Local`
/// provider this registry hands out, unless the configured model changes.
pub struct ProviderRegistry {
    settings: Arc<SettingsStore>,
    base_path: PathBuf,
    client: reqwest::Client,
    local: Mutex<Option<Arc<LocalModelHandle>>>,
}

impl ProviderRegistry {
    pub fn new(settings: Arc<SettingsStore>, base_path: &Path) -> Self {
        Self {
            settings,
            base_path: base_path.to_path_buf(),
            client: reqwest::Client::new(),
            local: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    /// Provider for the currently active kind. Re-reads the settings file.
    pub fn resolve(&self) -> Result<Provider, EmbeddingError> {
        let settings = self.settings.load()?;
        self.build(&settings, settings.active_provider)
    }

    /// Provider for `kind` configured from `settings`.
    pub fn build(&self, settings: &Settings, kind: ProviderKind) -> Result<Provider, EmbeddingError> {
        match kind {
            ProviderKind::Jina | ProviderKind::OpenAi => {
                let model = RemoteModel::for_kind(kind).ok_or_else(|| EmbeddingError::Provider {
                    provider: kind.to_string(),
                    message: "no remote model".to_string(),
                })?;
                let base_url = settings.base_url(kind).ok_or_else(|| EmbeddingError::Provider {
                    provider: kind.to_string(),
                    message: "no base url configured".to_string(),
                })?;

                Ok(Provider::Remote(RemoteProvider::new(
                    kind,
                    base_url,
                    settings.token(kind).map(str::to_string),
                    model,
                    Duration::from_secs(settings.request_timeout_secs),
                    self.client.clone(),
                )))
            }
            ProviderKind::Local => Ok(Provider::Local(LocalProvider::new(self.local_model(settings)?))),
            ProviderKind::Fallback => Ok(Provider::Fallback(FallbackProvider::new(
                settings.fallback.dimensions,
            ))),
        }
    }

    /// Shared handle to the local model worker, started on first use.
    pub fn local_model(&self, settings: &Settings) -> Result<Arc<LocalModelHandle>, EmbeddingError> {
        let mut guard = self
            .local
            .lock()
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to acquire model lock: {}", e)))?;

        if let Some(handle) = guard.as_ref() {
            if handle.model_name() == settings.local.model {
                return Ok(Arc::clone(handle));
            }
            log::info!(
                "local model changed from '{}' to '{}'",
                handle.model_name(),
                settings.local.model
            );
        }

        let cache_dir = settings
            .local
            .cache_dir
            .clone()
            .unwrap_or_else(|| self.base_path.join("models"));
        let handle = Arc::new(LocalModelHandle::spawn(&settings.local.model, cache_dir)?);
        *guard = Some(Arc::clone(&handle));
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, ProviderRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SettingsStore::new(dir.path()));
        let registry = ProviderRegistry::new(settings, dir.path());
        (dir, registry)
    }

    #[test]
    fn test_fallback_is_deterministic_with_fixed_dimensions() {
        let provider = FallbackProvider::new(4);
        let a = provider.embed("Rust Programming Language");
        let b = provider.embed("Rust Programming Language");

        assert_eq!(a, b);
        assert_eq!(a.len(), 4);
        assert_eq!(provider.embed("").len(), 4);
        assert_ne!(a, provider.embed("Go Programming Tutorial"));
    }

    #[test]
    fn test_fallback_buckets_code_points() {
        let provider = FallbackProvider::new(2);
        // 'a' = 97, 'b' = 98, 'c' = 99
        assert_eq!(provider.embed("abc"), vec![97.0 + 99.0, 98.0]);
    }

    #[tokio::test]
    async fn test_get_embedding_aligned_with_input() {
        let provider = Provider::Fallback(FallbackProvider::new(4));
        let input = vec!["one".to_string(), "two".to_string(), "three".to_string()];

        let vectors = provider.get_embedding(&input).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[1], FallbackProvider::new(4).embed("two"));
    }

    #[tokio::test]
    async fn test_embed_one() {
        let provider = Provider::Fallback(FallbackProvider::new(3));
        assert_eq!(provider.embed_one("x").await.unwrap(), vec![120.0, 0.0, 0.0]);
    }

    #[test]
    fn test_resolve_follows_active_provider() {
        let (_dir, registry) = registry();

        assert_eq!(registry.resolve().unwrap().kind(), ProviderKind::Jina);

        registry
            .settings()
            .set_active_provider(ProviderKind::Fallback)
            .unwrap();
        assert_eq!(registry.resolve().unwrap().kind(), ProviderKind::Fallback);

        registry
            .settings()
            .set_active_provider(ProviderKind::OpenAi)
            .unwrap();
        assert_eq!(registry.resolve().unwrap().kind(), ProviderKind::OpenAi);
    }

    #[tokio::test]
    async fn test_remote_without_token_fails_authentication() {
        let (_dir, registry) = registry();
        let provider = registry.resolve().unwrap();

        let result = provider.get_embedding(&["hello".to_string()]).await;
        assert!(matches!(result, Err(EmbeddingError::Authentication(_))));
    }

    #[test]
    fn test_local_handle_is_reused() {
        let (_dir, registry) = registry();
        let settings = Settings::default();

        let first = registry.local_model(&settings).unwrap();
        let second = registry.local_model(&settings).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let mut changed = settings.clone();
        changed.local.model = "all-minilm-l6-v2".to_string();
        let third = registry.local_model(&changed).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.model_name(), "all-minilm-l6-v2");
    }

    #[test]
    fn test_local_invalid_model() {
        let (_dir, registry) = registry();
        let mut settings = Settings::default();
        settings.local.model = "nope".to_string();

        let result = registry.build(&settings, ProviderKind::Local);
        assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
    }
}
