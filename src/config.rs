use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Mutex,
};

use homedir::my_home;
use serde::{Deserialize, Serialize};

use crate::semantic::remote::RemoteModel;
use crate::semantic::AggregationPolicy;

const CONFIG_FILE_NAME: &str = "config.yaml";

/// Default number of semantic hits returned per query
const DEFAULT_TOP_K: usize = 100;
/// Default dimensionality of the test-only fallback provider
const DEFAULT_FALLBACK_DIMENSIONS: usize = 4;
/// Default local sentence-embedding model
const DEFAULT_LOCAL_MODEL: &str = "multilingual-e5-small";
/// Default timeout for a single embedding request in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config is malformed: {0}")]
    Malformed(#[from] serde_yml::Error),

    #[error("unknown provider '{0}', expected one of: local, jina, openai, fallback")]
    UnknownProvider(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Embedding providers a user can select.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Local,
    #[default]
    Jina,
    #[serde(rename = "openai")]
    OpenAi,
    Fallback,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Local,
        ProviderKind::Jina,
        ProviderKind::OpenAi,
        ProviderKind::Fallback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::Jina => "jina",
            ProviderKind::OpenAi => "openai",
            ProviderKind::Fallback => "fallback",
        }
    }

    /// Remote providers need a token and a base url.
    pub fn is_remote(&self) -> bool {
        matches!(self, ProviderKind::Jina | ProviderKind::OpenAi)
    }

    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            ProviderKind::Jina => Some("https://api.jina.ai"),
            ProviderKind::OpenAi => Some("https://api.openai.com"),
            ProviderKind::Local | ProviderKind::Fallback => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == lowered)
            .ok_or_else(|| ConfigError::UnknownProvider(s.to_string()))
    }
}

/// Credentials and endpoint for one provider
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Maximum number of semantic hits per query
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// How a query is scored against a multi-segment title
    #[serde(default)]
    pub aggregation: AggregationPolicy,

    /// Optional minimum score for semantic hits [-1.0, 1.0]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            aggregation: AggregationPolicy::default(),
            threshold: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default = "default_fallback_dimensions")]
    pub dimensions: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_FALLBACK_DIMENSIONS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalModelConfig {
    /// Model name for the local provider (e.g. "multilingual-e5-small")
    #[serde(default = "default_local_model")]
    pub model: String,

    /// Where model files are cached; defaults to `<base>/models`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

impl Default for LocalModelConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_LOCAL_MODEL.to_string(),
            cache_dir: None,
        }
    }
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_fallback_dimensions() -> usize {
    DEFAULT_FALLBACK_DIMENSIONS
}

fn default_local_model() -> String {
    DEFAULT_LOCAL_MODEL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Provider used for new queries and incremental indexing
    #[serde(default)]
    pub active_provider: ProviderKind,

    /// Provider that built the current index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_provider: Option<ProviderKind>,

    /// Model that built the current index, see [`Settings::index_model`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_model: Option<String>,

    #[serde(default)]
    pub providers: BTreeMap<ProviderKind, ProviderSettings>,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub fallback: FallbackConfig,

    #[serde(default)]
    pub local: LocalModelConfig,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Chrome `Bookmarks` file used as the bookmark tree
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bookmarks_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            active_provider: ProviderKind::default(),
            indexed_provider: None,
            indexed_model: None,
            providers: BTreeMap::new(),
            search: SearchConfig::default(),
            fallback: FallbackConfig::default(),
            local: LocalModelConfig::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            bookmarks_file: None,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.search.top_k == 0 {
            return Err(ConfigError::Invalid(
                "search.top_k must be greater than 0".to_string(),
            ));
        }

        if let Some(threshold) = self.search.threshold {
            if !(-1.0..=1.0).contains(&threshold) {
                return Err(ConfigError::Invalid(format!(
                    "search.threshold must be between -1.0 and 1.0, got {threshold}"
                )));
            }
        }

        if self.fallback.dimensions == 0 {
            return Err(ConfigError::Invalid(
                "fallback.dimensions must be greater than 0".to_string(),
            ));
        }

        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        for (kind, provider) in &self.providers {
            if let Some(base_url) = &provider.base_url {
                url::Url::parse(base_url).map_err(|e| {
                    ConfigError::Invalid(format!("providers.{kind}.base_url '{base_url}': {e}"))
                })?;
            }
        }

        Ok(())
    }

    pub fn token(&self, kind: ProviderKind) -> Option<&str> {
        self.providers
            .get(&kind)
            .and_then(|p| p.token.as_deref())
            .filter(|t| !t.trim().is_empty())
    }

    /// Configured base url, or the provider's public endpoint.
    pub fn base_url(&self, kind: ProviderKind) -> Option<String> {
        self.providers
            .get(&kind)
            .and_then(|p| p.base_url.clone())
            .filter(|u| !u.trim().is_empty())
            .or_else(|| kind.default_base_url().map(str::to_string))
    }

    /// Name of the model `kind` embeds with under these settings. Two
    /// indexes with the same name hold vectors of the same space.
    pub fn index_model(&self, kind: ProviderKind) -> String {
        match kind {
            ProviderKind::Local => self.local.model.clone(),
            ProviderKind::Fallback => format!("fallback-{}d", self.fallback.dimensions),
            ProviderKind::Jina | ProviderKind::OpenAi => RemoteModel::for_kind(kind)
                .map_or_else(|| kind.to_string(), |model| model.name.to_string()),
        }
    }

    /// True when the index was not built by the active provider and model.
    ///
    /// An index recorded without a model name cannot be matched and is
    /// treated as stale.
    pub fn reindex_required(&self) -> bool {
        self.indexed_provider != Some(self.active_provider)
            || self.indexed_model.as_deref() != Some(self.index_model(self.active_provider).as_str())
    }

    /// `provider (model)` for the active provider.
    pub fn active_label(&self) -> String {
        format!("{} ({})", self.active_provider, self.index_model(self.active_provider))
    }

    /// `provider (model)` for the provider that built the index.
    pub fn indexed_label(&self) -> Option<String> {
        self.indexed_provider.map(|kind| match &self.indexed_model {
            Some(model) => format!("{} ({})", kind, model),
            None => kind.to_string(),
        })
    }
}

/// Settings persisted as YAML in the data directory.
///
/// Every read goes to disk so that a provider switch made by another
/// process (or another part of this one) applies to the next call.
pub struct SettingsStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SettingsStore {
    pub fn new(base_path: &Path) -> Self {
        Self {
            path: base_path.join(CONFIG_FILE_NAME),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Settings, ConfigError> {
        if !self.path.exists() {
            let settings = Settings::default();
            self.write(&settings)?;
            return Ok(settings);
        }

        let config_str = std::fs::read_to_string(&self.path)?;
        let settings: Settings = if config_str.trim().is_empty() {
            Settings::default()
        } else {
            serde_yml::from_str(&config_str)?
        };
        settings.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&settings)? {
            self.write(&settings)?;
        }

        Ok(settings)
    }

    pub fn save(&self, settings: &Settings) -> Result<(), ConfigError> {
        settings.validate()?;
        self.write(settings)
    }

    /// Read-modify-write under the store's lock.
    pub fn update<F>(&self, f: F) -> Result<Settings, ConfigError>
    where
        F: FnOnce(&mut Settings),
    {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| ConfigError::Invalid(format!("settings lock poisoned: {e}")))?;

        let mut settings = self.load()?;
        f(&mut settings);
        self.save(&settings)?;
        Ok(settings)
    }

    pub fn active_provider(&self) -> Result<ProviderKind, ConfigError> {
        Ok(self.load()?.active_provider)
    }

    pub fn set_active_provider(&self, kind: ProviderKind) -> Result<(), ConfigError> {
        self.update(|s| s.active_provider = kind).map(|_| ())
    }

    pub fn indexed_provider(&self) -> Result<Option<ProviderKind>, ConfigError> {
        Ok(self.load()?.indexed_provider)
    }

    /// Record `kind`, with the model it currently uses, as the builder of
    /// the index.
    pub fn set_indexed_provider(&self, kind: ProviderKind) -> Result<(), ConfigError> {
        self.update(|s| {
            s.indexed_model = Some(s.index_model(kind));
            s.indexed_provider = Some(kind);
        })
        .map(|_| ())
    }

    pub fn token(&self, kind: ProviderKind) -> Result<Option<String>, ConfigError> {
        Ok(self.load()?.token(kind).map(str::to_string))
    }

    pub fn set_token(&self, kind: ProviderKind, token: &str) -> Result<(), ConfigError> {
        let token = token.trim().to_string();
        self.update(|s| {
            s.providers.entry(kind).or_default().token = Some(token).filter(|t| !t.is_empty());
        })
        .map(|_| ())
    }

    pub fn base_url(&self, kind: ProviderKind) -> Result<Option<String>, ConfigError> {
        Ok(self.load()?.base_url(kind))
    }

    pub fn set_base_url(&self, kind: ProviderKind, base_url: &str) -> Result<(), ConfigError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !base_url.is_empty() {
            url::Url::parse(&base_url)
                .map_err(|e| ConfigError::Invalid(format!("base url '{base_url}': {e}")))?;
        }
        self.update(|s| {
            s.providers.entry(kind).or_default().base_url = Some(base_url).filter(|u| !u.is_empty());
        })
        .map(|_| ())
    }

    fn write(&self, settings: &Settings) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let config_str = serde_yml::to_string(settings)?;
        let temp_path = self.path.with_extension("yaml.tmp");
        std::fs::write(&temp_path, config_str.as_bytes())?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

/// Data directory: `SEMMARK_BASE_PATH` or `~/.local/share/semmark`.
pub fn base_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("SEMMARK_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }

    let home = my_home()?.ok_or_else(|| anyhow::anyhow!("Home directory path is empty"))?;
    Ok(home.join(".local/share/semmark"))
}
