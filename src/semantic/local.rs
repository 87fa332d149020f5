//! Offline embedding provider backed by fastembed.
//!
//! The model is owned by a dedicated worker thread (fastembed inference is
//! blocking) and reached through [`LocalModelHandle`]:
//! - the model is loaded lazily on the first `extract_features` request
//!   and reused for every later one
//! - load progress is pushed to subscribers as
//!   `update_model_init_progress` notifications, callers never wait on them

use std::path::PathBuf;

use fastembed::{InitOptions, TextEmbedding};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::semantic::embeddings::EmbeddingError;
use crate::semantic::protocol::{Features, Notification, Request};

/// Buffered progress notifications per subscriber
const PROGRESS_CAPACITY: usize = 16;

struct Job {
    request: Request,
    reply: oneshot::Sender<Result<Features, EmbeddingError>>,
}

/// Cheap handle to the background model worker.
///
/// The worker thread exits once every handle is dropped.
pub struct LocalModelHandle {
    model_name: String,
    requests: mpsc::UnboundedSender<Job>,
    progress: broadcast::Sender<Notification>,
}

impl LocalModelHandle {
    /// Start the worker for `model_name`. The model itself is not loaded
    /// until the first request.
    pub fn spawn(model_name: &str, cache_dir: PathBuf) -> Result<Self, EmbeddingError> {
        let model = parse_model_name(model_name)?;
        let (requests, rx) = mpsc::unbounded_channel();
        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);

        let worker = Worker {
            model,
            model_name: model_name.to_string(),
            cache_dir,
            progress: progress.clone(),
            loaded: None,
        };

        std::thread::Builder::new()
            .name("semmark-local-model".to_string())
            .spawn(move || worker.run(rx))
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to start model worker: {}", e)))?;

        Ok(Self {
            model_name: model_name.to_string(),
            requests,
            progress,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Receive model load progress.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.progress.subscribe()
    }

    /// Embed each sentence; output is aligned with the input.
    pub async fn extract_features(&self, sentences: Vec<String>) -> Result<Features, EmbeddingError> {
        self.send(Request::ExtractFeatures { sentences }).await
    }

    async fn send(&self, request: Request) -> Result<Features, EmbeddingError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Job { request, reply })
            .map_err(|_| EmbeddingError::EmbeddingFailed("local model worker stopped".to_string()))?;

        response
            .await
            .map_err(|_| EmbeddingError::EmbeddingFailed("local model worker dropped the request".to_string()))?
    }
}

struct Worker {
    model: fastembed::EmbeddingModel,
    model_name: String,
    cache_dir: PathBuf,
    progress: broadcast::Sender<Notification>,
    loaded: Option<TextEmbedding>,
}

impl Worker {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = rx.blocking_recv() {
            let result = self.handle(job.request);
            // the caller may have given up waiting
            let _ = job.reply.send(result);
        }
        log::debug!("local model worker for '{}' stopped", self.model_name);
    }

    fn handle(&mut self, request: Request) -> Result<Features, EmbeddingError> {
        match request {
            Request::ExtractFeatures { sentences } => {
                if sentences.is_empty() {
                    return Ok(vec![]);
                }

                let model = self.ensure_loaded()?;
                model
                    .embed(sentences, None)
                    .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))
            }
        }
    }

    fn ensure_loaded(&mut self) -> Result<&mut TextEmbedding, EmbeddingError> {
        if self.loaded.is_none() {
            self.loaded = Some(self.load()?);
        }

        self.loaded
            .as_mut()
            .ok_or_else(|| EmbeddingError::InitFailed("model not loaded".to_string()))
    }

    fn load(&self) -> Result<TextEmbedding, EmbeddingError> {
        self.notify(format!("loading {}", self.model_name));
        log::info!("Initializing local embedding model '{}'", self.model_name);

        let result = std::fs::create_dir_all(&self.cache_dir)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e)))
            .and_then(|_| {
                let options = InitOptions::new(self.model.clone())
                    .with_cache_dir(self.cache_dir.clone())
                    .with_show_download_progress(false);

                TextEmbedding::try_new(options).map_err(|e| EmbeddingError::InitFailed(e.to_string()))
            });

        match &result {
            Ok(_) => self.notify("ready"),
            Err(e) => {
                log::error!("Failed to load local model '{}': {}", self.model_name, e);
                self.notify(format!("failed: {}", e));
            }
        }

        result
    }

    fn notify(&self, progress: impl Into<String>) {
        // no subscribers is fine
        let _ = self.progress.send(Notification::progress(progress));
    }
}

/// Parse model name string to fastembed enum.
///
/// Only multilingual-capable sentence models plus two small English
/// models are offered.
fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
    match name.to_lowercase().as_str() {
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "paraphrase-multilingual-minilm-l12-v2" => {
            Ok(fastembed::EmbeddingModel::ParaphraseMLMiniLML12V2)
        }
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        _ => Err(EmbeddingError::InvalidModel(format!(
            "Unknown model: {}. Supported models: multilingual-e5-small, multilingual-e5-base, paraphrase-multilingual-minilm-l12-v2, all-minilm-l6-v2, bge-small-en-v1.5",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_model_name() {
        let result = LocalModelHandle::spawn("nonexistent-model", std::env::temp_dir());
        assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
    }

    #[test]
    fn test_model_names_case_insensitive() {
        assert!(parse_model_name("Multilingual-E5-Small").is_ok());
        assert!(parse_model_name("paraphrase-multilingual-minilm-l12-v2").is_ok());
    }

    #[tokio::test]
    async fn test_empty_request_does_not_load_model() {
        let dir = tempfile::tempdir().unwrap();
        let handle = LocalModelHandle::spawn("multilingual-e5-small", dir.path().join("models")).unwrap();
        let mut progress = handle.subscribe();

        let features = handle.extract_features(vec![]).await.unwrap();

        assert!(features.is_empty());
        assert!(progress.try_recv().is_err());
        assert!(!dir.path().join("models").exists());
    }

    #[tokio::test]
    #[ignore = "requires model download"]
    async fn test_loads_once_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let handle = LocalModelHandle::spawn("multilingual-e5-small", dir.path().join("models")).unwrap();
        let mut progress = handle.subscribe();

        let first = handle
            .extract_features(vec!["Rust 编程语言".to_string(), "Go tutorial".to_string()])
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].len(), 384);

        assert_eq!(
            progress.recv().await.unwrap(),
            Notification::progress("loading multilingual-e5-small")
        );
        assert_eq!(progress.recv().await.unwrap(), Notification::progress("ready"));

        handle.extract_features(vec!["again".to_string()]).await.unwrap();
        assert!(progress.try_recv().is_err());
    }
}
