//! Messages exchanged with the background feature-extraction worker.
//!
//! The wire shape is a JSON object tagged by `action`:
//!
//! ```json
//! {"action": "extract_features", "sentences": ["..."]}
//! {"action": "update_model_init_progress", "progress": "ready"}
//! ```
//!
//! An `extract_features` request is answered with a list of vectors
//! aligned with `sentences`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    ExtractFeatures { sentences: Vec<String> },
}

/// Pushed to every listener without waiting for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Notification {
    UpdateModelInitProgress { progress: String },
}

impl Notification {
    pub fn progress(progress: impl Into<String>) -> Self {
        Notification::UpdateModelInitProgress {
            progress: progress.into(),
        }
    }
}

/// Reply to [`Request::ExtractFeatures`].
pub type Features = Vec<Vec<f32>>;
