//! Token-authenticated HTTP embedding providers.
//!
//! Both presets speak the same contract:
//! `POST {base_url}/v1/embeddings` with `Authorization: Bearer {token}`,
//! answered by `{"data": [{"embedding": [...]}, ...]}` in input order.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::config::ProviderKind;
use crate::semantic::embeddings::EmbeddingError;

/// Longest error body echoed back from a failing provider
const MAX_ERROR_BODY: usize = 200;

/// Fixed request parameters for one remote model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteModel {
    pub name: &'static str,
    pub task: Option<&'static str>,
    pub dimensions: Option<usize>,
    pub late_chunking: Option<bool>,
    pub embedding_type: Option<&'static str>,
}

impl RemoteModel {
    pub const JINA_EMBEDDINGS_V3: RemoteModel = RemoteModel {
        name: "jina-embeddings-v3",
        task: Some("text-matching"),
        dimensions: Some(1024),
        late_chunking: Some(false),
        embedding_type: Some("float"),
    };

    pub const OPENAI_ADA_002: RemoteModel = RemoteModel {
        name: "text-embedding-ada-002",
        task: None,
        dimensions: None,
        late_chunking: None,
        embedding_type: None,
    };

    pub fn for_kind(kind: ProviderKind) -> Option<RemoteModel> {
        match kind {
            ProviderKind::Jina => Some(Self::JINA_EMBEDDINGS_V3),
            ProviderKind::OpenAi => Some(Self::OPENAI_ADA_002),
            ProviderKind::Local | ProviderKind::Fallback => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    task: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    late_chunking: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    embedding_type: Option<&'a str>,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

pub struct RemoteProvider {
    kind: ProviderKind,
    base_url: String,
    token: Option<String>,
    model: RemoteModel,
    timeout: Duration,
    client: reqwest::Client,
}

impl RemoteProvider {
    pub fn new(
        kind: ProviderKind,
        base_url: String,
        token: Option<String>,
        model: RemoteModel,
        timeout: Duration,
        client: reqwest::Client,
    ) -> Self {
        Self {
            kind,
            base_url,
            token,
            model,
            timeout,
            client,
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn endpoint(&self) -> String {
        format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'))
    }

    pub async fn get_embedding(&self, input: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if input.is_empty() {
            return Ok(vec![]);
        }

        let token = self.token.as_deref().ok_or_else(|| {
            EmbeddingError::Authentication(format!("No {} API token configured", self.kind))
        })?;

        let body = EmbeddingRequest {
            model: self.model.name,
            task: self.model.task,
            dimensions: self.model.dimensions,
            late_chunking: self.model.late_chunking,
            embedding_type: self.model.embedding_type,
            input,
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(token)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.provider_error(format!("request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(EmbeddingError::Authentication(format!(
                "{} rejected the API token ({})",
                self.kind, status
            )));
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let text: String = text.chars().take(MAX_ERROR_BODY).collect();
            return Err(self.provider_error(format!("status {}: {}", status, text)));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| self.provider_error(format!("malformed response: {}", e)))?;

        self.align(parsed, input.len())
    }

    /// Order vectors by their `index` when the provider sends one and check
    /// there is exactly one non-empty vector per input.
    fn align(&self, response: EmbeddingResponse, expected: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut data = response.data;

        if data.len() != expected {
            return Err(self.provider_error(format!(
                "expected {} embeddings, got {}",
                expected,
                data.len()
            )));
        }

        if data.iter().all(|d| d.index.is_some()) {
            data.sort_by_key(|d| d.index);
            if data.iter().enumerate().any(|(i, d)| d.index != Some(i)) {
                return Err(self.provider_error("response indices do not match the input".to_string()));
            }
        }

        if data.iter().any(|d| d.embedding.is_empty()) {
            return Err(self.provider_error("response contains an empty embedding".to_string()));
        }

        Ok(data.into_iter().map(|d| d.embedding).collect())
    }

    fn provider_error(&self, message: String) -> EmbeddingError {
        EmbeddingError::Provider {
            provider: self.kind.to_string(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider(token: Option<&str>) -> RemoteProvider {
        RemoteProvider::new(
            ProviderKind::Jina,
            "http://127.0.0.1:9/".to_string(),
            token.map(str::to_string),
            RemoteModel::JINA_EMBEDDINGS_V3,
            Duration::from_secs(1),
            reqwest::Client::new(),
        )
    }

    #[test]
    fn test_jina_request_body() {
        let input = vec!["hello".to_string()];
        let model = RemoteModel::JINA_EMBEDDINGS_V3;
        let body = EmbeddingRequest {
            model: model.name,
            task: model.task,
            dimensions: model.dimensions,
            late_chunking: model.late_chunking,
            embedding_type: model.embedding_type,
            input: &input,
        };

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "model": "jina-embeddings-v3",
                "task": "text-matching",
                "dimensions": 1024,
                "late_chunking": false,
                "embedding_type": "float",
                "input": ["hello"]
            })
        );
    }

    #[test]
    fn test_openai_request_body_omits_unused_fields() {
        let input = vec!["a".to_string(), "b".to_string()];
        let model = RemoteModel::OPENAI_ADA_002;
        let body = EmbeddingRequest {
            model: model.name,
            task: model.task,
            dimensions: model.dimensions,
            late_chunking: model.late_chunking,
            embedding_type: model.embedding_type,
            input: &input,
        };

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"model": "text-embedding-ada-002", "input": ["a", "b"]})
        );
    }

    #[test]
    fn test_endpoint_strips_trailing_slash() {
        assert_eq!(provider(None).endpoint(), "http://127.0.0.1:9/v1/embeddings");
    }

    #[tokio::test]
    async fn test_missing_token_is_authentication_error() {
        let result = provider(None).get_embedding(&["x".to_string()]).await;
        assert!(matches!(result, Err(EmbeddingError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_empty_input_skips_request() {
        let result = provider(None).get_embedding(&[]).await.unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_align_reorders_by_index() {
        let response: EmbeddingResponse = serde_json::from_value(json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        }))
        .unwrap();

        let vectors = provider(None).align(response, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_align_rejects_count_mismatch() {
        let response: EmbeddingResponse =
            serde_json::from_value(json!({"data": [{"embedding": [1.0]}]})).unwrap();

        let result = provider(None).align(response, 2);
        assert!(matches!(result, Err(EmbeddingError::Provider { .. })));
    }

    #[test]
    fn test_align_rejects_empty_vector() {
        let response: EmbeddingResponse =
            serde_json::from_value(json!({"data": [{"embedding": []}]})).unwrap();

        let result = provider(None).align(response, 1);
        assert!(matches!(result, Err(EmbeddingError::Provider { .. })));
    }
}
