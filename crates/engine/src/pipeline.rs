//! Fetch → extract → transform for one definition.
//!
//! The first failing stage short-circuits the run; its error is classified
//! into an [`ErrorKind`] for the run record.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::extract::{extract, ExtractionError};
use crate::fetch::{FetchError, Fetcher};
use crate::transform::{TransformError, Transformer};
use crate::types::{ErrorKind, SyncDefinition};

/// Error from the stage that stopped a run.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("FetchError: {0}")]
    Fetch(#[from] FetchError),

    #[error("ExtractionError: {0}")]
    Extract(#[from] ExtractionError),

    #[error("TransformError: {0}")]
    Transform(#[from] TransformError),
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(FetchError::InvalidRequest(_)) => ErrorKind::Configuration,
            Self::Fetch(_) => ErrorKind::Transient,
            Self::Extract(_) => ErrorKind::Configuration,
            Self::Transform(TransformError::Timeout(_) | TransformError::ResourceExceeded(_)) => {
                ErrorKind::ResourceExceeded
            }
            Self::Transform(_) => ErrorKind::Configuration,
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "fetch",
            Self::Extract(_) => "extract",
            Self::Transform(_) => "transform",
        }
    }
}

/// The three data stages of a run.
#[derive(Clone)]
pub struct Pipeline {
    fetcher: Arc<dyn Fetcher>,
    transformer: Transformer,
}

impl Pipeline {
    pub fn new(fetcher: Arc<dyn Fetcher>, transformer: Transformer) -> Self {
        Self {
            fetcher,
            transformer,
        }
    }

    pub fn transformer(&self) -> &Transformer {
        &self.transformer
    }

    pub async fn run(&self, definition: &SyncDefinition) -> Result<Value, StageError> {
        let raw = self.fetcher.fetch(&definition.request).await?;
        let extracted = extract(&raw, definition.extract_path.as_deref())?;
        let transformed = self
            .transformer
            .transform(extracted, definition.transform_script.as_deref())
            .await?;
        Ok(transformed)
    }
}

/// Leading `max_bytes` of the serialized payload, cut on a char boundary.
pub fn payload_sample(payload: &Value, max_bytes: usize) -> String {
    let mut text = payload.to_string();
    if text.len() > max_bytes {
        let mut cut = max_bytes;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    use crate::types::{CreateSyncDefinition, Frequency, Recurrence, RequestSpec};

    struct StaticFetcher(Result<Value, u16>);

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, _request: &RequestSpec) -> Result<Value, FetchError> {
            match &self.0 {
                Ok(v) => Ok(v.clone()),
                Err(status) => Err(FetchError::Status {
                    status: *status,
                    body: "down".into(),
                }),
            }
        }
    }

    fn definition(path: Option<&str>, script: Option<&str>) -> SyncDefinition {
        SyncDefinition::from_create(
            CreateSyncDefinition {
                tool_id: "fx".into(),
                name: None,
                request: RequestSpec::get("https://api.example.com/rates"),
                extract_path: path.map(String::from),
                transform_script: script.map(String::from),
                recurrence: Recurrence::fixed(Frequency::Hourly),
                is_active: true,
            },
            Utc::now(),
        )
    }

    fn pipeline(result: Result<Value, u16>) -> Pipeline {
        Pipeline::new(Arc::new(StaticFetcher(result)), Transformer::default())
    }

    #[tokio::test]
    async fn test_stages_compose() {
        let p = pipeline(Ok(json!({"data": {"rates": [{"v": 2}, {"v": 3}]}})));
        let out = p
            .run(&definition(Some("data.rates"), Some(r#"value | map(attribute="v") | sum"#)))
            .await
            .unwrap();
        assert_eq!(out, json!(5));
    }

    #[tokio::test]
    async fn test_fetch_failure_is_transient() {
        let err = pipeline(Err(502)).run(&definition(None, None)).await.unwrap_err();
        assert_eq!(err.stage(), "fetch");
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.to_string().starts_with("FetchError"));
    }

    #[tokio::test]
    async fn test_extraction_failure_is_configuration() {
        let err = pipeline(Ok(json!({"data": {"rates": []}})))
            .run(&definition(Some("data.rates[2].value"), None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("data.rates[2]"));
    }

    #[test]
    fn test_transform_error_classification() {
        assert_eq!(
            StageError::from(TransformError::Timeout(Duration::from_secs(2))).kind(),
            ErrorKind::ResourceExceeded
        );
        assert_eq!(
            StageError::from(TransformError::Runtime("boom".into())).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            StageError::from(FetchError::InvalidRequest("bad".into())).kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn test_payload_sample_cuts_on_char_boundary() {
        let value = json!("ééééé");
        // Serialized: "\"ééééé\"", each é is two bytes.
        let sample = payload_sample(&value, 4);
        assert_eq!(sample, "\"é");
        assert_eq!(payload_sample(&json!(1), 10), "1");
    }
}
