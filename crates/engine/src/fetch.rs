//! Outbound HTTP fetch for a definition's request.
//!
//! Exactly one request per call, bounded by a fixed timeout and a response
//! size cap. Retries happen at the schedule granularity, never here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use thiserror::Error;

use crate::types::RequestSpec;

/// Max characters of a non-2xx body kept on the error.
const BODY_SNIPPET_CHARS: usize = 512;

/// Errors from a single fetch. Every variant except `InvalidRequest` is
/// transient.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("response exceeded {limit} bytes")]
    TooLarge { limit: usize },
}

/// Fetches the raw payload for a request.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &RequestSpec) -> Result<serde_json::Value, FetchError>;
}

/// Check method, URL and headers without sending anything.
pub fn validate_request(request: &RequestSpec) -> Result<(), FetchError> {
    parse_method(&request.method)?;
    let url = url::Url::parse(&request.url)
        .map_err(|e| FetchError::InvalidRequest(format!("invalid url '{}': {e}", request.url)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(FetchError::InvalidRequest(format!(
            "unsupported url scheme '{}'",
            url.scheme()
        )));
    }
    for (name, value) in &request.headers {
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| FetchError::InvalidRequest(format!("invalid header name '{name}'")))?;
        HeaderValue::from_str(value)
            .map_err(|_| FetchError::InvalidRequest(format!("invalid value for header '{name}'")))?;
    }
    Ok(())
}

fn parse_method(method: &str) -> Result<Method, FetchError> {
    method
        .trim()
        .to_uppercase()
        .parse::<Method>()
        .map_err(|_| FetchError::InvalidRequest(format!("invalid HTTP method: {method}")))
}

/// [`Fetcher`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_response_bytes: usize,
}

impl HttpFetcher {
    pub fn new(
        timeout: Duration,
        max_response_bytes: usize,
        user_agent: &str,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| FetchError::InvalidRequest(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            timeout,
            max_response_bytes,
        })
    }

    pub fn from_config(config: &feedsync_core::config::FetchConfig) -> Result<Self, FetchError> {
        Self::new(
            Duration::from_secs(config.timeout_secs),
            config.max_response_bytes,
            &config.user_agent,
        )
    }

    fn map_transport(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::Network(e.to_string())
        }
    }

    async fn read_capped(&self, mut response: reqwest::Response) -> Result<Vec<u8>, FetchError> {
        if let Some(len) = response.content_length() {
            if len as usize > self.max_response_bytes {
                return Err(FetchError::TooLarge {
                    limit: self.max_response_bytes,
                });
            }
        }
        let mut buf = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.map_transport(e))? {
            if buf.len() + chunk.len() > self.max_response_bytes {
                return Err(FetchError::TooLarge {
                    limit: self.max_response_bytes,
                });
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf)
    }

    /// Read only as much of an error body as the snippet can show.
    async fn read_snippet(&self, mut response: reqwest::Response) -> String {
        // A char is at most four UTF-8 bytes.
        let cap = (BODY_SNIPPET_CHARS * 4).min(self.max_response_bytes);
        let mut buf = Vec::new();
        while buf.len() < cap {
            match response.chunk().await {
                Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(_) if buf.is_empty() => return "<unreadable body>".to_string(),
                Err(_) => break,
            }
        }
        buf.truncate(cap);
        String::from_utf8_lossy(&buf)
            .chars()
            .take(BODY_SNIPPET_CHARS)
            .collect()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &RequestSpec) -> Result<serde_json::Value, FetchError> {
        validate_request(request)?;
        let method = parse_method(&request.method)?;

        let mut builder = self.client.request(method.clone(), &request.url);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            if method != Method::GET && method != Method::HEAD {
                builder = builder.json(body);
            }
        }

        let response = builder.send().await.map_err(|e| self.map_transport(e))?;
        let status = response.status();

        if !status.is_success() {
            let snippet = self.read_snippet(response).await;
            tracing::warn!(
                url = %request.url,
                %status,
                "fetch returned non-2xx status"
            );
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: snippet,
            });
        }

        let bytes = self.read_capped(response).await?;
        tracing::debug!(url = %request.url, bytes = bytes.len(), "fetch completed");

        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(value),
            // Plain-text feeds are passed through as a JSON string.
            Err(_) => Ok(serde_json::Value::String(
                String::from_utf8_lossy(&bytes).into_owned(),
            )),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fetcher(timeout_ms: u64, max_bytes: usize) -> HttpFetcher {
        HttpFetcher::new(Duration::from_millis(timeout_ms), max_bytes, "feedsync-test").unwrap()
    }

    #[tokio::test]
    async fn test_fetch_json_body() {
        let base = serve(Router::new().route(
            "/rates",
            get(|| async { Json(json!({"data": {"rates": [1, 2, 3]}})) }),
        ))
        .await;
        let value = fetcher(2000, 1024)
            .fetch(&RequestSpec::get(format!("{base}/rates")))
            .await
            .unwrap();
        assert_eq!(value["data"]["rates"][2], 3);
    }

    #[tokio::test]
    async fn test_fetch_sends_headers_and_body() {
        let base = serve(Router::new().route(
            "/echo",
            post(|headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                let key = headers
                    .get("x-api-key")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                Json(json!({"key": key, "body": body}))
            }),
        ))
        .await;
        let mut request = RequestSpec::get(format!("{base}/echo"));
        request.method = "post".into();
        request.headers.insert("X-Api-Key".into(), "secret".into());
        request.body = Some(json!({"symbols": ["EUR"]}));

        let value = fetcher(2000, 4096).fetch(&request).await.unwrap();
        assert_eq!(value["key"], "secret");
        assert_eq!(value["body"]["symbols"][0], "EUR");
    }

    #[tokio::test]
    async fn test_non_2xx_carries_status_and_snippet() {
        let long_body = "x".repeat(2000);
        let base = serve(Router::new().route(
            "/down",
            get(move || {
                let body = long_body.clone();
                async move { (StatusCode::SERVICE_UNAVAILABLE, body) }
            }),
        ))
        .await;
        let err = fetcher(2000, 4096)
            .fetch(&RequestSpec::get(format!("{base}/down")))
            .await
            .unwrap_err();
        match err {
            FetchError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body.chars().count(), BODY_SNIPPET_CHARS);
            }
            other => panic!("expected Status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_endless_error_body_is_read_bounded() {
        let base = serve(Router::new().route(
            "/flood",
            get(|| async {
                let flood = futures::stream::repeat_with(|| {
                    Ok::<_, std::io::Error>(axum::body::Bytes::from(vec![b'e'; 1024]))
                });
                (StatusCode::INTERNAL_SERVER_ERROR, axum::body::Body::from_stream(flood))
            }),
        ))
        .await;
        let started = std::time::Instant::now();
        let err = fetcher(5000, 1000)
            .fetch(&RequestSpec::get(format!("{base}/flood")))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
        match err {
            FetchError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "e".repeat(BODY_SNIPPET_CHARS));
            }
            other => panic!("expected Status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_distinct() {
        let base = serve(Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        ))
        .await;
        let err = fetcher(200, 1024)
            .fetch(&RequestSpec::get(format!("{base}/slow")))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = fetcher(2000, 1024)
            .fetch(&RequestSpec::get(format!("http://{addr}/")))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Network(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_oversized_response_rejected() {
        let base = serve(Router::new().route("/big", get(|| async { "y".repeat(10_000) })))
            .await;
        let err = fetcher(2000, 1000)
            .fetch(&RequestSpec::get(format!("{base}/big")))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TooLarge { limit: 1000 }));
    }

    #[tokio::test]
    async fn test_plain_text_becomes_string() {
        let base = serve(Router::new().route("/text", get(|| async { "1.0842" }))).await;
        let value = fetcher(2000, 1024)
            .fetch(&RequestSpec::get(format!("{base}/text")))
            .await
            .unwrap();
        // "1.0842" parses as a JSON number.
        assert_eq!(value, json!(1.0842));

        let base = serve(Router::new().route("/words", get(|| async { "EUR up" }))).await;
        let value = fetcher(2000, 1024)
            .fetch(&RequestSpec::get(format!("{base}/words")))
            .await
            .unwrap();
        assert_eq!(value, json!("EUR up"));
    }

    #[test]
    fn test_validate_request() {
        assert!(validate_request(&RequestSpec::get("https://api.example.com/x")).is_ok());
        assert!(validate_request(&RequestSpec::get("not a url")).is_err());
        assert!(validate_request(&RequestSpec::get("ftp://example.com/x")).is_err());

        let mut bad_method = RequestSpec::get("https://api.example.com");
        bad_method.method = "GE T".into();
        assert!(matches!(
            validate_request(&bad_method),
            Err(FetchError::InvalidRequest(_))
        ));

        let mut bad_header = RequestSpec::get("https://api.example.com");
        bad_header.headers.insert("bad header".into(), "v".into());
        assert!(validate_request(&bad_header).is_err());
    }
}
