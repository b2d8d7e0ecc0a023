//! HTTP transport using `reqwest`.
//!
//! Chunks go out as `multipart/form-data`, finalize as a JSON body. Every
//! request runs on its own spawned task so that dropping the caller's
//! future (pause, shutdown, a lost select) does not abort a request that
//! is already on the wire.

use std::future::Future;
use std::time::Duration;

use reelup_protocol::constants::fields;
use reelup_protocol::{ChunkUploadResponse, FinalizeRequest, FinalizeResponse};
use reqwest::header::{AUTHORIZATION, ETAG, HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use tracing::debug;

use crate::{ChunkUpload, TransportClient, TransportError, TransportFuture};

const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// Endpoint locations and request limits.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub base_url: String,
    pub chunk_path: String,
    pub finalize_path: String,
    /// Bound on a whole round trip, body included.
    pub timeout: Duration,
    /// Sent as `Authorization: Bearer <token>` when set.
    pub api_token: Option<String>,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            chunk_path: "/uploads/chunk".to_string(),
            finalize_path: "/uploads/finalize".to_string(),
            timeout: Duration::from_secs(60),
            api_token: None,
        }
    }
}

impl HttpTransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }
}

/// Upload endpoints reached over HTTP(S).
pub struct HttpTransport {
    http: reqwest::Client,
    chunk_url: String,
    finalize_url: String,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.api_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| TransportError::InvalidConfig("API token is not a valid header".into()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            http,
            chunk_url: config.url(&config.chunk_path),
            finalize_url: config.url(&config.finalize_path),
        })
    }
}

impl TransportClient for HttpTransport {
    fn upload_chunk(&self, chunk: &ChunkUpload) -> TransportFuture<'_, String> {
        let http = self.http.clone();
        let url = self.chunk_url.clone();
        let chunk = chunk.clone();

        Box::pin(keep_alive(async move {
            let index = chunk.chunk_index;
            let size = chunk.data.len();
            let part = Part::bytes(chunk.data)
                .file_name(format!("chunk-{index:08}"))
                .mime_str("application/octet-stream")
                .map_err(map_reqwest)?;
            let form = Form::new()
                .text(fields::TASK_ID, chunk.task_id.clone())
                .text(fields::CHUNK_INDEX, index.to_string())
                .text(fields::TOTAL_CHUNKS, chunk.total_chunks.to_string())
                .text(fields::CHECKSUM, chunk.checksum)
                .part(fields::CHUNK, part);

            let resp = http
                .post(&url)
                .multipart(form)
                .send()
                .await
                .map_err(map_reqwest)?;
            let status = resp.status();
            let header_etag = resp
                .headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim_matches('"').to_string());
            let body = resp.bytes().await.map_err(map_reqwest)?;

            if !status.is_success() {
                return Err(TransportError::from_status(
                    status.as_u16(),
                    String::from_utf8_lossy(&body),
                ));
            }

            let etag = parse_etag(&body, header_etag)?;
            debug!(task = %chunk.task_id, chunk = index, bytes = size, %etag, "chunk acknowledged");
            Ok(etag)
        }))
    }

    fn finalize(&self, request: &FinalizeRequest) -> TransportFuture<'_, FinalizeResponse> {
        let http = self.http.clone();
        let url = self.finalize_url.clone();
        let request = request.clone();

        Box::pin(keep_alive(async move {
            let resp = http
                .post(&url)
                .json(&request)
                .send()
                .await
                .map_err(map_reqwest)?;
            let status = resp.status();
            let body = resp.bytes().await.map_err(map_reqwest)?;

            if !status.is_success() {
                return Err(TransportError::from_status(
                    status.as_u16(),
                    String::from_utf8_lossy(&body),
                ));
            }
            if body.is_empty() {
                return Ok(FinalizeResponse(serde_json::Value::Null));
            }
            serde_json::from_slice(&body)
                .map_err(|e| TransportError::Protocol(format!("finalize response: {e}")))
        }))
    }
}

/// Runs `fut` detached from the caller; the caller only awaits the outcome.
async fn keep_alive<T, F>(fut: F) -> Result<T, TransportError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, TransportError>> + Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| TransportError::Network(format!("request task failed: {e}")))?
}

/// Reads the etag from the JSON body, falling back to the `ETag` header.
fn parse_etag(body: &[u8], header: Option<String>) -> Result<String, TransportError> {
    let from_body = serde_json::from_slice::<ChunkUploadResponse>(body)
        .ok()
        .map(|r| r.etag);
    from_body
        .or(header)
        .filter(|etag| !etag.is_empty())
        .ok_or_else(|| TransportError::Protocol("chunk response carries no etag".into()))
}

fn map_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_decode() {
        TransportError::Protocol(e.to_string())
    } else if e.is_builder() {
        TransportError::InvalidConfig(e.to_string())
    } else {
        TransportError::Network(e.to_string())
    }
}
