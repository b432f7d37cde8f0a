//! REST implementation of [`RemoteSyncClient`].
//!
//! Endpoints, relative to the configured base URL:
//! - `PUT  /v1/messages/{id}` creates the document (`409 Conflict` means it
//!   already exists, which counts as success)
//! - `HEAD /v1/messages/{id}` answers `200` or `404`
//! - `POST /v1/blobs` takes raw bytes and answers `{"url": "..."}`

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use super::{RemoteError, RemoteMessage, RemoteSyncClient};

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: String,
}

/// HTTP client for the remote message store.
#[derive(Debug, Clone)]
pub struct HttpRemoteSync {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemoteSync {
    /// `timeout` bounds a single HTTP exchange; the outbox applies its own
    /// per-attempt timeout on top.
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn message_url(&self, id: Uuid) -> String {
        format!("{}/v1/messages/{}", self.base_url, id)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl RemoteSyncClient for HttpRemoteSync {
    async fn create(&self, message: &RemoteMessage) -> Result<(), RemoteError> {
        let response = self
            .authorize(self.client.put(self.message_url(message.id)))
            .json(message)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        debug!(msg_id = %message.id, status = %status, "create");

        if status.is_success() || status == StatusCode::CONFLICT {
            Ok(())
        } else {
            Err(classify_status(status))
        }
    }

    async fn exists(&self, id: Uuid) -> Result<bool, RemoteError> {
        let response = self
            .authorize(self.client.head(self.message_url(id)))
            .send()
            .await
            .map_err(classify_transport)?;

        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(classify_status(s)),
        }
    }

    async fn upload_blob(&self, bytes: Bytes) -> Result<String, RemoteError> {
        let size = bytes.len();
        let response = self
            .authorize(self.client.post(format!("{}/v1/blobs", self.base_url)))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status));
        }

        let body: UploadResponse = response.json().await.map_err(classify_transport)?;
        debug!(size, url = %body.url, "Uploaded blob");
        Ok(body.url)
    }
}

/// Map an HTTP status to a retry class.
pub fn classify_status(status: StatusCode) -> RemoteError {
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        RemoteError::Transient(format!("HTTP {status}"))
    } else {
        RemoteError::Permanent(format!("HTTP {status}"))
    }
}

/// Anything that went wrong on the wire is transient; only a request that
/// could not even be built is permanent.
fn classify_transport(e: reqwest::Error) -> RemoteError {
    if e.is_builder() {
        RemoteError::Permanent(e.to_string())
    } else {
        RemoteError::Transient(e.to_string())
    }
}
