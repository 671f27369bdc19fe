//! HTTPS backend: object storage for artifacts plus an RPC endpoint for
//! audit events.

use crate::backend::{RemoteBackend, UploadRequest};
use crate::error::{RejectReason, RetryClassifiable, SyncError, UploadError};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use cinepi_protocol::AuditRecord;
use reqwest::{Client, StatusCode, header};
use serde::Serialize;
use std::time::Duration;

const AUDIT_RPC_PATH: &str = "rest/v1/rpc/log_storage_audit_event";

#[derive(Clone)]
pub struct HttpBackendConfig {
    pub base_url: String,
    pub bucket: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

pub struct HttpBackend {
    client: Client,
    config: HttpBackendConfig,
}

#[derive(Serialize)]
struct AuditEventBody<'a> {
    kind: &'a str,
    subject_id: &'a str,
    outcome: &'a str,
    details: &'a serde_json::Map<String, serde_json::Value>,
    timestamp: String,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self, SyncError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key).header("apikey", key),
            None => request,
        }
    }

    async fn post_audit(&self, record: &AuditRecord) -> Result<(), UploadError> {
        let body = AuditEventBody {
            kind: record.kind.as_str(),
            subject_id: &record.subject_id,
            outcome: record.outcome.as_str(),
            details: &record.details,
            timestamp: record.timestamp.to_rfc3339(),
        };
        let response = self
            .authorize(self.client.post(self.url(AUDIT_RPC_PATH)))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        check_response(response).await
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn upload(&self, request: &UploadRequest) -> Result<(), UploadError> {
        let url = self.url(&format!(
            "storage/v1/object/{}/{}",
            self.config.bucket,
            request.key.trim_start_matches('/')
        ));
        let mut builder = self
            .authorize(self.client.post(url))
            .header(header::CONTENT_TYPE, content_type_for(&request.key))
            .header("x-upsert", "false")
            .header("x-content-sha256", &request.content_hash)
            .header("x-content-size", request.size().to_string())
            .header("x-captured-at", request.captured_at.to_rfc3339());
        if let Some(tag) = &request.tag {
            builder = builder.header("x-capture-tag", tag);
        }

        let response = builder
            .body(request.body.clone())
            .send()
            .await
            .map_err(transport_error)?;
        check_response(response).await
    }

    /// Audit forwarding is retried briefly here; the local ledger already
    /// holds the record, so a final failure only loses the remote copy.
    async fn append_audit(&self, record: &AuditRecord) -> Result<(), UploadError> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(2)
            .with_jitter();
        (|| self.post_audit(record))
            .retry(backoff)
            .when(UploadError::is_retryable)
            .notify(|err, dur| {
                tracing::debug!(error = %err, retry_in_ms = dur.as_millis() as u64, "Retrying audit forward");
            })
            .await
    }
}

async fn check_response(response: reqwest::Response) -> Result<(), UploadError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, body, retry_after))
}

/// Map a non-success HTTP status onto the upload taxonomy.
pub fn classify_status(status: StatusCode, body: String, retry_after: Option<Duration>) -> UploadError {
    let message = if body.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {}", status.as_u16(), body.trim())
    };
    match status {
        StatusCode::CONFLICT => UploadError::rejected(RejectReason::Duplicate, message),
        StatusCode::PAYLOAD_TOO_LARGE | StatusCode::PAYMENT_REQUIRED | StatusCode::INSUFFICIENT_STORAGE => {
            UploadError::rejected(RejectReason::Quota, message)
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => UploadError::Transient { message, retry_after },
        s if s.is_server_error() => UploadError::Transient { message, retry_after },
        _ => UploadError::rejected(RejectReason::Validation, message),
    }
}

fn transport_error(err: reqwest::Error) -> UploadError {
    if err.is_builder() {
        UploadError::rejected(RejectReason::Validation, err.to_string())
    } else {
        UploadError::transient(err.to_string())
    }
}

fn content_type_for(key: &str) -> &'static str {
    let ext = key.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("dng") => "image/x-adobe-dng",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}
