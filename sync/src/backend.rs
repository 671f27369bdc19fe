use crate::error::UploadError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cinepi_protocol::AuditRecord;

/// One upload call: the artifact bytes plus the metadata stored with them.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub key: String,
    pub body: Vec<u8>,
    pub content_hash: String,
    pub captured_at: DateTime<Utc>,
    pub tag: Option<String>,
}

impl UploadRequest {
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

/// Remote storage and audit service.
///
/// Both calls must be safe to repeat with the same content hash.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn upload(&self, request: &UploadRequest) -> Result<(), UploadError>;

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), UploadError>;
}
