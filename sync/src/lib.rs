//! Reliable sync of captured artifacts to a remote storage backend.
//!
//! A bounded intake queue feeds a small worker pool. Failed attempts are
//! retried with capped exponential backoff plus jitter; every attempt is
//! audited before its task moves on, and uploads are deduplicated by
//! content hash against the audit ledger. Backlogs are processed in
//! chunks with a fail-fast ratio that stops a run during an outage.

mod backend;
mod error;
mod hash;
mod http;
mod key;
mod pipeline;
mod policy;

pub use backend::RemoteBackend;
pub use backend::UploadRequest;
pub use error::ErrorClass;
pub use error::RejectReason;
pub use error::RetryClassifiable;
pub use error::SyncError;
pub use error::UploadError;
pub use hash::content_hash;
pub use http::HttpBackend;
pub use http::HttpBackendConfig;
pub use http::classify_status;
pub use key::RemoteKey;
pub use key::remote_key_for;
pub use pipeline::BacklogReport;
pub use pipeline::PipelineConfig;
pub use pipeline::SyncPipeline;
pub use pipeline::SyncStatus;
pub use policy::RetryPolicy;
