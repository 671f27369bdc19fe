//! Shared data model for the capture host.
//!
//! The lock manager, the interval scheduler and the sync pipeline never
//! depend on each other's internals; they meet through the types here and
//! through the append-only [`AuditSink`].

pub mod artifact;
pub mod audit;
pub mod session;
pub mod upload;

pub use artifact::ArtifactRef;
pub use audit::AuditError;
pub use audit::AuditKind;
pub use audit::AuditOutcome;
pub use audit::AuditRecord;
pub use audit::AuditSink;
pub use audit::MemoryAuditSink;
pub use audit::UploadLedger;
pub use session::CaptureSession;
pub use session::InvalidTransition;
pub use session::ScheduledTick;
pub use session::SessionStatus;
pub use upload::TaskId;
pub use upload::UploadStatus;
pub use upload::UploadTask;
