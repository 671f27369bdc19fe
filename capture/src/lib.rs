//! `cinepi-capture`: interval still capture on a single camera, guarded by
//! an exclusive device lock, with frames optionally synced to remote
//! storage.

pub mod cli;
pub mod config;
pub mod intake;
pub mod logging;
pub mod metadata;
pub mod naming;
pub mod session;
pub mod source;
pub mod storage;

pub use cli::Cli;
pub use session::run;
