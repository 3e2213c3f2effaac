//! Crate-level error kinds.
//!
//! Components return these where callers need to match on kind (retry
//! vs. abort); `anyhow::Context` carries the human-readable message at
//! the CLI/orchestrator boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AirdumpError {
    #[error("GPS source unavailable: {0}")]
    GpsUnavailable(String),

    #[error("upstream capture daemon unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("failed to spawn capture tool: {0}")]
    CaptureSpawnFailure(String),

    #[error("store write failed (will retry/buffer): {0}")]
    StoreWriteTransient(String),

    #[error("store write fatal: {0}")]
    StoreWriteFatal(String),

    #[error("failed to restore interface to managed mode: {0}")]
    InterfaceRestoreFailed(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

/// Process exit codes per the external contract (§6.6).
pub mod exit_code {
    pub const CLEAN_STOP: i32 = 0;
    pub const CONFIG_OR_STORE_INIT_FAILURE: i32 = 2;
    pub const INTERFACE_RESTORE_FAILED: i32 = 3;
}
