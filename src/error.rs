use thiserror::Error;

/// Failure kinds the management surface needs to tell apart. Everything else
/// travels as `anyhow::Error` with context.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("task {0} not found")]
    NotFound(i64),

    #[error("task {0} is already running")]
    AlreadyRunning(i64),

    #[error("{0}")]
    InvalidInput(String),
}
