//! Error taxonomy for the alarm engine core.
//!
//! Mirrors the taxonomy used throughout the component design: validation
//! errors are rejected at the CRUD boundary before anything is persisted,
//! store-transient errors are retried by the store itself, and store-fatal
//! errors are expected to bubble all the way up and trigger shutdown.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("store operation timed out or was busy after retries: {0}")]
    StoreTransient(#[source] sqlx::Error),

    #[error("unrecoverable store error: {0}")]
    StoreFatal(#[source] sqlx::Error),

    #[error("rule not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Classify a raw `sqlx::Error` into the transient/fatal split used by the
/// store's retry loop. Busy/locked conditions are transient; everything
/// else (corruption, IO, protocol errors) is treated as fatal.
pub fn classify_sqlx_error(err: sqlx::Error) -> EngineError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let is_busy = db_err
                .code()
                .map(|code| code == "5" || code == "6") // SQLITE_BUSY / SQLITE_LOCKED
                .unwrap_or(false);
            if is_busy {
                EngineError::StoreTransient(err)
            } else {
                EngineError::StoreFatal(err)
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => EngineError::StoreTransient(err),
        _ => EngineError::StoreFatal(err),
    }
}
