//! Store-level error type shared by quota and log backends.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("quota store error: {0}")]
    Quota(String),
    #[error("execution log error: {0}")]
    Log(String),
}
