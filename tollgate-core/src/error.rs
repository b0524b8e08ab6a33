use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum TollgateError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TollgateError {
    /// True when the underlying store could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, TollgateError::Store(err) if err.is_unavailable())
    }
}

pub type Result<T> = std::result::Result<T, TollgateError>;
