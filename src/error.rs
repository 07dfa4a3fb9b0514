use crate::flash::FlashError;
use thiserror::Error;

/// Caller-visible store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No valid record matches the requested key and ordinal.
    #[error("key/index not found")]
    NotFound,
    /// The active region cannot fit the record even after compaction.
    #[error("insufficient free space")]
    NoSpace,
    #[error("flash error: {0}")]
    Flash(#[from] FlashError),
}
