//! Error types for codec operations

use thiserror::Error;

/// Errors reported by encoder and decoder entry points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SiameseError {
    /// Transient: the operation can succeed after more input arrives
    #[error("need more data before this operation can succeed")]
    NeedMoreData,

    /// The packet was already received or falls before the window
    #[error("duplicate data")]
    DuplicateData,

    /// Malformed wire data or out-of-range argument
    #[error("invalid input")]
    InvalidInput,

    /// Encoder window is at its hard packet cap
    #[error("encoder window is full")]
    WindowFull,

    /// Sticky failure state after an unrecoverable internal inconsistency
    #[error("codec is disabled after an unrecoverable failure")]
    Disabled,
}

/// Type alias for Result with SiameseError
pub type Result<T> = core::result::Result<T, SiameseError>;
