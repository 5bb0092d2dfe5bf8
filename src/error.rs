use thiserror::Error;

/// Stable numeric error codes.
///
/// These travel inside element envelopes (`err_code`) and are what the
/// application sees, so the values must never be renumbered.
pub mod err_code {
    pub const SUCCESS: u8 = 0;
    pub const FAIL: u8 = 1;
    pub const INVALID_ARG: u8 = 2;
    pub const ERR_PLAT: u8 = 3;
    pub const NO_MEM: u8 = 4;
    pub const INVALID_STATE: u8 = 5;
    pub const NOT_FOUND: u8 = 6;
    pub const NOT_SUPPORTED: u8 = 7;
    pub const TIMEOUT: u8 = 8;
    pub const NOT_ALLOWED: u8 = 9;
    pub const FULL: u8 = 10;
    pub const EMPTY: u8 = 11;
    pub const SIZE_MISMATCH: u8 = 12;
}

/// Process-wide error type for the MeshX core.
#[derive(Debug, Error)]
pub enum MeshxError {
    /// Generic failure with no better classification.
    #[error("operation failed: {0}")]
    Fail(String),

    /// Caller supplied malformed input.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// Operation not valid in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A fixed-capacity table or allocation could not hold the request.
    #[error("out of memory: {0}")]
    NoMem(String),

    /// Lookup missed.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    /// Operation expired before completion.
    #[error("timed out")]
    Timeout,

    /// Destination is not unicast, broadcast or a subscribed group.
    #[error("destination 0x{0:04x} not allowed for this model")]
    NotAllowed(u16),

    /// Queue stayed full for the whole send window.
    #[error("queue full")]
    Full,

    /// Queue stayed empty for the whole receive window.
    #[error("queue empty")]
    Empty,

    /// Stored blob length differs from the caller's buffer.
    #[error("size mismatch: stored {stored} bytes, buffer {buffer} bytes")]
    SizeMismatch { stored: usize, buffer: usize },

    /// Platform storage has no free pages left and must be erased.
    #[error("platform storage has no free pages")]
    NoFreePages,

    /// Wrapped error from the mesh stack or another platform service.
    #[error("platform error: {0}")]
    Platform(String),

    /// Wrapper around sled's error type.
    #[error("sled error: {0}")]
    Storage(#[from] sled::Error),

    /// Wrapper around bincode serialization and deserialization errors.
    #[error("serialization error: {0}")]
    Codec(#[from] bincode::Error),

    /// Wrapper around IO errors (directory creation, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshxError {
    /// Numeric code as carried in `err_code` envelope fields.
    pub fn code(&self) -> u8 {
        match self {
            MeshxError::Fail(_) => err_code::FAIL,
            MeshxError::InvalidArg(_) => err_code::INVALID_ARG,
            MeshxError::InvalidState(_) => err_code::INVALID_STATE,
            MeshxError::NoMem(_) => err_code::NO_MEM,
            MeshxError::NotFound(_) => err_code::NOT_FOUND,
            MeshxError::NotSupported(_) => err_code::NOT_SUPPORTED,
            MeshxError::Timeout => err_code::TIMEOUT,
            MeshxError::NotAllowed(_) => err_code::NOT_ALLOWED,
            MeshxError::Full => err_code::FULL,
            MeshxError::Empty => err_code::EMPTY,
            MeshxError::SizeMismatch { .. } => err_code::SIZE_MISMATCH,
            MeshxError::NoFreePages
            | MeshxError::Platform(_)
            | MeshxError::Storage(_)
            | MeshxError::Codec(_)
            | MeshxError::Io(_) => err_code::ERR_PLAT,
        }
    }

    pub(crate) fn invalid_arg(msg: impl Into<String>) -> Self {
        MeshxError::InvalidArg(msg.into())
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        MeshxError::InvalidState(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, MeshxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_code_is_stable() {
        assert_eq!(MeshxError::Timeout.code(), 8);
        assert_eq!(MeshxError::NotAllowed(0xC001).code(), err_code::NOT_ALLOWED);
    }

    #[test]
    fn wrapped_errors_report_platform_code() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(MeshxError::from(io).code(), err_code::ERR_PLAT);
        assert_eq!(MeshxError::NoFreePages.code(), err_code::ERR_PLAT);
    }
}
