use thiserror::Error;

use crate::common::BlockNumber;

/// Errors surfaced by the trusted evaluator.
///
/// All variants are fatal to the current operation; there is no local
/// recovery. The session front door maps the outermost error to a return
/// code at the trust boundary.
#[derive(Error, Debug)]
pub enum SoeError {
    #[error("page cipher failure: {0}")]
    CryptoFault(String),

    #[error("block {blkno} beyond relation extent {nblocks}")]
    OutOfBounds { blkno: BlockNumber, nblocks: u32 },

    #[error("invalid state: {0}")]
    Invalid(String),

    #[error("tuple of {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    #[error("page full: {0}")]
    PageFull(String),

    #[error("host callback failed: {0}")]
    Host(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, SoeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SoeError::OutOfBounds {
            blkno: 9,
            nblocks: 4,
        };
        assert_eq!(err.to_string(), "block 9 beyond relation extent 4");
    }
}
