use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsckError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Filesystem structure damaged beyond repair: {0}")]
    Corrupt(String),

    #[error("Block {addr} is outside the filesystem ({total} blocks)")]
    OutOfRange { addr: u64, total: u64 },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Check cancelled by user")]
    Canceled,

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, FsckError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read"))?;
            Ok(())
        }
        let err = fails().unwrap_err();
        assert!(matches!(err, FsckError::Io(_)));
        assert_eq!(err.to_string(), "IO error: short read");
    }

    #[test]
    fn test_out_of_range_message() {
        let err = FsckError::OutOfRange { addr: 900, total: 512 };
        assert_eq!(err.to_string(), "Block 900 is outside the filesystem (512 blocks)");
    }
}
