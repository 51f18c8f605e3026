use thiserror::Error;

/// Errors that can occur while reading or writing framed binary data.
#[derive(Error, Debug)]
pub enum BinaryError {
    /// Not enough bytes remaining in the buffer for the requested read.
    #[error("not enough bytes in buffer: needed {needed}, remaining {remaining}")]
    UnexpectedEof { needed: usize, remaining: usize },

    /// A length-prefixed value (string, byte slice) declared a size that
    /// does not fit the target type or exceeds a sane limit.
    #[error("invalid length: {0}")]
    InvalidLength(usize),

    /// A string field did not contain valid UTF-8.
    #[error("invalid UTF-8 string data: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// Any other malformed field (bad discriminant, bad magic, etc).
    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, BinaryError>;
