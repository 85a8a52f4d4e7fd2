use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChunkError>;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("out of memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    #[error("unsupported stream format version {0}")]
    UnsupportedVersion(u32),

    #[error("corrupt stream: {0}")]
    Corrupt(&'static str),

    #[error("utf-8 decoding failed: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}
