use std::fmt::Display;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UsmError {
    #[error("Not a USM file: {0}")]
    InvalidMagic(String),
    #[error("Corrupt chunk: {0}")]
    CorruptChunk(String),
    #[error("Unknown chunk signature: {0}")]
    UnknownChunkKind(String),
    #[error("Invalid page table: {0}")]
    InvalidPageTable(String),
    #[error("No directory entry: {0}")]
    MissingDirectoryEntry(String),
    #[error("Format version not found: {0}")]
    MissingFormatVersion(String),
    #[error("Invalid cipher key: {0}")]
    InvalidKey(String),
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("{0}")]
    Custom(String),
    #[error("Additional context for error: {0}, {1}")]
    Usm(String, #[source] Box<UsmError>),
    #[error("I/O error: {0}, {1}")]
    Io(String, #[source] std::io::Error),
    #[error("binrw error: {0}, {1}")]
    BinRW(String, #[source] binrw::Error),
    #[error("FFMPEG failed: {0}")]
    FFMPEG(String),
}

impl UsmError {
    pub fn add_context(self, message: impl Into<String>) -> Self {
        Self::Usm(message.into(), Box::new(self))
    }

    pub fn custom<T: Display>(msg: T) -> Self {
        UsmError::Custom(msg.to_string())
    }
}

/// binrw wraps field errors in a backtrace; dig out the original so it
/// can be classified.
pub(crate) fn binrw_root_cause(error: &binrw::Error) -> &binrw::Error {
    match error {
        binrw::Error::Backtrace(backtrace) => &backtrace.error,
        other => other,
    }
}
