//! Reading, writing, and transforming CRI Sofdec2 USM containers.

pub mod chunk;
pub mod cipher;
pub mod console;
pub mod error;
pub mod media;
pub mod page;
pub mod probe;
pub mod tools;
pub mod usm;

pub use encoding_rs::Encoding;

pub use crate::chunk::{is_usm, ChunkPayload, ChunkType, PayloadType, UsmChunk};
pub use crate::cipher::OpMode;
pub use crate::error::UsmError;
pub use crate::probe::Sofdec2Codec;
pub use crate::usm::{Usm, DEFAULT_FORMAT_VERSION};
