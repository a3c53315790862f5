//! The 0x20-byte-header-plus-payload container chunk.

use std::fmt::{Display, Formatter};
use std::io::Cursor;

use binrw::{binrw, BinReaderExt, BinWriterExt};
use encoding_rs::Encoding;

use crate::error::UsmError;
use crate::page::{get_pages, pack_pages, UsmPage};
use crate::tools::{align_padding, bytes_to_hex, SECTOR_SIZE};

pub const CHUNK_HEADER_SIZE: usize = 0x20;

/// The four ASCII bytes that open every chunk.
#[binrw]
#[brw(big)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChunkType {
    #[brw(magic = b"CRID")]
    Info,
    #[brw(magic = b"@SFV")]
    Video,
    #[brw(magic = b"@SFA")]
    Audio,
    #[brw(magic = b"@ALP")]
    Alpha,
    #[brw(magic = b"@SBT")]
    Subtitle,
    #[brw(magic = b"@CUE")]
    Cue,
    // Rare chunk types seen in the wild.
    #[brw(magic = b"SFSH")]
    Sfsh,
    #[brw(magic = b"@AHX")]
    Ahx,
    #[brw(magic = b"@USR")]
    Usr,
    #[brw(magic = b"@PST")]
    Pst,
}

impl ChunkType {
    pub fn tag(&self) -> &'static [u8; 4] {
        match self {
            ChunkType::Info => b"CRID",
            ChunkType::Video => b"@SFV",
            ChunkType::Audio => b"@SFA",
            ChunkType::Alpha => b"@ALP",
            ChunkType::Subtitle => b"@SBT",
            ChunkType::Cue => b"@CUE",
            ChunkType::Sfsh => b"SFSH",
            ChunkType::Ahx => b"@AHX",
            ChunkType::Usr => b"@USR",
            ChunkType::Pst => b"@PST",
        }
    }

    /// The tag as a big-endian integer, as stored in directory pages'
    /// `stmid` element.
    pub fn to_int(&self) -> u32 {
        u32::from_be_bytes(*self.tag())
    }
}

impl Display for ChunkType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(std::str::from_utf8(self.tag()).expect("tags are ASCII"))
    }
}

/// Stored in the low two bits of header byte 0x0F.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PayloadType {
    Stream = 0,
    Header = 1,
    SectionEnd = 2,
    Metadata = 3,
}

impl PayloadType {
    fn from_low_bits(value: u8) -> Self {
        match value & 0x3 {
            0 => PayloadType::Stream,
            1 => PayloadType::Header,
            2 => PayloadType::SectionEnd,
            _ => PayloadType::Metadata,
        }
    }
}

#[binrw]
#[brw(big)]
struct ChunkHeader {
    chunk_type: ChunkType,
    /// 0x18 + payload length + padding; everything after byte 0x08.
    chunk_size: u32,
    #[brw(pad_before = 1)]
    payload_offset: u8,
    padding_size: u16,
    channel_number: u8,
    #[brw(pad_before = 2)]
    payload_type: u8,
    frame_time: u32,
    #[brw(pad_after = 8)]
    frame_rate: u32,
}

/// Raw bytes for stream payloads and section-end banners, a decoded
/// page table for everything that starts with `@UTF`.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkPayload {
    Bytes(Vec<u8>),
    Pages(Vec<UsmPage>),
}

impl ChunkPayload {
    pub fn pages(&self) -> Option<&[UsmPage]> {
        match self {
            ChunkPayload::Pages(pages) => Some(pages),
            ChunkPayload::Bytes(_) => None,
        }
    }

    fn packed(
        &self,
        encoding: &'static Encoding,
        string_padding: usize,
    ) -> Result<Vec<u8>, UsmError> {
        match self {
            ChunkPayload::Bytes(bytes) => Ok(bytes.clone()),
            ChunkPayload::Pages(pages) => pack_pages(pages, encoding, string_padding),
        }
    }
}

/// How much zero padding follows the payload when the chunk is packed.
#[derive(Debug, Copy, Clone)]
pub enum ChunkPadding {
    Fixed(u32),
    /// Pad the chunk out to the next CD sector boundary. Used for the
    /// top-level CRID chunk.
    ToSector,
    /// Metadata chunks pad to 0xF0 total, or the next 0x8 multiple once
    /// they outgrow that.
    Metadata,
}

impl ChunkPadding {
    fn size_for(&self, unpadded_size: usize) -> usize {
        match self {
            ChunkPadding::Fixed(size) => *size as usize,
            ChunkPadding::ToSector => align_padding(unpadded_size, SECTOR_SIZE),
            ChunkPadding::Metadata => {
                if unpadded_size <= 0xF0 {
                    0xF0 - unpadded_size
                } else {
                    align_padding(unpadded_size, 0x8)
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct UsmChunk {
    pub chunk_type: ChunkType,
    pub payload_type: PayloadType,
    pub payload: ChunkPayload,
    pub frame_rate: u32,
    pub frame_time: u32,
    pub padding: ChunkPadding,
    pub channel_number: u8,
    /// Distance from header byte 0x08 to the payload; 0x18 in practice.
    pub payload_offset: u8,
    /// Extra NUL bytes appended to a page payload's string pool. The
    /// top-level directory table carries 5 of them.
    pub string_padding: usize,
    pub encoding: &'static Encoding,
}

impl UsmChunk {
    pub fn new(
        chunk_type: ChunkType,
        payload_type: PayloadType,
        payload: ChunkPayload,
        encoding: &'static Encoding,
    ) -> Self {
        Self {
            chunk_type,
            payload_type,
            payload,
            frame_rate: 30,
            frame_time: 0,
            padding: ChunkPadding::Fixed(0),
            channel_number: 0,
            payload_offset: 0x18,
            string_padding: 0,
            encoding,
        }
    }

    pub fn with_frame(mut self, frame_time: u32, frame_rate: u32) -> Self {
        self.frame_time = frame_time;
        self.frame_rate = frame_rate;
        self
    }

    pub fn with_padding(mut self, padding: ChunkPadding) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_channel(mut self, channel_number: u8) -> Self {
        self.channel_number = channel_number;
        self
    }

    pub fn with_string_padding(mut self, string_padding: usize) -> Self {
        self.string_padding = string_padding;
        self
    }

    /// Payload length and padding length from a peeked 0x20-byte header,
    /// without touching the payload itself.
    pub fn peek_size_and_padding(header: &[u8]) -> Result<(usize, usize), UsmError> {
        let header = Self::parse_header(header)?;
        let payload_size = payload_size_of(&header)?;
        Ok((payload_size, header.padding_size as usize))
    }

    fn parse_header(data: &[u8]) -> Result<ChunkHeader, UsmError> {
        Cursor::new(data).read_be().map_err(|e| {
            if matches!(
                crate::error::binrw_root_cause(&e),
                binrw::Error::NoVariantMatch { .. } | binrw::Error::EnumErrors { .. }
            ) {
                UsmError::UnknownChunkKind(bytes_to_hex(&data[..data.len().min(4)]))
            } else {
                UsmError::BinRW("Couldn't read chunk header".into(), e)
            }
        })
    }

    /// Decode a chunk from a buffer holding the header and at least the
    /// payload (trailing padding may be absent). Payloads that open with
    /// `@UTF` are decoded into pages.
    pub fn from_bytes(data: &[u8], encoding: &'static Encoding) -> Result<UsmChunk, UsmError> {
        let header = Self::parse_header(data)?;
        let payload_size = payload_size_of(&header)?;
        let payload_type = PayloadType::from_low_bits(header.payload_type);

        log::debug!(
            "UsmChunk: type: {}, chunk size: {:#x}, payload offset: {:#x}, \
             padding: {:#x}, chno: {}, payload type: {:?}, frame time: {:#x}, frame rate: {}",
            header.chunk_type,
            header.chunk_size,
            header.payload_offset,
            header.padding_size,
            header.channel_number,
            payload_type,
            header.frame_time,
            header.frame_rate,
        );

        let payload_begin = 0x8 + header.payload_offset as usize;
        let payload_bytes = data
            .get(payload_begin..payload_begin + payload_size)
            .ok_or_else(|| {
                UsmError::CorruptChunk(format!(
                    "Chunk claims {:#x} payload bytes but only {:#x} given",
                    payload_size,
                    data.len().saturating_sub(payload_begin),
                ))
            })?;

        let payload = if payload_bytes.starts_with(b"@UTF") {
            ChunkPayload::Pages(get_pages(payload_bytes, encoding)?)
        } else {
            ChunkPayload::Bytes(payload_bytes.to_vec())
        };

        Ok(UsmChunk {
            chunk_type: header.chunk_type,
            payload_type,
            payload,
            frame_rate: header.frame_rate,
            frame_time: header.frame_time,
            padding: ChunkPadding::Fixed(header.padding_size as u32),
            channel_number: header.channel_number,
            payload_offset: header.payload_offset,
            string_padding: 0,
            encoding,
        })
    }

    /// The padding this chunk will carry once packed.
    pub fn padding_size(&self) -> Result<usize, UsmError> {
        let payload = self.payload.packed(self.encoding, self.string_padding)?;
        Ok(self.padding.size_for(CHUNK_HEADER_SIZE + payload.len()))
    }

    /// Total packed length, padding included.
    pub fn packed_len(&self) -> Result<usize, UsmError> {
        let payload = self.payload.packed(self.encoding, self.string_padding)?;
        let padding = self.padding.size_for(CHUNK_HEADER_SIZE + payload.len());
        Ok(CHUNK_HEADER_SIZE + payload.len() + padding)
    }

    pub fn pack(&self) -> Result<Vec<u8>, UsmError> {
        let payload = self.payload.packed(self.encoding, self.string_padding)?;
        let padding = self.padding.size_for(CHUNK_HEADER_SIZE + payload.len());

        let header = ChunkHeader {
            chunk_type: self.chunk_type,
            chunk_size: (0x18 + payload.len() + padding) as u32,
            payload_offset: 0x18,
            padding_size: padding as u16,
            channel_number: self.channel_number,
            payload_type: self.payload_type as u8,
            frame_time: self.frame_time,
            frame_rate: self.frame_rate,
        };

        let mut result = Cursor::new(Vec::with_capacity(CHUNK_HEADER_SIZE + payload.len() + padding));
        result
            .write_be(&header)
            .map_err(|e| UsmError::BinRW("Couldn't write chunk header".into(), e))?;
        let mut result = result.into_inner();
        result.extend_from_slice(&payload);
        result.extend(std::iter::repeat(0u8).take(padding));
        Ok(result)
    }
}

fn payload_size_of(header: &ChunkHeader) -> Result<usize, UsmError> {
    (header.chunk_size as usize)
        .checked_sub(header.payload_offset as usize + header.padding_size as usize)
        .ok_or_else(|| {
            UsmError::CorruptChunk(format!(
                "Negative payload size: chunk size {:#x}, payload offset {:#x}, padding {:#x}",
                header.chunk_size, header.payload_offset, header.padding_size,
            ))
        })
}

/// Check the first four bytes of a file for the top-level chunk magic.
pub fn is_usm(magic: &[u8]) -> bool {
    magic.len() >= 4 && &magic[..4] == b"CRID"
}

#[cfg(test)]
mod chunk_tests {
    use super::*;
    use crate::page::Element;
    use encoding_rs::UTF_8;

    #[test]
    fn stream_chunk_round_trip() {
        let payload: Vec<u8> = (0..0x30u8).collect();
        let chunk = UsmChunk::new(
            ChunkType::Video,
            PayloadType::Stream,
            ChunkPayload::Bytes(payload.clone()),
            UTF_8,
        )
        .with_frame(999, 3000)
        .with_padding(ChunkPadding::Fixed(0x10))
        .with_channel(2);

        let packed = chunk.pack().unwrap();
        assert_eq!(packed.len(), 0x60);
        assert_eq!(&packed[..4], b"@SFV");

        let decoded = UsmChunk::from_bytes(&packed, UTF_8).unwrap();
        assert_eq!(decoded.chunk_type, ChunkType::Video);
        assert_eq!(decoded.payload_type, PayloadType::Stream);
        assert_eq!(decoded.payload, ChunkPayload::Bytes(payload));
        assert_eq!(decoded.frame_time, 999);
        assert_eq!(decoded.frame_rate, 3000);
        assert_eq!(decoded.channel_number, 2);
        assert!(matches!(decoded.padding, ChunkPadding::Fixed(0x10)));
    }

    #[test]
    fn peeked_sizes_match_packed_layout() {
        let chunk = UsmChunk::new(
            ChunkType::Audio,
            PayloadType::Stream,
            ChunkPayload::Bytes(vec![7; 0x25]),
            UTF_8,
        )
        .with_padding(ChunkPadding::Fixed(0x1B));

        let packed = chunk.pack().unwrap();
        let (payload_size, padding) =
            UsmChunk::peek_size_and_padding(&packed[..CHUNK_HEADER_SIZE]).unwrap();
        assert_eq!(payload_size, 0x25);
        assert_eq!(padding, 0x1B);
        assert_eq!(packed.len(), CHUNK_HEADER_SIZE + payload_size + padding);
    }

    #[test]
    fn page_payload_round_trip() {
        let mut page = UsmPage::new("VIDEO_HDRINFO");
        page.update("width", Element::I32(640));
        page.update("height", Element::I32(480));

        let chunk = UsmChunk::new(
            ChunkType::Video,
            PayloadType::Header,
            ChunkPayload::Pages(vec![page.clone()]),
            UTF_8,
        )
        .with_padding(ChunkPadding::Fixed(0x18));

        let packed = chunk.pack().unwrap();
        let decoded = UsmChunk::from_bytes(&packed, UTF_8).unwrap();
        assert_eq!(decoded.payload, ChunkPayload::Pages(vec![page]));
        assert_eq!(decoded.payload_type, PayloadType::Header);
    }

    #[test]
    fn sector_padding_for_info_chunks() {
        let chunk = UsmChunk::new(
            ChunkType::Info,
            PayloadType::Header,
            ChunkPayload::Bytes(vec![0; 0x100]),
            UTF_8,
        )
        .with_padding(ChunkPadding::ToSector);

        assert_eq!(chunk.packed_len().unwrap(), 0x800);
        assert_eq!(chunk.pack().unwrap().len(), 0x800);
    }

    #[test]
    fn metadata_padding_rule() {
        // Small tables pad out to 0xF0 total.
        assert_eq!(ChunkPadding::Metadata.size_for(0x6C), 0xF0 - 0x6C);
        // Larger ones align to 8.
        assert_eq!(ChunkPadding::Metadata.size_for(0xF1), 7);
        assert_eq!(ChunkPadding::Metadata.size_for(0xF8), 0);
    }

    #[test]
    fn unknown_signature_rejected() {
        let mut data = vec![0u8; 0x40];
        data[..4].copy_from_slice(b"XXXX");
        let result = UsmChunk::from_bytes(&data, UTF_8);
        assert!(matches!(result, Err(UsmError::UnknownChunkKind(_))));
    }

    #[test]
    fn negative_payload_rejected() {
        let chunk = UsmChunk::new(
            ChunkType::Video,
            PayloadType::Stream,
            ChunkPayload::Bytes(vec![0; 4]),
            UTF_8,
        );
        let mut packed = chunk.pack().unwrap();
        // Claim more padding than the chunk holds.
        packed[0xA..0xC].copy_from_slice(&0xFFFFu16.to_be_bytes());
        let result = UsmChunk::from_bytes(&packed, UTF_8);
        assert!(matches!(result, Err(UsmError::CorruptChunk(_))));
    }

    #[test]
    fn usm_magic_check() {
        assert!(is_usm(b"CRID"));
        assert!(!is_usm(b"CRI"));
        assert!(!is_usm(b"@SFV"));
    }
}
