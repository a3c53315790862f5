use std::fs::File;
use std::io::Read;
use std::path::Path;

use binrw::{binread, BinReaderExt};

use crate::error::UsmError;
use crate::media::tools::{create_audio_crid_page, create_audio_header_page, AudioCodec};
use crate::media::{UsmAudio, UsmMedia};
use crate::page::UsmPage;

pub type AudioPacketStream = Box<dyn Iterator<Item = Result<Vec<u8>, UsmError>> + Send>;

/// Generic audio channel, the audio counterpart of
/// [GenericVideo](crate::media::GenericVideo).
pub struct GenericAudio {
    stream: AudioPacketStream,
    crid_page: UsmPage,
    header_page: UsmPage,
    length: usize,
    channel_number: u8,
    metadata_pages: Option<Vec<UsmPage>>,
}

impl GenericAudio {
    pub fn new(
        stream: AudioPacketStream,
        crid_page: UsmPage,
        header_page: UsmPage,
        length: usize,
        channel_number: u8,
        metadata_pages: Option<Vec<UsmPage>>,
    ) -> Self {
        Self {
            stream,
            crid_page,
            header_page,
            length,
            channel_number,
            metadata_pages,
        }
    }
}

impl UsmMedia for GenericAudio {
    fn crid_page(&self) -> &UsmPage {
        &self.crid_page
    }

    fn header_page(&self) -> &UsmPage {
        &self.header_page
    }

    fn metadata_pages(&self) -> Option<&[UsmPage]> {
        self.metadata_pages.as_deref()
    }

    fn channel_number(&self) -> u8 {
        self.channel_number
    }

    fn num_packets(&self) -> usize {
        self.length
    }
}

impl UsmAudio for GenericAudio {
    fn next_packet(&mut self) -> Option<Result<Vec<u8>, UsmError>> {
        self.stream.next()
    }
}

// Sizing constants lifted from observed HCA-bearing containers.
// TODO: derive metadata_size and ixsize from the bitstream instead of
// trusting these two values.
const HCA_METADATA_SIZE: i32 = 256;
const HCA_IXSIZE: i32 = 27860;

const HCA_MINBUF_FACTOR: f64 = 54.4140625;
const HCA_AVBPS_FACTOR: f64 = 0.0399607;

/// An HCA audio channel. Reads just enough of the `HCA`/`fmt`/`comp`
/// blocks to size packets and fill the header page; the bitstream
/// itself is carried through untouched.
pub struct Hca {
    inner: GenericAudio,
}

impl Hca {
    pub fn new(
        path: impl AsRef<Path>,
        channel_number: u8,
        format_version: i32,
    ) -> Result<Self, UsmError> {
        let path = path.as_ref();
        let mut file =
            File::open(path).map_err(|e| UsmError::Io("Couldn't open audio file".into(), e))?;
        let metadata: HcaMetadata = file
            .read_be()
            .map_err(|e| UsmError::BinRW("Couldn't read HCA header blocks".into(), e))?;

        let filesize = std::fs::metadata(path)
            .map_err(|e| UsmError::Io("Couldn't stat audio file".into(), e))?
            .len();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let frame_size = metadata.comp.frame_size as f64;
        let frame_count = metadata.format.frame_count;
        let minbuf = (frame_size * HCA_MINBUF_FACTOR).ceil() as i32;
        let avbps = (HCA_AVBPS_FACTOR * frame_count as f64 * frame_size).round() as i32;

        let crid_page = create_audio_crid_page(
            &filename,
            filesize as i32,
            format_version,
            channel_number,
            minbuf,
            avbps,
        );
        let header_page = create_audio_header_page(
            AudioCodec::Hca,
            metadata.format.sample_rate as i32,
            metadata.format.channel_count as i32,
            1,
            HCA_METADATA_SIZE,
            HCA_IXSIZE,
        );

        let file = File::open(path)
            .map_err(|e| UsmError::Io("Couldn't reopen audio file".into(), e))?;
        Ok(Self {
            inner: GenericAudio::new(
                Box::new(HcaPacketReader {
                    file,
                    header_done: false,
                    remaining_frames: frame_count,
                    frame_size: metadata.comp.frame_size as usize,
                }),
                crid_page,
                header_page,
                frame_count as usize + 1,
                channel_number,
                None,
            ),
        })
    }
}

impl UsmMedia for Hca {
    fn crid_page(&self) -> &UsmPage {
        self.inner.crid_page()
    }

    fn header_page(&self) -> &UsmPage {
        self.inner.header_page()
    }

    fn metadata_pages(&self) -> Option<&[UsmPage]> {
        self.inner.metadata_pages()
    }

    fn channel_number(&self) -> u8 {
        self.inner.channel_number()
    }

    fn num_packets(&self) -> usize {
        self.inner.num_packets()
    }
}

impl UsmAudio for Hca {
    fn next_packet(&mut self) -> Option<Result<Vec<u8>, UsmError>> {
        self.inner.next_packet()
    }
}

/// The first packet carries the 0x60-byte file header, then one packet
/// per HCA frame.
struct HcaPacketReader {
    file: File,
    header_done: bool,
    remaining_frames: u32,
    frame_size: usize,
}

impl Iterator for HcaPacketReader {
    type Item = Result<Vec<u8>, UsmError>;

    fn next(&mut self) -> Option<Self::Item> {
        let size = if !self.header_done {
            self.header_done = true;
            0x60
        } else if self.remaining_frames > 0 {
            self.remaining_frames -= 1;
            self.frame_size
        } else {
            return None;
        };

        let mut packet = vec![0u8; size];
        match self.file.read_exact(&mut packet) {
            Ok(()) => Some(Ok(packet)),
            Err(e) => {
                self.remaining_frames = 0;
                Some(Err(UsmError::Io("Couldn't read audio packet".into(), e)))
            }
        }
    }
}

#[binread]
#[derive(Debug)]
#[br(big, magic = b"HCA\0")]
struct HcaBlock {
    #[br(temp)]
    _version_major: u8,
    #[br(temp)]
    _version_minor: u8,
    #[br(temp)]
    _header_size: u16,
}

#[binread]
#[derive(Debug)]
#[br(big, magic = b"fmt\0")]
struct FormatBlock {
    channel_count: u8,
    #[br(map = |raw: [u8; 3]| u32::from_be_bytes([0, raw[0], raw[1], raw[2]]))]
    sample_rate: u32,
    frame_count: u32,
    #[br(temp)]
    _inserted_samples: u16,
    #[br(temp)]
    _appended_samples: u16,
}

#[binread]
#[derive(Debug)]
#[br(big, magic = b"comp")]
struct CompBlock {
    frame_size: u16,
    #[br(temp)]
    _min_resolution: i8,
    #[br(temp)]
    _max_resolution: i8,
    #[br(temp)]
    _track_count: i8,
    #[br(temp)]
    _channel_config: i8,
    #[br(temp)]
    _total_band_count: u8,
    #[br(temp)]
    _base_band_count: u8,
    #[br(temp)]
    _stereo_band_count: u8,
    #[br(temp)]
    _bands_per_hfr_group: u8,
    #[br(temp)]
    _reserved1: i8,
    #[br(temp)]
    _reserved2: i8,
}

#[binread]
#[derive(Debug)]
#[br(big)]
struct HcaMetadata {
    #[br(temp)]
    _hca: HcaBlock,
    format: FormatBlock,
    comp: CompBlock,
}

#[cfg(test)]
mod audio_tests {
    use super::*;
    use std::io::Cursor;

    fn synthetic_hca_header() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"HCA\0");
        data.extend_from_slice(&[2, 0]);
        data.extend_from_slice(&0x60u16.to_be_bytes());

        data.extend_from_slice(b"fmt\0");
        data.push(2);
        data.extend_from_slice(&[0x00, 0xAC, 0x44]); // 44100 as 24-bit
        data.extend_from_slice(&1200u32.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());

        data.extend_from_slice(b"comp");
        data.extend_from_slice(&0x300u16.to_be_bytes());
        data.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        data
    }

    #[test]
    fn hca_blocks_parsed() {
        let metadata: HcaMetadata = Cursor::new(synthetic_hca_header()).read_be().unwrap();
        assert_eq!(metadata.format.channel_count, 2);
        assert_eq!(metadata.format.sample_rate, 44100);
        assert_eq!(metadata.format.frame_count, 1200);
        assert_eq!(metadata.comp.frame_size, 0x300);
    }

    #[test]
    fn bad_hca_magic_rejected() {
        let mut data = synthetic_hca_header();
        data[0] = b'X';
        let result: Result<HcaMetadata, _> = Cursor::new(data).read_be();
        assert!(result.is_err());
    }
}
