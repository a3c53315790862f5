use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::UsmError;
use crate::media::tools::{create_video_crid_page, create_video_header_page};
use crate::media::{UsmMedia, UsmVideo};
use crate::page::UsmPage;
use crate::probe::probe;
use crate::tools::{align_padding, CHUNK_ALIGN};

pub type VideoPacketStream = Box<dyn Iterator<Item = Result<(Vec<u8>, bool), UsmError>> + Send>;

/// Generic video channel: a packet source plus the pages that describe
/// it. This is what the demuxer hands back; creation from real files
/// goes through codec-specific constructors like [Vp9].
pub struct GenericVideo {
    stream: VideoPacketStream,
    crid_page: UsmPage,
    header_page: UsmPage,
    length: usize,
    channel_number: u8,
    metadata_pages: Option<Vec<UsmPage>>,
}

impl GenericVideo {
    pub fn new(
        stream: VideoPacketStream,
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

impl UsmMedia for GenericVideo {
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

impl UsmVideo for GenericVideo {
    fn next_packet(&mut self) -> Option<Result<(Vec<u8>, bool), UsmError>> {
        self.stream.next()
    }
}

/// A VP9 video channel built from an IVF file. Frame boundaries and
/// keyframes come from an ffprobe packet listing.
pub struct Vp9 {
    inner: GenericVideo,
}

impl Vp9 {
    pub fn new(
        path: impl AsRef<Path>,
        channel_number: u8,
        format_version: i32,
        ffprobe_path: Option<&Path>,
    ) -> Result<Self, UsmError> {
        let path = path.as_ref();
        let info = probe(path, ffprobe_path, Some("packet=dts,pts_time,pos,flags"))?;

        let stream = info
            .streams
            .first()
            .ok_or_else(|| UsmError::UnsupportedCodec("File has no video streams".into()))?;
        let format_name = info
            .format
            .as_ref()
            .and_then(|f| f.format_name.as_deref())
            .unwrap_or("unknown");
        if format_name != "ivf" {
            return Err(UsmError::UnsupportedCodec("File is not an ivf".into()));
        }
        if stream.codec_name.as_deref() != Some("vp9") {
            return Err(UsmError::UnsupportedCodec("File is not a VP9 video".into()));
        }

        let filesize = std::fs::metadata(path)
            .map_err(|e| UsmError::Io("Couldn't stat video file".into(), e))?
            .len();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (framerate_n, framerate_d) = stream.frame_rate_fraction().unwrap_or((30, 1));

        let frames = &info.packets;
        let keyframes: Vec<i64> = frames
            .iter()
            .enumerate()
            .filter(|(_, frame)| frame.is_keyframe())
            .map(|(i, frame)| frame.dts.unwrap_or(i as i64))
            .collect();

        let mut sizes = Vec::with_capacity(frames.len());
        let mut max_size = 0usize;
        for (i, frame) in frames.iter().enumerate() {
            let offset = frame.position().ok_or_else(|| {
                UsmError::FFMPEG(format!("Packet {} has no position", i))
            })?;
            let size = if i == frames.len() - 1 {
                (filesize - offset) as usize
            } else if i == 0 {
                // The first packet drags the IVF file header along.
                frames[1].position().ok_or_else(|| {
                    UsmError::FFMPEG("Packet 1 has no position".into())
                })? as usize
            } else {
                (frames[i + 1]
                    .position()
                    .ok_or_else(|| UsmError::FFMPEG(format!("Packet {} has no position", i + 1)))?
                    - offset) as usize
            };

            max_size = max_size.max(size);
            sizes.push(size);
        }

        let max_packed_size = 0x18 + max_size + align_padding(max_size, CHUNK_ALIGN);
        let bitrate = info
            .format
            .as_ref()
            .and_then(|f| f.bit_rate.as_deref())
            .and_then(|b| b.parse::<i32>().ok())
            .unwrap_or_else(|| {
                log::warn!("No bit_rate reported for {}, storing 0", path.display());
                0
            });

        let crid_page = create_video_crid_page(
            &filename,
            filesize as i32,
            max_size as i32,
            format_version,
            channel_number,
            bitrate,
        );
        let header_page = create_video_header_page(
            stream.width.unwrap_or(0),
            stream.height.unwrap_or(0),
            frames.len() as i32,
            keyframes.len() as i32,
            framerate_n,
            framerate_d,
            max_packed_size as i32,
            9, // mpeg_codec value for VP9
            0,
        );

        let file =
            File::open(path).map_err(|e| UsmError::Io("Couldn't open video file".into(), e))?;
        let length = sizes.len();
        Ok(Self {
            inner: GenericVideo::new(
                Box::new(FilePacketReader {
                    file,
                    sizes,
                    keyframes,
                    index: 0,
                }),
                crid_page,
                header_page,
                length,
                channel_number,
                None,
            ),
        })
    }
}

impl UsmMedia for Vp9 {
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

impl UsmVideo for Vp9 {
    fn next_packet(&mut self) -> Option<Result<(Vec<u8>, bool), UsmError>> {
        self.inner.next_packet()
    }
}

/// Sequential packet reader over a source video file.
struct FilePacketReader {
    file: File,
    sizes: Vec<usize>,
    keyframes: Vec<i64>,
    index: usize,
}

impl Iterator for FilePacketReader {
    type Item = Result<(Vec<u8>, bool), UsmError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.sizes.len() {
            return None;
        }

        let size = self.sizes[self.index];
        let is_keyframe = self.keyframes.contains(&(self.index as i64));
        self.index += 1;

        let mut packet = vec![0u8; size];
        match self.file.read_exact(&mut packet) {
            Ok(()) => Some(Ok((packet, is_keyframe))),
            Err(e) => {
                self.index = self.sizes.len();
                Some(Err(UsmError::Io("Couldn't read video packet".into(), e)))
            }
        }
    }
}
