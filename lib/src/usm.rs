//! The top-level container: opening an existing file into channels, and
//! packing channels back into a well-formed byte stream.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use encoding_rs::Encoding;
use parking_lot::Mutex;

use crate::chunk::{
    is_usm, ChunkPadding, ChunkPayload, ChunkType, PayloadType, UsmChunk, CHUNK_HEADER_SIZE,
};
use crate::cipher::{
    crypt_audio_packet, decrypt_video_packet, generate_keys, AudioKey, OpMode, VideoKey,
};
use crate::error::UsmError;
use crate::media::{
    AudioChunkSource, GenericAudio, GenericVideo, UsmAudio, UsmVideo, VideoChunkSource,
};
use crate::page::{
    keyframes_from_seek_pages, Element, UsmPage, CRIUSF_DIR_STREAM, VIDEO_SEEKINFO,
};
use crate::tools::{round_up, slugify, HEADER_END_BANNER, METADATA_END_BANNER, SECTOR_SIZE};

pub const DEFAULT_FORMAT_VERSION: i32 = 0x0100_0240;

/// Empirical scale from the largest packed chunk to the player's
/// `minbuf` hint. No derivation is known, so it stays adjustable.
pub const DEFAULT_MINBUF_FACTOR: f64 = 1.98746;

/// Per-channel bookkeeping collected while scanning an existing file.
#[derive(Debug, Default)]
struct ScannedChannel {
    /// Absolute payload offset and size of every stream chunk.
    stream: Vec<(u64, u64)>,
    header: Option<UsmPage>,
    metadata: Option<Vec<UsmPage>>,
}

pub struct Usm {
    videos: Vec<Box<dyn UsmVideo>>,
    audios: Vec<Box<dyn UsmAudio>>,
    version: i32,
    usm_crid: Option<UsmPage>,
    video_key: Option<VideoKey>,
    audio_key: Option<AudioKey>,
    max_packet_size: usize,
    pub minbuf_factor: f64,
}

impl Usm {
    pub fn new(
        videos: Vec<Box<dyn UsmVideo>>,
        audios: Vec<Box<dyn UsmAudio>>,
        key: Option<u64>,
        usm_crid: Option<UsmPage>,
        version: i32,
    ) -> Result<Self, UsmError> {
        if videos.is_empty() {
            return Err(UsmError::Custom("No videos given".into()));
        }

        let mut videos = videos;
        let mut audios = audios;
        videos.sort_by_key(|v| v.channel_number());
        audios.sort_by_key(|a| a.channel_number());

        log::info!("Usm format version: {:x}", version);
        log::info!(
            "{} video channels and {} audio channels given",
            videos.len(),
            audios.len()
        );

        let (video_key, audio_key) = match key {
            Some(seed) => {
                log::info!("Key provided");
                let (video_key, audio_key) = generate_keys(seed);
                (Some(video_key), Some(audio_key))
            }
            None => (None, None),
        };

        Ok(Self {
            videos,
            audios,
            version,
            usm_crid,
            video_key,
            audio_key,
            max_packet_size: 1,
            minbuf_factor: DEFAULT_MINBUF_FACTOR,
        })
    }

    /// Attach a cipher key after construction.
    pub fn set_key(&mut self, seed: u64) {
        let (video_key, audio_key) = generate_keys(seed);
        self.video_key = Some(video_key);
        self.audio_key = Some(audio_key);
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn videos(&self) -> &[Box<dyn UsmVideo>] {
        &self.videos
    }

    pub fn audios(&self) -> &[Box<dyn UsmAudio>] {
        &self.audios
    }

    pub fn usm_crid(&self) -> Option<&UsmPage> {
        self.usm_crid.as_ref()
    }

    /// The container's own file name: from the top-level directory page
    /// when there is one, otherwise derived from the first video.
    pub fn filename(&self) -> String {
        if let Some(crid) = &self.usm_crid {
            if let Some(name) = crid.get("filename").and_then(Element::as_str) {
                return name.rsplit('/').next().unwrap_or(name).to_string();
            }
        }

        let name = self.videos[0]
            .crid_page()
            .get("filename")
            .and_then(Element::as_str)
            .unwrap_or("output");
        let base = name.rsplit('/').next().unwrap_or(name);
        let stem = base.split('.').next().unwrap_or(base);
        format!("{}.usm", stem)
    }

    /// Open an existing USM file read-only. Channel packet sources read
    /// lazily through a shared, mutex-guarded file handle.
    pub fn open(
        filepath: impl AsRef<Path>,
        key: Option<u64>,
        encoding: &'static Encoding,
    ) -> Result<Usm, UsmError> {
        let filepath = filepath.as_ref();
        let filesize = std::fs::metadata(filepath)
            .map_err(|e| UsmError::Io("Couldn't stat USM file".into(), e))?
            .len();
        if filesize <= CHUNK_HEADER_SIZE as u64 {
            return Err(UsmError::InvalidMagic(format!(
                "File {} too small",
                filepath.display()
            )));
        }

        let mut usmfile =
            File::open(filepath).map_err(|e| UsmError::Io("Couldn't open USM file".into(), e))?;
        log::info!(
            "Loading Usm from file. File: {}, File size: {}, Encoding: {}",
            filepath.display(),
            filesize,
            encoding.name()
        );

        let mut signature = [0u8; 4];
        usmfile
            .read_exact(&mut signature)
            .map_err(|e| UsmError::Io("Couldn't read file signature".into(), e))?;
        if !is_usm(&signature) {
            return Err(UsmError::InvalidMagic(format!(
                "Invalid file signature: {:02x?}",
                signature
            )));
        }

        let (crids, video_channels, audio_channels) =
            scan_chunks(&mut usmfile, filesize, encoding)?;

        let usmfile = Arc::new(Mutex::new(usmfile));
        let mut videos: Vec<Box<dyn UsmVideo>> = Vec::new();
        let mut audios: Vec<Box<dyn UsmAudio>> = Vec::new();

        for (channel_number, channel) in video_channels {
            let crid = find_directory_page(&crids, ChunkType::Video, channel_number)
                .ok_or_else(|| {
                    UsmError::MissingDirectoryEntry(format!(
                        "No crid page found for video ch {}",
                        channel_number
                    ))
                })?;

            let keyframes = match &channel.metadata {
                Some(pages) => keyframes_from_seek_pages(pages)?,
                None => Vec::new(),
            };
            let length = channel.stream.len();
            videos.push(Box::new(GenericVideo::new(
                Box::new(VideoSliceReader {
                    file: Arc::clone(&usmfile),
                    slices: channel.stream,
                    keyframes,
                    index: 0,
                }),
                crid.clone(),
                channel.header.unwrap_or_else(|| UsmPage::new("")),
                length,
                channel_number,
                channel.metadata,
            )));
        }

        for (channel_number, channel) in audio_channels {
            let crid = find_directory_page(&crids, ChunkType::Audio, channel_number)
                .ok_or_else(|| {
                    UsmError::MissingDirectoryEntry(format!(
                        "No crid page found for audio ch {}",
                        channel_number
                    ))
                })?;

            let length = channel.stream.len();
            audios.push(Box::new(GenericAudio::new(
                Box::new(AudioSliceReader {
                    file: Arc::clone(&usmfile),
                    slices: channel.stream,
                    index: 0,
                }),
                crid.clone(),
                channel.header.unwrap_or_else(|| UsmPage::new("")),
                length,
                channel_number,
                channel.metadata,
            )));
        }

        let usm_crid = crids
            .iter()
            .find(|page| page.get_int("chno") == Some(-1))
            .cloned()
            .ok_or_else(|| {
                UsmError::MissingDirectoryEntry("No usm crid page found".into())
            })?;
        let version = usm_crid
            .get_int("fmtver")
            .ok_or_else(|| {
                UsmError::MissingFormatVersion("Top-level crid page has no fmtver".into())
            })? as i32;

        Usm::new(videos, audios, key, Some(usm_crid), version)
    }

    /// Write out every channel's elementary stream (deciphering if a key
    /// is attached), optionally also the metadata pages. Returns the
    /// written video and audio paths.
    pub fn demux(
        &mut self,
        path: impl AsRef<Path>,
        save_video: bool,
        save_audio: bool,
        save_pages: bool,
        folder_name: Option<&str>,
    ) -> Result<(Vec<PathBuf>, Vec<PathBuf>), UsmError> {
        let folder_name = match folder_name {
            Some(name) => name.to_string(),
            None => self.filename(),
        };
        let output = path.as_ref().join(slugify(&folder_name, true));
        if output.is_file() {
            return Err(UsmError::Io(
                format!("Output folder {} is a file", output.display()),
                std::io::Error::from(std::io::ErrorKind::AlreadyExists),
            ));
        }
        std::fs::create_dir_all(&output)
            .map_err(|e| UsmError::Io("Couldn't create output folder".into(), e))?;

        let mut videos = Vec::new();
        let mut audios = Vec::new();

        if save_video {
            log::info!("Saving videos");
            let vid_output = output.join("videos");
            std::fs::create_dir_all(&vid_output)
                .map_err(|e| UsmError::Io("Couldn't create videos folder".into(), e))?;

            for video in &mut self.videos {
                let filename = vid_output.join(video.filename()?);
                let mut out = File::create(&filename)
                    .map_err(|e| UsmError::Io("Couldn't create video output".into(), e))?;
                while let Some(packet) = video.next_packet() {
                    let (mut packet, _) = packet?;
                    if let Some(key) = &self.video_key {
                        decrypt_video_packet(&mut packet, key);
                    }
                    out.write_all(&packet)
                        .map_err(|e| UsmError::Io("Couldn't write video packet".into(), e))?;
                }

                videos.push(filename);
            }
        }

        if save_audio {
            log::info!("Saving audios");
            let aud_output = output.join("audios");
            std::fs::create_dir_all(&aud_output)
                .map_err(|e| UsmError::Io("Couldn't create audios folder".into(), e))?;

            for audio in &mut self.audios {
                let filename = aud_output.join(audio.filename()?);
                let mut out = File::create(&filename)
                    .map_err(|e| UsmError::Io("Couldn't create audio output".into(), e))?;
                while let Some(packet) = audio.next_packet() {
                    let mut packet = packet?;
                    if let Some(key) = &self.audio_key {
                        crypt_audio_packet(&mut packet, key);
                    }
                    out.write_all(&packet)
                        .map_err(|e| UsmError::Io("Couldn't write audio packet".into(), e))?;
                }

                audios.push(filename);
            }
        }

        if save_pages {
            log::info!("Saving pages");
            let mut report = String::new();
            if let Some(crid) = &self.usm_crid {
                report.push_str(&format!("{:#?}\n", crid));
            }
            for video in &self.videos {
                report.push_str(&format!("{:#?}\n{:#?}\n", video.crid_page(), video.header_page()));
                if let Some(pages) = video.metadata_pages() {
                    report.push_str(&format!("{:#?}\n", pages));
                }
            }
            for audio in &self.audios {
                report.push_str(&format!("{:#?}\n{:#?}\n", audio.crid_page(), audio.header_page()));
                if let Some(pages) = audio.metadata_pages() {
                    report.push_str(&format!("{:#?}\n", pages));
                }
            }
            std::fs::write(output.join("pages.txt"), report)
                .map_err(|e| UsmError::Io("Couldn't write pages report".into(), e))?;
        }

        Ok((videos, audios))
    }

    /// Pack the container. Consumes every channel's packet source and
    /// returns a lazy stream of output blocks; the interleaved stream
    /// section lives in a scratch file that is removed when the stream
    /// is dropped.
    pub fn stream(
        &mut self,
        mode: OpMode,
        encoding: &'static Encoding,
    ) -> Result<UsmStream, UsmError> {
        let packed = self.pack_stream(mode, encoding)?;
        let prestream =
            self.generate_prestream_chunks(packed.filesize, &packed.keyframe_offsets, encoding)?;

        let mut scratch = packed.scratch;
        scratch
            .seek(SeekFrom::Start(0))
            .map_err(|e| UsmError::Io("Couldn't rewind scratch file".into(), e))?;
        Ok(UsmStream {
            prestream: prestream.into_iter(),
            scratch,
            remaining: packed.filesize,
        })
    }

    /// Drive [Usm::stream] to completion into a writer. Returns the
    /// number of bytes written.
    pub fn pack_into<W: Write>(
        &mut self,
        writer: &mut W,
        mode: OpMode,
        encoding: &'static Encoding,
    ) -> Result<u64, UsmError> {
        let mut written = 0u64;
        for block in self.stream(mode, encoding)? {
            let block = block?;
            writer
                .write_all(&block)
                .map_err(|e| UsmError::Io("Couldn't write USM".into(), e))?;
            written += block.len() as u64;
        }

        Ok(written)
    }

    /// Phase A: interleave every channel's chunk batches, frame by
    /// frame, into a scratch file. Videos go before audios on each
    /// frame; channels stay in channel-number order throughout.
    fn pack_stream(
        &mut self,
        mode: OpMode,
        encoding: &'static Encoding,
    ) -> Result<PackedStream, UsmError> {
        let Usm {
            videos,
            audios,
            video_key,
            audio_key,
            ..
        } = self;

        let mut video_sources = Vec::with_capacity(videos.len());
        for video in videos.iter_mut() {
            video_sources.push(VideoChunkSource::new(
                video.as_mut(),
                mode,
                video_key.as_ref(),
                encoding,
            )?);
        }
        let mut audio_sources = Vec::with_capacity(audios.len());
        for audio in audios.iter_mut() {
            audio_sources.push(AudioChunkSource::new(
                audio.as_mut(),
                mode,
                audio_key.as_ref(),
                encoding,
            )?);
        }

        let mut scratch = tempfile::tempfile()
            .map_err(|e| UsmError::Io("Couldn't create scratch file".into(), e))?;
        let mut keyframe_offsets: BTreeMap<u8, Vec<(u32, u64)>> = BTreeMap::new();
        let mut max_packet_size = 1usize;
        let mut position = 0u64;
        let mut frame_index = 0u32;

        loop {
            let mut any_pulled = false;

            for source in &mut video_sources {
                let Some(batch) = source.next() else {
                    continue;
                };
                any_pulled = true;
                let (chunks, is_keyframe) = batch?;
                if is_keyframe {
                    keyframe_offsets
                        .entry(chunks[0].channel_number)
                        .or_default()
                        .push((frame_index, position));
                }
                for chunk in &chunks {
                    let packed = chunk.pack()?;
                    max_packet_size = max_packet_size.max(packed.len());
                    scratch
                        .write_all(&packed)
                        .map_err(|e| UsmError::Io("Couldn't write scratch file".into(), e))?;
                    position += packed.len() as u64;
                }
            }

            for source in &mut audio_sources {
                let Some(batch) = source.next() else {
                    continue;
                };
                any_pulled = true;
                for chunk in &batch? {
                    let packed = chunk.pack()?;
                    max_packet_size = max_packet_size.max(packed.len());
                    scratch
                        .write_all(&packed)
                        .map_err(|e| UsmError::Io("Couldn't write scratch file".into(), e))?;
                    position += packed.len() as u64;
                }
            }

            if !any_pulled {
                break;
            }
            frame_index += 1;
        }

        scratch
            .flush()
            .map_err(|e| UsmError::Io("Couldn't flush scratch file".into(), e))?;
        self.max_packet_size = max_packet_size;
        Ok(PackedStream {
            scratch,
            filesize: position,
            keyframe_offsets,
        })
    }

    /// Phases B and C: header/metadata chunks, then the top CRID chunk,
    /// in emission order.
    fn generate_prestream_chunks(
        &self,
        stream_filesize: u64,
        keyframe_offsets: &BTreeMap<u8, Vec<(u32, u64)>>,
        encoding: &'static Encoding,
    ) -> Result<Vec<UsmChunk>, UsmError> {
        let (header_metadata_chunks, header_metadata_size) =
            self.generate_header_metadata_chunks(keyframe_offsets, encoding)?;

        let usm_crid_page =
            self.usm_crid_page(header_metadata_size + stream_filesize as usize);
        let mut pages = vec![usm_crid_page];
        for video in &self.videos {
            pages.push(video.crid_page().clone());
        }
        for audio in &self.audios {
            pages.push(audio.crid_page().clone());
        }

        let mut chunks = vec![UsmChunk::new(
            ChunkType::Info,
            PayloadType::Header,
            ChunkPayload::Pages(pages),
            encoding,
        )
        .with_padding(ChunkPadding::ToSector)
        .with_string_padding(5)];
        chunks.extend(header_metadata_chunks);
        Ok(chunks)
    }

    /// Phase B. Returns the chunks and their total packed size. Seek
    /// page offsets are rebased onto the finished file: sector 1 plus
    /// the whole pre-stream region plus the scratch offset.
    fn generate_header_metadata_chunks(
        &self,
        keyframe_offsets: &BTreeMap<u8, Vec<(u32, u64)>>,
        encoding: &'static Encoding,
    ) -> Result<(Vec<UsmChunk>, usize), UsmError> {
        let mut chunks = Vec::new();
        let mut current_position = 0usize;

        for video in &self.videos {
            let chunk = UsmChunk::new(
                ChunkType::Video,
                PayloadType::Header,
                ChunkPayload::Pages(vec![video.header_page().clone()]),
                encoding,
            )
            .with_padding(ChunkPadding::Fixed(0x18))
            .with_channel(video.channel_number());
            current_position += chunk.packed_len()?;
            chunks.push(chunk);
        }

        for audio in &self.audios {
            let chunk = UsmChunk::new(
                ChunkType::Audio,
                PayloadType::Header,
                ChunkPayload::Pages(vec![audio.header_page().clone()]),
                encoding,
            )
            .with_padding(ChunkPadding::Fixed(0x8))
            .with_channel(audio.channel_number());
            current_position += chunk.packed_len()?;
            chunks.push(chunk);
        }

        for video in &self.videos {
            let chunk = UsmChunk::new(
                ChunkType::Video,
                PayloadType::SectionEnd,
                ChunkPayload::Bytes(HEADER_END_BANNER.to_vec()),
                encoding,
            )
            .with_channel(video.channel_number());
            current_position += chunk.packed_len()?;
            chunks.push(chunk);
        }

        for audio in &self.audios {
            let chunk = UsmChunk::new(
                ChunkType::Audio,
                PayloadType::SectionEnd,
                ChunkPayload::Bytes(HEADER_END_BANNER.to_vec()),
                encoding,
            )
            .with_channel(audio.channel_number());
            current_position += chunk.packed_len()?;
            chunks.push(chunk);
        }

        let mut metadata_section_size = 0usize;
        let mut metadata_chunks: Vec<UsmChunk> = Vec::new();
        let mut metadata_end_chunks: Vec<UsmChunk> = Vec::new();

        for video in &self.videos {
            let metadata_pages = match video.metadata_pages() {
                Some(pages) => pages.to_vec(),
                None => {
                    let offsets = keyframe_offsets
                        .get(&video.channel_number())
                        .map(Vec::as_slice)
                        .unwrap_or_default();
                    offsets
                        .iter()
                        .map(|(index, offset)| {
                            // ofs_byte is rebased once the section size
                            // is known.
                            let mut page = UsmPage::new(VIDEO_SEEKINFO);
                            page.update("ofs_byte", Element::I64(*offset as i64));
                            page.update("ofs_frmid", Element::U32(*index));
                            page.update("num_skip", Element::U16(0));
                            page.update("resv", Element::U16(0));
                            page
                        })
                        .collect()
                }
            };

            if metadata_pages.is_empty() {
                log::warn!(
                    "Video ch {} has no keyframes, skipping its seek index",
                    video.channel_number()
                );
                continue;
            }

            let chunk = UsmChunk::new(
                ChunkType::Video,
                PayloadType::Metadata,
                ChunkPayload::Pages(metadata_pages),
                encoding,
            )
            .with_padding(ChunkPadding::Metadata)
            .with_channel(video.channel_number());
            metadata_section_size += chunk.packed_len()?;
            metadata_chunks.push(chunk);

            let end_chunk = UsmChunk::new(
                ChunkType::Video,
                PayloadType::SectionEnd,
                ChunkPayload::Bytes(METADATA_END_BANNER.to_vec()),
                encoding,
            )
            .with_channel(video.channel_number());
            metadata_section_size += end_chunk.packed_len()?;
            metadata_end_chunks.push(end_chunk);
        }

        for audio in &self.audios {
            let Some(pages) = audio.metadata_pages() else {
                continue;
            };

            let chunk = UsmChunk::new(
                ChunkType::Audio,
                PayloadType::Metadata,
                ChunkPayload::Pages(pages.to_vec()),
                encoding,
            )
            .with_padding(ChunkPadding::Metadata)
            .with_channel(audio.channel_number());
            metadata_section_size += chunk.packed_len()?;
            metadata_chunks.push(chunk);

            let end_chunk = UsmChunk::new(
                ChunkType::Audio,
                PayloadType::SectionEnd,
                ChunkPayload::Bytes(METADATA_END_BANNER.to_vec()),
                encoding,
            )
            .with_channel(audio.channel_number());
            metadata_section_size += end_chunk.packed_len()?;
            metadata_end_chunks.push(end_chunk);
        }

        // Now that the whole pre-stream size is known, point every seek
        // page at its keyframe's absolute file offset.
        let total_size = current_position + metadata_section_size;
        for chunk in &mut metadata_chunks {
            if chunk.chunk_type != ChunkType::Video {
                continue;
            }
            if let ChunkPayload::Pages(pages) = &mut chunk.payload {
                for page in pages {
                    let offset = page.get_int("ofs_byte").unwrap_or(0);
                    page.update(
                        "ofs_byte",
                        Element::I64(offset + SECTOR_SIZE as i64 + total_size as i64),
                    );
                }
            }
        }

        chunks.extend(metadata_chunks);
        chunks.extend(metadata_end_chunks);
        Ok((chunks, total_size))
    }

    /// The container's own directory page. An opened container reuses
    /// the page it was read with; a built one computes `filesize`,
    /// `minbuf`, and the summed bitrate.
    fn usm_crid_page(&self, size_after_crid_part: usize) -> UsmPage {
        if let Some(page) = &self.usm_crid {
            return page.clone();
        }

        let mut minbuf = (self.max_packet_size as f64 * self.minbuf_factor).round() as i64;
        minbuf = round_up(minbuf as usize, 0x10) as i64;

        let mut bitrate = 0i64;
        for video in &self.videos {
            bitrate += video.crid_page().get_int("avbps").unwrap_or(0);
        }
        for audio in &self.audios {
            bitrate += audio.crid_page().get_int("avbps").unwrap_or(0);
        }

        let mut crid = UsmPage::new(CRIUSF_DIR_STREAM);
        crid.update("fmtver", Element::I32(self.version));
        crid.update("filename", Element::String(self.filename()));
        crid.update(
            "filesize",
            Element::I32((SECTOR_SIZE + size_after_crid_part) as i32),
        );
        crid.update("datasize", Element::I32(0));
        crid.update("stmid", Element::I32(0));
        crid.update("chno", Element::I16(-1));
        crid.update("minchk", Element::I16(1));
        crid.update("minbuf", Element::I32(minbuf as i32));
        crid.update("avbps", Element::I32(bitrate as i32));
        crid
    }
}

struct PackedStream {
    scratch: File,
    filesize: u64,
    keyframe_offsets: BTreeMap<u8, Vec<(u32, u64)>>,
}

/// Lazy output of a packed container: the pre-stream chunks, then the
/// scratch file in sector-sized blocks. Dropping it removes the scratch
/// file.
pub struct UsmStream {
    prestream: std::vec::IntoIter<UsmChunk>,
    scratch: File,
    remaining: u64,
}

impl Iterator for UsmStream {
    type Item = Result<Vec<u8>, UsmError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(chunk) = self.prestream.next() {
            return Some(chunk.pack());
        }

        if self.remaining == 0 {
            return None;
        }

        let block_size = self.remaining.min(SECTOR_SIZE as u64) as usize;
        let mut block = vec![0u8; block_size];
        match self.scratch.read_exact(&mut block) {
            Ok(()) => {
                self.remaining -= block_size as u64;
                Some(Ok(block))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(UsmError::Io("Couldn't read scratch file".into(), e)))
            }
        }
    }
}

fn find_directory_page<'a>(
    crids: &'a [UsmPage],
    chunk_type: ChunkType,
    channel_number: u8,
) -> Option<&'a UsmPage> {
    crids.iter().find(|page| {
        page.get_int("chno") == Some(i64::from(channel_number))
            && page.get_int("stmid") == Some(i64::from(chunk_type.to_int()))
    })
}

type ScanResult = (
    Vec<UsmPage>,
    BTreeMap<u8, ScannedChannel>,
    BTreeMap<u8, ScannedChannel>,
);

/// Walk the whole file chunk by chunk, collecting directory pages and
/// per-channel stream offsets, headers, and metadata.
fn scan_chunks(
    usmfile: &mut File,
    filesize: u64,
    encoding: &'static Encoding,
) -> Result<ScanResult, UsmError> {
    let mut crids: Vec<UsmPage> = Vec::new();
    let mut video_channels: BTreeMap<u8, ScannedChannel> = BTreeMap::new();
    let mut audio_channels: BTreeMap<u8, ScannedChannel> = BTreeMap::new();

    usmfile
        .seek(SeekFrom::Start(0))
        .map_err(|e| UsmError::Io("Couldn't seek to file start".into(), e))?;

    let mut offset = 0u64;
    let mut prev_payload_type = PayloadType::Header;
    while offset < filesize {
        let mut header = [0u8; CHUNK_HEADER_SIZE];
        usmfile
            .read_exact(&mut header)
            .map_err(|e| UsmError::Io("Couldn't read chunk header".into(), e))?;
        let (payload_size, padding) = UsmChunk::peek_size_and_padding(&header)?;

        let mut data = vec![0u8; CHUNK_HEADER_SIZE + payload_size];
        data[..CHUNK_HEADER_SIZE].copy_from_slice(&header);
        usmfile
            .read_exact(&mut data[CHUNK_HEADER_SIZE..])
            .map_err(|e| UsmError::Io("Couldn't read chunk payload".into(), e))?;
        usmfile
            .seek(SeekFrom::Current(padding as i64))
            .map_err(|e| UsmError::Io("Couldn't skip chunk padding".into(), e))?;

        let chunk = UsmChunk::from_bytes(&data, encoding)?;
        if chunk.payload_type != prev_payload_type {
            log::info!("New Usm section at {:#x} offset", offset);
        }

        let payload_offset = offset + 8 + chunk.payload_offset as u64;
        match chunk.chunk_type {
            ChunkType::Info => match &chunk.payload {
                ChunkPayload::Pages(pages) => crids.extend(pages.iter().cloned()),
                ChunkPayload::Bytes(bytes) => {
                    log::warn!(
                        "scan_chunks: Received info chunk that's not a page table: {} bytes",
                        bytes.len()
                    );
                }
            },
            ChunkType::Video | ChunkType::Audio => {
                let channels = if chunk.chunk_type == ChunkType::Video {
                    &mut video_channels
                } else {
                    &mut audio_channels
                };
                let channel = channels.entry(chunk.channel_number).or_default();
                match chunk.payload_type {
                    PayloadType::Stream => {
                        channel.stream.push((payload_offset, payload_size as u64));
                    }
                    PayloadType::Header => {
                        channel.header = chunk
                            .payload
                            .pages()
                            .and_then(|pages| pages.first())
                            .cloned();
                    }
                    PayloadType::Metadata => {
                        channel.metadata = chunk.payload.pages().map(<[UsmPage]>::to_vec);
                    }
                    PayloadType::SectionEnd => {
                        log::debug!("scan_chunks: {} section end", chunk.chunk_type);
                    }
                }
            }
            other => {
                log::warn!(
                    "scan_chunks: Ignoring {} chunk at {:#x} offset",
                    other,
                    offset
                );
            }
        }

        prev_payload_type = chunk.payload_type;
        offset += (CHUNK_HEADER_SIZE + payload_size + padding) as u64;
    }

    Ok((crids, video_channels, audio_channels))
}

/// Lazy packet source over recorded (offset, size) slices of the backing
/// file. Every pull locks the shared handle, seeks, and reads exactly
/// one payload.
struct VideoSliceReader {
    file: Arc<Mutex<File>>,
    slices: Vec<(u64, u64)>,
    keyframes: Vec<u32>,
    index: usize,
}

impl Iterator for VideoSliceReader {
    type Item = Result<(Vec<u8>, bool), UsmError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (offset, size) = *self.slices.get(self.index)?;
        let is_keyframe = self.keyframes.contains(&(self.index as u32));
        self.index += 1;

        Some(
            read_slice(&self.file, offset, size).map(|packet| (packet, is_keyframe)),
        )
    }
}

struct AudioSliceReader {
    file: Arc<Mutex<File>>,
    slices: Vec<(u64, u64)>,
    index: usize,
}

impl Iterator for AudioSliceReader {
    type Item = Result<Vec<u8>, UsmError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (offset, size) = *self.slices.get(self.index)?;
        self.index += 1;
        Some(read_slice(&self.file, offset, size))
    }
}

fn read_slice(file: &Mutex<File>, offset: u64, size: u64) -> Result<Vec<u8>, UsmError> {
    let mut packet = vec![0u8; size as usize];
    let mut file = file.lock();
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| UsmError::Io("Couldn't seek to packet".into(), e))?;
    file.read_exact(&mut packet)
        .map_err(|e| UsmError::Io("Couldn't read packet".into(), e))?;
    Ok(packet)
}

#[cfg(test)]
mod usm_tests {
    use super::*;
    use crate::media::tools::{
        create_audio_crid_page, create_audio_header_page, create_video_crid_page,
        create_video_header_page, AudioCodec,
    };
    use encoding_rs::UTF_8;
    use std::io::Write as _;

    fn patterned_packet(len: usize, salt: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31) ^ salt).collect()
    }

    fn fixture_video_packets() -> Vec<(Vec<u8>, bool)> {
        vec![
            (patterned_packet(0x300, 0x11), true),
            (patterned_packet(0x2C0, 0x22), false),
            (patterned_packet(0x280, 0x33), false),
        ]
    }

    fn fixture_audio_packets() -> Vec<Vec<u8>> {
        vec![patterned_packet(0x200, 0x44), patterned_packet(0x1C0, 0x55)]
    }

    fn fixture_video() -> GenericVideo {
        let packets = fixture_video_packets();
        let length = packets.len();
        let crid = create_video_crid_page(
            "fixture.ivf",
            0x840,
            0x300,
            DEFAULT_FORMAT_VERSION,
            0,
            1_000_000,
        );
        let header = create_video_header_page(640, 480, 3, 1, 30, 1, 0x338, 9, 0);
        GenericVideo::new(
            Box::new(packets.into_iter().map(Ok)),
            crid,
            header,
            length,
            0,
            None,
        )
    }

    fn fixture_audio() -> GenericAudio {
        let packets = fixture_audio_packets();
        let length = packets.len();
        let crid =
            create_audio_crid_page("fixture.hca", 0x3C0, DEFAULT_FORMAT_VERSION, 0, 0x300, 96_000);
        let header = create_audio_header_page(AudioCodec::Hca, 48_000, 2, 1, 256, 27_860);
        GenericAudio::new(
            Box::new(packets.into_iter().map(Ok)),
            crid,
            header,
            length,
            0,
            None,
        )
    }

    fn fixture_usm(key: Option<u64>) -> Usm {
        Usm::new(
            vec![Box::new(fixture_video()) as Box<dyn UsmVideo>],
            vec![Box::new(fixture_audio()) as Box<dyn UsmAudio>],
            key,
            None,
            DEFAULT_FORMAT_VERSION,
        )
        .unwrap()
    }

    fn pack_fixture(key: Option<u64>, mode: OpMode) -> Vec<u8> {
        let mut out = Vec::new();
        fixture_usm(key).pack_into(&mut out, mode, UTF_8).unwrap();
        out
    }

    fn write_temp(data: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    /// Walk a packed file and return (type, payload type, chno) triples.
    fn chunk_sequence(data: &[u8]) -> Vec<(ChunkType, PayloadType, u8)> {
        let mut result = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            let (payload_size, padding) =
                UsmChunk::peek_size_and_padding(&data[offset..offset + CHUNK_HEADER_SIZE])
                    .unwrap();
            let chunk = UsmChunk::from_bytes(
                &data[offset..offset + CHUNK_HEADER_SIZE + payload_size],
                UTF_8,
            )
            .unwrap();
            result.push((chunk.chunk_type, chunk.payload_type, chunk.channel_number));
            offset += CHUNK_HEADER_SIZE + payload_size + padding;
        }

        assert_eq!(offset, data.len());
        result
    }

    #[test]
    fn packed_file_starts_with_sector_aligned_crid() {
        let out = pack_fixture(None, OpMode::None);
        assert!(is_usm(&out));

        let (payload_size, padding) =
            UsmChunk::peek_size_and_padding(&out[..CHUNK_HEADER_SIZE]).unwrap();
        assert_eq!(CHUNK_HEADER_SIZE + payload_size + padding, SECTOR_SIZE);
    }

    #[test]
    fn filesize_field_matches_output_length() {
        let out = pack_fixture(None, OpMode::None);
        let crid_chunk = UsmChunk::from_bytes(&out, UTF_8).unwrap();
        let pages = crid_chunk.payload.pages().unwrap();
        let usm_page = pages
            .iter()
            .find(|p| p.get_int("chno") == Some(-1))
            .unwrap();
        assert_eq!(usm_page.get_int("filesize").unwrap(), out.len() as i64);
        // One entry per channel plus the container itself.
        assert_eq!(pages.len(), 3);
    }

    #[test]
    fn every_chunk_lands_on_a_chunk_boundary() {
        let out = pack_fixture(None, OpMode::None);
        // chunk_sequence asserts that the walk consumes the exact file.
        let sequence = chunk_sequence(&out);
        assert!(sequence.len() > 5);
    }

    #[test]
    fn seek_page_points_at_keyframe_chunk() {
        let out = pack_fixture(None, OpMode::None);

        let mut offset = 0usize;
        let mut seek_pages = Vec::new();
        while offset < out.len() {
            let (payload_size, padding) =
                UsmChunk::peek_size_and_padding(&out[offset..offset + CHUNK_HEADER_SIZE])
                    .unwrap();
            let chunk = UsmChunk::from_bytes(
                &out[offset..offset + CHUNK_HEADER_SIZE + payload_size],
                UTF_8,
            )
            .unwrap();
            if chunk.payload_type == PayloadType::Metadata {
                seek_pages.extend(chunk.payload.pages().unwrap().to_vec());
            }
            offset += CHUNK_HEADER_SIZE + payload_size + padding;
        }

        assert_eq!(seek_pages.len(), 1);
        assert_eq!(seek_pages[0].name(), VIDEO_SEEKINFO);
        assert_eq!(seek_pages[0].get_int("ofs_frmid"), Some(0));

        // The offset lands on the first video stream chunk.
        let ofs_byte = seek_pages[0].get_int("ofs_byte").unwrap() as usize;
        let target = UsmChunk::from_bytes(&out[ofs_byte..], UTF_8).unwrap();
        assert_eq!(target.chunk_type, ChunkType::Video);
        assert_eq!(target.payload_type, PayloadType::Stream);
        assert_eq!(
            target.payload,
            ChunkPayload::Bytes(fixture_video_packets()[0].0.clone())
        );
    }

    #[test]
    fn open_reads_back_channels_and_packets() {
        let out = pack_fixture(None, OpMode::None);
        let file = write_temp(&out);

        let mut usm = Usm::open(file.path(), None, UTF_8).unwrap();
        assert_eq!(usm.version(), DEFAULT_FORMAT_VERSION);
        assert_eq!(usm.videos().len(), 1);
        assert_eq!(usm.audios().len(), 1);
        assert_eq!(usm.videos()[0].num_packets(), 3);
        assert_eq!(usm.audios()[0].num_packets(), 2);

        let expected = fixture_video_packets();
        let mut index = 0;
        while let Some(packet) = usm.videos[0].next_packet() {
            let (packet, is_keyframe) = packet.unwrap();
            assert_eq!(packet, expected[index].0);
            assert_eq!(is_keyframe, expected[index].1);
            index += 1;
        }
        assert_eq!(index, 3);

        let expected = fixture_audio_packets();
        let mut index = 0;
        while let Some(packet) = usm.audios[0].next_packet() {
            assert_eq!(packet.unwrap(), expected[index]);
            index += 1;
        }
        assert_eq!(index, 2);
    }

    #[test]
    fn remux_preserves_chunk_sequence() {
        let out = pack_fixture(None, OpMode::None);
        let file = write_temp(&out);

        let mut reopened = Usm::open(file.path(), None, UTF_8).unwrap();
        let mut remuxed = Vec::new();
        reopened
            .pack_into(&mut remuxed, OpMode::None, UTF_8)
            .unwrap();

        assert_eq!(chunk_sequence(&out), chunk_sequence(&remuxed));
    }

    #[test]
    fn encrypted_round_trip() {
        let plain = pack_fixture(None, OpMode::None);
        let encrypted = pack_fixture(Some(0xDEADBEEF), OpMode::Encrypt);
        assert_ne!(plain, encrypted);

        let file = write_temp(&encrypted);
        let dir = tempfile::tempdir().unwrap();
        let mut usm = Usm::open(file.path(), Some(0xDEADBEEF), UTF_8).unwrap();
        let (videos, audios) = usm
            .demux(dir.path(), true, true, false, Some("fixture"))
            .unwrap();

        assert_eq!(videos.len(), 1);
        assert_eq!(audios.len(), 1);

        let video_bytes = std::fs::read(&videos[0]).unwrap();
        let expected: Vec<u8> = fixture_video_packets()
            .into_iter()
            .flat_map(|(packet, _)| packet)
            .collect();
        assert_eq!(video_bytes, expected);

        let audio_bytes = std::fs::read(&audios[0]).unwrap();
        let expected: Vec<u8> = fixture_audio_packets().into_iter().flatten().collect();
        assert_eq!(audio_bytes, expected);
    }

    #[test]
    fn missing_directory_entry_detected() {
        let out = pack_fixture(None, OpMode::None);

        // Strip the audio directory page by rebuilding the CRID chunk
        // with only the container and video pages.
        let crid_chunk = UsmChunk::from_bytes(&out, UTF_8).unwrap();
        let mut pages = crid_chunk.payload.pages().unwrap().to_vec();
        pages.retain(|p| p.get_int("stmid") != Some(ChunkType::Audio.to_int() as i64));
        let rebuilt = UsmChunk::new(
            ChunkType::Info,
            PayloadType::Header,
            ChunkPayload::Pages(pages),
            UTF_8,
        )
        .with_padding(ChunkPadding::ToSector)
        .with_string_padding(5)
        .pack()
        .unwrap();
        assert_eq!(rebuilt.len(), SECTOR_SIZE);

        let mut corrupted = rebuilt;
        corrupted.extend_from_slice(&out[SECTOR_SIZE..]);
        let file = write_temp(&corrupted);
        let result = Usm::open(file.path(), None, UTF_8);
        assert!(matches!(result, Err(UsmError::MissingDirectoryEntry(_))));
    }

    #[test]
    fn non_usm_file_rejected() {
        let file = write_temp(&vec![0x41u8; 0x100]);
        let result = Usm::open(file.path(), None, UTF_8);
        assert!(matches!(result, Err(UsmError::InvalidMagic(_))));
    }

    #[test]
    fn tiny_file_rejected() {
        let file = write_temp(b"CRID");
        let result = Usm::open(file.path(), None, UTF_8);
        assert!(matches!(result, Err(UsmError::InvalidMagic(_))));
    }
}
