//! Per-channel models of the elementary streams inside a container.

use encoding_rs::Encoding;

use crate::chunk::{ChunkPadding, ChunkPayload, ChunkType, PayloadType, UsmChunk};
use crate::cipher::{
    crypt_audio_packet, decrypt_video_packet, encrypt_video_packet, AudioKey, OpMode, VideoKey,
};
use crate::error::UsmError;
use crate::page::UsmPage;
use crate::tools::{align_padding, CHUNK_ALIGN, CONTENTS_END_BANNER};

pub mod audio;
pub mod tools;
pub mod video;

pub use audio::{GenericAudio, Hca};
pub use video::{GenericVideo, Vp9};

/// Shared surface of video and audio channels: the pages that describe
/// them and where they sit in the container.
pub trait UsmMedia {
    /// The channel's `CRIUSF_DIR_STREAM` page.
    fn crid_page(&self) -> &UsmPage;

    /// The channel's `VIDEO_HDRINFO`/`AUDIO_HDRINFO` page.
    fn header_page(&self) -> &UsmPage;

    /// Extra metadata pages, e.g. a video channel's `VIDEO_SEEKINFO`.
    /// `None` asks the muxer to generate them.
    fn metadata_pages(&self) -> Option<&[UsmPage]>;

    fn channel_number(&self) -> u8;

    /// How many packets the stream will yield.
    fn num_packets(&self) -> usize;

    /// Slugified file name from the directory page, path components
    /// stripped.
    fn filename(&self) -> Result<String, UsmError> {
        self.crid_page().filename()
    }
}

/// A video channel. The packet source is lazy and single-shot.
pub trait UsmVideo: UsmMedia + Send {
    fn next_packet(&mut self) -> Option<Result<(Vec<u8>, bool), UsmError>>;
}

/// An audio channel. The packet source is lazy and single-shot.
pub trait UsmAudio: UsmMedia + Send {
    fn next_packet(&mut self) -> Option<Result<Vec<u8>, UsmError>>;
}

pub type FrameTimePolicy = fn(usize) -> u32;

/// The frame-time formula observed in production containers. How it
/// should actually derive from `framerate_n`/`framerate_d` is not
/// documented, so it stays a swappable policy.
pub fn default_frame_time(index: usize) -> u32 {
    (index as u64 * 999 / 10) as u32
}

fn frame_rate_from_header(header: &UsmPage) -> u32 {
    match (header.get_int("framerate_n"), header.get_int("framerate_d")) {
        (Some(n), Some(d)) if d != 0 => ((n as f64 / d as f64) * 100.0).round() as u32,
        _ => 3000,
    }
}

fn contents_end_chunk(
    chunk_type: ChunkType,
    frame_rate: u32,
    channel_number: u8,
    encoding: &'static Encoding,
) -> UsmChunk {
    UsmChunk::new(
        chunk_type,
        PayloadType::SectionEnd,
        ChunkPayload::Bytes(CONTENTS_END_BANNER.to_vec()),
        encoding,
    )
    .with_frame(0, frame_rate)
    .with_channel(channel_number)
}

/// Pulls a video channel's packets and wraps them into STREAM chunks,
/// applying the cipher on the way through. The `#CONTENTS END` marker
/// rides in the same batch as the final packet.
pub struct VideoChunkSource<'a> {
    channel: &'a mut dyn UsmVideo,
    mode: OpMode,
    key: Option<&'a VideoKey>,
    encoding: &'static Encoding,
    frame_time: FrameTimePolicy,
    frame_rate: u32,
    index: usize,
    done: bool,
}

impl<'a> VideoChunkSource<'a> {
    pub fn new(
        channel: &'a mut dyn UsmVideo,
        mode: OpMode,
        key: Option<&'a VideoKey>,
        encoding: &'static Encoding,
    ) -> Result<Self, UsmError> {
        if mode != OpMode::None && key.is_none() {
            return Err(UsmError::InvalidKey(
                "No key given for encrypt or decrypt mode".into(),
            ));
        }

        let frame_rate = frame_rate_from_header(channel.header_page());
        Ok(Self {
            channel,
            mode,
            key,
            encoding,
            frame_time: default_frame_time,
            frame_rate,
            index: 0,
            done: false,
        })
    }

    pub fn with_frame_time_policy(mut self, policy: FrameTimePolicy) -> Self {
        self.frame_time = policy;
        self
    }
}

impl Iterator for VideoChunkSource<'_> {
    type Item = Result<(Vec<UsmChunk>, bool), UsmError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let channel_number = self.channel.channel_number();
        match self.channel.next_packet() {
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            Some(Ok((mut payload, is_keyframe))) => {
                match self.mode {
                    OpMode::None => {}
                    OpMode::Encrypt => {
                        encrypt_video_packet(&mut payload, self.key.expect("checked in new"))
                    }
                    OpMode::Decrypt => {
                        decrypt_video_packet(&mut payload, self.key.expect("checked in new"))
                    }
                }

                let padding = align_padding(payload.len(), CHUNK_ALIGN);
                let chunk = UsmChunk::new(
                    ChunkType::Video,
                    PayloadType::Stream,
                    ChunkPayload::Bytes(payload),
                    self.encoding,
                )
                .with_frame((self.frame_time)(self.index), self.frame_rate)
                .with_padding(ChunkPadding::Fixed(padding as u32))
                .with_channel(channel_number);

                self.index += 1;
                let mut chunks = vec![chunk];
                if self.index >= self.channel.num_packets() {
                    self.done = true;
                    chunks.push(contents_end_chunk(
                        ChunkType::Video,
                        self.frame_rate,
                        channel_number,
                        self.encoding,
                    ));
                }

                Some(Ok((chunks, is_keyframe)))
            }
            None => {
                // A dry or empty stream still terminates its section.
                self.done = true;
                Some(Ok((
                    vec![contents_end_chunk(
                        ChunkType::Video,
                        self.frame_rate,
                        channel_number,
                        self.encoding,
                    )],
                    false,
                )))
            }
        }
    }
}

/// Audio counterpart of [VideoChunkSource]. Audio streams always carry
/// a frame rate of 3000.
pub struct AudioChunkSource<'a> {
    channel: &'a mut dyn UsmAudio,
    mode: OpMode,
    key: Option<&'a AudioKey>,
    encoding: &'static Encoding,
    frame_time: FrameTimePolicy,
    index: usize,
    done: bool,
}

const AUDIO_FRAME_RATE: u32 = 3000;

impl<'a> AudioChunkSource<'a> {
    pub fn new(
        channel: &'a mut dyn UsmAudio,
        mode: OpMode,
        key: Option<&'a AudioKey>,
        encoding: &'static Encoding,
    ) -> Result<Self, UsmError> {
        if mode != OpMode::None && key.is_none() {
            return Err(UsmError::InvalidKey(
                "No key given for encrypt or decrypt mode".into(),
            ));
        }

        Ok(Self {
            channel,
            mode,
            key,
            encoding,
            frame_time: default_frame_time,
            index: 0,
            done: false,
        })
    }
}

impl Iterator for AudioChunkSource<'_> {
    type Item = Result<Vec<UsmChunk>, UsmError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let channel_number = self.channel.channel_number();
        match self.channel.next_packet() {
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            Some(Ok(mut payload)) => {
                if self.mode != OpMode::None {
                    crypt_audio_packet(&mut payload, self.key.expect("checked in new"));
                }

                let padding = align_padding(payload.len(), CHUNK_ALIGN);
                let chunk = UsmChunk::new(
                    ChunkType::Audio,
                    PayloadType::Stream,
                    ChunkPayload::Bytes(payload),
                    self.encoding,
                )
                .with_frame((self.frame_time)(self.index), AUDIO_FRAME_RATE)
                .with_padding(ChunkPadding::Fixed(padding as u32))
                .with_channel(channel_number);

                self.index += 1;
                let mut chunks = vec![chunk];
                if self.index >= self.channel.num_packets() {
                    self.done = true;
                    chunks.push(contents_end_chunk(
                        ChunkType::Audio,
                        AUDIO_FRAME_RATE,
                        channel_number,
                        self.encoding,
                    ));
                }

                Some(Ok(chunks))
            }
            None => {
                self.done = true;
                Some(Ok(vec![contents_end_chunk(
                    ChunkType::Audio,
                    AUDIO_FRAME_RATE,
                    channel_number,
                    self.encoding,
                )]))
            }
        }
    }
}

#[cfg(test)]
mod media_tests {
    use super::*;
    use crate::media::tools::create_video_crid_page;
    use crate::media::video::GenericVideo;
    use encoding_rs::UTF_8;

    fn test_video(packets: Vec<(Vec<u8>, bool)>) -> GenericVideo {
        let length = packets.len();
        let crid = create_video_crid_page("test.ivf", 100, 64, 0x01000240, 0, 1000);
        let mut header = UsmPage::new(crate::page::VIDEO_HDRINFO);
        header.update("framerate_n", crate::page::Element::I32(30000));
        header.update("framerate_d", crate::page::Element::I32(1000));
        GenericVideo::new(
            Box::new(packets.into_iter().map(Ok)),
            crid,
            header,
            length,
            0,
            None,
        )
    }

    #[test]
    fn last_batch_carries_section_end() {
        let mut video = test_video(vec![(vec![1; 0x20], true), (vec![2; 0x30], false)]);
        let source = VideoChunkSource::new(&mut video, OpMode::None, None, UTF_8).unwrap();
        let batches: Vec<_> = source.collect::<Result<Vec<_>, _>>().unwrap();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].0.len(), 1);
        assert!(batches[0].1);
        assert_eq!(batches[1].0.len(), 2);
        assert!(!batches[1].1);
        assert_eq!(batches[1].0[1].payload_type, PayloadType::SectionEnd);
        assert_eq!(
            batches[1].0[1].payload,
            ChunkPayload::Bytes(CONTENTS_END_BANNER.to_vec())
        );
    }

    #[test]
    fn empty_channel_still_ends_its_section() {
        let mut video = test_video(vec![]);
        let source = VideoChunkSource::new(&mut video, OpMode::None, None, UTF_8).unwrap();
        let batches: Vec<_> = source.collect::<Result<Vec<_>, _>>().unwrap();

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0.len(), 1);
        assert_eq!(batches[0].0[0].payload_type, PayloadType::SectionEnd);
    }

    #[test]
    fn cipher_mode_requires_key() {
        let mut video = test_video(vec![]);
        let result = VideoChunkSource::new(&mut video, OpMode::Encrypt, None, UTF_8);
        assert!(matches!(result, Err(UsmError::InvalidKey(_))));
    }

    #[test]
    fn frame_times_follow_policy() {
        assert_eq!(default_frame_time(0), 0);
        assert_eq!(default_frame_time(1), 99);
        assert_eq!(default_frame_time(10), 999);
        assert_eq!(default_frame_time(100), 9990);
    }

    #[test]
    fn stream_chunks_are_aligned() {
        let mut video = test_video(vec![(vec![3; 0x2B], true)]);
        let source = VideoChunkSource::new(&mut video, OpMode::None, None, UTF_8).unwrap();
        let batches: Vec<_> = source.collect::<Result<Vec<_>, _>>().unwrap();
        let packed = batches[0].0[0].pack().unwrap();
        assert_eq!(packed.len() % CHUNK_ALIGN, 0);
        assert_eq!(batches[0].0[0].frame_rate, 3000);
    }
}
