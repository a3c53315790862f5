//! Factories for the directory and header pages a channel carries.

use crate::chunk::ChunkType;
use crate::page::{Element, UsmPage, AUDIO_HDRINFO, CRIUSF_DIR_STREAM, VIDEO_HDRINFO};

/// `audio_codec` values understood by Sofdec2 players.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AudioCodec {
    Hca = 4,
}

pub fn create_video_crid_page(
    filename: &str,
    filesize: i32,
    max_size: i32,
    format_version: i32,
    channel_number: u8,
    bitrate: i32,
) -> UsmPage {
    let mut crid = UsmPage::new(CRIUSF_DIR_STREAM);
    crid.update("fmtver", Element::I32(format_version));
    crid.update("filename", Element::String(filename.into()));
    crid.update("filesize", Element::I32(filesize));
    crid.update("datasize", Element::I32(0));
    crid.update("stmid", Element::I32(ChunkType::Video.to_int() as i32));
    crid.update("chno", Element::I16(channel_number as i16));
    crid.update("minchk", Element::I16(3));
    crid.update("minbuf", Element::I32(max_size));
    crid.update("avbps", Element::I32(bitrate));
    crid
}

#[allow(clippy::too_many_arguments)]
pub fn create_video_header_page(
    width: i32,
    height: i32,
    num_frames: i32,
    num_keyframes: i32,
    framerate_n: i32,
    framerate_d: i32,
    max_packed_size: i32,
    mpeg_codec: i8,
    mpeg_dcprec: i8,
) -> UsmPage {
    // Observed files store the fraction scaled to a millisecond base.
    let (framerate_n, framerate_d) = if framerate_d < 1000 {
        (framerate_n * 1000, framerate_d * 1000)
    } else {
        (framerate_n, framerate_d)
    };

    let mut header = UsmPage::new(VIDEO_HDRINFO);
    header.update("width", Element::I32(width));
    header.update("height", Element::I32(height));
    header.update("mat_width", Element::I32(width));
    header.update("mat_height", Element::I32(height));
    header.update("disp_width", Element::I32(width));
    header.update("disp_height", Element::I32(height));
    header.update("scrn_width", Element::I32(0));
    header.update("mpeg_dcprec", Element::I8(mpeg_dcprec));
    header.update("mpeg_codec", Element::I8(mpeg_codec));
    header.update("alpha_type", Element::I32(0));
    header.update("total_frames", Element::I32(num_frames));
    header.update("framerate_n", Element::I32(framerate_n));
    header.update("framerate_d", Element::I32(framerate_d));
    header.update("metadata_count", Element::I32(1));
    header.update("metadata_size", Element::I32(num_keyframes));
    header.update("ixsize", Element::I32(max_packed_size));
    header.update("pre_padding", Element::I32(0));
    header.update("max_picture_size", Element::I32(0));
    header.update("color_space", Element::I32(0));
    header.update("picture_type", Element::I32(0));
    header
}

pub fn create_audio_crid_page(
    filename: &str,
    filesize: i32,
    format_version: i32,
    channel_number: u8,
    minbuf: i32,
    avbps: i32,
) -> UsmPage {
    let mut crid = UsmPage::new(CRIUSF_DIR_STREAM);
    crid.update("fmtver", Element::I32(format_version));
    crid.update("filename", Element::String(filename.into()));
    crid.update("filesize", Element::I32(filesize));
    crid.update("datasize", Element::I32(0));
    crid.update("stmid", Element::I32(ChunkType::Audio.to_int() as i32));
    crid.update("chno", Element::I16(channel_number as i16));
    crid.update("minchk", Element::I16(1));
    crid.update("minbuf", Element::I32(minbuf));
    crid.update("avbps", Element::I32(avbps));
    crid
}

pub fn create_audio_header_page(
    audio_codec: AudioCodec,
    sampling_rate: i32,
    num_channels: i32,
    metadata_count: i32,
    metadata_size: i32,
    ixsize: i32,
) -> UsmPage {
    let mut header = UsmPage::new(AUDIO_HDRINFO);
    header.update("audio_codec", Element::I8(audio_codec as i8));
    header.update("sampling_rate", Element::I32(sampling_rate));
    header.update("num_channels", Element::I32(num_channels));
    header.update("metadata_count", Element::I32(metadata_count));
    header.update("metadata_size", Element::I32(metadata_size));
    header.update("ixsize", Element::I32(ixsize));
    header.update("ambisonics", Element::I8(0));
    header
}

#[cfg(test)]
mod media_tools_tests {
    use super::*;

    #[test]
    fn video_crid_page_identifies_stream() {
        let crid = create_video_crid_page("op.ivf", 1000, 64, 0x01000240, 0, 1_500_000);
        assert_eq!(crid.get_int("stmid"), Some(0x40534656));
        assert_eq!(crid.get_int("chno"), Some(0));
        assert_eq!(crid.get_int("fmtver"), Some(0x01000240));
    }

    #[test]
    fn audio_crid_page_identifies_stream() {
        let crid = create_audio_crid_page("bgm.hca", 1000, 0x01000240, 1, 64, 96000);
        assert_eq!(crid.get_int("stmid"), Some(0x40534641));
        assert_eq!(crid.get_int("chno"), Some(1));
    }

    #[test]
    fn framerate_scaled_to_millisecond_base() {
        let header = create_video_header_page(640, 480, 90, 3, 30, 1, 0x1000, 9, 0);
        assert_eq!(header.get_int("framerate_n"), Some(30000));
        assert_eq!(header.get_int("framerate_d"), Some(1000));

        let ntsc = create_video_header_page(640, 480, 90, 3, 30000, 1001, 0x1000, 9, 0);
        assert_eq!(ntsc.get_int("framerate_n"), Some(30000));
        assert_eq!(ntsc.get_int("framerate_d"), Some(1001));
    }
}
