//! Drives `ffprobe` to learn enough about video/audio files to build
//! container metadata. Only the handful of fields used for directory and
//! header pages are modeled.

use std::ffi::OsString;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use serde::Deserialize;

use crate::error::UsmError;

const GENERAL_FFPROBE_INSTRUCTIONS: [&str; 1] = ["-hide_banner"];

#[derive(Debug, Deserialize)]
pub struct ProbeInfo {
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
    pub format: Option<ProbeFormat>,
    #[serde(default)]
    pub packets: Vec<ProbePacket>,
}

#[derive(Debug, Deserialize)]
pub struct ProbeStream {
    pub codec_name: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub r_frame_rate: Option<String>,
}

impl ProbeStream {
    /// `r_frame_rate` comes back as a `n/d` fraction.
    pub fn frame_rate_fraction(&self) -> Option<(i32, i32)> {
        let raw = self.r_frame_rate.as_deref()?;
        let (n, d) = raw.split_once('/')?;
        Some((n.parse().ok()?, d.parse().ok()?))
    }
}

#[derive(Debug, Deserialize)]
pub struct ProbeFormat {
    pub format_name: Option<String>,
    /// ffprobe emits this as a string.
    pub bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProbePacket {
    pub dts: Option<i64>,
    pub pts_time: Option<String>,
    pub pos: Option<String>,
    pub flags: Option<String>,
}

impl ProbePacket {
    pub fn position(&self) -> Option<u64> {
        self.pos.as_deref()?.parse().ok()
    }

    pub fn is_keyframe(&self) -> bool {
        self.flags.as_deref().is_some_and(|f| f.contains('K'))
    }
}

/// Probe `path`, optionally also collecting per-packet entries.
pub fn probe(
    path: &Path,
    ffprobe_path: Option<&Path>,
    packet_entries: Option<&str>,
) -> Result<ProbeInfo, UsmError> {
    let mut probe_args = ArgBuilder::new()
        .add_all(GENERAL_FFPROBE_INSTRUCTIONS)
        .add_all(get_ffprobe_loglevel())
        .add_kv("-of", "json")
        .add("-show_format")
        .add("-show_streams");
    if let Some(entries) = packet_entries {
        probe_args = probe_args.add_kv("-show_entries", entries);
    }
    let probe_args = probe_args.add(path).into_vec();

    let command = ffprobe_path
        .map(Path::as_os_str)
        .unwrap_or_else(|| "ffprobe".as_ref());
    log::debug!("Running {:?} {:?}", command, probe_args);
    let output = Command::new(command)
        .args(probe_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .output()
        .map_err(|e| UsmError::Io("Couldn't run ffprobe".into(), e))?;
    check_exit(&output)?;

    serde_json::from_slice(&output.stdout)
        .map_err(|e| UsmError::FFMPEG(format!("Couldn't parse ffprobe output: {}", e)))
}

/// The video codecs Sofdec2 containers can carry.
#[derive(Debug, Copy, Clone, Eq, PartialEq, strum::Display)]
pub enum Sofdec2Codec {
    /// MPEG2.
    Prime,
    H264,
    Vp9,
}

impl Sofdec2Codec {
    pub fn from_file(path: &Path, ffprobe_path: Option<&Path>) -> Result<Self, UsmError> {
        let info = probe(path, ffprobe_path, None)?;

        let stream = info
            .streams
            .first()
            .ok_or_else(|| UsmError::UnsupportedCodec("File has no video streams".into()))?;
        let codec_name = stream.codec_name.as_deref().unwrap_or("unknown");
        match codec_name {
            "vp9" => {
                let format_name = info
                    .format
                    .as_ref()
                    .and_then(|f| f.format_name.as_deref())
                    .unwrap_or("unknown");
                if format_name != "ivf" {
                    return Err(UsmError::UnsupportedCodec(
                        "VP9 file must be stored as an ivf".into(),
                    ));
                }
                Ok(Sofdec2Codec::Vp9)
            }
            "h264" => Ok(Sofdec2Codec::H264),
            "mpeg2video" => Ok(Sofdec2Codec::Prime),
            other => Err(UsmError::UnsupportedCodec(format!(
                "Unknown codec {}",
                other
            ))),
        }
    }
}

fn get_ffprobe_loglevel() -> [&'static str; 2] {
    match log::max_level() {
        log::LevelFilter::Trace => ["-loglevel", "debug"],
        _ => ["-loglevel", "error"],
    }
}

fn check_exit(output: &Output) -> Result<(), UsmError> {
    if !output.status.success() {
        return Err(UsmError::FFMPEG(format!(
            "exit code {}, {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

#[derive(Clone, Debug, Default)]
struct ArgBuilder {
    parts: Vec<OsString>,
}

impl ArgBuilder {
    fn new() -> Self {
        Self::default()
    }

    fn add(mut self, part: impl Into<OsString>) -> Self {
        self.parts.push(part.into());
        self
    }

    fn add_kv(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.parts.extend_from_slice(&[key.into(), value.into()]);
        self
    }

    fn add_all(mut self, part: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        self.parts.extend(part.into_iter().map(Into::into));
        self
    }

    fn into_vec(self) -> Vec<OsString> {
        self.parts
    }
}

#[cfg(test)]
mod probe_tests {
    use super::*;

    #[test]
    fn frame_rate_fraction_parsed() {
        let stream = ProbeStream {
            codec_name: Some("vp9".into()),
            width: Some(640),
            height: Some(480),
            r_frame_rate: Some("30000/1001".into()),
        };
        assert_eq!(stream.frame_rate_fraction(), Some((30000, 1001)));
    }

    #[test]
    fn keyframe_flags() {
        let packet = ProbePacket {
            dts: Some(0),
            pts_time: None,
            pos: Some("32".into()),
            flags: Some("K_".into()),
        };
        assert!(packet.is_keyframe());
        assert_eq!(packet.position(), Some(32));
    }

    #[test]
    fn probe_json_shape() {
        let raw = r#"{
            "packets": [
                {"dts": 0, "pts_time": "0.000000", "pos": "32", "flags": "K__"},
                {"dts": 1, "pts_time": "0.033000", "pos": "1044", "flags": "___"}
            ],
            "streams": [
                {"codec_name": "vp9", "width": 640, "height": 480, "r_frame_rate": "30/1"}
            ],
            "format": {"format_name": "ivf", "bit_rate": "1500000"}
        }"#;
        let info: ProbeInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.packets.len(), 2);
        assert!(info.packets[0].is_keyframe());
        assert!(!info.packets[1].is_keyframe());
        assert_eq!(info.streams[0].codec_name.as_deref(), Some("vp9"));
        assert_eq!(
            info.format.unwrap().format_name.as_deref(),
            Some("ivf")
        );
    }
}
