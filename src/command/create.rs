use std::fs::File;
use std::path::PathBuf;

use clap::Args;
use owo_colors::Style;

use sofdec_usm::error::UsmError;
use sofdec_usm::media::{Hca, UsmAudio, UsmVideo, Vp9};
use sofdec_usm::tools::{encoding_for_label, parse_key};
use sofdec_usm::{OpMode, Sofdec2Codec, Usm, DEFAULT_FORMAT_VERSION};

use crate::command::global_args::GlobalArgs;
use crate::command::UsmToolCommand;
use crate::console::ErrStyle;

/// Build a USM from a video file, optionally with HCA audio tracks.
#[derive(Args, Debug)]
pub struct Create {
    /// Path to the video file. Only VP9 in an ivf is supported.
    input: PathBuf,
    /// HCA audio files to mux in, one channel each.
    #[clap(short, long)]
    audio: Vec<PathBuf>,
    /// Encryption key, decimal or hex.
    #[clap(short, long)]
    key: Option<String>,
    /// Output path. Defaults to the input with a .usm extension.
    #[clap(short, long)]
    output: Option<PathBuf>,
    /// Path to the ffprobe executable.
    #[clap(long)]
    ffprobe: Option<PathBuf>,
}

impl UsmToolCommand for Create {
    fn run(self, global_args: GlobalArgs) -> Result<(), UsmError> {
        let encoding = encoding_for_label(&global_args.encoding)?;
        let key = self.key.as_deref().map(parse_key).transpose()?;

        let codec = Sofdec2Codec::from_file(&self.input, self.ffprobe.as_deref())?;
        if codec != Sofdec2Codec::Vp9 {
            return Err(UsmError::UnsupportedCodec(format!(
                "{} files are not yet implemented",
                codec
            )));
        }

        let video = Vp9::new(&self.input, 0, DEFAULT_FORMAT_VERSION, self.ffprobe.as_deref())
            .map_err(|e| e.add_context("Failed to probe input video"))?;
        let mut audios: Vec<Box<dyn UsmAudio>> = Vec::with_capacity(self.audio.len());
        for (channel_number, path) in self.audio.iter().enumerate() {
            let hca = Hca::new(path, channel_number as u8, DEFAULT_FORMAT_VERSION)
                .map_err(|e| e.add_context(format!("Failed to read {}", path.display())))?;
            audios.push(Box::new(hca));
        }

        let mut usm = Usm::new(
            vec![Box::new(video) as Box<dyn UsmVideo>],
            audios,
            key,
            None,
            DEFAULT_FORMAT_VERSION,
        )?;

        let output_path = self
            .output
            .unwrap_or_else(|| self.input.with_extension("usm"));
        let mut output = File::create(&output_path)
            .map_err(|e| UsmError::Io("Couldn't create output file".into(), e))?;

        let mode = if key.is_some() {
            OpMode::Encrypt
        } else {
            OpMode::None
        };
        let written = usm.pack_into(&mut output, mode, encoding)?;

        eprintln!(
            "Done creating {} ({} bytes)",
            output_path.display().errstyle(Style::new().green()),
            written.errstyle(Style::new().yellow()),
        );
        Ok(())
    }
}
