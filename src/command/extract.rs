use std::path::PathBuf;

use clap::Args;
use owo_colors::Style;
use rayon::iter::{IndexedParallelIterator, IntoParallelRefIterator, ParallelIterator};
use strum::EnumString;

use sofdec_usm::error::UsmError;
use sofdec_usm::tools::{encoding_for_label, parse_key};
use sofdec_usm::Usm;

use crate::command::find::find_usm_files;
use crate::command::global_args::GlobalArgs;
use crate::command::UsmToolCommand;
use crate::console::ErrStyle;

/// Extract the elementary streams from USM files.
#[derive(Args, Debug)]
pub struct Extract {
    /// USM files or folders to scan for them.
    inputs: Vec<PathBuf>,
    /// Decryption key for encrypted USMs, decimal or hex.
    #[clap(short, long)]
    key: Option<String>,
    /// Also save the USM's pages.
    #[clap(short, long)]
    pages: bool,
    /// Which streams to extract.
    #[clap(short, long, default_value = "all")]
    streams: ExtractTarget,
    /// Output folder.
    #[clap(short, long, default_value = "./output")]
    output: PathBuf,
}

#[derive(EnumString, Copy, Clone, Debug)]
#[strum(serialize_all = "snake_case")]
enum ExtractTarget {
    Video,
    Audio,
    All,
}

impl UsmToolCommand for Extract {
    fn run(mut self, global_args: GlobalArgs) -> Result<(), UsmError> {
        let encoding = encoding_for_label(&global_args.encoding)?;
        let key = self.key.as_deref().map(parse_key).transpose()?;
        let (save_video, save_audio) = match self.streams {
            ExtractTarget::Video => (true, false),
            ExtractTarget::Audio => (false, true),
            ExtractTarget::All => (true, true),
        };

        self.inputs.sort();
        let mut usmfiles = Vec::new();
        for input in &self.inputs {
            usmfiles.extend(find_usm_files(input)?);
        }
        log::info!("Found {} usm files", usmfiles.len());

        usmfiles
            .par_iter()
            .enumerate()
            .for_each(|(i, usmfile)| {
                let result = Usm::open(usmfile, key, encoding).and_then(|mut usm| {
                    let folder_name = usmfile
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned());
                    usm.demux(
                        &self.output,
                        save_video,
                        save_audio,
                        self.pages,
                        folder_name.as_deref(),
                    )
                });

                match result {
                    Ok(_) => eprintln!(
                        "Processed {} of {}: {}",
                        i + 1,
                        usmfiles.len(),
                        usmfile.display().errstyle(Style::new().green()),
                    ),
                    Err(e) => log::warn!(
                        "Failed to extract {}: {:#?}",
                        usmfile.display().errstyle(Style::new().green()),
                        e
                    ),
                }
            });

        Ok(())
    }
}
