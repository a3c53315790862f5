use std::fmt::Write as _;
use std::path::PathBuf;

use clap::Args;
use owo_colors::Style;

use sofdec_usm::console::format_channel_for_console;
use sofdec_usm::error::UsmError;
use sofdec_usm::probe::probe;
use sofdec_usm::tools::encoding_for_label;
use sofdec_usm::Usm;

use crate::command::find::find_usm_files;
use crate::command::global_args::GlobalArgs;
use crate::command::UsmToolCommand;
use crate::console::ErrStyle;

/// Examine USM files: their channels, pages, and what ffprobe makes of
/// the extracted streams. Writes one log per input file.
#[derive(Args, Debug)]
pub struct Probe {
    /// USM files or folders to scan for them.
    inputs: Vec<PathBuf>,
    /// Folder receiving the probe logs.
    #[clap(short, long, default_value = "./usmlogs")]
    output: PathBuf,
    /// Path to the ffprobe executable.
    #[clap(long)]
    ffprobe: Option<PathBuf>,
}

impl UsmToolCommand for Probe {
    fn run(mut self, global_args: GlobalArgs) -> Result<(), UsmError> {
        let encoding = encoding_for_label(&global_args.encoding)?;

        self.inputs.sort();
        let mut usmfiles = Vec::new();
        for input in &self.inputs {
            usmfiles.extend(find_usm_files(input)?);
        }

        std::fs::create_dir_all(&self.output)
            .map_err(|e| UsmError::Io("Couldn't create log folder".into(), e))?;

        for (i, usmfile) in usmfiles.iter().enumerate() {
            eprintln!("Processing {} of {}", i + 1, usmfiles.len());
            let mut report = String::new();
            let _ = writeln!(report, "Path: {}", usmfile.display());

            if let Err(e) = self.probe_one(usmfile, encoding, &mut report) {
                log::warn!(
                    "Error probing {}: {:#?}",
                    usmfile.display().errstyle(Style::new().green()),
                    e
                );
                let _ = writeln!(report, "ERROR: {:#?}", e);
            }

            let log_name = format!(
                "{}_{}.log",
                usmfile
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                i
            );
            std::fs::write(self.output.join(log_name), report)
                .map_err(|e| UsmError::Io("Couldn't write probe log".into(), e))?;
        }

        eprintln!(
            "Probe complete. All logs are stored in the {} folder",
            self.output.display().errstyle(Style::new().green()),
        );
        Ok(())
    }
}

impl Probe {
    fn probe_one(
        &self,
        usmfile: &std::path::Path,
        encoding: &'static sofdec_usm::Encoding,
        report: &mut String,
    ) -> Result<(), UsmError> {
        let mut usm = Usm::open(usmfile, None, encoding)?;
        let _ = writeln!(report, "Version: {:#x}", usm.version());
        if let Some(crid) = usm.usm_crid() {
            let _ = writeln!(report, "{:#?}", crid);
        }
        for video in usm.videos() {
            let _ = writeln!(report, "{}", format_channel_for_console("@SFV", video.as_ref()));
            let _ = writeln!(report, "{:#?}", video.header_page());
        }
        for audio in usm.audios() {
            let _ = writeln!(report, "{}", format_channel_for_console("@SFA", audio.as_ref()));
            let _ = writeln!(report, "{:#?}", audio.header_page());
        }

        let temp_dir = tempfile::tempdir()
            .map_err(|e| UsmError::Io("Couldn't create temp folder".into(), e))?;
        let (videos, audios) = usm.demux(temp_dir.path(), true, true, false, None)?;

        for video in videos {
            let _ = writeln!(report, "Video {}:", video.display());
            let info = probe(
                &video,
                self.ffprobe.as_deref(),
                Some("packet=dts,pts_time,pos,flags"),
            )?;
            let _ = writeln!(report, "format: {:#?}", info.format);
            let _ = writeln!(report, "streams: {:#?}", info.streams);
            let _ = writeln!(report, "packets: {}", info.packets.len());
        }
        for audio in audios {
            let _ = writeln!(report, "Audio {}:", audio.display());
            match probe(&audio, self.ffprobe.as_deref(), None) {
                Ok(info) => {
                    let _ = writeln!(report, "format: {:#?}", info.format);
                    let _ = writeln!(report, "streams: {:#?}", info.streams);
                }
                Err(e) => {
                    // HCA is not something every ffprobe build knows.
                    let _ = writeln!(report, "ffprobe failed: {:#?}", e);
                }
            }
        }

        Ok(())
    }
}
