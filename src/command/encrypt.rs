use std::fs::File;
use std::path::PathBuf;

use clap::Args;
use owo_colors::Style;

use sofdec_usm::error::UsmError;
use sofdec_usm::tools::{encoding_for_label, parse_key};
use sofdec_usm::{OpMode, Usm};

use crate::command::global_args::GlobalArgs;
use crate::command::UsmToolCommand;
use crate::console::ErrStyle;

/// Re-pack a plain USM with its stream payloads obfuscated.
#[derive(Args, Debug)]
pub struct Encrypt {
    /// Path to the USM file.
    input: PathBuf,
    /// Encryption key, decimal or hex.
    #[clap(short, long)]
    key: String,
    /// Output path. Defaults to "<input>.encrypted.usm".
    #[clap(short, long)]
    output: Option<PathBuf>,
}

impl UsmToolCommand for Encrypt {
    fn run(self, global_args: GlobalArgs) -> Result<(), UsmError> {
        let encoding = encoding_for_label(&global_args.encoding)?;
        let key = parse_key(&self.key)?;

        let mut usm = Usm::open(&self.input, None, encoding)?;
        usm.set_key(key);

        let output_path = self
            .output
            .unwrap_or_else(|| self.input.with_extension("encrypted.usm"));
        let mut output = File::create(&output_path)
            .map_err(|e| UsmError::Io("Couldn't create output file".into(), e))?;
        let written = usm.pack_into(&mut output, OpMode::Encrypt, encoding)?;

        eprintln!(
            "Done encrypting {} ({} bytes)",
            output_path.display().errstyle(Style::new().green()),
            written.errstyle(Style::new().yellow()),
        );
        Ok(())
    }
}
