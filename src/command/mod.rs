use clap::{Parser, Subcommand};

use sofdec_usm::error::UsmError;

use crate::command::global_args::GlobalArgs;

mod create;
mod encrypt;
mod extract;
mod find;
mod global_args;
mod probe;

pub trait UsmToolCommand {
    fn run(self, global_args: GlobalArgs) -> Result<(), UsmError>;
}

#[derive(Parser, Debug)]
#[clap(about = "CRI Sofdec2 USM toolkit", version)]
pub struct UsmTool {
    #[clap(flatten)]
    pub global_args: GlobalArgs,
    /// Thing to do.
    #[clap(subcommand)]
    pub subcommand: UsmToolSubcommand,
}

#[derive(Subcommand, Debug)]
pub enum UsmToolSubcommand {
    #[clap(name = "extractusm")]
    Extract(extract::Extract),
    #[clap(name = "createusm")]
    Create(create::Create),
    #[clap(name = "probeusm")]
    Probe(probe::Probe),
    #[clap(name = "encryptusm")]
    Encrypt(encrypt::Encrypt),
}

impl UsmToolCommand for UsmToolSubcommand {
    fn run(self, global_args: GlobalArgs) -> Result<(), UsmError> {
        match self {
            UsmToolSubcommand::Extract(v) => v.run(global_args),
            UsmToolSubcommand::Create(v) => v.run(global_args),
            UsmToolSubcommand::Probe(v) => v.run(global_args),
            UsmToolSubcommand::Encrypt(v) => v.run(global_args),
        }
    }
}
