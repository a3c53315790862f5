use clap::Parser;

use sofdec_usm::error::UsmError;

use crate::command::{UsmTool, UsmToolCommand};

mod command;
mod console;

fn main() -> Result<(), UsmError> {
    let args = UsmTool::parse();

    env_logger::Builder::from_default_env()
        .filter_level(match args.global_args.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        })
        .init();

    args.subcommand.run(args.global_args)
}
