use clap::Args;

#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Character encoding used in USM page strings.
    #[clap(short, long, default_value = "shift-jis")]
    pub encoding: String,
    /// Verbosity level, repeat to increase.
    #[clap(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
