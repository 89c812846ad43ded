use clap::Parser;

/// Automatic image updates for labelled containers.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Validate the environment configuration and exit.
    #[arg(long)]
    pub check_config: bool,

    /// Run a single check cycle and exit.
    #[arg(long)]
    pub once: bool,
}
