//! nmea-bridge: forwards GPS NMEA from ModemManager into a PTY that gpsd reads.
//!
//! # Usage
//!
//! ```text
//! nmea-bridge run [MODEM_INDEX] [--config FILE] [--link PATH] [--group NAME] [--no-handoff]
//! nmea-bridge sources [--json]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{run::RunArgs, sources::SourcesArgs};

#[derive(Parser, Debug)]
#[command(
    name = "nmea-bridge",
    version,
    about = "Bridge ModemManager GPS NMEA output to gpsd through a pseudo-terminal",
    long_about = None,
)]
struct Cli {
    /// Log filter used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bridge in the foreground until SIGTERM or SIGINT.
    Run(RunArgs),

    /// List ModemManager modems with a Location interface.
    Sources(SourcesArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    nmea_bridge_daemon::init_tracing(&cli.log_level);
    match cli.command {
        Commands::Run(args) => args.run(),
        Commands::Sources(args) => args.run(),
    }
}
