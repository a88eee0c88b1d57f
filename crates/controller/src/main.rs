mod channel;
mod client;
mod cmd;
mod config;
mod daemon;
mod device;
mod dispatch;
mod logging;
mod shutdown;

use anyhow::Result;
use clap::Parser;

use crate::config::Cli;
use crate::config::Commands;

fn main() -> Result<()> {
    logging::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Daemon(args) => cmd::daemon::run(args),
        Commands::Send(args) => cmd::send::run(args),
        Commands::ShowTable(args) => cmd::show_table::run(args),
    }
}
