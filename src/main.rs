//! socketd: privileged socket broker
//!
//! Listens on a Unix socket and hands freshly created AF_INET sockets to
//! whoever connects, one per request byte.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use clap::Parser;
use sockbroker::broker::{BrokerConfig, BrokerServer};
use sockbroker::error::exit_code_for;
use sockbroker::logging;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

// CLI
#[derive(Parser)]
#[command(name = "socketd")]
#[command(version)]
#[command(about = "Create sockets on behalf of an unprivileged proxy")]
struct Cli {
    /// PATH to unix domain socket
    #[arg(short, long, value_name = "PATH", env = "SOCKETD_LISTEN")]
    listen: PathBuf,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long, value_name = "SECS", default_value_t = 0)]
    read_timeout: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = BrokerConfig::new(cli.listen)?
        .with_read_timeout(Some(Duration::from_secs(cli.read_timeout)));

    let mut server = BrokerServer::new(config);
    server.start()
}
