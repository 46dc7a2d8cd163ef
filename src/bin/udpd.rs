//! udpd: unprivileged transparent UDP proxy client
//!
//! Binds the transparent listening socket, connects to socketd, checks
//! that the broker hands out datagram sockets and builds the session table.
//! Relaying datagrams is not implemented yet, so the process stops there
//! with a non-zero exit code.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::Parser;
use sockbroker::broker::BrokerClient;
use sockbroker::error::exit_code_for;
use sockbroker::logging;
use sockbroker::proxy::{self, ProxyConfig, DEFAULT_IP, DEFAULT_PORT};
use sockbroker::session::{ProxySessions, RecencyPolicy, SessionTable, DEFAULT_CAPACITY};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

// CLI
#[derive(Parser)]
#[command(name = "udpd")]
#[command(version)]
#[command(about = "Transparent UDP proxy using socketd for its sockets")]
struct Cli {
    /// Listen IP
    #[arg(long, value_name = "IP", default_value = DEFAULT_IP)]
    ip: String,

    /// PORT to listen on
    #[arg(short, long, value_name = "PORT", default_value = DEFAULT_PORT)]
    port: String,

    /// PATH to socketd
    #[arg(short, long, value_name = "PATH", env = "UDPD_CONNECT")]
    connect: PathBuf,

    /// Number of concurrent peer sessions
    #[arg(long, value_name = "N", default_value_t = DEFAULT_CAPACITY)]
    table_size: usize,

    /// Give up on a socketd request after this many seconds (0 = never)
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    broker_timeout: u64,

    /// Evict the oldest session instead of the least recently used
    #[arg(long)]
    insertion_order: bool,

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
    let policy = if cli.insertion_order {
        RecencyPolicy::InsertionOrder
    } else {
        RecencyPolicy::LeastRecentlyUsed
    };
    let config = ProxyConfig::new(&cli.ip, &cli.port, cli.connect)?
        .with_table_size(cli.table_size)?
        .with_policy(policy);

    let listener = proxy::bind_transparent(config.listen)?;

    let mut broker = BrokerClient::connect(&config.broker_path)
        .with_context(|| format!("connect to socketd at '{}'", config.broker_path.display()))?;
    let timeout = Some(Duration::from_secs(cli.broker_timeout)).filter(|t| !t.is_zero());
    broker.set_timeout(timeout)?;
    let probe = broker
        .request_datagram()
        .context("request datagram socket from socketd")?;
    log::debug!("socketd handed out fd {}", probe.as_raw_fd());
    drop(probe);

    let table = SessionTable::with_policy(config.table_size, config.policy)?;
    let sessions = ProxySessions::new(table, broker);
    log::info!(
        "ready: {} sessions max ({:?}), listener fd {}",
        sessions.table().capacity(),
        sessions.table().policy(),
        listener.as_raw_fd()
    );

    proxy::relay()?;
    Ok(())
}
