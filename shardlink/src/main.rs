//! Command line tool for probing shards.
//!
//! This handles only the CLI and config file loading, the probing lives in
//! [`shardlink::probe`].

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use n0_snafu::{Result, ResultExt};
use shardlink::{Config, EchoServer, Shard, defaults::DEFAULT_ECHO_BIND_ADDR, rank};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, prelude::*};

/// Measure and rank relay shards.
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file.
    ///
    /// Defaults are used when not provided.
    #[clap(long, short)]
    config_path: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run one probe round against the given shards and print them fastest first.
    Probe {
        /// Shard addresses as `host:port`.
        #[clap(required = true)]
        addrs: Vec<String>,
        /// Override the collection window, e.g. `500ms`.
        #[clap(long, value_parser = humantime::parse_duration)]
        window: Option<Duration>,
    },
    /// Echo probes back to their sender, acting as a shard.
    Echo {
        /// Address to listen on.
        #[clap(long, short, default_value = DEFAULT_ECHO_BIND_ADDR)]
        bind: SocketAddr,
        /// Delay every reply, e.g. `20ms`.
        #[clap(long, value_parser = humantime::parse_duration, default_value = "0s")]
        delay: Duration,
    },
}

async fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config_path {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            Config::load(path).await.e()
        }
        None => Ok(Config::default()),
    }
}

async fn probe(config: Config, addrs: Vec<String>, window: Option<Duration>) -> Result<()> {
    let mut prober = config.prober();
    if let Some(window) = window {
        prober = prober.with_window(window);
    }
    let shards = addrs.into_iter().map(Shard::new).collect();
    let shards = rank(prober.probe(shards).await.e()?);
    for (i, shard) in shards.iter().enumerate() {
        match shard.rtt_ms() {
            Some(rtt) => println!("{:>3}  {:<40} {rtt:>9.3} ms", i + 1, shard.addr),
            None => println!("{:>3}  {:<40} {:>12}", i + 1, shard.addr, "no reply"),
        }
    }
    Ok(())
}

async fn echo(bind: SocketAddr, delay: Duration) -> Result<()> {
    let server = EchoServer::spawn(bind, delay)
        .await
        .context("failed to bind echo server")?;
    info!(local_addr = %server.local_addr(), "echoing probes, ctrl-c to stop");
    // Dropping the server on ctrl-c stops it.
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("failed to listen for ctrl-c")?,
        _ = server.join() => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli).await?;
    match cli.command {
        Command::Probe { addrs, window } => probe(config, addrs, window).await,
        Command::Echo { bind, delay } => echo(bind, delay).await,
    }
}
