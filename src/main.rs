mod cli;
mod simulate;

use clap::Parser;
use cli::{Cli, Command};
use swarm_core::prelude::*;

use tokio_util::sync::CancellationToken;

use tracing_subscriber::{filter, fmt, layer::SubscriberExt, registry::Registry, Layer};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => filter::LevelFilter::INFO,
        1 => filter::LevelFilter::DEBUG,
        _ => filter::LevelFilter::TRACE,
    };
    // stdout carries the statistics JSON
    let fmt_layer = fmt::Layer::default()
        .pretty()
        .with_writer(std::io::stderr)
        .with_filter(level);

    let subscriber = Registry::default().with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
        .context("could not set global tracing subscriber")?;

    let shutdown_token = CancellationToken::new();
    let ctrl_c_token = shutdown_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, wrapping up");
            ctrl_c_token.cancel();
        }
    });

    match cli.command {
        Command::Simulate(args) => simulate::run(args, shutdown_token).await,
    }
}
