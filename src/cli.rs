use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Piece picking, upload rate limiting and swarm statistics for a BitTorrent client."
)]
pub struct Cli {
    /// log more, repeat for trace output
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// run a local node against simulated peers and print its final statistics as JSON
    Simulate(SimulateArgs),
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[arg(long, default_value_t = 64)]
    pub pieces: usize,

    #[arg(long, default_value_t = 32 * 1024)]
    pub piece_length: u32,

    #[arg(long, default_value_t = 6)]
    pub peers: usize,

    /// global upload cap in bytes/sec, 0 lifts it. overrides the config file
    #[arg(long)]
    pub rate: Option<u64>,

    /// wall clock run time
    #[arg(long, default_value_t = 10.0)]
    pub seconds: f64,

    /// engine settings as JSON
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// include the per peer table in the output
    #[arg(long)]
    pub spew: bool,

    /// fraction of pieces the local node starts with
    #[arg(long, default_value_t = 0.3)]
    pub have: f64,

    /// fraction of pieces each simulated peer starts with
    #[arg(long, default_value_t = 0.5)]
    pub peer_have: f64,

    /// bytes/sec each simulated peer uploads to us
    #[arg(long, default_value_t = 128 * 1024)]
    pub peer_rate: u64,

    /// bytes/sec each simulated link drains towards its peer
    #[arg(long, default_value_t = 512 * 1024)]
    pub link_rate: u64,

    /// chance that a piece arrives corrupted
    #[arg(long, default_value_t = 0.0)]
    pub corrupt: f64,

    /// rng seed for piece data and peer bitfields
    #[arg(long, default_value_t = 1)]
    pub seed: u64,
}
