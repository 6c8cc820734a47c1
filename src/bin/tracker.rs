//! # btmini Tracker
//!
//! The tracker-side process of the btmini file-sharing system: answers
//! `GET /announce` queries over HTTP and keeps the per-content swarms in
//! memory. All state lives in one [`TrackerState`] shared across handlers;
//! nothing is persisted.

#[macro_use]
extern crate log;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::Parser;

use btmini::server;
use btmini::swarm::TrackerState;

// Default TCP port to listen on
const DEFAULT_PORT: u16 = 8080;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A minimal BitTorrent-style announce tracker."
)]
struct Args {
    /// TCP port to listen on
    #[arg(default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[tokio::main]
async fn run(args: Args) -> Result<()> {
    let state = Arc::new(Mutex::new(TrackerState::new()));

    info!("starting tracker on port {}", args.port);
    server::run(args.port, state).await
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run tracker, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }
}
