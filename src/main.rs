//! # btmini Client
//!
//! The peer-side process of the btmini file-sharing system.
//!
//! ## Modes
//!
//! - `client -g <file>` generates `<file>.torrent` against the configured
//!   tracker announce URL and exits.
//! - With no mode flag the client runs interactively: it starts the UDP peer
//!   engine, scans the content root, keeps announcing every synced file in
//!   the background, and accepts commands on stdin.
//!
//! ## Long-lived activities
//!
//! Interactive mode runs three concurrent activities:
//!
//! - the stdin loop (the only mutator of the catalog and creator of
//!   downloads),
//! - the periodic announcer,
//! - the UDP engine's receive loop, which feeds received piece fragments
//!   into the download table.

#[macro_use]
extern crate log;

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use btmini::announcer::{Announcer, DEFAULT_SYNC_PERIOD_MS};
use btmini::catalog::{scan_content_root, sibling_torrent_path, CatalogEntry};
use btmini::downloads::DownloadTable;
use btmini::engine::UdpPeerEngine;
use btmini::metainfo::{make_metainfo, read_metainfo, Metainfo};
use btmini::net::parse_url;
use btmini::tracker::{AnnounceParams, TrackerClient};
use btmini::util::random_peer_id;

// Default port for the UDP peer engine
const DEFAULT_PEER_PORT: u16 = 6881;
// Default tracker endpoint
const DEFAULT_TRACKER_URL: &str = "http://127.0.0.1:8080/announce";
// Piece length used when generating metainfo
const GENERATE_PIECE_LENGTH: u64 = 512_000;
// Announce URLs without an explicit port go to plain HTTP
const DEFAULT_HTTP_PORT: u16 = 80;
// Give up on a download after this long without new bytes
const STALL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A minimal BitTorrent-style file sharing client."
)]
struct Args {
    /// Generate <FILE>.torrent against the configured tracker and exit
    #[arg(short = 'g', long = "generate", value_name = "FILE")]
    generate: Option<PathBuf>,

    /// Local UDP port for the peer engine
    #[arg(short = 'p', long = "port", default_value_t = DEFAULT_PEER_PORT)]
    port: u16,

    /// Tracker announce URL embedded in generated metainfo
    #[arg(long, default_value = DEFAULT_TRACKER_URL)]
    tracker: String,

    /// Content root scanned for shareable files
    #[arg(long, default_value = "./share")]
    root: PathBuf,

    /// Re-announce period in milliseconds
    #[arg(long = "sync-period-ms", default_value_t = DEFAULT_SYNC_PERIOD_MS)]
    sync_period_ms: u64,
}

/// Sanitize a filename to prevent path traversal and basic issues.
fn sanitize_filename(filename: &str) -> String {
    // Replace path separators with underscores to prevent directory traversal
    let safe_name = filename.replace(['/', '\\'], "_");

    // Use default name if empty
    if safe_name.trim().is_empty() {
        "download".to_string()
    } else {
        safe_name
    }
}

fn run(args: Args) -> Result<()> {
    // Generation mode: write the metainfo next to the file and exit
    if let Some(file) = &args.generate {
        if !file.exists() {
            return Err(anyhow!("could not find file: {}", file.display()));
        }

        let out_path = sibling_torrent_path(file);
        make_metainfo(file, &args.tracker, &out_path, GENERATE_PIECE_LENGTH)?;
        println!("Generated \"{}\".", out_path.display());
        return Ok(());
    }

    interactive(args)
}

fn interactive(args: Args) -> Result<()> {
    let peer_id = random_peer_id();
    let downloads = Arc::new(DownloadTable::new());

    // The engine feeds every received fragment into the download table
    let mut engine = UdpPeerEngine::new(args.port)?;
    let table = Arc::clone(&downloads);
    engine.set_piece_chunk_handler(Box::new(
        move |infohash_hex: &str, piece_index: u32, offset: u64, total_size: u64, bytes: &[u8]| {
            table.apply_chunk(infohash_hex, piece_index, offset, total_size, bytes);
        },
    ));

    let engine = Arc::new(engine);
    engine.start();

    let catalog = Arc::new(Mutex::new(scan_content_root(&args.root)?));
    let sync_period_ms = Arc::new(AtomicU64::new(args.sync_period_ms));

    let announcer = Announcer::spawn(
        Arc::clone(&catalog),
        Arc::clone(&engine),
        Arc::clone(&sync_period_ms),
        peer_id.clone(),
    );

    println!(
        "btmini client: peer_id={} udp_port={} root={}",
        peer_id,
        engine.local_port(),
        args.root.display()
    );
    println!("Type 'help' for commands.");

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = tokens.first() else {
            continue;
        };

        let outcome = match command {
            "help" => {
                print_help();
                Ok(())
            }
            "ls" => {
                print_catalog(&catalog);
                Ok(())
            }
            "scan" => cmd_scan(&args.root, &catalog),
            "downloads" => {
                print_downloads(&downloads);
                Ok(())
            }
            "get" => match tokens.get(1) {
                Some(torrent) => cmd_get(
                    Path::new(torrent),
                    tokens.get(2).map(Path::new),
                    &engine,
                    &downloads,
                    &peer_id,
                ),
                None => Err(anyhow!("usage: get <torrent> [output]")),
            },
            "set" => cmd_set(&tokens, &sync_period_ms),
            "quit" | "exit" => break,
            _ => Err(anyhow!("unknown command: {} (try 'help')", command)),
        };

        if let Err(e) = outcome {
            println!("Error: {}", e);
        }
    }

    // Orderly shutdown: flag both activities and join them
    announcer.stop();
    engine.stop();

    Ok(())
}

fn print_help() {
    println!("Commands:");
    println!("  ls                     list the content catalog");
    println!("  scan                   rescan the content root");
    println!("  downloads              show download progress");
    println!("  get <torrent> [out]    download the content of a .torrent");
    println!("  set period <ms>        change the re-announce period");
    println!("  quit                   exit");
}

fn print_catalog(catalog: &Mutex<Vec<CatalogEntry>>) {
    let entries = match catalog.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    if entries.is_empty() {
        println!("Catalog is empty; drop files into the content root and 'scan'.");
        return;
    }

    for entry in entries.iter() {
        let sync_mark = if entry.synced { "synced" } else { "      " };
        println!(
            "  [{}] {:<32} {:>12} B  {}",
            sync_mark, entry.name, entry.size_bytes, entry.infohash_hex
        );
    }
}

fn cmd_scan(root: &Path, catalog: &Mutex<Vec<CatalogEntry>>) -> Result<()> {
    let entries = scan_content_root(root)?;
    println!(
        "Scanned {}: {} entries, {} synced.",
        root.display(),
        entries.len(),
        entries.iter().filter(|e| e.synced).count()
    );

    let mut guard = match catalog.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *guard = entries;

    Ok(())
}

fn print_downloads(downloads: &DownloadTable) {
    let snapshot = downloads.snapshot();
    if snapshot.is_empty() {
        println!("No downloads.");
        return;
    }

    for d in snapshot {
        let state = if d.completed { "done" } else { "    " };
        println!(
            "  [{}] {:<32} {:>12}/{} B  pieces {}/{}",
            state, d.name, d.bytes_downloaded, d.total_size, d.pieces_complete, d.num_pieces
        );
    }
}

fn cmd_set(tokens: &[&str], sync_period_ms: &AtomicU64) -> Result<()> {
    match (tokens.get(1), tokens.get(2)) {
        (Some(&"period"), Some(value)) => {
            let ms: u64 = value
                .parse()
                .map_err(|_| anyhow!("bad period: {}", value))?;
            sync_period_ms.store(ms, Ordering::Relaxed);
            println!("Re-announce period set to {} ms.", ms);
            Ok(())
        }
        _ => Err(anyhow!("usage: set period <ms>")),
    }
}

/// Download the content described by a metainfo file.
///
/// Announces to the metainfo's tracker, hole-punches every returned peer,
/// then requests every piece in ascending order from the first peer and
/// watches progress until the download completes or stalls.
fn cmd_get(
    torrent_path: &Path,
    output: Option<&Path>,
    engine: &Arc<UdpPeerEngine>,
    downloads: &Arc<DownloadTable>,
    peer_id: &str,
) -> Result<()> {
    let meta = read_metainfo(torrent_path)?;
    let infohash_hex = meta.infohash_hex();

    // Discover the swarm
    let parts = parse_url(&meta.announce)?;
    let client = TrackerClient::new(&parts.host, parts.port.unwrap_or(DEFAULT_HTTP_PORT));
    let reply = client.announce(&AnnounceParams {
        info_hash: meta.infohash.clone(),
        peer_id: peer_id.to_string(),
        port: engine.local_port(),
        ..Default::default()
    })?;

    if reply.peers.is_empty() {
        return Err(anyhow!("no peers in swarm for {}", meta.name));
    }

    // Open NAT mappings toward the whole swarm before requesting
    for peer in &reply.peers {
        if let Err(e) = engine.punch_to(&peer.ip, peer.port, peer_id) {
            warn!("could not punch to {}:{}: {}", peer.ip, peer.port, e);
        }
    }

    let output_path = match output {
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(sanitize_filename(&meta.name)),
    };

    if !downloads.add(&meta, &output_path) {
        return Err(anyhow!("already downloading {}", meta.name));
    }

    // Simplest strategy: every piece, in order, from the first peer
    let source = &reply.peers[0];
    println!(
        "Downloading \"{}\" ({} pieces) from {}:{}",
        meta.name,
        meta.num_pieces(),
        source.ip,
        source.port
    );
    for index in 0..meta.num_pieces() {
        engine.request_piece_from(&source.ip, source.port, &infohash_hex, index, peer_id)?;
    }

    watch_progress(&meta, &infohash_hex, downloads, &output_path)
}

/// Poll download progress and render it until completion or stall.
fn watch_progress(
    meta: &Metainfo,
    infohash_hex: &str,
    downloads: &DownloadTable,
    output_path: &Path,
) -> Result<()> {
    // Create progress bar
    let pb = ProgressBar::new(meta.length);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")
            .unwrap()
            .progress_chars("#>-"),
    );

    let mut last_bytes = 0;
    let mut last_change = Instant::now();

    loop {
        let Some(progress) = downloads.progress(infohash_hex) else {
            return Err(anyhow!("download disappeared"));
        };

        pb.set_position(progress.bytes_downloaded);

        if progress.completed {
            pb.finish();
            println!("Saved in \"{}\".", output_path.display());
            return Ok(());
        }

        if progress.bytes_downloaded != last_bytes {
            last_bytes = progress.bytes_downloaded;
            last_change = Instant::now();
        } else if last_change.elapsed() > STALL_TIMEOUT {
            pb.abandon();
            println!(
                "Download stalled at {}/{} bytes; lost fragments are not re-requested.",
                progress.bytes_downloaded, progress.total_size
            );
            return Ok(());
        }

        std::thread::sleep(Duration::from_millis(200));
    }
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run program, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }

    // Exit success
    std::process::exit(0);
}
