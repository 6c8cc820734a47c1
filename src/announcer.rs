//! # Periodic Announcer
//!
//! Background activity that keeps this client registered as a seeder. On a
//! fixed interval it walks the synced subset of the catalog and, for each
//! entry, registers the content file with the UDP engine, announces to the
//! tracker named in the sibling metainfo, and hole-punches every peer the
//! tracker returned.
//!
//! A failure on one entry (bad URL, unreadable metainfo, unreachable
//! tracker) is logged and never aborts the tick. The sleep period is re-read
//! from shared configuration on every tick, so interactive edits take effect
//! without a restart; the shutdown channel doubles as a cancellable sleep.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;

use crate::catalog::{sibling_torrent_path, CatalogEntry};
use crate::engine::UdpPeerEngine;
use crate::metainfo::read_metainfo;
use crate::net::parse_url;
use crate::tracker::{AnnounceParams, TrackerClient};

/// Default re-announce period.
pub const DEFAULT_SYNC_PERIOD_MS: u64 = 30_000;

// Announce URLs without an explicit port go to plain HTTP
const DEFAULT_HTTP_PORT: u16 = 80;

/// Handle on the running announcer activity.
pub struct Announcer {
    shutdown_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl Announcer {
    /// Spawn the announcer thread.
    ///
    /// # Arguments
    ///
    /// * `catalog` - Shared catalog; only its synced entries are announced.
    /// * `engine` - Peer engine used to register files and punch peers.
    /// * `sync_period_ms` - Shared re-announce period, re-read every tick.
    /// * `peer_id` - This process's peer id.
    ///
    pub fn spawn(
        catalog: Arc<Mutex<Vec<CatalogEntry>>>,
        engine: Arc<UdpPeerEngine>,
        sync_period_ms: Arc<AtomicU64>,
        peer_id: String,
    ) -> Announcer {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let handle = thread::spawn(move || {
            info!(
                "announcer started (period {} ms)",
                sync_period_ms.load(Ordering::Relaxed)
            );

            loop {
                announce_all(&catalog, &engine, &peer_id);

                // Re-read the period so UI edits apply without restart
                let period =
                    Duration::from_millis(sync_period_ms.load(Ordering::Relaxed).max(100));
                match shutdown_rx.recv_timeout(period) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => continue,
                }
            }

            info!("announcer stopped");
        });

        Announcer {
            shutdown_tx,
            handle,
        }
    }

    /// Stop the announcer and join its thread.
    pub fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.handle.join();
    }
}

/// Run one announce tick over the synced catalog entries.
fn announce_all(catalog: &Mutex<Vec<CatalogEntry>>, engine: &UdpPeerEngine, peer_id: &str) {
    // Snapshot under a brief lock; the catalog belongs to the UI activity
    let synced: Vec<CatalogEntry> = {
        let entries = match catalog.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.iter().filter(|e| e.synced).cloned().collect()
    };

    for entry in &synced {
        if let Err(e) = announce_entry(entry, engine, peer_id) {
            warn!("announce failed for {}: {}", entry.name, e);
        }
    }
}

/// Announce one synced entry and hole-punch the peers that came back.
fn announce_entry(entry: &CatalogEntry, engine: &UdpPeerEngine, peer_id: &str) -> Result<()> {
    let torrent_path = sibling_torrent_path(&entry.path);
    let meta = read_metainfo(&torrent_path)?;

    // Seed: make the content servable before telling the tracker about it
    engine.register_local_file(
        &meta.infohash_hex(),
        &entry.path,
        meta.piece_length,
        meta.length,
    );

    let parts = parse_url(&meta.announce)?;
    let client = TrackerClient::new(&parts.host, parts.port.unwrap_or(DEFAULT_HTTP_PORT));

    let reply = client.announce(&AnnounceParams {
        info_hash: meta.infohash.clone(),
        peer_id: peer_id.to_string(),
        port: engine.local_port(),
        ..Default::default()
    })?;

    debug!(
        "tracker returned {} peer(s) for {}",
        reply.peers.len(),
        entry.name
    );

    for peer in &reply.peers {
        if let Err(e) = engine.punch_to(&peer.ip, peer.port, peer_id) {
            warn!("could not punch to {}:{}: {}", peer.ip, peer.port, e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    #[test]
    fn entry_without_metainfo_fails_without_panicking() {
        let engine = Arc::new(UdpPeerEngine::new(0).unwrap());
        let entry = CatalogEntry {
            path: PathBuf::from("/nonexistent/content.bin"),
            name: "content.bin".to_string(),
            size_bytes: 0,
            infohash_hex: String::new(),
            synced: true,
        };

        assert!(announce_entry(&entry, &engine, "pid").is_err());
    }

    #[test]
    fn spawn_and_stop_joins_cleanly() {
        let catalog = Arc::new(Mutex::new(vec![]));
        let engine = Arc::new(UdpPeerEngine::new(0).unwrap());
        let period = Arc::new(AtomicU64::new(10_000));

        let announcer = Announcer::spawn(catalog, engine, period, "pid".to_string());
        // The first tick runs immediately over an empty catalog
        announcer.stop();
    }
}
