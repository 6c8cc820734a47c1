//! # Tracker Swarm State
//!
//! The tracker's whole state is one in-memory index from infohash to the
//! peers currently announcing it. Peers are upserted on announce, removed on
//! an explicit `stopped` event, and garbage collected when their last
//! announce is older than the TTL.
//!
//! ## Peer identity
//!
//! A peer is identified by the triple `(addr, port, peer_id)`. The address
//! is the one the tracker observed on the TCP connection, never a value the
//! client supplied. Insertion order inside a swarm is preserved across
//! upserts: a re-announcing peer keeps its position and only refreshes its
//! `last_seen` timestamp.
//!
//! ## Concurrency
//!
//! The state itself is not synchronised; the announce service wraps it in a
//! single mutex, which is all the serialisation the tracker needs.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::util::to_hex;

/// How long until an un-refreshed peer record is considered stale.
pub const DEFAULT_PEER_TTL: Duration = Duration::from_secs(120);

/// Upper bound on the peer list returned for one announce.
pub const MAX_PEERS_RETURNED: usize = 50;

/// One peer registered in a swarm.
#[derive(Debug, Clone)]
pub struct SwarmPeer {
    /// Address observed on the announce connection
    pub addr: IpAddr,
    /// Peer engine port supplied in the announce
    pub port: u16,
    /// Peer id supplied in the announce
    pub peer_id: String,
    /// When this peer last announced
    pub last_seen: Instant,
}

impl SwarmPeer {
    fn matches(&self, addr: IpAddr, port: u16, peer_id: &str) -> bool {
        self.addr == addr && self.port == port && self.peer_id == peer_id
    }
}

/// All swarms known to the tracker.
#[derive(Debug, Default)]
pub struct TrackerState {
    // infohash -> list of peers, insertion ordered
    swarms: HashMap<Vec<u8>, Vec<SwarmPeer>>,
    ttl: Duration,
}

impl TrackerState {
    /// Build an empty tracker state with the default TTL.
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_PEER_TTL)
    }

    /// Build an empty tracker state with a custom TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        TrackerState {
            swarms: HashMap::new(),
            ttl,
        }
    }

    /// Drop every peer whose last announce is older than the TTL.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let ttl = self.ttl;

        for (infohash, peers) in &mut self.swarms {
            let before = peers.len();
            peers.retain(|p| now.duration_since(p.last_seen) <= ttl);
            if peers.len() < before {
                debug!(
                    "gc: swarm {} dropped {} stale peer(s), {} remaining",
                    to_hex(infohash),
                    before - peers.len(),
                    peers.len()
                );
            }
        }
    }

    /// Refresh a known peer or append a new one to the swarm.
    pub fn upsert_peer(&mut self, infohash: &[u8], addr: IpAddr, port: u16, peer_id: &str) {
        let peers = self.swarms.entry(infohash.to_vec()).or_default();
        let now = Instant::now();

        // A known triple only gets its timestamp refreshed
        for p in peers.iter_mut() {
            if p.matches(addr, port, peer_id) {
                p.last_seen = now;
                return;
            }
        }

        debug!(
            "swarm {}: new peer {}:{} peer_id={}",
            to_hex(infohash),
            addr,
            port,
            peer_id
        );
        peers.push(SwarmPeer {
            addr,
            port,
            peer_id: peer_id.to_string(),
            last_seen: now,
        });
    }

    /// Remove a peer from the swarm. No-op if the swarm or peer is unknown.
    pub fn remove_peer(&mut self, infohash: &[u8], addr: IpAddr, port: u16, peer_id: &str) {
        let Some(peers) = self.swarms.get_mut(infohash) else {
            debug!("remove: no swarm for infohash {}", to_hex(infohash));
            return;
        };

        let before = peers.len();
        peers.retain(|p| !p.matches(addr, port, peer_id));
        debug!(
            "swarm {}: removed {} peer(s), {} remaining",
            to_hex(infohash),
            before - peers.len(),
            peers.len()
        );
    }

    /// List the swarm for `infohash`, excluding the requesting peer itself,
    /// capped at [`MAX_PEERS_RETURNED`] entries.
    pub fn list_peers(
        &self,
        infohash: &[u8],
        self_addr: IpAddr,
        self_port: u16,
        self_peer_id: &str,
    ) -> Vec<SwarmPeer> {
        let mut out = vec![];
        let Some(peers) = self.swarms.get(infohash) else {
            return out;
        };

        for p in peers {
            if p.matches(self_addr, self_port, self_peer_id) {
                continue;
            }
            out.push(p.clone());
            if out.len() >= MAX_PEERS_RETURNED {
                break;
            }
        }

        out
    }

    /// Number of peers currently registered for `infohash`.
    pub fn swarm_size(&self, infohash: &[u8]) -> usize {
        self.swarms.get(infohash).map_or(0, Vec::len)
    }
}
