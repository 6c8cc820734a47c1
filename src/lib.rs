//! # btmini
//!
//! A minimal BitTorrent-style file sharing system, split into two
//! cooperating services:
//!
//! - a **tracker** that maintains swarm membership per content item and
//!   answers HTTP announce queries;
//! - a **client** that generates `.torrent` metainfo files, registers as a
//!   seeder, and exchanges pieces with other peers over a single UDP socket.
//!
//! ## Architecture
//!
//! - **Metainfo codec** ([`metainfo`]): bencoded `.torrent` files, SHA-256
//!   piece hashing, and the infohash derived from the `info` dictionary.
//! - **Swarm state** ([`swarm`], [`server`]): an in-memory index from
//!   infohash to live peers with TTL eviction, served over HTTP.
//! - **UDP peer engine** ([`engine`]): hole-punch handshakes, piece serving
//!   from registered local files, and piece fragment reception.
//! - **Download bookkeeping** ([`downloads`]): sparse output files and
//!   per-piece progress accounting.
//! - **Periodic announcer** ([`announcer`]): re-announces every synced file
//!   to its tracker and hole-punches the returned peers.

#[macro_use]
extern crate log;

pub mod announcer;
pub mod catalog;
pub mod downloads;
pub mod engine;
pub mod metainfo;
pub mod net;
pub mod server;
pub mod swarm;
pub mod tracker;
pub mod util;
