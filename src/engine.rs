//! # UDP Peer Engine
//!
//! Peer-to-peer transport over a single UDP socket. The engine runs one
//! receive loop on a dedicated thread and demultiplexes incoming datagrams
//! into handlers; outbound operations may be invoked from any thread and
//! share the same socket.
//!
//! ## Wire format
//!
//! Every datagram begins with a single-line ASCII header terminated by a
//! newline; the binary payload, if any, follows the newline and runs to the
//! end of the datagram.
//!
//! | Message | Header | Body |
//! |---|---|---|
//! | Hole-punch | `HELLO <peer_id>` | — |
//! | Ack | `HELLO_ACK` | — |
//! | Piece request | `REQ_PIECE <infohash_hex> <piece_index> <peer_id>` | — |
//! | Piece fragment | `PIECE <infohash_hex> <piece_index> <offset> <total_size>` | bytes |
//!
//! Header tokens are whitespace-separated and parsing tolerates repeated
//! spaces. Unknown commands and truncated headers are logged and discarded;
//! a receive error never closes the socket.
//!
//! ## Serving pieces
//!
//! Content files registered with [`UdpPeerEngine::register_local_file`] are
//! served on `REQ_PIECE`: the piece is read from disk and split into
//! fragments small enough that header plus payload fit the receive buffer,
//! each sent with its offset inside the piece and the total piece size.
//!
//! ## Reception of pieces
//!
//! Incoming `PIECE` fragments are dispatched to the piece-chunk handler, a
//! single slot configured before [`UdpPeerEngine::start`]. Transfers are
//! send-and-forget: there is no retransmission and piece requests are not
//! gated on a completed hole-punch exchange.

use anyhow::{anyhow, Result};

use std::collections::HashMap;
use std::fs::File;
use std::io::{ErrorKind, Seek, SeekFrom};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::util::read_full;

/// Size of the receive buffer; no served datagram may exceed it.
pub const RECV_BUFFER_SIZE: usize = 2048;

// Margin kept for the fragment header inside one datagram
const HEADER_RESERVE: usize = 128;

/// Largest piece-fragment payload per datagram.
pub const MAX_FRAGMENT_PAYLOAD: usize = RECV_BUFFER_SIZE - HEADER_RESERVE;

// How often the receive loop rechecks the shutdown flag
const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Callback invoked for every received piece fragment with
/// `(infohash_hex, piece_index, offset_in_piece, total_piece_size, bytes)`.
pub type PieceChunkHandler = Box<dyn Fn(&str, u32, u64, u64, &[u8]) + Send + Sync>;

/// A registered content file this engine serves pieces from.
#[derive(Debug, Clone)]
struct LocalFile {
    path: PathBuf,
    piece_length: u64,
    file_length: u64,
}

/// Message-oriented peer engine bound to one UDP socket.
pub struct UdpPeerEngine {
    socket: UdpSocket,
    running: AtomicBool,
    // infohash hex (uppercase) -> servable file
    local_files: Mutex<HashMap<String, LocalFile>>,
    chunk_handler: Option<PieceChunkHandler>,
    recv_thread: Mutex<Option<JoinHandle<()>>>,
}

impl UdpPeerEngine {
    /// Bind the engine socket on `0.0.0.0:<local_port>`.
    ///
    /// Port 0 binds an ephemeral port; [`UdpPeerEngine::local_port`] reports
    /// the actual one. Failing to bind is fatal for the peer service.
    pub fn new(local_port: u16) -> Result<UdpPeerEngine> {
        let socket = match UdpSocket::bind(("0.0.0.0", local_port)) {
            Ok(socket) => socket,
            Err(e) => return Err(anyhow!("could not bind udp port {}: {}", local_port, e)),
        };

        // The receive loop polls so stop() can take effect
        if socket.set_read_timeout(Some(RECV_POLL_TIMEOUT)).is_err() {
            return Err(anyhow!("could not set udp read timeout"));
        }

        Ok(UdpPeerEngine {
            socket,
            running: AtomicBool::new(false),
            local_files: Mutex::new(HashMap::new()),
            chunk_handler: None,
            recv_thread: Mutex::new(None),
        })
    }

    /// The UDP port this engine is bound to.
    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Install the piece-chunk handler.
    ///
    /// One configuration slot, set before [`UdpPeerEngine::start`]; taking
    /// `&mut self` rules out replacement while the receive loop runs.
    pub fn set_piece_chunk_handler(&mut self, handler: PieceChunkHandler) {
        self.chunk_handler = Some(handler);
    }

    /// Start the receive loop on its own thread. No-op when already running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("peer engine starting on udp port {}", self.local_port());

        let engine = Arc::clone(self);
        let handle = thread::spawn(move || engine.receive_loop());

        if let Ok(mut slot) = self.recv_thread.lock() {
            *slot = Some(handle);
        }
    }

    /// Stop the receive loop and join its thread. No-op when not running.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let handle = self.recv_thread.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        info!("peer engine stopped");
    }

    /// Register a content file so piece requests for it can be served.
    pub fn register_local_file(
        &self,
        infohash_hex: &str,
        path: &Path,
        piece_length: u64,
        file_length: u64,
    ) {
        let key = infohash_hex.to_ascii_uppercase();

        let mut local_files = match self.local_files.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if !local_files.contains_key(&key) {
            debug!(
                "registered local file: infohash={} path={} piece_len={} file_len={}",
                key,
                path.display(),
                piece_length,
                file_length
            );
        }
        local_files.insert(
            key,
            LocalFile {
                path: path.to_path_buf(),
                piece_length,
                file_length,
            },
        );
    }

    /// Send a hole-punch `HELLO` datagram to a remote peer.
    ///
    /// Send-and-forget: the ack, if any, only shows up in the logs.
    pub fn punch_to(&self, ip: &str, port: u16, peer_id: &str) -> Result<()> {
        let addr = match ip.parse::<IpAddr>() {
            Ok(addr) => SocketAddr::new(addr, port),
            Err(_) => return Err(anyhow!("could not parse peer address: {}", ip)),
        };

        let msg = format!("HELLO {peer_id}");
        match self.socket.send_to(msg.as_bytes(), addr) {
            Ok(sent) => {
                debug!("TX {}B to {} :: '{}'", sent, addr, msg);
                Ok(())
            }
            Err(e) => Err(anyhow!("could not punch to {}: {}", addr, e)),
        }
    }

    /// Request one piece from a remote peer.
    pub fn request_piece_from(
        &self,
        ip: &str,
        port: u16,
        infohash_hex: &str,
        piece_index: u32,
        peer_id: &str,
    ) -> Result<()> {
        let addr = match ip.parse::<IpAddr>() {
            Ok(addr) => SocketAddr::new(addr, port),
            Err(_) => return Err(anyhow!("could not parse peer address: {}", ip)),
        };

        let msg = format!("REQ_PIECE {infohash_hex} {piece_index} {peer_id}");
        match self.socket.send_to(msg.as_bytes(), addr) {
            Ok(sent) => {
                debug!("TX {}B to {} :: '{}'", sent, addr, msg);
                Ok(())
            }
            Err(e) => Err(anyhow!("could not request piece from {}: {}", addr, e)),
        }
    }

    fn receive_loop(&self) {
        let mut buf = [0u8; RECV_BUFFER_SIZE];

        while self.running.load(Ordering::SeqCst) {
            match self.socket.recv_from(&mut buf) {
                Ok((bytes, from)) => self.handle_datagram(&buf[..bytes], from),
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    continue;
                }
                Err(e) => {
                    // Keep the socket; transient receive errors must not end
                    // the peer service
                    if self.running.load(Ordering::SeqCst) {
                        warn!("udp receive error: {}", e);
                        thread::sleep(Duration::from_millis(50));
                    }
                }
            }
        }

        debug!("peer engine receive loop exiting");
    }

    /// Split the header line off a datagram and dispatch by command.
    fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let newline = datagram.iter().position(|&b| b == b'\n');
        let header_bytes = match newline {
            Some(pos) => &datagram[..pos],
            None => datagram,
        };
        let body: &[u8] = match newline {
            Some(pos) => &datagram[pos + 1..],
            None => &[],
        };

        let header = String::from_utf8_lossy(header_bytes);
        let tokens: Vec<&str> = header.split_whitespace().collect();

        let Some(&cmd) = tokens.first() else {
            debug!("empty datagram from {}", from);
            return;
        };

        match cmd {
            "HELLO" => {
                let peer_id = tokens.get(1).copied().unwrap_or("<none>");
                debug!("HELLO from {} peer_id={}", from, peer_id);

                // Reply so the remote NAT mapping confirms both ways
                if let Err(e) = self.socket.send_to(b"HELLO_ACK", from) {
                    warn!("could not ack hello from {}: {}", from, e);
                }
            }
            "HELLO_ACK" => {
                debug!("HELLO_ACK from {}", from);
            }
            "REQ_PIECE" => {
                let (Some(infohash_hex), Some(index_raw)) = (tokens.get(1), tokens.get(2)) else {
                    debug!("truncated REQ_PIECE from {}", from);
                    return;
                };
                let Ok(piece_index) = index_raw.parse::<u32>() else {
                    debug!("REQ_PIECE with bad piece index from {}", from);
                    return;
                };

                debug!(
                    "REQ_PIECE from {} infohash={} index={}",
                    from, infohash_hex, piece_index
                );
                self.serve_piece(from, &infohash_hex.to_ascii_uppercase(), piece_index);
            }
            "PIECE" => {
                if tokens.len() < 5 {
                    debug!("truncated PIECE header from {}", from);
                    return;
                }
                let (Ok(piece_index), Ok(offset), Ok(total_size)) = (
                    tokens[2].parse::<u32>(),
                    tokens[3].parse::<u64>(),
                    tokens[4].parse::<u64>(),
                ) else {
                    debug!("PIECE header with bad numbers from {}", from);
                    return;
                };

                if body.is_empty() {
                    debug!("PIECE fragment without payload from {}", from);
                    return;
                }

                if let Some(handler) = &self.chunk_handler {
                    handler(
                        &tokens[1].to_ascii_uppercase(),
                        piece_index,
                        offset,
                        total_size,
                        body,
                    );
                }
            }
            _ => {
                debug!("unknown command '{}' from {}", cmd, from);
            }
        }
    }

    /// Read a piece from a registered file and send it as fragments.
    ///
    /// Each fragment datagram stays within the receive buffer budget. A
    /// request for an unregistered infohash or a piece past end of file is
    /// dropped with a log line.
    fn serve_piece(&self, to: SocketAddr, infohash_hex: &str, piece_index: u32) {
        let local_file = {
            let local_files = match self.local_files.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            local_files.get(infohash_hex).cloned()
        };
        let Some(local_file) = local_file else {
            debug!("no local file for infohash {}", infohash_hex);
            return;
        };

        let mut file = match File::open(&local_file.path) {
            Ok(file) => file,
            Err(e) => {
                warn!("could not open {}: {}", local_file.path.display(), e);
                return;
            }
        };

        let offset = u64::from(piece_index) * local_file.piece_length;
        if offset >= local_file.file_length {
            debug!(
                "requested piece {} past end of infohash {}",
                piece_index, infohash_hex
            );
            return;
        }

        // The final piece may be shorter than piece_length
        let total_size = local_file.piece_length.min(local_file.file_length - offset);

        if file.seek(SeekFrom::Start(offset)).is_err() {
            warn!("could not seek in {}", local_file.path.display());
            return;
        }

        let mut data_buf = vec![0u8; MAX_FRAGMENT_PAYLOAD];
        let mut sent_total: u64 = 0;

        while sent_total < total_size {
            let to_read = (MAX_FRAGMENT_PAYLOAD as u64).min(total_size - sent_total) as usize;
            let got = match read_full(&mut file, &mut data_buf[..to_read]) {
                Ok(0) => break,
                Ok(got) => got,
                Err(e) => {
                    warn!("could not read {}: {}", local_file.path.display(), e);
                    return;
                }
            };

            let header = format!(
                "PIECE {} {} {} {}\n",
                infohash_hex, piece_index, sent_total, total_size
            );

            let mut packet = Vec::with_capacity(header.len() + got);
            packet.extend_from_slice(header.as_bytes());
            packet.extend_from_slice(&data_buf[..got]);

            match self.socket.send_to(&packet, to) {
                Ok(sent) => debug!(
                    "TX {}B PIECE infohash={} index={} off={}",
                    sent, infohash_hex, piece_index, sent_total
                ),
                Err(e) => {
                    warn!("could not send piece fragment to {}: {}", to, e);
                    return;
                }
            }

            sent_total += got as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv_with_deadline(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let (n, from) = socket.recv_from(&mut buf).unwrap();
        (buf[..n].to_vec(), from)
    }

    #[test]
    fn fragment_budget_leaves_room_for_the_header() {
        // A full fragment header plus payload must fit the receive buffer
        let header = format!("PIECE {} {} {} {}\n", "F".repeat(64), u32::MAX, u64::MAX, u64::MAX);
        assert!(header.len() <= HEADER_RESERVE);
        assert!(MAX_FRAGMENT_PAYLOAD + HEADER_RESERVE <= RECV_BUFFER_SIZE);
    }

    #[test]
    fn punch_sends_hello_and_engine_acks_incoming_hello() {
        let engine = Arc::new(UdpPeerEngine::new(0).unwrap());
        engine.start();

        let remote = UdpSocket::bind("127.0.0.1:0").unwrap();
        let remote_port = remote.local_addr().unwrap().port();

        // Outbound hole-punch reaches the remote endpoint
        engine.punch_to("127.0.0.1", remote_port, "pidABCDEF").unwrap();
        let (datagram, _) = recv_with_deadline(&remote);
        assert_eq!(datagram, b"HELLO pidABCDEF");

        // An incoming HELLO is acked to the sender's endpoint
        remote
            .send_to(
                b"HELLO other-peer",
                ("127.0.0.1", engine.local_port()),
            )
            .unwrap();
        let (ack, _) = recv_with_deadline(&remote);
        assert_eq!(ack, b"HELLO_ACK");

        engine.stop();
    }

    #[test]
    fn unknown_commands_are_discarded_without_killing_the_loop() {
        let engine = Arc::new(UdpPeerEngine::new(0).unwrap());
        engine.start();

        let remote = UdpSocket::bind("127.0.0.1:0").unwrap();
        let engine_addr = ("127.0.0.1", engine.local_port());

        remote.send_to(b"BOGUS stuff here", engine_addr).unwrap();
        remote.send_to(b"", engine_addr).unwrap();
        remote.send_to(b"REQ_PIECE ABCD notanumber", engine_addr).unwrap();

        // The loop is still alive: a HELLO still gets acked
        remote.send_to(b"HELLO pid", engine_addr).unwrap();
        let (ack, _) = recv_with_deadline(&remote);
        assert_eq!(ack, b"HELLO_ACK");

        engine.stop();
    }

    #[test]
    fn request_for_unregistered_infohash_is_dropped() {
        let engine = Arc::new(UdpPeerEngine::new(0).unwrap());
        engine.start();

        let remote = UdpSocket::bind("127.0.0.1:0").unwrap();
        remote
            .send_to(
                b"REQ_PIECE 0123456789ABCDEF 0 pid",
                ("127.0.0.1", engine.local_port()),
            )
            .unwrap();

        remote
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        assert!(remote.recv_from(&mut buf).is_err());

        engine.stop();
    }
}
