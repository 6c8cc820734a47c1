//! # Shared Utilities
//!
//! Small helpers used across the client and the tracker: hex encoding for
//! infohash display and the per-process peer id.
//!
//! Infohashes travel as raw bytes inside the metainfo codec and the tracker
//! query string, but every external surface (peer wire headers, the catalog,
//! log lines) shows them as uppercase hex.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use std::io::Read;

/// Length of the per-process peer id.
pub const PEER_ID_LEN: usize = 10;

/// Encode bytes as uppercase hex.
pub fn to_hex(data: &[u8]) -> String {
    const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(data.len() * 2);

    for &byte in data {
        out.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        out.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
    }

    out
}

/// Generate the random alphanumeric peer id.
///
/// Generated once per process start; tests that need a fixed identity pass
/// their own string instead.
pub fn random_peer_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PEER_ID_LEN)
        .map(char::from)
        .collect()
}

/// Fill `buf` from `reader`, tolerating short reads. Returns the number of
/// bytes read; fewer than `buf.len()` only at end of input.
pub fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(filled)
}
