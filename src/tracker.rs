//! # Tracker Announce Client
//!
//! Client side of the announce protocol: builds the percent-encoded query,
//! performs one blocking HTTP GET against the tracker, and parses the JSON
//! peer list out of the response.
//!
//! The infohash travels as raw percent-encoded bytes; everything else in the
//! query is plain ASCII. `uploaded`, `downloaded` and `left` are carried for
//! protocol compatibility and always zero in this client.

use anyhow::{anyhow, Result};
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};

use std::time::Duration;

use crate::server::AnnounceReply;

// Tracker connect/read timeout
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameters of one announce request.
#[derive(Debug, Clone, Default)]
pub struct AnnounceParams {
    /// Raw infohash bytes identifying the swarm
    pub info_hash: Vec<u8>,
    /// This client's peer id
    pub peer_id: String,
    /// UDP port other peers should reach us on
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    /// Announce event: `started`, `stopped`, or empty
    pub event: String,
}

/// One tracker endpoint.
#[derive(Debug, Clone)]
pub struct TrackerClient {
    host: String,
    port: u16,
    announce_path: String,
}

impl TrackerClient {
    /// Build a client for one tracker endpoint with the conventional
    /// `/announce` path.
    pub fn new(host: &str, port: u16) -> Self {
        TrackerClient {
            host: host.to_string(),
            port,
            announce_path: "/announce".to_string(),
        }
    }

    /// Announce to the tracker and return the parsed peer list.
    ///
    /// # Arguments
    ///
    /// * `params` - Announce parameters; see [`AnnounceParams`].
    ///
    pub fn announce(&self, params: &AnnounceParams) -> Result<AnnounceReply> {
        let url = format!(
            "http://{}:{}{}?{}",
            self.host,
            self.port,
            self.announce_path,
            build_query(params)
        );

        // Build blocking HTTP client
        let client = match reqwest::blocking::Client::builder()
            .timeout(ANNOUNCE_TIMEOUT)
            .build()
        {
            Ok(client) => client,
            Err(_) => return Err(anyhow!("could not build http client")),
        };

        // Send GET request to the tracker
        let response = match client.get(&url).send() {
            Ok(response) => response,
            Err(e) => return Err(anyhow!("could not reach tracker {}: {}", self.host, e)),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(anyhow!("tracker error: {} {}", status.as_u16(), body.trim()));
        }

        // Parse the JSON peer list
        match response.json::<AnnounceReply>() {
            Ok(reply) => Ok(reply),
            Err(e) => Err(anyhow!("could not parse tracker response: {}", e)),
        }
    }
}

/// Build the announce query string.
///
/// Every byte outside `[0-9A-Za-z]` is percent-encoded, which keeps raw
/// infohash bytes intact across the wire.
fn build_query(params: &AnnounceParams) -> String {
    let mut query = format!(
        "infohash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}",
        percent_encode(&params.info_hash, NON_ALPHANUMERIC),
        percent_encode(params.peer_id.as_bytes(), NON_ALPHANUMERIC),
        params.port,
        params.uploaded,
        params.downloaded,
        params.left,
    );

    if !params.event.is_empty() {
        query.push_str("&event=");
        query.push_str(&params.event);
    }

    query
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_percent_encodes_binary_infohash() {
        let params = AnnounceParams {
            info_hash: vec![0x00, 0xAB, 0xFF],
            peer_id: "pid123".to_string(),
            port: 6881,
            ..Default::default()
        };

        let query = build_query(&params);
        assert_eq!(
            query,
            "infohash=%00%AB%FF&peer_id=pid123&port=6881&uploaded=0&downloaded=0&left=0"
        );
    }

    #[test]
    fn event_is_elided_when_empty() {
        let mut params = AnnounceParams {
            info_hash: vec![0x01],
            peer_id: "p".to_string(),
            port: 1,
            ..Default::default()
        };
        assert!(!build_query(&params).contains("event"));

        params.event = "stopped".to_string();
        assert!(build_query(&params).ends_with("&event=stopped"));
    }
}
