//! # Announce Tracker Service
//!
//! HTTP front end for the swarm state. The tracker answers exactly one kind
//! of request, `GET /announce?...`, with a JSON peer list; everything else
//! is an error with a JSON body.
//!
//! ## Query protocol
//!
//! Parameters arrive percent-encoded, with `+` standing for space per
//! form-encoding conventions. The decoded `infohash` value is used as the
//! swarm key as raw bytes; it is not required to be valid UTF-8. Required
//! parameters are `infohash`, `peer_id` and `port`; `event` is optional
//! (`started`, `stopped` or empty). Legacy parameters such as `uploaded`,
//! `downloaded`, `left`, `compact` and `numwant` are accepted and ignored.
//!
//! ## Peer address
//!
//! The address stored in the swarm is the remote address of the TCP
//! connection that carried the announce. A client cannot register an
//! arbitrary IP on behalf of someone else.
//!
//! ## Concurrency
//!
//! One `TrackerState` behind a single mutex, locked once per announce. The
//! handlers do no blocking work while holding the lock.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

use crate::swarm::TrackerState;

/// Swarm state shared across announce handlers.
pub type SharedTrackerState = Arc<Mutex<TrackerState>>;

// Advised client re-announce period, seconds
const ANNOUNCE_INTERVAL_SECS: u32 = 60;

const SERVER_NAME: &str = "btmini-tracker";

/// One peer entry in an announce response.
#[derive(Debug, Serialize, Deserialize)]
pub struct PeerEntry {
    pub ip: String,
    pub port: u16,
}

/// Body of a successful announce response.
#[derive(Debug, Serialize, Deserialize)]
pub struct AnnounceReply {
    pub interval: u32,
    pub peers: Vec<PeerEntry>,
}

/// Run the tracker on `0.0.0.0:<port>` until the process is stopped.
pub async fn run(port: u16, state: SharedTrackerState) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => return Err(anyhow!("could not bind tracker port {}: {}", port, e)),
    };

    serve(listener, state).await
}

/// Serve announces on an already-bound listener until the process is
/// stopped.
pub async fn serve(listener: tokio::net::TcpListener, state: SharedTrackerState) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("tracker listening on http://{}", addr);
    }

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow!("tracker server error: {}", e))
}

/// Build the announce router.
pub fn router(state: SharedTrackerState) -> Router {
    Router::new()
        .route("/announce", any(handle_announce))
        .fallback(handle_not_found)
        .with_state(state)
}

async fn handle_announce(
    State(state): State<SharedTrackerState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
) -> Response {
    if method != Method::GET {
        debug!("rejecting {} {} from {}", method, uri.path(), remote);
        return json_response(StatusCode::METHOD_NOT_ALLOWED, r#"{"error":"use GET"}"#.into());
    }

    let (status, body) = announce(&state, remote.ip(), uri.query().unwrap_or(""));
    json_response(status, body)
}

async fn handle_not_found(uri: Uri) -> Response {
    debug!("no route for {}", uri.path());
    json_response(StatusCode::NOT_FOUND, r#"{"error":"not found"}"#.into())
}

/// Handle one announce: run GC, apply the event, and build the peer list.
///
/// Split out of the axum handler so the whole state transition is testable
/// without a socket. Returns the HTTP status and the response body.
pub fn announce(state: &SharedTrackerState, remote_addr: IpAddr, raw_query: &str) -> (StatusCode, String) {
    let params = parse_query(raw_query);

    let Some(infohash) = param(&params, "infohash") else {
        return missing_params();
    };
    let Some(peer_id) = param(&params, "peer_id") else {
        return missing_params();
    };
    let Some(port_raw) = param(&params, "port") else {
        return missing_params();
    };

    let peer_id = String::from_utf8_lossy(peer_id).into_owned();

    // The supplied port must be a valid unsigned 16-bit value
    let port: u16 = match String::from_utf8_lossy(port_raw).parse() {
        Ok(port) => port,
        Err(_) => {
            debug!("announce with unparsable port from {}", remote_addr);
            return (StatusCode::BAD_REQUEST, r#"{"error":"bad port"}"#.into());
        }
    };

    let event = param(&params, "event")
        .map(|v| String::from_utf8_lossy(v).into_owned())
        .unwrap_or_default();

    let mut state = match state.lock() {
        Ok(state) => state,
        Err(poisoned) => poisoned.into_inner(),
    };

    // Every announce starts by reaping stale peers
    state.gc();

    if event == "stopped" {
        state.remove_peer(infohash, remote_addr, port, &peer_id);
    } else {
        state.upsert_peer(infohash, remote_addr, port, &peer_id);
    }

    let peers = state
        .list_peers(infohash, remote_addr, port, &peer_id)
        .into_iter()
        .map(|p| PeerEntry {
            ip: p.addr.to_string(),
            port: p.port,
        })
        .collect();

    let reply = AnnounceReply {
        interval: ANNOUNCE_INTERVAL_SECS,
        peers,
    };

    match serde_json::to_string(&reply) {
        Ok(mut body) => {
            body.push('\n');
            (StatusCode::OK, body)
        }
        Err(e) => {
            error!("could not serialize announce reply: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                r#"{"error":"internal"}"#.into(),
            )
        }
    }
}

fn missing_params() -> (StatusCode, String) {
    (
        StatusCode::BAD_REQUEST,
        r#"{"error":"missing infohash|peer_id|port"}"#.into(),
    )
}

/// Decode the raw query string into `(name, value)` pairs.
///
/// Values are decoded to raw bytes: the infohash is binary and must survive
/// the trip. `+` decodes to a space before percent-decoding; a literal plus
/// arrives as `%2B`.
fn parse_query(raw_query: &str) -> Vec<(String, Vec<u8>)> {
    let mut params = vec![];

    for pair in raw_query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));

        let name = percent_decode_str(&name.replace('+', " "))
            .decode_utf8_lossy()
            .into_owned();
        let value: Vec<u8> = percent_decode_str(&value.replace('+', " ")).collect();

        params.push((name, value));
    }

    params
}

/// First value for a query parameter, if present.
fn param<'a>(params: &'a [(String, Vec<u8>)], name: &str) -> Option<&'a [u8]> {
    params
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_slice())
}

fn json_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::SERVER, SERVER_NAME),
        ],
        body,
    )
        .into_response()
}
