//! # Tracker URL Splitting
//!
//! Announce URLs stored in metainfo files have the form
//! `[scheme://]host[:port][/path]`. The tracker client only needs the host
//! and port; the scheme is discarded and the announce path is fixed by
//! convention (`/announce`).

use anyhow::{anyhow, Result};
use url::Url;

/// Host and port split out of an announce URL.
///
/// `port` is `None` when the URL carries no explicit port; callers fall back
/// to the HTTP default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    pub host: String,
    pub port: Option<u16>,
}

/// Split an absolute URL into host and optional port.
///
/// A missing scheme is tolerated (`tracker.local:8080/announce` parses the
/// same as `http://tracker.local:8080/announce`). A present but malformed
/// port is an error.
pub fn parse_url(raw: &str) -> Result<UrlParts> {
    // The url crate refuses scheme-less input, so assume http.
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };

    let url = match Url::parse(&with_scheme) {
        Ok(url) => url,
        Err(_) => return Err(anyhow!("could not parse url: {}", raw)),
    };

    let host = match url.host_str() {
        Some(host) => host.to_string(),
        None => return Err(anyhow!("url has no host: {}", raw)),
    };

    Ok(UrlParts {
        host,
        port: url.port(),
    })
}
