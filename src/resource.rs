use std::path::Path;

use chrono::{DateTime, Utc};
use if_chain::if_chain;
use log::debug;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, LAST_MODIFIED};
use thiserror::Error;
use url::Url;

use crate::http_utils::{self, Transport};

#[derive(Error, Debug)]
pub(crate) enum ProbeError {
    #[error("probe request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// What the header probe learned about the remote resource. These three
/// values are all the download core ever consumes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResourceSpec {
    /// `None` when the server reported no usable length; parallel ranged
    /// semantics need a known upper bound.
    pub(crate) content_length: Option<u64>,
    pub(crate) transport: Transport,
    /// False when a local file at the output path already matches the remote
    /// size and is at least as fresh as its `Last-Modified`.
    pub(crate) need_download: bool,
}

/// HEAD the resource and decide length, transport, and whether a download is
/// needed at all, comparing against any pre-existing file at `local`.
pub(crate) async fn probe(
    url: &Url,
    local: &Path,
    insecure: bool,
) -> Result<ResourceSpec, ProbeError> {
    let client = http_utils::build_client(Transport::Http1, insecure)?;
    let response = client.head(url.clone()).send().await?.error_for_status()?;

    let transport = if response.version() == reqwest::Version::HTTP_2 {
        Transport::Http2
    } else {
        Transport::Http1
    };

    let headers = response.headers();
    let content_length = parse_content_length(headers);
    let spec = ResourceSpec {
        content_length,
        transport,
        need_download: need_download(local, content_length, parse_last_modified(headers)),
    };
    debug!("probed {url}: {spec:?}");
    Ok(spec)
}

fn parse_content_length(headers: &HeaderMap) -> Option<u64> {
    let length = headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()?;
    if length == 0 {
        return None;
    }
    Some(length)
}

fn parse_last_modified(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let raw = headers.get(LAST_MODIFIED)?.to_str().ok()?;
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn need_download(
    local: &Path,
    remote_len: Option<u64>,
    remote_modified: Option<DateTime<Utc>>,
) -> bool {
    if_chain! {
        if let Ok(meta) = std::fs::metadata(local);
        if remote_len == Some(meta.len());
        if match (meta.modified(), remote_modified) {
            // Same size and no usable timestamp on either side: assume the
            // local copy is the same file.
            (_, None) => true,
            (Ok(local_modified), Some(remote)) => DateTime::<Utc>::from(local_modified) >= remote,
            (Err(_), Some(_)) => false,
        };
        then { false } else { true }
    }
}
