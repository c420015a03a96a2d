use super::request::url_encode_bytes;
use super::{AnnounceRequest, AnnounceResponse};
use crate::bencode::decode;
use crate::error::{BittorrentError, Result};
use crate::torrent::TrackerUrl;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

/// Announce to an http(s) tracker with a compact peer list request.
pub async fn announce(
    client: &Client,
    tracker: &TrackerUrl,
    request: &AnnounceRequest,
    read_timeout: Duration,
) -> Result<AnnounceResponse> {
    info!("Announcing to HTTP tracker: {}", tracker.as_str());

    // The binary parameters are pre-encoded; serde handles the rest.
    let mut url = tracker.url().clone();
    let binary = format!(
        "info_hash={}&peer_id={}",
        url_encode_bytes(&request.info_hash),
        url_encode_bytes(&request.peer_id)
    );
    let query = match url.query() {
        Some(existing) if !existing.is_empty() => format!("{}&{}", existing, binary),
        _ => binary,
    };
    url.set_query(Some(&query));

    let response = client
        .get(url)
        .query(&request.http_query())
        .timeout(read_timeout)
        .send()
        .await?;

    let status = response.status();
    let body = response.bytes().await?;
    debug!("Tracker response status: {}, body length: {}", status, body.len());

    if !status.is_success() {
        return Err(BittorrentError::TrackerError(format!("HTTP error: {}", status)));
    }

    let response = AnnounceResponse::from_bencode(&decode(&body)?)?;
    info!(
        "Tracker {} answered with {} peers (interval: {}s)",
        tracker.as_str(),
        response.peers.len(),
        response.interval
    );

    Ok(response)
}
