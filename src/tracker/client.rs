use super::{http, AnnounceRequest, AnnounceResponse, UdpTracker};
use crate::error::{BittorrentError, Result};
use crate::torrent::TrackerUrl;
use reqwest::Client;
use std::time::Duration;

/// Announces to trackers of either transport
pub struct TrackerClient {
    http: Client,
    read_timeout: Duration,
}

impl TrackerClient {
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            http: Client::new(),
            read_timeout,
        }
    }

    /// Connect (UDP only) and announce; any failure is returned so the
    /// caller can move on to the next tracker.
    pub async fn announce(
        &self,
        tracker: &TrackerUrl,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        if tracker.is_udp() {
            let udp = UdpTracker::connect(&tracker.host_port()?, self.read_timeout).await?;
            udp.announce(request, &tracker.request_path()).await
        } else if tracker.is_http() {
            http::announce(&self.http, tracker, request, self.read_timeout).await
        } else {
            Err(BittorrentError::TrackerError(format!(
                "Unsupported tracker scheme: {}",
                tracker.scheme()
            )))
        }
    }
}
