//! Tracker clients: discovers peers for a torrent over HTTP or UDP.
//!
//! A torrent's announce-list is a list of tiers (`Vec<Vec<String>>`); trackers
//! within a tier are tried in order and the first successful response wins.
//! Both URL schemes the BitTorrent spec allows, `http(s)://` and `udp://`,
//! are supported through [`http`] and [`udp`] respectively.

pub(crate) mod http;
pub(crate) mod udp;

use std::net::SocketAddr;

use crate::{error::*, PeerId, Sha1Hash};

/// Announce event, sent to the tracker to describe why we're announcing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Started,
    Stopped,
    Completed,
    /// A periodic re-announce, not one of the above lifecycle events.
    None,
}

/// The parameters of a single announce request, common to both HTTP and UDP
/// trackers.
#[derive(Debug, Clone)]
pub(crate) struct AnnounceParams {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
}

/// A successful announce response.
#[derive(Debug, Clone)]
pub(crate) struct AnnounceResponse {
    /// The peers the tracker returned.
    pub peers: Vec<SocketAddr>,
    /// Seconds to wait before the next announce, if the tracker told us.
    pub interval: Option<u64>,
}

/// A single tracker, belonging to one of the tiers of a torrent's
/// announce-list.
#[derive(Debug, Clone)]
pub(crate) enum Tracker {
    Http(http::HttpTracker),
    Udp(udp::UdpTracker),
}

impl Tracker {
    /// Parses a tracker URL into the concrete client for its scheme.
    pub fn new(url: &str) -> Result<Self> {
        if url.starts_with("http://") || url.starts_with("https://") {
            Ok(Self::Http(http::HttpTracker::new(url)?))
        } else if url.starts_with("udp://") {
            Ok(Self::Udp(udp::UdpTracker::new(url)?))
        } else {
            Err(Error::InvalidTrackerResponse(format!(
                "unsupported tracker scheme: {}",
                url
            )))
        }
    }

    pub async fn announce(
        &mut self,
        params: &AnnounceParams,
    ) -> Result<AnnounceResponse> {
        match self {
            Self::Http(t) => t.announce(params).await,
            Self::Udp(t) => t.announce(params).await,
        }
    }
}

/// Builds the tiered tracker list for a torrent's announce-list, skipping
/// (and logging) any tracker URL we fail to parse rather than failing the
/// whole torrent over one bad tier entry.
pub(crate) fn build_tiers(announce_list: &[Vec<String>]) -> Vec<Vec<Tracker>> {
    announce_list
        .iter()
        .map(|tier| {
            tier.iter()
                .filter_map(|url| match Tracker::new(url) {
                    Ok(tracker) => Some(tracker),
                    Err(e) => {
                        log::warn!("Skipping unparseable tracker {}: {}", url, e);
                        None
                    }
                })
                .collect()
        })
        .filter(|tier: &Vec<Tracker>| !tier.is_empty())
        .collect()
}

/// Announces to the given tiers in order, tier by tier and tracker by
/// tracker within a tier, returning the first successful response. Returns
/// [`Error::TrackerUnreachable`] if every tracker in every tier failed.
pub(crate) async fn announce_tiers(
    tiers: &mut [Vec<Tracker>],
    params: &AnnounceParams,
) -> Result<AnnounceResponse> {
    for tier in tiers.iter_mut() {
        for tracker in tier.iter_mut() {
            match tracker.announce(params).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    log::warn!("Tracker announce failed: {}", e);
                }
            }
        }
    }
    Err(Error::TrackerUnreachable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_tiers_skips_bad_urls() {
        let announce_list = vec![vec![
            "http://tracker.example/announce".to_string(),
            "not-a-valid-scheme".to_string(),
        ]];
        let tiers = build_tiers(&announce_list);
        assert_eq!(tiers.len(), 1);
        assert_eq!(tiers[0].len(), 1);
    }
}
