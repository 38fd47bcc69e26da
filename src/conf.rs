//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use sha1::{Digest, Sha1};

use crate::{peer_selector::PeerSelector, PeerId};

/// The azureus-style prefix every client id generated by this engine starts
/// with (BEP 20): two letters and four digits identifying the client and its
/// version, surrounded by dashes.
pub const SWARMCORE_CLIENT_PREFIX: &[u8; 8] = b"-SC0001-";

/// Derives a fresh 20 byte peer id: the client prefix followed by 12 bytes
/// of SHA-1(current time), so each run of the engine gets a distinct id
/// (spec.md §4.1) without requiring a dependency on a random number
/// generator at the call site.
pub fn generate_peer_id() -> PeerId {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let mut hasher = Sha1::new();
    hasher.input(now.as_nanos().to_be_bytes());
    let digest = hasher.result();

    let mut id = [0; 20];
    id[..8].copy_from_slice(SWARMCORE_CLIENT_PREFIX);
    id[8..].copy_from_slice(&digest[..12]);
    id
}

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. The client id is freshly generated via [`generate_peer_id`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: generate_peer_id(),
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    /// This will be configurable later.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing every 30 seconds.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,

    /// Regardless of what a tracker's response says, we re-announce at
    /// least this often (spec.md §4.3, §4.7).
    pub tracker_refresh_interval: Duration,

    /// How often the regular-unchoke round runs (spec.md §4.5).
    pub regular_unchoke_interval: Duration,

    /// How often the optimistic-unchoke round runs (spec.md §4.5).
    pub optimistic_unchoke_interval: Duration,

    /// The number of peers kept regular-unchoked at any given time (`K` in
    /// spec.md §4.5).
    pub regular_unchoke_count: usize,

    /// A `Pending` block is swept back to `Free` if it hasn't arrived within
    /// this long (spec.md §4.2, §5, P6).
    pub block_request_timeout: Duration,

    /// The minimum time that must pass between two sends to the same peer,
    /// to avoid busy-sending (spec.md §4.4's `is_eligible`).
    pub peer_send_cooldown: Duration,

    /// How long we wait for an outbound TCP connect to succeed before
    /// giving up on a candidate peer (spec.md §4.4, §5).
    pub peer_connect_timeout: Duration,

    /// How often a session checks its downloads for blocks that have been
    /// `Pending` longer than `block_request_timeout`, and whether it's gone
    /// long enough without sending anything to owe the peer a keep-alive
    /// (spec.md §4.2, §4.4).
    pub request_sweep_interval: Duration,

    /// The number of block requests a session keeps outstanding at once
    /// (spec.md §4.6's `MAX_OUTSTANDING_REQUESTS`).
    pub max_outstanding_requests: usize,

    /// A session that hasn't sent anything in this long sends a keep-alive
    /// so the peer doesn't time out the connection (spec.md §4.4).
    pub keep_alive_interval: Duration,

    /// The port we listen on for inbound peer connections.
    pub listen_port: u16,

    /// The policy used to pick one candidate among several peers eligible
    /// for the optimistic unchoke slot (spec.md §4.5, §9's REDESIGN FLAGS).
    pub peer_selector: PeerSelector,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            // needs teting
            announce_interval: Duration::from_secs(60 * 60),
            // needs testing
            tracker_error_threshold: 15,
            tracker_refresh_interval: Duration::from_secs(180),
            regular_unchoke_interval: Duration::from_secs(10),
            optimistic_unchoke_interval: Duration::from_secs(30),
            regular_unchoke_count: 4,
            block_request_timeout: Duration::from_secs(5),
            peer_send_cooldown: Duration::from_millis(200),
            peer_connect_timeout: Duration::from_secs(2),
            request_sweep_interval: Duration::from_secs(1),
            max_outstanding_requests: 5,
            keep_alive_interval: Duration::from_secs(2 * 60),
            listen_port: 6881,
            peer_selector: PeerSelector::ProportionalRandom,
        }
    }
}
