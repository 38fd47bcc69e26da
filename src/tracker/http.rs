//! The HTTP(S) tracker announce protocol (BEP 3).
//!
//! The request is a GET with the info hash, peer id, port and transfer
//! counters url-encoded as query parameters; `info_hash` and `peer_id` are
//! raw 20-byte strings that must be percent-encoded byte for byte rather
//! than treated as UTF-8, so we reach for `percent_encoding`'s
//! `NON_ALPHANUMERIC` set directly instead of `reqwest`'s form/query
//! helpers, which would mangle them.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};

use super::{AnnounceParams, AnnounceResponse, Event};
use crate::error::*;

#[derive(Debug, Clone)]
pub(crate) struct HttpTracker {
    url: url::Url,
    client: reqwest::Client,
}

impl HttpTracker {
    pub fn new(url: &str) -> Result<Self> {
        let url = url::Url::parse(url).map_err(|e| {
            Error::InvalidTrackerResponse(format!("bad tracker url {}: {}", url, e))
        })?;
        Ok(Self {
            url,
            client: reqwest::Client::new(),
        })
    }

    pub async fn announce(
        &mut self,
        params: &AnnounceParams,
    ) -> Result<AnnounceResponse> {
        let url = self.build_url(params);
        log::debug!("GET {}", url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::InvalidTrackerResponse(e.to_string()))?;
        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::InvalidTrackerResponse(e.to_string()))?;

        let raw: RawAnnounceResponse = serde_bencode::from_bytes(&body)?;
        if let Some(reason) = raw.failure_reason {
            return Err(Error::InvalidTrackerResponse(reason));
        }

        let peers = match raw.peers {
            Some(Peers::Compact(bytes)) => parse_compact_peers(&bytes),
            Some(Peers::Dict(list)) => list
                .into_iter()
                .filter_map(|p| {
                    let ip: IpAddr = p.ip.parse().ok()?;
                    Some(SocketAddr::new(ip, p.port))
                })
                .collect(),
            None => Vec::new(),
        };

        Ok(AnnounceResponse {
            peers,
            interval: raw.interval,
        })
    }

    fn build_url(&self, params: &AnnounceParams) -> String {
        let info_hash = percent_encode(&params.info_hash, NON_ALPHANUMERIC);
        let peer_id = percent_encode(&params.peer_id, NON_ALPHANUMERIC);
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.url,
            info_hash,
            peer_id,
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
        );
        if let Some(event) = event_str(params.event) {
            url.push_str("&event=");
            url.push_str(event);
        }
        url
    }
}

fn event_str(event: Event) -> Option<&'static str> {
    match event {
        Event::Started => Some("started"),
        Event::Stopped => Some("stopped"),
        Event::Completed => Some("completed"),
        Event::None => None,
    }
}

/// Parses the compact peer list format: 6 bytes per peer, 4-byte big-endian
/// IPv4 address followed by a 2-byte big-endian port.
fn parse_compact_peers(bytes: &[u8]) -> Vec<SocketAddr> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct RawAnnounceResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<u64>,
    peers: Option<Peers>,
}

/// The tracker may answer with either the compact (a single byte string) or
/// the original (a list of dictionaries) peer list representation.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Peers {
    Compact(#[serde(with = "serde_bytes")] Vec<u8>),
    Dict(Vec<DictPeer>),
}

#[derive(Debug, Deserialize)]
struct DictPeer {
    ip: String,
    port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact_peers() {
        // two peers: 127.0.0.1:6881 and 10.0.0.2:51413
        let mut bytes = vec![127, 0, 0, 1];
        bytes.extend_from_slice(&6881u16.to_be_bytes());
        bytes.extend_from_slice(&[10, 0, 0, 2]);
        bytes.extend_from_slice(&51413u16.to_be_bytes());

        let peers = parse_compact_peers(&bytes);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0], "127.0.0.1:6881".parse().unwrap());
        assert_eq!(peers[1], "10.0.0.2:51413".parse().unwrap());
    }

    #[test]
    fn test_build_url_includes_required_fields() {
        let tracker = HttpTracker::new("http://tracker.example/announce").unwrap();
        let params = AnnounceParams {
            info_hash: [1; 20],
            peer_id: [2; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1000,
            event: Event::Started,
        };
        let url = tracker.build_url(&params);
        assert!(url.starts_with("http://tracker.example/announce?"));
        assert!(url.contains("port=6881"));
        assert!(url.contains("event=started"));
    }
}
