//! The UDP tracker protocol (BEP 15).
//!
//! There's no bencode here: every message is a fixed binary layout of
//! big-endian integers, connect/announce/scrape distinguished by an `action`
//! field, and every request echoes a client-chosen `transaction_id` so stray
//! or delayed replies from a prior attempt can be told apart from the one
//! we're waiting for. We roll this by hand with `bytes::{Buf, BufMut}`, the
//! same way the peer wire protocol is framed in `peer::codec`, since this is
//! as close to a raw socket protocol as the crate gets.

use std::{
    net::SocketAddr,
    time::Duration,
};

use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;
use tokio::net::UdpSocket;

use super::{AnnounceParams, AnnounceResponse, Event};
use crate::error::*;

/// The magic constant that must be sent as the connection id on the very
/// first connect request.
const PROTOCOL_ID: u64 = 0x0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// How long we wait for a reply before retrying, and how many times we
/// retry before giving up, per BEP 15's suggested backoff (15 * 2^n
/// seconds, capped at a much smaller number of attempts here since a
/// torrent client has other trackers/tiers to fall back to).
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_ATTEMPTS: u32 = 4;

#[derive(Debug, Clone)]
pub(crate) struct UdpTracker {
    host: String,
    port: u16,
    /// Cached connection id and the attempt count it was acquired on; BEP 15
    /// says a connection id is valid for 1 minute and may be reused for that
    /// long, so we don't reconnect on every single announce.
    connection: Option<(u64, std::time::Instant)>,
}

/// A connection id is only valid for this long after being issued.
const CONNECTION_ID_LIFETIME: Duration = Duration::from_secs(60);

impl UdpTracker {
    pub fn new(url: &str) -> Result<Self> {
        let parsed = url::Url::parse(url).map_err(|e| {
            Error::InvalidTrackerResponse(format!("bad tracker url {}: {}", url, e))
        })?;
        let host = parsed
            .host_str()
            .ok_or_else(|| {
                Error::InvalidTrackerResponse(format!("tracker url missing host: {}", url))
            })?
            .to_string();
        let port = parsed.port().unwrap_or(80);

        Ok(Self {
            host,
            port,
            connection: None,
        })
    }

    pub async fn announce(
        &mut self,
        params: &AnnounceParams,
    ) -> Result<AnnounceResponse> {
        let addr = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                Error::InvalidTrackerResponse(format!(
                    "could not resolve tracker host: {}",
                    self.host
                ))
            })?;

        let mut socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;

        let connection_id = self.connection_id(&mut socket).await?;
        let response = self.send_announce(&mut socket, connection_id, params).await?;
        Ok(response)
    }

    /// Returns a cached connection id if it's still within its 1 minute
    /// lifetime, otherwise performs the connect handshake and caches the
    /// result.
    async fn connection_id(&mut self, socket: &mut UdpSocket) -> Result<u64> {
        if let Some((id, issued_at)) = self.connection {
            if issued_at.elapsed() < CONNECTION_ID_LIFETIME {
                return Ok(id);
            }
        }

        let transaction_id = rand::thread_rng().next_u32();
        let mut req = BytesMut::with_capacity(16);
        req.put_u64(PROTOCOL_ID);
        req.put_u32(ACTION_CONNECT);
        req.put_u32(transaction_id);

        let resp = send_with_retries(socket, &req, 16).await?;
        let mut resp = BytesMut::from(&resp[..]);

        let action = resp.get_u32();
        let resp_transaction_id = resp.get_u32();
        if resp_transaction_id != transaction_id {
            return Err(Error::InvalidTrackerResponse(
                "transaction id mismatch in connect response".into(),
            ));
        }
        if action == ACTION_ERROR {
            return Err(Error::InvalidTrackerResponse(read_error_message(&resp)));
        }
        if action != ACTION_CONNECT {
            return Err(Error::InvalidTrackerResponse(format!(
                "unexpected action in connect response: {}",
                action
            )));
        }

        let connection_id = resp.get_u64();
        self.connection = Some((connection_id, std::time::Instant::now()));
        Ok(connection_id)
    }

    async fn send_announce(
        &self,
        socket: &mut UdpSocket,
        connection_id: u64,
        params: &AnnounceParams,
    ) -> Result<AnnounceResponse> {
        let transaction_id = rand::thread_rng().next_u32();

        let mut req = BytesMut::with_capacity(98);
        req.put_u64(connection_id);
        req.put_u32(ACTION_ANNOUNCE);
        req.put_u32(transaction_id);
        req.put_slice(&params.info_hash);
        req.put_slice(&params.peer_id);
        req.put_u64(params.downloaded);
        req.put_u64(params.left);
        req.put_u64(params.uploaded);
        req.put_u32(event_code(params.event));
        req.put_u32(0); // ip address: 0 means "use the sender's"
        req.put_u32(0); // key: left unset, we identify by peer id
        req.put_i32(-1); // num_want: -1 means "as many as the tracker will give"
        req.put_u16(params.port);

        let resp = send_with_retries(socket, &req, 20).await?;
        let mut resp = BytesMut::from(&resp[..]);

        let action = resp.get_u32();
        let resp_transaction_id = resp.get_u32();
        if resp_transaction_id != transaction_id {
            return Err(Error::InvalidTrackerResponse(
                "transaction id mismatch in announce response".into(),
            ));
        }
        if action == ACTION_ERROR {
            return Err(Error::InvalidTrackerResponse(read_error_message(&resp)));
        }
        if action != ACTION_ANNOUNCE {
            return Err(Error::InvalidTrackerResponse(format!(
                "unexpected action in announce response: {}",
                action
            )));
        }

        let interval = resp.get_u32() as u64;
        let _leechers = resp.get_u32();
        let _seeders = resp.get_u32();

        let peers = resp
            .chunks(6)
            .filter(|chunk| chunk.len() == 6)
            .map(|chunk| {
                let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddr::new(std::net::IpAddr::V4(ip), port)
            })
            .collect();

        Ok(AnnounceResponse {
            peers,
            interval: Some(interval),
        })
    }
}

fn event_code(event: Event) -> u32 {
    match event {
        Event::None => 0,
        Event::Completed => 1,
        Event::Started => 2,
        Event::Stopped => 3,
    }
}

fn read_error_message(buf: &BytesMut) -> String {
    String::from_utf8_lossy(&buf[..]).into_owned()
}

/// Sends `req` and waits for a reply at least `min_resp_len` bytes long,
/// retrying with the timeout BEP 15 recommends (here: a flat 15 s, rather
/// than the exponential 15 * 2^n backoff, since giving up sooner and
/// falling through to the next tracker tier serves us better than a single
/// tracker holding up the whole announce for minutes).
async fn send_with_retries(
    socket: &mut UdpSocket,
    req: &[u8],
    min_resp_len: usize,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; 2048];
    for attempt in 0..MAX_ATTEMPTS {
        socket.send(req).await?;
        match tokio::time::timeout(RESPONSE_TIMEOUT, socket.recv(&mut buf)).await {
            Ok(Ok(len)) if len >= min_resp_len => {
                return Ok(buf[..len].to_vec());
            }
            Ok(Ok(_)) => {
                log::warn!("UDP tracker sent a response shorter than expected");
            }
            Ok(Err(e)) => return Err(Error::Io(e)),
            Err(_) => {
                log::debug!(
                    "UDP tracker announce attempt {} timed out, retrying",
                    attempt + 1
                );
            }
        }
    }
    Err(Error::TrackerUnreachable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_code_mapping() {
        assert_eq!(event_code(Event::None), 0);
        assert_eq!(event_code(Event::Completed), 1);
        assert_eq!(event_code(Event::Started), 2);
        assert_eq!(event_code(Event::Stopped), 3);
    }

    #[test]
    fn test_parse_tracker_url() {
        let tracker = UdpTracker::new("udp://tracker.example:6969/announce").unwrap();
        assert_eq!(tracker.port, 6969);
        assert_eq!(tracker.host, "tracker.example");
    }
}
