//! Owns a single torrent's peer set and drives the choking algorithm.
//!
//! A [`Torrent`] is the actor that sits between the engine (which only knows
//! about tracker announces and top level start/stop) and the individual
//! [`crate::peer::PeerSession`] tasks. It keeps the piece picker and disk
//! handle that all of a torrent's sessions share, spawns and tracks a
//! session per peer, and on two independent timers runs the regular and
//! optimistic unchoke rounds described in DESIGN.md.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, RwLock},
    task::JoinHandle,
    time::interval,
};

use crate::{
    conf::TorrentConf,
    disk::{DiskHandle, TorrentAlert, TorrentAlertReceiver},
    error::*,
    peer::{self, PeerSession},
    peer_selector::PeerCandidate,
    piece_picker::PiecePicker,
    storage_info::StorageInfo,
    PeerId, Sha1Hash, TorrentId,
};

/// Information shared, read-only, by every peer session of a torrent.
///
/// This plays the same role as a "context" struct elsewhere in the engine:
/// it's wrapped in an `Arc` and cloned cheaply into each session task.
pub(crate) struct SharedStatus {
    pub id: TorrentId,
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub storage: StorageInfo,
    /// Timing and scheduling knobs every peer session of this torrent
    /// shares (send cooldown, block request timeout, connect timeout; see
    /// [`TorrentConf`]).
    pub conf: TorrentConf,
}

/// A handle the torrent keeps for each of its peer session tasks.
struct PeerHandle {
    cmd_chan: peer::Sender,
    join_handle: JoinHandle<()>,
    /// Set once we've regular-unchoked this peer, so the next round knows
    /// whether to send Choke on eviction.
    is_regular_unchoked: bool,
    /// Set once this peer holds the (single) optimistic unchoke slot.
    is_optimistically_unchoked: bool,
}

/// Commands that can be sent to a running torrent.
pub(crate) enum Command {
    /// The tracker (or DHT/PEX, eventually) discovered addresses we can try
    /// connecting to.
    PeerDiscovered(SocketAddr),
    /// An inbound connection was accepted on the listen port and is ready
    /// for the handshake (spec.md §3: "created on outbound connect or
    /// inbound accept").
    InboundConnection(TcpStream, SocketAddr),
    /// Requests a progress snapshot, used by the engine to drive its
    /// progress line and its stop condition (spec.md §4.7).
    GetProgress(oneshot::Sender<Progress>),
    Shutdown,
}

/// A point-in-time snapshot of a torrent's progress, handed back to the
/// engine.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Progress {
    pub complete_pieces: usize,
    pub total_pieces: usize,
    pub connected_peers: usize,
}

pub(crate) type Sender = mpsc::UnboundedSender<Command>;
type Receiver = mpsc::UnboundedReceiver<Command>;

pub(crate) struct Torrent {
    ctx: Arc<SharedStatus>,
    piece_picker: Arc<RwLock<PiecePicker>>,
    disk: DiskHandle,
    disk_alert_port: TorrentAlertReceiver,
    conf: TorrentConf,
    peers: HashMap<SocketAddr, PeerHandle>,
    cmd_chan: Sender,
    cmd_port: Receiver,
}

impl Torrent {
    pub fn new(
        ctx: Arc<SharedStatus>,
        piece_picker: PiecePicker,
        disk: DiskHandle,
        disk_alert_port: TorrentAlertReceiver,
        conf: TorrentConf,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                ctx,
                piece_picker: Arc::new(RwLock::new(piece_picker)),
                disk,
                disk_alert_port,
                conf,
                peers: HashMap::new(),
                cmd_chan: cmd_chan.clone(),
                cmd_port,
            },
            cmd_chan,
        )
    }

    /// Runs the torrent until it's shut down, an unrecoverable error occurs,
    /// or the process receives a shutdown command.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting torrent {}", self.ctx.id);

        let mut regular_unchoke_timer =
            interval(self.conf.regular_unchoke_interval);
        let mut optimistic_unchoke_timer =
            interval(self.conf.optimistic_unchoke_interval);
        let mut was_complete = false;

        loop {
            tokio::select! {
                _ = regular_unchoke_timer.tick() => {
                    self.run_regular_unchoke_round().await;
                }
                _ = optimistic_unchoke_timer.tick() => {
                    self.run_optimistic_unchoke_round().await;
                }
                alert = self.disk_alert_port.recv() => {
                    match alert {
                        Some(TorrentAlert::BatchWrite(result)) => {
                            self.handle_batch_write_alert(result).await;
                        }
                        None => {
                            log::warn!("Torrent {} disk alert channel closed", self.ctx.id);
                        }
                    }
                }
                cmd = self.cmd_port.recv() => {
                    match cmd {
                        Some(Command::PeerDiscovered(addr)) => {
                            self.connect_to_peer(addr);
                        }
                        Some(Command::InboundConnection(socket, addr)) => {
                            self.accept_peer(socket, addr);
                        }
                        Some(Command::GetProgress(chan)) => {
                            let _ = chan.send(self.progress().await);
                        }
                        Some(Command::Shutdown) | None => {
                            log::info!("Shutting down torrent {}", self.ctx.id);
                            break;
                        }
                    }
                }
            }

            let is_complete = self.piece_picker.read().await.is_complete();
            if is_complete && !was_complete {
                log::info!(
                    "Torrent {} download complete, continuing to seed",
                    self.ctx.id
                );
            }
            was_complete = is_complete;
        }

        self.shutdown().await;

        Ok(())
    }

    /// Returns a snapshot of this torrent's current progress.
    async fn progress(&self) -> Progress {
        let piece_picker = self.piece_picker.read().await;
        Progress {
            complete_pieces: piece_picker.own_bitfield().count_ones(),
            total_pieces: piece_picker.own_bitfield().len(),
            connected_peers: self.peers.len(),
        }
    }

    /// Spawns a new outbound peer session task, unless we're already
    /// connected (or connecting) to it, or we're already at capacity.
    fn connect_to_peer(&mut self, addr: SocketAddr) {
        if self.peers.contains_key(&addr) {
            return;
        }
        if self.peers.len() >= self.conf.max_connected_peer_count {
            log::debug!(
                "Torrent {} at peer capacity, not connecting to {}",
                self.ctx.id,
                addr
            );
            return;
        }

        log::info!("Torrent {} connecting to peer {}", self.ctx.id, addr);

        let (mut session, cmd_chan) = PeerSession::outbound(
            Arc::clone(&self.ctx),
            Arc::clone(&self.piece_picker),
            self.disk.clone(),
            addr,
        );
        let torrent_cmd_chan = self.cmd_chan.clone();
        let join_handle = tokio::spawn(async move {
            if let Err(e) = session.start().await {
                log::warn!("Peer {} session ended with error: {}", addr, e);
            }
            // the torrent doesn't currently need a notification on session
            // end beyond the log line above; the join handle alone lets
            // `shutdown` wait for a graceful exit
            drop(torrent_cmd_chan);
        });

        self.peers.insert(
            addr,
            PeerHandle {
                cmd_chan,
                join_handle,
                is_regular_unchoked: false,
                is_optimistically_unchoked: false,
            },
        );
    }

    /// Spawns a peer session task for a connection accepted on our listen
    /// port (spec.md §3, §4.4), unless we're already connected to that
    /// address or at capacity.
    fn accept_peer(&mut self, socket: TcpStream, addr: SocketAddr) {
        if self.peers.contains_key(&addr) {
            return;
        }
        if self.peers.len() >= self.conf.max_connected_peer_count {
            log::debug!(
                "Torrent {} at peer capacity, rejecting inbound {}",
                self.ctx.id,
                addr
            );
            return;
        }

        log::info!("Torrent {} accepted inbound peer {}", self.ctx.id, addr);

        let (mut session, cmd_chan) = PeerSession::inbound(
            Arc::clone(&self.ctx),
            Arc::clone(&self.piece_picker),
            self.disk.clone(),
            addr,
            socket,
        );
        let torrent_cmd_chan = self.cmd_chan.clone();
        let join_handle = tokio::spawn(async move {
            if let Err(e) = session.start().await {
                log::warn!("Peer {} session ended with error: {}", addr, e);
            }
            drop(torrent_cmd_chan);
        });

        self.peers.insert(
            addr,
            PeerHandle {
                cmd_chan,
                join_handle,
                is_regular_unchoked: false,
                is_optimistically_unchoked: false,
            },
        );
    }

    /// Collects a stats snapshot from every live peer session.
    async fn collect_stats(
        &self,
    ) -> Vec<(SocketAddr, peer::PeerSessionStats)> {
        let mut stats = Vec::with_capacity(self.peers.len());
        for (addr, handle) in self.peers.iter() {
            let (tx, rx) = oneshot::channel();
            if handle.cmd_chan.send(peer::Command::GetStats(tx)).is_err() {
                continue;
            }
            if let Ok(s) = rx.await {
                stats.push((*addr, s));
            }
        }
        stats
    }

    /// Every `conf.regular_unchoke_interval`: unchoke the
    /// `conf.regular_unchoke_count` peers with the best download rate toward
    /// us (or, once we're seeding every piece, the best upload rate -- see
    /// DESIGN.md for why round-robin was not chosen), among those interested
    /// in us. Every other peer is (re-)choked.
    async fn run_regular_unchoke_round(&mut self) {
        let is_seeding = self.piece_picker.read().await.is_complete();
        let mut stats = self.collect_stats().await;
        stats.retain(|(_, s)| s.is_peer_interested);

        if is_seeding {
            stats.sort_by(|(_, a), (_, b)| {
                b.upload_ratio
                    .partial_cmp(&a.upload_ratio)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        } else {
            stats.sort_by(|(_, a), (_, b)| {
                b.download_rate
                    .partial_cmp(&a.download_rate)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        let top_k: std::collections::HashSet<SocketAddr> = stats
            .iter()
            .take(self.conf.regular_unchoke_count)
            .map(|(addr, _)| *addr)
            .collect();

        log::debug!(
            "Torrent {} regular-unchoke round: {} candidates, top {} selected",
            self.ctx.id,
            stats.len(),
            top_k.len()
        );

        for (addr, handle) in self.peers.iter_mut() {
            let should_unchoke = top_k.contains(addr);
            if should_unchoke && !handle.is_regular_unchoked {
                let _ = handle.cmd_chan.send(peer::Command::Unchoke);
            } else if !should_unchoke
                && handle.is_regular_unchoked
                && !handle.is_optimistically_unchoked
            {
                let _ = handle.cmd_chan.send(peer::Command::Choke);
            }
            handle.is_regular_unchoked = should_unchoke;
        }
    }

    /// Every 30 s: pick one choked, interested peer outside of the regular
    /// top-K and unchoke it, to discover peers whose capacity we haven't
    /// measured yet. This is an independent slot and doesn't affect the
    /// regular-K count. Which candidate is picked is governed by
    /// `conf.peer_selector` (spec.md §4.5, §9's REDESIGN FLAGS): this is the
    /// nearest point in this per-session architecture where one peer is
    /// chosen out of several eligible ones (see `peer_selector`'s module
    /// doc and DESIGN.md).
    async fn run_optimistic_unchoke_round(&mut self) {
        let stats = self.collect_stats().await;
        let candidates: Vec<PeerCandidate> = stats
            .into_iter()
            .filter(|(addr, s)| {
                s.is_peer_interested
                    && self
                        .peers
                        .get(addr)
                        .map(|h| !h.is_regular_unchoked)
                        .unwrap_or(false)
            })
            .map(|(addr, s)| PeerCandidate {
                addr,
                upload_ratio: s.upload_ratio,
            })
            .collect();

        // revoke the previous optimistic slot, if any
        for handle in self.peers.values_mut() {
            if handle.is_optimistically_unchoked {
                handle.is_optimistically_unchoked = false;
                if !handle.is_regular_unchoked {
                    let _ = handle.cmd_chan.send(peer::Command::Choke);
                }
            }
        }

        let picked = match self.conf.peer_selector.select(&candidates) {
            Ok(picked) => picked,
            Err(e) => {
                log::warn!(
                    "Torrent {} peer selector failed: {}",
                    self.ctx.id,
                    e
                );
                None
            }
        };

        if let Some(candidate) = picked {
            let addr = candidate.addr;
            log::debug!(
                "Torrent {} optimistically unchoking {}",
                self.ctx.id,
                addr
            );
            if let Some(handle) = self.peers.get_mut(&addr) {
                handle.is_optimistically_unchoked = true;
                let _ = handle.cmd_chan.send(peer::Command::Unchoke);
            }
        }
    }

    async fn handle_batch_write_alert(
        &mut self,
        result: std::result::Result<crate::disk::BatchWrite, WriteError>,
    ) {
        match result {
            Ok(batch) => {
                log::debug!(
                    "Torrent {} wrote batch of {} blocks, piece valid: {:?}",
                    self.ctx.id,
                    batch.blocks.len(),
                    batch.is_piece_valid
                );
                if batch.is_piece_valid == Some(false) {
                    log::warn!(
                        "Torrent {} piece failed hash verification",
                        self.ctx.id
                    );
                }
            }
            Err(e) => {
                log::error!("Torrent {} write error: {}", self.ctx.id, e);
            }
        }
    }

    async fn shutdown(&mut self) {
        log::info!(
            "Torrent {} disconnecting from {} peers",
            self.ctx.id,
            self.peers.len()
        );
        for handle in self.peers.values() {
            let _ = handle.cmd_chan.send(peer::Command::Shutdown);
        }
        for (_, handle) in self.peers.drain() {
            let _ = handle.join_handle.await;
        }
        let _ = self.disk.shutdown();
    }
}
