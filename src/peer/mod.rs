mod codec;

use {
    futures::{
        select,
        stream::{Fuse, SplitSink},
        FutureExt, SinkExt, StreamExt,
    },
    std::{
        net::SocketAddr,
        sync::Arc,
        time::{Duration, Instant},
    },
    tokio::{
        net::TcpStream,
        sync::{
            mpsc::{self, UnboundedReceiver, UnboundedSender},
            oneshot, RwLock,
        },
        time::{interval, timeout},
    },
    tokio_util::codec::{Framed, FramedParts},
};

use {
    crate::{
        counter::PeerStats, disk::DiskHandle, download::PieceDownload,
        error::*, piece_picker::PiecePicker, torrent::SharedStatus, Bitfield,
        BlockInfo, PeerId,
    },
    codec::*,
};

pub(crate) struct PeerSession {
    /// Shared information of the torrent.
    torrent: Arc<SharedStatus>,
    /// The piece picker picks the next most optimal piece to download and is
    /// shared by other entities in the same torrent.
    piece_picker: Arc<RwLock<PiecePicker>>,
    /// The entity used to save downloaded file blocks to disk, and to read
    /// them back when serving upload requests.
    disk: DiskHandle,
    /// The port on which peer session receives commands.
    cmd_port: Fuse<Receiver>,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// Session related information.
    status: Status,
    /// Running throughput counters for this peer, consulted by the torrent's
    /// choking algorithm.
    stats: PeerStats,
    /// These are the active piece downloads in which this session is
    /// participating.
    downloads: Vec<PieceDownload>,
    /// Our pending requests that we sent to peer. It represents the blocks that
    /// we are expecting. Thus, if we receive a block that is not in this list,
    /// it is dropped. If we receive a block whose request entry is in here, the
    /// entry is removed.
    ///
    /// Since the Fast extension is not supported (yet), this is emptied when
    /// we're choked, as in that case we don't expect outstanding requests to be
    /// served.
    ///
    /// Note that if a request for a piece's block is in this queue, there
    /// _must_ be a corresponding entry for the piece download in `downloads`.
    outgoing_requests: Vec<BlockInfo>,
    /// Information about a peer that is set after a successful handshake.
    peer_info: Option<PeerInfo>,
    /// Set for an inbound session: the already-accepted socket, consumed by
    /// `start` on its first call. `None` for an outbound session, which
    /// instead dials `addr` itself.
    pending_socket: Option<TcpStream>,
}

impl PeerSession {
    /// Creates a new outbound session with the peer at the given address.
    pub fn outbound(
        torrent: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        disk: DiskHandle,
        addr: SocketAddr,
    ) -> (Self, Sender) {
        Self::new(torrent, piece_picker, disk, addr, None)
    }

    /// Creates a new inbound session from a socket already accepted on our
    /// listen port (spec.md §3, §4.4).
    pub fn inbound(
        torrent: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        disk: DiskHandle,
        addr: SocketAddr,
        socket: TcpStream,
    ) -> (Self, Sender) {
        Self::new(torrent, piece_picker, disk, addr, Some(socket))
    }

    fn new(
        torrent: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        disk: DiskHandle,
        addr: SocketAddr,
        pending_socket: Option<TcpStream>,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                torrent,
                piece_picker,
                disk,
                cmd_port: cmd_port.fuse(),
                addr,
                status: Status::default(),
                stats: PeerStats::new(),
                downloads: Vec::new(),
                outgoing_requests: Vec::new(),
                peer_info: None,
                pending_socket,
            },
            cmd_chan,
        )
    }

    /// Starts the peer session and returns if the connection is closed or an
    /// error occurs.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting peer {} session", self.addr);

        let (socket, we_send_handshake_first) =
            match self.pending_socket.take() {
                Some(socket) => (socket, false),
                None => {
                    log::info!("Connecting to peer {}", self.addr);
                    self.status.state = State::Connecting;
                    let socket = timeout(
                        self.torrent.conf.peer_connect_timeout,
                        TcpStream::connect(self.addr),
                    )
                    .await
                    .map_err(|_| {
                        Error::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "peer connect timed out",
                        ))
                    })??;
                    log::info!("Connected to peer {}", self.addr);
                    (socket, true)
                }
            };

        let mut socket = Framed::new(socket, HandshakeCodec);

        self.status.state = State::Handshaking;
        let our_handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);

        if we_send_handshake_first {
            log::info!("Sending handshake to peer {}", self.addr);
            socket.send(our_handshake).await?;
        }

        // receive peer's handshake
        log::info!("Waiting for peer {} handshake", self.addr);
        if let Some(peer_handshake) = socket.next().await {
            let peer_handshake = peer_handshake?;
            log::info!("Received handshake from peer {}", self.addr);
            log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);
            // codec should only return handshake if the protocol string in
            // it is valid
            debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());

            // verify that the advertised torrent info hash is the same as
            // ours
            if peer_handshake.info_hash != self.torrent.info_hash {
                log::info!("Peer {} handshake invalid info hash", self.addr);
                return Err(Error::InvalidPeerInfoHash);
            }

            // set basic peer information
            self.peer_info = Some(PeerInfo {
                peer_id: peer_handshake.peer_id,
                pieces: None,
            });

            if !we_send_handshake_first {
                // this is an inbound connection, so the peer sent the first
                // handshake and is now waiting for ours
                log::info!("Sending handshake to peer {}", self.addr);
                socket.send(our_handshake).await?;
            }

            // now that we have the handshake, we need to switch to the peer
            // message codec and save the socket in self (note that we need
            // to keep the buffer from the original codec as it may contain
            // bytes of any potential message the peer may have sent after
            // the handshake)
            let old_parts = socket.into_parts();
            let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
            new_parts.read_buf = old_parts.read_buf;
            new_parts.write_buf = old_parts.write_buf;
            let socket = Framed::from_parts(new_parts);

            // enter the piece availability exchange state until peer sends a
            // bitfield, or until the first non-bitfield message arrives, in
            // which case we treat peer as having no pieces yet (a leech we
            // can still seed to and exchange `have`s with)
            self.status.state = State::AvailabilityExchange;
            log::info!(
                "Peer {} session state: {:?}",
                self.addr,
                self.status.state
            );

            self.run(socket).await?;
        }

        Ok(())
    }

    /// Runs the session after connection to peer is established.
    ///
    /// This is the main session "loop" and performs the core of the session
    /// logic: exchange of messages, commands from the torrent, etc.
    async fn run(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        // announce our own pieces, if we have any, right after the
        // handshake as the protocol expects
        {
            let piece_picker = self.piece_picker.read().await;
            let bitfield = piece_picker.own_bitfield().clone();
            if bitfield.any() {
                self.send_msg(&mut sink, Message::Bitfield(bitfield)).await?;
            }
        }

        let mut sweep_timer = interval(self.torrent.conf.request_sweep_interval);

        loop {
            select! {
                msg = stream.select_next_some() => {
                    let msg = msg?;
                    log::debug!(
                        "Received message {:?} from peer {}",
                        msg.id().map(|id| id as u8),
                        self.addr,
                    );

                    // handle the bitfield message separately as it may only
                    // be received directly after the handshake
                    if self.status.state == State::AvailabilityExchange {
                        match msg {
                            Message::Bitfield(bitfield) => {
                                self.handle_bitfield_msg(&mut sink, bitfield).await?;
                            }
                            other => {
                                // peer didn't send a bitfield, so we assume
                                // it has no pieces (a leech); dispatch the
                                // message normally once we flip to Connected
                                self.status.state = State::Connected;
                                self.handle_msg(&mut sink, other).await?;
                            }
                        }

                        if self.status.state == State::AvailabilityExchange {
                            self.status.state = State::Connected;
                        }
                        log::info!(
                            "Peer {} session state: {:?}",
                            self.addr,
                            self.status.state
                        );
                    } else {
                        self.handle_msg(&mut sink, msg).await?;
                    }
                }
                cmd = self.cmd_port.select_next_some() => {
                    if !self.handle_cmd(&mut sink, cmd).await? {
                        log::info!("Shutting down peer {} session", self.addr);
                        break;
                    }
                }
                _ = sweep_timer.tick().fuse() => {
                    self.sweep_expired_requests(&mut sink).await?;
                }
            }
        }

        Ok(())
    }

    /// Handles a command sent by the torrent (e.g. the choking algorithm),
    /// returning `Ok(false)` when the session should shut down.
    async fn handle_cmd(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        cmd: Command,
    ) -> Result<bool> {
        match cmd {
            Command::Shutdown => return Ok(false),
            Command::Choke => {
                if !self.status.is_peer_choked {
                    log::info!("Choking peer {}", self.addr);
                    self.status.is_peer_choked = true;
                    self.send_msg(sink, Message::Choke).await?;
                }
            }
            Command::Unchoke => {
                if self.status.is_peer_choked {
                    log::info!("Unchoking peer {}", self.addr);
                    self.status.is_peer_choked = false;
                    self.send_msg(sink, Message::Unchoke).await?;
                }
            }
            Command::GetStats(chan) => {
                let _ = chan.send(PeerSessionStats {
                    is_peer_interested: self.status.is_peer_interested,
                    is_choking_peer: self.status.is_peer_choked,
                    download_rate: self.stats.download_rate(),
                    upload_ratio: self.stats.upload_ratio(),
                });
            }
        }
        Ok(true)
    }

    /// Handles a message expected in the `AvailabilityExchange` state
    /// (the bitfield message).
    async fn handle_bitfield_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        mut bitfield: Bitfield,
    ) -> Result<()> {
        debug_assert_eq!(self.status.state, State::AvailabilityExchange);
        log::info!("Handling peer {} Bitfield message", self.addr);
        log::trace!("Bitfield: {:?}", bitfield);

        // the bitfield raw data sent over the wire may be longer than the
        // logical number of pieces, if the piece count isn't a multiple of 8
        bitfield.resize(self.torrent.storage.piece_count, false);

        let mut piece_picker = self.piece_picker.write().await;
        let is_interested = piece_picker.register_availability(&bitfield)?;
        drop(piece_picker);
        if let Some(peer_info) = &mut self.peer_info {
            peer_info.pieces = Some(bitfield);
        }

        if is_interested {
            self.status.is_interested = true;
            log::info!("Interested in peer {}", self.addr);
            self.send_msg(sink, Message::Interested).await?;
            // set the request queue size so we can request blocks
            self.status.best_request_queue_len =
                Some(self.torrent.conf.max_outstanding_requests);
        }

        Ok(())
    }

    /// Handles messages expected in the `Connected` state.
    async fn handle_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::Bitfield(_) => {
                log::info!(
                    "Peer {} sent bitfield message not after handshake",
                    self.addr
                );
                return Err(Error::BitfieldNotAfterHandshake);
            }
            Message::KeepAlive => {
                log::info!("Peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    // since we're choked we don't expect to receive blocks
                    // for our pending requests
                    self.outgoing_requests.clear();
                    self.status.is_choked = true;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.status.is_peer_interested = true;
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("Peer {} is not interested", self.addr);
                    self.status.is_peer_interested = false;
                }
            }
            Message::Have { piece_index } => {
                let is_interesting = self
                    .piece_picker
                    .write()
                    .await
                    .register_have(piece_index)?;
                if let Some(peer_info) = &mut self.peer_info {
                    if let Some(pieces) = &mut peer_info.pieces {
                        pieces.set(piece_index, true);
                    }
                }
                if is_interesting && !self.status.is_interested {
                    self.status.is_interested = true;
                    self.send_msg(sink, Message::Interested).await?;
                    if self.status.best_request_queue_len.is_none() {
                        self.status.best_request_queue_len =
                            Some(self.torrent.conf.max_outstanding_requests);
                    }
                }
            }
            Message::Request(block_info) => {
                self.handle_request_msg(sink, block_info).await?;
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let block_info = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                self.handle_block_msg(block_info, data).await?;
                // we may be able to make more requests now that a block
                // arrived
                self.make_requests(sink).await?;
            }
            Message::Cancel(_) => {
                // requests are served synchronously as they arrive, so
                // there's nothing queued to actually cancel
                log::debug!("Peer {} sent cancel", self.addr);
            }
        }

        Ok(())
    }

    /// Serves a block request from the peer by reading it back from disk, as
    /// long as we aren't choking them.
    async fn handle_request_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        block_info: BlockInfo,
    ) -> Result<()> {
        if self.status.is_peer_choked {
            log::debug!(
                "Ignoring request from choked peer {}",
                self.addr
            );
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        self.disk.read_block(self.torrent.id, block_info, tx)?;
        match rx.await {
            Ok(Ok(data)) => {
                self.stats.record_upload(data.len() as u64);
                self.send_msg(
                    sink,
                    Message::Block {
                        piece_index: block_info.piece_index,
                        offset: block_info.offset,
                        data,
                    },
                )
                .await?;
            }
            Ok(Err(e)) => {
                log::warn!(
                    "Could not serve block {:?} to peer {}: {}",
                    block_info,
                    self.addr,
                    e
                );
            }
            Err(_) => {
                log::warn!("Disk task dropped read reply channel");
            }
        }

        Ok(())
    }

    /// Fills the session's download pipeline with the optimal number of
    /// requests.
    async fn make_requests(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        log::trace!("Making requests to peer {}", self.addr);

        let mut blocks = Vec::new();

        // if we have active downloads, prefer to continue those, resulting
        // in fewer in-progress pieces
        for download in self.downloads.iter_mut() {
            debug_assert!(
                self.status.best_request_queue_len.unwrap_or_default()
                    >= self.outgoing_requests.len()
            );
            let to_request_count =
                self.status.best_request_queue_len.unwrap_or_default()
                    - self.outgoing_requests.len();
            if to_request_count == 0 {
                break;
            }
            download.pick_blocks(to_request_count, &mut blocks);
        }

        // while we can make more requests we start new download(s)
        loop {
            debug_assert!(
                self.status.best_request_queue_len.unwrap_or_default()
                    >= self.outgoing_requests.len()
            );
            let request_queue_len =
                self.status.best_request_queue_len.unwrap_or_default()
                    - self.outgoing_requests.len();
            if request_queue_len == 0 {
                break;
            }

            let peer_pieces = self
                .peer_info
                .as_ref()
                .and_then(|info| info.pieces.as_ref());
            let picked = match peer_pieces {
                Some(peer_pieces) => {
                    let mut piece_picker = self.piece_picker.write().await;
                    let picked = piece_picker.pick_piece_from(peer_pieces);
                    drop(piece_picker);
                    picked
                }
                // we haven't recorded this peer's availability yet (e.g. no
                // bitfield, no have message so far), so there's nothing of
                // theirs we know we can request
                None => None,
            };

            if let Some(index) = picked {
                log::info!("Session {} picked piece {}", self.addr, index);

                let mut download = PieceDownload::new(
                    index,
                    self.torrent.storage.piece_len(index)?,
                );
                download.pick_blocks(request_queue_len, &mut blocks);
                self.downloads.push(download);
            } else {
                break;
            }
        }

        self.outgoing_requests.extend_from_slice(&blocks);
        for block in blocks.iter() {
            self.send_msg(sink, Message::Request(*block)).await?;
        }

        Ok(())
    }

    /// Sends a message to the peer and records the send time, so the sweep
    /// timer knows whether a keep-alive is owed (spec.md §4.4).
    async fn send_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        sink.send(msg).await?;
        self.status.last_send = Instant::now();
        Ok(())
    }

    /// Reverts blocks that have been outstanding longer than
    /// `conf.block_request_timeout` back to free so they can be requested
    /// again, tries to refill the pipeline with new requests, and sends a
    /// keep-alive if we've been silent for `conf.keep_alive_interval`
    /// (spec.md §4.2 P6, §4.4, §5).
    async fn sweep_expired_requests(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        let timeout = self.torrent.conf.block_request_timeout;
        let mut expired = Vec::new();
        for download in self.downloads.iter_mut() {
            expired.extend(download.expire_blocks(timeout));
        }

        if !expired.is_empty() {
            log::debug!(
                "Peer {} had {} block(s) time out, re-requesting",
                self.addr,
                expired.len()
            );
            self.outgoing_requests
                .retain(|pending| !expired.contains(pending));
            // only re-enter the request pipeline if we haven't just sent a
            // burst, to avoid busy-sending the same peer (spec.md §5's
            // per-peer send cooldown)
            if self.status.last_send.elapsed()
                >= self.torrent.conf.peer_send_cooldown
            {
                self.make_requests(sink).await?;
            }
        }

        if self.status.last_send.elapsed()
            >= self.torrent.conf.keep_alive_interval
        {
            self.send_msg(sink, Message::KeepAlive).await?;
        }

        Ok(())
    }

    /// Verifies block validity, registers the download (and finishes a piece
    /// download if this was the last missing block in piece) and updates
    /// statistics about the download.
    async fn handle_block_msg(
        &mut self,
        block_info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::info!("Received block from peer {}: {:?}", self.addr, block_info);

        let block_pos = match self
            .outgoing_requests
            .iter()
            .position(|b| *b == block_info)
        {
            Some(pos) => pos,
            None => {
                log::warn!(
                    "Peer {} sent not requested block: {:?}",
                    self.addr,
                    block_info,
                );
                return Ok(());
            }
        };
        self.outgoing_requests.remove(block_pos);

        let download_pos = self
            .downloads
            .iter()
            .position(|d| d.piece_index() == block_info.piece_index);
        debug_assert!(download_pos.is_some());
        let download_pos = download_pos.unwrap();
        let download = &mut self.downloads[download_pos];
        download.received_block(block_info);

        let missing_blocks_count = download.count_missing_blocks();
        if missing_blocks_count == 0 {
            log::info!(
                "Finished piece {} via peer {}",
                block_info.piece_index,
                self.addr
            );
            self.piece_picker
                .write()
                .await
                .received_piece(block_info.piece_index);
            self.downloads.remove(download_pos);
        }

        // validate and save the block to disk by sending a write command to
        // the disk task
        self.disk.write_block(self.torrent.id, block_info, data)?;

        self.stats.record_download(block_info.len as u64);
        self.status.downloaded_block_bytes_count += block_info.len as u64;

        Ok(())
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        // give back any pieces we had in progress so other sessions can pick
        // them up
        if let Some(piece_picker) = self.piece_picker.try_write().ok() {
            let mut piece_picker = piece_picker;
            for download in &self.downloads {
                piece_picker.abandon_piece(download.piece_index());
            }
        }
    }
}

/// The channel on which torrent can send a command to the peer session task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// A point-in-time snapshot of a session's stats, requested by the torrent's
/// choking algorithm to rank peers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PeerSessionStats {
    pub is_peer_interested: bool,
    pub is_choking_peer: bool,
    pub download_rate: f64,
    pub upload_ratio: f64,
}

/// The commands peer session can receive.
pub(crate) enum Command {
    /// Eventually shut down the peer session.
    Shutdown,
    /// Start choking the peer: stop serving their requests.
    Choke,
    /// Stop choking the peer: start serving their requests again.
    Unchoke,
    /// Requests a snapshot of this session's throughput statistics.
    GetStats(oneshot::Sender<PeerSessionStats>),
}

/// The status of a peer session.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// The current state of the session.
    state: State,
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we
    /// have.
    is_peer_interested: bool,
    /// The request queue size, which is the number of block requests we keep
    /// outstanding to fully saturate the link.
    ///
    /// Only set once we start downloading.
    best_request_queue_len: Option<usize>,
    /// The number of piece/block bytes downloaded.
    downloaded_block_bytes_count: u64,
    /// When we last sent anything to the peer, so the sweep timer knows
    /// whether a keep-alive is owed (spec.md §4.4).
    last_send: Instant,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
            best_request_queue_len: None,
            downloaded_block_bytes_count: 0,
            last_send: Instant::now(),
        }
    }
}

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum State {
    /// The peer connection has not yet been connected, or it had been
    /// connected before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// Used to verify that the bitfield exchange occurs directly after the
    /// handshake and not later. Any subsequent bitfield messages are
    /// rejected and the connection is dropped, as per the standard.
    AvailabilityExchange,
    /// The normal state of a peer session, in which any messages apart from
    /// the handshake and bitfield may be exchanged.
    Connected,
}

impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Information about the peer we're connected to.
struct PeerInfo {
    /// Peer's 20 byte BitTorrent id.
    peer_id: PeerId,
    /// All pieces peer has, updated when it announces new pieces via
    /// `have` messages.
    pieces: Option<Bitfield>,
}
