//! The engine's top level: owns a single torrent end to end, from reading
//! its metainfo off disk to the tracker announce loop to driving the
//! [`crate::torrent::Torrent`] actor, until the download completes (or
//! seeding is requested) or the caller interrupts it.
//!
//! This is authored fresh rather than adapted from an existing module: it's
//! the glue the rest of the crate is missing, built the way the parts it
//! wires together (`torrent`, `disk`, `tracker`) already read -- a plain
//! struct, a `tokio::select!` run loop, `log` for progress, manual error
//! propagation via `?`.

use std::{path::Path, sync::Arc, time::{Duration, Instant}};

use tokio::{net::TcpListener, sync::oneshot, time::interval};

use crate::{
    conf::Conf,
    disk::{Alert, DiskHandle},
    error::{Error, Result},
    metainfo::Metainfo,
    piece_picker::PiecePicker,
    storage_info::StorageInfo,
    torrent::{self, Progress, SharedStatus, Torrent},
    tracker, TorrentId,
};

/// Every engine instance currently only ever drives a single torrent, so a
/// constant id is all that's needed to address it on the disk and torrent
/// command channels (spec.md §4.7 doesn't require multi-torrent support).
const TORRENT_ID: TorrentId = 0;

/// How often the engine polls the torrent for a progress snapshot, used to
/// decide whether the change-only progress line should be printed and
/// whether the download has just completed (spec.md §4.7, §8 Scenario 1).
const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A snapshot of a finished (or interrupted) run, returned by [`Engine::run`].
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub complete_pieces: usize,
    pub total_pieces: usize,
    pub connected_peers: usize,
    pub elapsed: Duration,
}

impl Stats {
    fn from_progress(progress: Progress, started_at: Instant) -> Self {
        Self {
            complete_pieces: progress.complete_pieces,
            total_pieces: progress.total_pieces,
            connected_peers: progress.connected_peers,
            elapsed: started_at.elapsed(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total_pieces > 0 && self.complete_pieces == self.total_pieces
    }
}

/// The outcome of a run: either it ran to completion (and was seeding, if
/// requested, until interrupted), or it was interrupted before finishing.
#[derive(Debug, Clone, Copy)]
pub enum Completion {
    Done(Stats),
    Interrupted(Stats),
}

/// Owns a single torrent's metainfo and configuration, and drives it from
/// start to (optional) completion.
pub struct Engine {
    metainfo: Metainfo,
    conf: Conf,
    /// If true, [`Engine::run`] doesn't return once the download completes,
    /// but keeps seeding until interrupted (spec.md §4.7, §6 `-s`/`--seed`).
    seed_after_download: bool,
}

impl Engine {
    /// Creates an engine for an already-parsed torrent.
    pub fn new(metainfo: Metainfo, conf: Conf, seed_after_download: bool) -> Self {
        Self {
            metainfo,
            conf,
            seed_after_download,
        }
    }

    /// Reads and parses a `.torrent` file off disk and creates an engine for
    /// it.
    pub fn open(
        torrent_path: &Path,
        conf: Conf,
        seed_after_download: bool,
    ) -> Result<Self> {
        let buf = std::fs::read(torrent_path)?;
        let metainfo = Metainfo::from_bytes(&buf)?;
        Ok(Self::new(metainfo, conf, seed_after_download))
    }

    /// The metainfo this engine was created with.
    pub fn metainfo(&self) -> &Metainfo {
        &self.metainfo
    }

    /// Where this torrent's files will be (or already are) placed.
    pub fn storage_path(&self) -> std::path::PathBuf {
        StorageInfo::new(&self.metainfo, self.conf.torrent.download_dir.clone())
            .download_dir
    }

    /// Runs the torrent: allocates (or resumes) its storage, spawns the
    /// [`Torrent`] actor and an inbound connection listener, and announces
    /// to the tracker on a timer, until the download completes (returning
    /// unless seeding was requested) or `ctrl_c` is received.
    pub async fn run(self) -> Result<Completion> {
        let Engine {
            metainfo,
            conf,
            seed_after_download,
        } = self;

        let started_at = Instant::now();

        let storage = StorageInfo::new(&metainfo, conf.torrent.download_dir.clone());
        log::info!(
            "Torrent {:?}: {} piece(s), {} byte(s) total",
            metainfo.name,
            storage.piece_count,
            storage.download_len
        );

        let (disk, mut disk_alert_port) = DiskHandle::new()?;
        disk.new_torrent(TORRENT_ID, storage.clone(), metainfo.piece_hashes.clone())?;

        let (torrent_alert_port, resumed_pieces) = loop {
            match disk_alert_port.recv().await {
                Some(Alert::TorrentAllocation(Ok(alloc))) if alloc.id == TORRENT_ID => {
                    break (alloc.alert_port, alloc.resumed_pieces);
                }
                Some(Alert::TorrentAllocation(Ok(_))) => continue,
                Some(Alert::TorrentAllocation(Err(e))) => return Err(Error::from(e)),
                None => return Err(Error::Channel),
            }
        };
        log::info!(
            "Resumed {}/{} piece(s) from a previous run",
            resumed_pieces.count_ones(),
            resumed_pieces.len()
        );

        let ctx = Arc::new(SharedStatus {
            id: TORRENT_ID,
            info_hash: metainfo.info_hash,
            client_id: conf.engine.client_id,
            storage: storage.clone(),
            conf: conf.torrent.clone(),
        });

        let piece_picker = PiecePicker::with_completed(resumed_pieces);
        let (mut torrent, torrent_cmd_chan) = Torrent::new(
            Arc::clone(&ctx),
            piece_picker,
            disk.clone(),
            torrent_alert_port,
            conf.torrent.clone(),
        );
        let torrent_handle = tokio::spawn(async move {
            if let Err(e) = torrent.start().await {
                log::error!("Torrent {} exited with error: {}", TORRENT_ID, e);
            }
        });

        let listener =
            TcpListener::bind(("0.0.0.0", conf.torrent.listen_port)).await?;
        let (listener_stop_tx, listener_stop_rx) = oneshot::channel::<()>();
        let listener_cmd_chan = torrent_cmd_chan.clone();
        let listener_handle = tokio::spawn(Self::run_listener(
            listener,
            listener_cmd_chan,
            listener_stop_rx,
        ));

        let mut tiers = tracker::build_tiers(&metainfo.trackers);

        let completion = Self::run_loop(
            &mut tiers,
            &ctx,
            &storage,
            &torrent_cmd_chan,
            seed_after_download,
            started_at,
        )
        .await;

        // best-effort: let the tracker know we're going away
        Self::announce(
            &mut tiers,
            &ctx,
            storage.download_len,
            tracker::Event::Stopped,
            &torrent_cmd_chan,
        )
        .await;

        let _ = listener_stop_tx.send(());
        let _ = listener_handle.await;

        let _ = torrent_cmd_chan.send(torrent::Command::Shutdown);
        let _ = torrent_handle.await;

        disk.shutdown()?;

        Ok(completion)
    }

    /// The engine's central run loop (spec.md §4.7): re-announces to the
    /// tracker on a timer, polls the torrent's progress and logs it when it
    /// changes, and returns once the download completes (unless seeding was
    /// requested) or the process receives an interrupt signal.
    async fn run_loop(
        tiers: &mut [Vec<tracker::Tracker>],
        ctx: &Arc<SharedStatus>,
        storage: &StorageInfo,
        torrent_cmd_chan: &torrent::Sender,
        seed_after_download: bool,
        started_at: Instant,
    ) -> Completion {
        let mut tracker_timer = interval(ctx.conf.tracker_refresh_interval);
        let mut progress_timer = interval(PROGRESS_POLL_INTERVAL);
        let mut last_logged: Option<Progress> = None;
        let mut was_complete = false;

        // the very first announce happens immediately, not after waiting out
        // a full `tracker_refresh_interval`
        Self::announce(
            tiers,
            ctx,
            storage.download_len,
            tracker::Event::Started,
            torrent_cmd_chan,
        )
        .await;

        loop {
            tokio::select! {
                _ = tracker_timer.tick() => {
                    Self::announce(
                        tiers,
                        ctx,
                        storage.download_len,
                        tracker::Event::None,
                        torrent_cmd_chan,
                    )
                    .await;
                }
                _ = progress_timer.tick() => {
                    if let Some(progress) = Self::query_progress(torrent_cmd_chan).await {
                        Self::log_progress_if_changed(&mut last_logged, progress);

                        let is_complete = progress.total_pieces > 0
                            && progress.complete_pieces == progress.total_pieces;
                        if is_complete && !was_complete {
                            log::info!("Download complete");
                            Self::announce(
                                tiers,
                                ctx,
                                0,
                                tracker::Event::Completed,
                                torrent_cmd_chan,
                            )
                            .await;
                        }
                        was_complete = is_complete;

                        if is_complete && !seed_after_download {
                            return Completion::Done(Stats::from_progress(progress, started_at));
                        }
                    } else {
                        // the torrent actor is gone; nothing more to drive
                        return Completion::Interrupted(Stats {
                            complete_pieces: 0,
                            total_pieces: 0,
                            connected_peers: 0,
                            elapsed: started_at.elapsed(),
                        });
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Received interrupt, shutting down");
                    let stats = Self::query_progress(torrent_cmd_chan)
                        .await
                        .map(|p| Stats::from_progress(p, started_at))
                        .unwrap_or(Stats {
                            complete_pieces: 0,
                            total_pieces: 0,
                            connected_peers: 0,
                            elapsed: started_at.elapsed(),
                        });
                    return Completion::Interrupted(stats);
                }
            }
        }
    }

    /// Prints the change-only progress line (spec.md §4.7, §8 Scenario 1)
    /// only when the piece count or peer count moved since the last log.
    fn log_progress_if_changed(last_logged: &mut Option<Progress>, progress: Progress) {
        let changed = match last_logged {
            Some(last) => {
                last.complete_pieces != progress.complete_pieces
                    || last.connected_peers != progress.connected_peers
            }
            None => true,
        };
        if changed {
            let percent = if progress.total_pieces == 0 {
                100.0
            } else {
                100.0 * progress.complete_pieces as f64 / progress.total_pieces as f64
            };
            log::info!(
                "Connected peers: {} - {:.1}% completed | {}/{} pieces",
                progress.connected_peers,
                percent,
                progress.complete_pieces,
                progress.total_pieces,
            );
            *last_logged = Some(progress);
        }
    }

    /// Requests a progress snapshot from the torrent actor. Returns `None`
    /// if the torrent is no longer reachable.
    async fn query_progress(torrent_cmd_chan: &torrent::Sender) -> Option<Progress> {
        let (tx, rx) = oneshot::channel();
        torrent_cmd_chan
            .send(torrent::Command::GetProgress(tx))
            .ok()?;
        rx.await.ok()
    }

    /// Announces to the tracker and forwards any discovered peers to the
    /// torrent. Failures are logged and otherwise swallowed: a missed
    /// announce isn't fatal, the next timer tick will try again.
    async fn announce(
        tiers: &mut [Vec<tracker::Tracker>],
        ctx: &Arc<SharedStatus>,
        left: u64,
        event: tracker::Event,
        torrent_cmd_chan: &torrent::Sender,
    ) {
        if tiers.is_empty() {
            return;
        }

        let params = tracker::AnnounceParams {
            info_hash: ctx.info_hash,
            peer_id: ctx.client_id,
            port: ctx.conf.listen_port,
            // neither uploaded nor downloaded totals are aggregated across
            // peer sessions anywhere in the engine today (each session only
            // tracks its own EWMA rate, see `counter.rs`); only `left`,
            // which can be derived from the torrent's own progress, is
            // reported accurately. See DESIGN.md.
            uploaded: 0,
            downloaded: 0,
            left,
            event,
        };

        match tracker::announce_tiers(tiers, &params).await {
            Ok(response) => {
                log::info!(
                    "Tracker announce ({:?}) returned {} peer(s)",
                    event,
                    response.peers.len()
                );
                for addr in response.peers {
                    let _ = torrent_cmd_chan.send(torrent::Command::PeerDiscovered(addr));
                }
            }
            Err(e) => {
                log::warn!("Tracker announce ({:?}) failed: {}", event, e);
            }
        }
    }

    /// Accepts inbound peer connections until told to stop, forwarding each
    /// to the torrent (spec.md §3: torrents are created "on outbound connect
    /// or inbound accept").
    async fn run_listener(
        listener: TcpListener,
        torrent_cmd_chan: torrent::Sender,
        mut stop: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let _ = torrent_cmd_chan
                                .send(torrent::Command::InboundConnection(socket, addr));
                        }
                        Err(e) => log::warn!("Error accepting inbound connection: {}", e),
                    }
                }
                _ = &mut stop => break,
            }
        }
    }
}
