//! Owns all disk IO for the engine.
//!
//! Disk access happens on a single dedicated task (see [`io::Disk`]), so that
//! the slow parts -- hashing a completed piece, writing it out, reading a
//! block back for an upload -- never block a peer session's reactor. Callers
//! talk to it through a [`DiskHandle`], which is just a cheap, cloneable
//! wrapper around the command channel.

mod io;

use tokio::sync::{mpsc, oneshot};

use crate::{
    error::{NewTorrentError, ReadError, Result, WriteError},
    storage_info::StorageInfo,
    Bitfield, BlockInfo, TorrentId,
};

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;

pub(crate) type AlertSender = mpsc::UnboundedSender<Alert>;
pub(crate) type AlertReceiver = mpsc::UnboundedReceiver<Alert>;

pub(crate) type TorrentAlertSender = mpsc::UnboundedSender<TorrentAlert>;
pub(crate) type TorrentAlertReceiver = mpsc::UnboundedReceiver<TorrentAlert>;

pub(crate) type ReadResult = std::result::Result<Vec<u8>, ReadError>;

/// The commands the disk task can receive.
pub(crate) enum Command {
    /// Allocates the on-disk (or in-memory bookkeeping for the) storage of a
    /// new torrent, scanning for and verifying any pieces that already exist
    /// on disk from a previous run.
    NewTorrent {
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    },
    /// Queues a downloaded block for writing.
    WriteBlock {
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    },
    /// Reads a block back from disk (or from an in-progress piece's write
    /// buffer) to serve an upload request.
    ReadBlock {
        id: TorrentId,
        info: BlockInfo,
        chan: oneshot::Sender<ReadResult>,
    },
    Shutdown,
}

/// Alerts sent from the disk task to the engine (not to any specific
/// torrent).
pub(crate) enum Alert {
    /// The result of allocating a new torrent's storage.
    TorrentAllocation(std::result::Result<TorrentAllocation, NewTorrentError>),
}

/// Sent back once a torrent's storage has been allocated (or recovered from
/// a previous run).
pub(crate) struct TorrentAllocation {
    pub id: TorrentId,
    /// The channel on which this torrent will receive further disk alerts.
    pub alert_port: TorrentAlertReceiver,
    /// Pieces that were already present and verified on disk, e.g. because
    /// the torrent is being resumed.
    pub resumed_pieces: Bitfield,
}

/// Alerts sent from the disk task to a specific torrent.
pub(crate) enum TorrentAlert {
    /// The result of writing a batch of blocks (i.e. a completed piece) to
    /// disk.
    BatchWrite(std::result::Result<BatchWrite, WriteError>),
}

/// The result of a successful batch write: the blocks that were written and
/// whether the piece they complete passed hash verification.
pub(crate) struct BatchWrite {
    pub blocks: Vec<BlockInfo>,
    pub is_piece_valid: Option<bool>,
}

/// A cheap, cloneable handle to the disk task.
#[derive(Clone)]
pub(crate) struct DiskHandle {
    cmd_chan: CommandSender,
}

impl DiskHandle {
    /// Spawns the disk task and returns a handle to it along with the
    /// channel on which engine-wide alerts are received.
    pub(crate) fn new() -> Result<(Self, AlertReceiver)> {
        let (mut disk, cmd_chan, alert_port) = io::Disk::new()?;
        tokio::spawn(async move {
            if let Err(e) = disk.start().await {
                log::error!("Disk IO event loop exited with error: {}", e);
            }
        });
        Ok((Self { cmd_chan }, alert_port))
    }

    pub(crate) fn new_torrent(
        &self,
        id: TorrentId,
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    ) -> Result<()> {
        Ok(self.cmd_chan.send(Command::NewTorrent {
            id,
            info,
            piece_hashes,
        })?)
    }

    pub(crate) fn write_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        Ok(self.cmd_chan.send(Command::WriteBlock { id, info, data })?)
    }

    pub(crate) fn read_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        chan: oneshot::Sender<ReadResult>,
    ) -> Result<()> {
        Ok(self.cmd_chan.send(Command::ReadBlock { id, info, chan })?)
    }

    pub(crate) fn shutdown(&self) -> Result<()> {
        Ok(self.cmd_chan.send(Command::Shutdown)?)
    }
}
