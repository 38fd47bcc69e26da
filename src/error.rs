//! Error types used throughout the engine.
//!
//! Following the rest of the crate, each error is a plain enum with a manual
//! `Display` impl and `From` conversions at the boundaries that need them,
//! rather than a derive-macro crate: errors here are few enough, and
//! long-lived enough, that writing them by hand keeps their shape honest.

use std::fmt;

use crate::PieceIndex;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The top level error type, returned from any fallible operation that
/// crosses a torrent's public API.
#[derive(Debug)]
pub enum Error {
    /// Wraps a generic IO error.
    Io(std::io::Error),
    /// The peer's advertised info hash doesn't match ours.
    InvalidPeerInfoHash,
    /// The remote didn't send a bitfield first and isn't a seed, so we can't
    /// download from it (we don't yet support downloading from leeches).
    PeerNotSeed,
    /// Peer sent a bitfield message outside of the availability exchange
    /// state, which is a protocol violation.
    BitfieldNotAfterHandshake,
    /// A message's declared length didn't match what its id allows.
    InvalidMessageLength,
    /// An unrecognized message id was received.
    InvalidMessageId(u8),
    /// The handshake's protocol string wasn't the expected one.
    InvalidProtocolString,
    /// A piece index outside of `0..piece_count` was used.
    InvalidPieceIndex,
    /// A file index outside of the torrent's file list was used.
    InvalidFileIndex,
    /// An invalid torrent id was used to address a torrent.
    InvalidTorrentId,
    /// Failed to parse the torrent metainfo.
    Metainfo(MetainfoError),
    /// The tracker could not be reached on any announce tier this round.
    TrackerUnreachable,
    /// The tracker sent a response we couldn't make sense of.
    InvalidTrackerResponse(String),
    /// A disk IO or piece write error.
    Write(WriteError),
    /// Failed to allocate a torrent's on-disk storage.
    NewTorrent(NewTorrentError),
    /// The channel to a background task (peer session, disk task) is gone.
    Channel,
    /// A declared but intentionally unimplemented feature was invoked.
    NotImplemented(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::InvalidPeerInfoHash => write!(f, "peer advertised invalid info hash"),
            Self::PeerNotSeed => write!(f, "peer is not a seed"),
            Self::BitfieldNotAfterHandshake => {
                write!(f, "peer sent bitfield message not directly after handshake")
            }
            Self::InvalidMessageLength => write!(f, "invalid message length"),
            Self::InvalidMessageId(id) => write!(f, "invalid message id: {}", id),
            Self::InvalidProtocolString => write!(f, "invalid handshake protocol string"),
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::InvalidFileIndex => write!(f, "invalid file index"),
            Self::InvalidTorrentId => write!(f, "invalid torrent id"),
            Self::Metainfo(e) => write!(f, "metainfo error: {}", e),
            Self::TrackerUnreachable => write!(f, "no tracker tier returned a response"),
            Self::InvalidTrackerResponse(reason) => {
                write!(f, "invalid tracker response: {}", reason)
            }
            Self::Write(e) => write!(f, "write error: {}", e),
            Self::NewTorrent(e) => write!(f, "failed to allocate torrent storage: {}", e),
            Self::Channel => write!(f, "internal channel closed"),
            Self::NotImplemented(what) => write!(f, "not implemented: {}", what),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<MetainfoError> for Error {
    fn from(e: MetainfoError) -> Self {
        Self::Metainfo(e)
    }
}

impl From<WriteError> for Error {
    fn from(e: WriteError) -> Self {
        Self::Write(e)
    }
}

impl From<NewTorrentError> for Error {
    fn from(e: NewTorrentError) -> Self {
        Self::NewTorrent(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Channel
    }
}

/// Errors that may occur while parsing a torrent's metainfo.
#[derive(Debug)]
pub enum MetainfoError {
    /// The bencoded metainfo couldn't be decoded at all.
    Bencode(String),
    /// The concatenated piece hashes field isn't a multiple of 20 bytes, or
    /// doesn't match the expected piece count.
    InvalidPieceHashesLength,
    /// A mandatory field was missing.
    MissingField(&'static str),
    /// The torrent declares zero total length or zero files.
    EmptyTorrent,
}

impl fmt::Display for MetainfoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bencode(e) => write!(f, "bencode decode error: {}", e),
            Self::InvalidPieceHashesLength => {
                write!(f, "piece hashes length doesn't match piece count")
            }
            Self::MissingField(field) => write!(f, "missing mandatory field: {}", field),
            Self::EmptyTorrent => write!(f, "torrent has zero length or no files"),
        }
    }
}

impl std::error::Error for MetainfoError {}

impl From<serde_bencode::Error> for MetainfoError {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e.to_string())
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Metainfo(MetainfoError::from(e))
    }
}

/// Errors that may occur while writing a piece's blocks to disk.
#[derive(Debug)]
pub enum WriteError {
    Io(std::io::Error),
    InvalidPieceIndex,
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
        }
    }
}

impl std::error::Error for WriteError {}

impl From<std::io::Error> for WriteError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Errors that may occur when allocating storage for a new torrent.
#[derive(Debug)]
pub enum NewTorrentError {
    AlreadyExists,
    Io(std::io::Error),
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "torrent already allocated"),
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for NewTorrentError {}

/// Errors that may occur when reading back a block to serve to a peer.
#[derive(Debug)]
pub enum ReadError {
    Io(std::io::Error),
    /// The requested block isn't on disk (piece not yet committed, or the
    /// offset/length don't line up with a block boundary).
    InvalidBlock,
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::InvalidBlock => write!(f, "requested block is not available"),
        }
    }
}

impl std::error::Error for ReadError {}

impl From<std::io::Error> for ReadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// A hash mismatch encountered while verifying a committed piece.
#[derive(Debug, Clone, Copy)]
pub struct PieceHashMismatch {
    pub piece_index: PieceIndex,
}

impl fmt::Display for PieceHashMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "piece {} failed hash verification", self.piece_index)
    }
}
