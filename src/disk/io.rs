use {
    nix::sys::uio::pwritev,
    sha1::{Digest, Sha1},
    std::{
        collections::{BTreeMap, HashMap},
        fs::{self, File, OpenOptions},
        ops::Range,
        os::unix::fs::FileExt,
        os::unix::io::AsRawFd,
        sync::{Arc, Mutex},
    },
    tokio::{
        sync::{mpsc, RwLock},
        task,
    },
};

use {
    super::{
        Alert, AlertReceiver, AlertSender, BatchWrite, Command,
        CommandReceiver, CommandSender, ReadResult, TorrentAlert,
        TorrentAlertReceiver, TorrentAlertSender, TorrentAllocation,
    },
    crate::{
        block_count,
        error::{Error, NewTorrentError, ReadError, Result, WriteError},
        iovecs::{IoVec, IoVecs},
        storage_info::{FsStructure, StorageInfo},
        Bitfield, BlockInfo, FileIndex, FileInfo, PieceIndex, Sha1Hash,
        TorrentId,
    },
};

/// The entity responsible for saving downloaded file blocks to disk and
/// verifying whether downloaded pieces are valid, as well as serving reads
/// for blocks we're seeding to other peers.
pub(super) struct Disk {
    /// Each torrent in engine has a corresponding entry in this hashmap, which
    /// includes various metadata about torrent and the torrent specific alert
    /// channel.
    torrents: HashMap<TorrentId, RwLock<Torrent>>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
    /// Channel on which `Disk` sends alerts to the torrent engine.
    alert_chan: AlertSender,
}

impl Disk {
    /// Creates a new `Disk` instance and returns a command sender and an alert
    /// receiver.
    pub(super) fn new() -> Result<(Self, CommandSender, AlertReceiver)> {
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        Ok((
            Self {
                torrents: HashMap::new(),
                cmd_port,
                alert_chan,
            },
            cmd_chan,
            alert_port,
        ))
    }

    /// Starts the disk event loop which is run until shutdown or an
    /// unrecoverable error occurs (e.g. mpsc channel failure).
    pub(super) async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            log::debug!("Disk received command");
            match cmd {
                Command::NewTorrent {
                    id,
                    info,
                    piece_hashes,
                } => {
                    if self.torrents.contains_key(&id) {
                        log::warn!("Torrent {} already allocated", id);
                        self.alert_chan.send(Alert::TorrentAllocation(Err(
                            NewTorrentError::AlreadyExists,
                        )))?;
                        continue;
                    }

                    // opening files and scanning for already-downloaded
                    // pieces can mean hashing a large amount of existing
                    // data, so don't do this on the reactor
                    let torrent_res =
                        task::spawn_blocking(move || Torrent::new(info, piece_hashes))
                            .await
                            .expect("torrent allocation task panicked");

                    // NOTE: Do _NOT_ return on failure, we don't want to kill
                    // the disk task due to potential disk IO errors: we just
                    // want to log it and notify engine of it.
                    match torrent_res {
                        Ok((torrent, alert_port, resumed_pieces)) => {
                            log::info!("Torrent {} successfully allocated", id);
                            self.torrents.insert(id, RwLock::new(torrent));
                            // send notificaiton of allocation success
                            self.alert_chan.send(Alert::TorrentAllocation(
                                Ok(TorrentAllocation {
                                    id,
                                    alert_port,
                                    resumed_pieces,
                                }),
                            ))?;
                        }
                        Err(e) => {
                            log::warn!(
                                "Torrent {} allocation failure: {}",
                                id,
                                e
                            );
                            // send notificaiton of allocation failure
                            self.alert_chan
                                .send(Alert::TorrentAllocation(Err(e)))?;
                        }
                    }
                }
                Command::WriteBlock { id, info, data } => {
                    self.write_block(id, info, data).await?;
                }
                Command::ReadBlock { id, info, chan } => {
                    let result = self.read_block(id, info).await;
                    // the requester may have given up waiting; that's not our
                    // problem
                    let _ = chan.send(result);
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Queues a block for writing and fails if the torrent id is invalid.
    ///
    /// If the block could not be written due to IO failure, the torrent is
    /// notified of it.
    async fn write_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Saving torrent {} block {:?} to disk", id, info);

        let torrent = self.torrents.get(&id).ok_or_else(|| {
            log::warn!("Torrent {} not found", id);
            Error::InvalidTorrentId
        })?;
        torrent.write().await.write_block(info, data).await
    }

    /// Reads a block back from disk to serve an upload request.
    async fn read_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
    ) -> ReadResult {
        log::trace!("Reading torrent {} block {:?} from disk", id, info);

        let torrent = self
            .torrents
            .get(&id)
            .ok_or(ReadError::InvalidBlock)?;
        let torrent = torrent.read().await;
        let files = Arc::clone(&torrent.files);
        let storage = torrent.info.clone();
        if !torrent.have.get(info.piece_index).map_or(false, |b| *b) {
            return Err(ReadError::InvalidBlock);
        }
        task::spawn_blocking(move || {
            let piece_offset =
                info.piece_index as u64 * storage.piece_len as u64
                    + info.offset as u64;
            let file_range =
                storage.files_intersecting_piece(info.piece_index).map_err(
                    |_| ReadError::InvalidBlock,
                )?;
            read_range(
                &files[file_range],
                piece_offset,
                info.len as u64,
            )
        })
        .await
        .expect("disk IO read task panicked")
    }
}

/// Torrent information related to disk IO.
///
/// Contains the in-progress pieces (i.e. the write buffer), metadata about
/// torrent's download and piece sizes, etc.
struct Torrent {
    /// All information concerning this torrent's storage.
    info: StorageInfo,
    /// The channel used to alert a torrent that a block has been written to
    /// disk and/or a piece was completed.
    alert_chan: TorrentAlertSender,
    /// The in-progress piece downloads and disk writes. This is the torrent's
    /// disk write buffer. Each piece is mapped to its index for faster lookups.
    // TODO(https://github.com/mandreyel/cratetorrent/issues/22): Currently
    // there is no upper bound on the in-memory write buffer, so this may lead
    // to OOM.
    pieces: HashMap<PieceIndex, Piece>,
    /// Handles of all files in torrent, opened in advance during torrent
    /// creation.
    ///
    /// Each writer thread will get exclusive access to the file handle it
    /// needs, referring to it directly in the vector (hence the arc).
    ///
    /// Later we will need to make file access more granular, as multiple
    /// concurrent writes to the same file that don't overlap are safe to do.
    files: Arc<Vec<Mutex<TorrentFile>>>,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Vec<u8>,
    /// Which pieces are already fully and correctly written to disk, and
    /// therefore safe to read back to serve an upload.
    have: Bitfield,
    /// Disk IO statistics.
    stats: Stats,
}

impl Torrent {
    /// Creates the file system structure of the torrent, opens the file
    /// handles (creating them if this is a fresh download, reusing them if
    /// this is a resume), and scans for pieces that are already present and
    /// valid on disk.
    fn new(
        info: StorageInfo,
        piece_hashes: Vec<u8>,
    ) -> Result<(Self, TorrentAlertReceiver, Bitfield), NewTorrentError> {
        let is_resume = info.download_dir.exists();
        if is_resume {
            log::info!(
                "Download path {:?} exists, attempting resume",
                info.download_dir
            );
        } else if let FsStructure::Archive { .. } = &info.structure {
            fs::create_dir_all(&info.download_dir)
                .map_err(NewTorrentError::Io)?;
        }

        // Helper function for opening a file, creating it (and its parent
        // directories) if it doesn't already exist.
        let open_file = |info: FileInfo| {
            if let Some(parent) = info.path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    log::info!("Creating torrent subdir {:?}", parent);
                    fs::create_dir_all(&parent).map_err(|e| {
                        log::warn!("Failed to create subdir {:?}", parent);
                        NewTorrentError::Io(e)
                    })?;
                }
            }
            let handle = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&info.path)
                .map_err(|e| {
                    log::warn!("Failed to open file {:?}", &info.path);
                    NewTorrentError::Io(e)
                })?;
            Ok(Mutex::new(TorrentFile { info, handle }))
        };

        let files = match &info.structure {
            FsStructure::File(file) => {
                log::debug!(
                    "Torrent is single {} bytes long file {:?}",
                    file.len,
                    file.path
                );
                vec![open_file(file.clone())?]
            }
            FsStructure::Archive { files } => {
                debug_assert!(!files.is_empty());
                log::debug!("Torrent is multi file: {:?}", files);
                let mut torrent_files = Vec::with_capacity(files.len());
                for file in files.iter() {
                    let file = FileInfo {
                        path: info.download_dir.join(&file.path),
                        torrent_offset: file.torrent_offset,
                        len: file.len,
                    };
                    torrent_files.push(open_file(file)?);
                }
                torrent_files
            }
        };

        let (alert_chan, alert_port) = mpsc::unbounded_channel();

        let have = if is_resume {
            resume_scan(&info, &piece_hashes, &files)
        } else {
            Bitfield::repeat(false, info.piece_count)
        };
        let resumed_pieces = have.clone();

        Ok((
            Self {
                info,
                alert_chan,
                pieces: HashMap::new(),
                files: Arc::new(files),
                piece_hashes,
                have,
                stats: Stats::default(),
            },
            alert_port,
            resumed_pieces,
        ))
    }

    async fn write_block(
        &mut self,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Saving block {:?} to disk", info);

        let piece_index = info.piece_index;
        if !self.pieces.contains_key(&piece_index) {
            if let Err(e) = self.start_new_piece(info) {
                self.alert_chan.send(TorrentAlert::BatchWrite(Err(e)))?;
                return Ok(());
            }
        }
        let piece = self
            .pieces
            .get_mut(&piece_index)
            .expect("Newly inserted piece not present");

        piece.enqueue_block(info.offset, data);

        if piece.is_complete() {
            let piece = self.pieces.remove(&piece_index).unwrap();
            let piece_len = self.info.piece_len;
            let files = Arc::clone(&self.files);

            let write_result = task::spawn_blocking(move || {
                let is_piece_valid = piece.matches_hash();

                let (write_count, blocks) = if is_piece_valid {
                    log::info!("Piece {} is valid", piece_index);
                    let piece_torrent_offset =
                        piece_index as u64 * piece_len as u64;
                    let write_count =
                        piece.write(piece_torrent_offset, &*files)?;

                    let blocks = piece
                        .blocks
                        .iter()
                        .map(|(offset, block)| BlockInfo {
                            piece_index: info.piece_index,
                            offset: *offset,
                            len: block.len() as u32,
                        })
                        .collect();

                    (Some(write_count), blocks)
                } else {
                    log::warn!("Piece {} is NOT valid", info.piece_index);
                    (None, Vec::new())
                };

                Ok((is_piece_valid, write_count, blocks))
            })
            .await
            .expect("disk IO write task panicked");

            match write_result {
                Ok((is_piece_valid, write_count, blocks)) => {
                    if is_piece_valid {
                        if let Some(write_count) = write_count {
                            self.stats.write_count += write_count as u64;
                        }
                        if let Some(mut have) = self.have.get_mut(piece_index)
                        {
                            *have = true;
                        }
                    }

                    self.alert_chan.send(TorrentAlert::BatchWrite(Ok(
                        BatchWrite {
                            blocks,
                            is_piece_valid: Some(is_piece_valid),
                        },
                    )))?;
                }
                Err(e) => {
                    log::warn!("Disk write error: {}", e);
                    self.stats.write_failure_count += 1;
                    self.alert_chan.send(TorrentAlert::BatchWrite(Err(e)))?;
                }
            }
        }

        Ok(())
    }

    /// Starts a new in-progress piece, creating metadata for it in self.
    fn start_new_piece(&mut self, info: BlockInfo) -> Result<(), WriteError> {
        log::trace!("Creating piece {} write buffer", info.piece_index);

        let hash_pos = info.piece_index * 20;
        if hash_pos + 20 > self.piece_hashes.len() {
            log::warn!("Piece index {} is invalid", info.piece_index);
            return Err(WriteError::InvalidPieceIndex);
        }

        let hash_slice = &self.piece_hashes[hash_pos..hash_pos + 20];
        let mut expected_hash = [0; 20];
        expected_hash.copy_from_slice(hash_slice);
        log::debug!(
            "Piece {} expected hash {}",
            info.piece_index,
            hex::encode(&expected_hash)
        );

        let len = self
            .info
            .piece_len(info.piece_index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        log::debug!("Piece {} is {} bytes long", info.piece_index, len);

        let files = self
            .info
            .files_intersecting_piece(info.piece_index)
            .map_err(|_| WriteError::InvalidPieceIndex)?;
        log::debug!("Piece {} intersects files: {:?}", info.piece_index, files);

        let piece = Piece {
            expected_hash,
            len,
            blocks: BTreeMap::new(),
            files,
        };
        self.pieces.insert(info.piece_index, piece);

        Ok(())
    }
}

struct TorrentFile {
    info: FileInfo,
    handle: File,
}

impl TorrentFile {
    fn write_vectored_at(
        &self,
        iovecs: &mut IoVecs<'_>,
        offset: u64,
    ) -> Result<usize, WriteError> {
        let mut total_write_count = 0;
        while !iovecs.buffers().is_empty() {
            let write_count = pwritev(
                self.handle.as_raw_fd(),
                &iovecs.buffers(),
                offset as i64,
            )
            .map_err(|e| {
                log::warn!("File {:?} write error: {}", self.info.path, e);
                WriteError::Io(std::io::Error::last_os_error())
            })?;
            iovecs.advance(write_count);
            total_write_count += write_count;
        }
        Ok(total_write_count)
    }
}

/// Reads `len` bytes starting at `torrent_offset` out of the files that
/// intersect that range, returning them concatenated.
///
/// # Important
///
/// This performs sync IO and should be run on a thread pool, not the
/// reactor.
fn read_range(
    files: &[Mutex<TorrentFile>],
    torrent_offset: u64,
    len: u64,
) -> ReadResult {
    let mut buf = Vec::with_capacity(len as usize);
    let mut remaining = len;
    let mut offset = torrent_offset;
    for file in files {
        if remaining == 0 {
            break;
        }
        let file = file.lock().unwrap();
        // the file range handed to us spans every file the whole piece
        // touches, but the requested block may not start in the first of
        // them, so skip files that end before our current read offset
        if offset >= file.info.torrent_end_offset() {
            continue;
        }
        let slice = file.info.get_slice(offset, remaining);
        let mut chunk = vec![0; slice.len as usize];
        file.handle.read_exact_at(&mut chunk, slice.offset)?;
        buf.extend_from_slice(&chunk);
        offset += slice.len;
        remaining -= slice.len;
    }
    if remaining > 0 {
        return Err(ReadError::InvalidBlock);
    }
    Ok(buf)
}

/// Scans the already-opened files of a resumed torrent and hashes each piece
/// to determine which ones are already fully and correctly present.
fn resume_scan(
    info: &StorageInfo,
    piece_hashes: &[u8],
    files: &[Mutex<TorrentFile>],
) -> Bitfield {
    let mut have = Bitfield::repeat(false, info.piece_count);
    for index in 0..info.piece_count {
        let piece_len = match info.piece_len(index) {
            Ok(len) => len,
            Err(_) => continue,
        };
        let file_range = match info.files_intersecting_piece(index) {
            Ok(range) => range,
            Err(_) => continue,
        };
        let torrent_offset = index as u64 * info.piece_len as u64;
        let data = match read_range(
            &files[file_range],
            torrent_offset,
            piece_len as u64,
        ) {
            Ok(data) => data,
            Err(_) => continue,
        };

        let hash_pos = index * 20;
        if hash_pos + 20 > piece_hashes.len() {
            continue;
        }
        let mut hasher = Sha1::new();
        hasher.input(&data);
        let hash = hasher.result();
        if hash.as_slice() == &piece_hashes[hash_pos..hash_pos + 20] {
            if let Some(mut bit) = have.get_mut(index) {
                *bit = true;
            }
        }
    }
    let verified = have.count_ones();
    if verified > 0 {
        log::info!(
            "Resume scan found {}/{} pieces already complete",
            verified,
            info.piece_count
        );
    }
    have
}

#[derive(Default)]
struct Stats {
    /// The number of bytes successfully written to disk.
    write_count: u64,
    /// The number of times we failed to write to disk.
    write_failure_count: usize,
}

/// An in-progress piece download that keeps in memory the so far downloaded
/// blocks and the expected hash of the piece.
struct Piece {
    /// The expected hash of the whole piece.
    expected_hash: Sha1Hash,
    /// The length of the piece, in bytes.
    len: u32,
    /// The so far downloaded blocks. Once the size of this map reaches the
    /// number of blocks in piece, the piece is complete and, if the hash is
    /// correct, saved to disk.
    blocks: BTreeMap<u32, Vec<u8>>,
    /// The files that this piece overlaps with.
    files: Range<FileIndex>,
}

impl Piece {
    fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) {
        if self.blocks.contains_key(&offset) {
            log::warn!("Duplicate piece block at offset {}", offset);
        } else {
            self.blocks.insert(offset, data);
        }
    }

    fn is_complete(&self) -> bool {
        self.blocks.len() == block_count(self.len)
    }

    /// Calculates the piece's hash using all its blocks and returns if it
    /// matches the expected hash.
    ///
    /// # Important
    ///
    /// This is a long running function and should be executed on a thread pool
    /// and not the executor.
    fn matches_hash(&self) -> bool {
        debug_assert_eq!(self.blocks.len(), block_count(self.len));
        let mut hasher = Sha1::new();
        for block in self.blocks.values() {
            hasher.input(&block);
        }
        let hash = hasher.result();
        log::debug!("Piece hash: {:x}", hash);
        hash.as_slice() == self.expected_hash
    }

    /// Writes the piece's blocks to the files the piece overlaps with.
    ///
    /// # Important
    ///
    /// This performs sync IO and is thus potentially blocking and should be
    /// executed on a thread pool and not the executor.
    fn write(
        &self,
        piece_torrent_offset: u64,
        files: &[Mutex<TorrentFile>],
    ) -> Result<usize, WriteError> {
        let mut total_write_count = 0;

        let blocks: Vec<_> = self
            .blocks
            .values()
            .map(|b| IoVec::from_slice(&b))
            .collect();
        let mut bufs = blocks;
        let mut write_torrent_offset = piece_torrent_offset;

        let files = &files[self.files.clone()];
        debug_assert!(!files.is_empty());
        if files.len() == 1 {
            let file = files.first().unwrap().lock().unwrap();
            let slice =
                file.info.get_slice(write_torrent_offset, self.len as u64);
            let mut iovecs = IoVecs::unbounded(&bufs);
            debug_assert!(
                iovecs
                    .buffers()
                    .iter()
                    .map(|iov| iov.as_slice().len() as u64)
                    .sum::<u64>()
                    <= slice.len
            );

            total_write_count +=
                file.write_vectored_at(&mut iovecs, slice.offset)?;

            bufs = iovecs.into_tail();
        } else {
            for file in files.iter() {
                let file = file.lock().unwrap();
                let slice =
                    file.info.get_slice(write_torrent_offset, self.len as u64);
                debug_assert!(slice.len > 0);
                debug_assert!(!bufs.is_empty());

                let mut iovecs = IoVecs::bounded(&bufs, slice.len as usize);
                debug_assert!(
                    iovecs
                        .buffers()
                        .iter()
                        .map(|iov| iov.as_slice().len() as u64)
                        .sum::<u64>()
                        <= slice.len
                );

                let write_count =
                    file.write_vectored_at(&mut iovecs, slice.offset)?;

                bufs = iovecs.into_tail();

                write_torrent_offset += write_count as u64;
                total_write_count += write_count;
            }
        }

        debug_assert!(bufs.is_empty());

        Ok(total_write_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_piece_is_complete() {
        let piece = Piece {
            expected_hash: [0; 20],
            len: crate::BLOCK_LEN * 2,
            blocks: BTreeMap::new(),
            files: 0..1,
        };
        assert!(!piece.is_complete());
    }

    #[test]
    fn test_resume_scan_empty_torrent_has_no_pieces() {
        let info = StorageInfo {
            piece_count: 0,
            piece_len: crate::BLOCK_LEN,
            last_piece_len: crate::BLOCK_LEN,
            download_len: 0,
            download_dir: PathBuf::from("/"),
            structure: FsStructure::Archive { files: Vec::new() },
        };
        let have = resume_scan(&info, &[], &[]);
        assert_eq!(have.len(), 0);
    }
}
