//! Tracks the block-level progress of a single piece download.
//!
//! A [`PieceDownload`] doesn't know anything about peers or the network: it
//! just keeps each of a piece's blocks in one of three states and lets a
//! [`crate::peer::PeerSession`] pull the next batch of blocks to request.
//!
//! A block that's been requested but hasn't arrived within
//! [`crate::conf::TorrentConf::block_request_timeout`] is swept back to
//! `Free` by [`PieceDownload::expire_blocks`], so a peer that stalls on a
//! request doesn't permanently tie the block up (spec.md §4.2, P6).

use std::time::{Duration, Instant};

use crate::{block_count, block_len, BlockInfo, PieceIndex};

/// The state of a single block within a piece download.
#[derive(Clone, Copy, Debug)]
enum BlockStatus {
    /// Not yet requested from any peer.
    Free,
    /// Requested from a peer but not yet received, along with when the
    /// request was sent.
    Pending(Instant),
    /// Received and handed off to disk.
    Received,
}

/// Tracks which of a piece's blocks have been requested and/or received.
pub(crate) struct PieceDownload {
    /// The piece's index.
    index: PieceIndex,
    /// The piece's length, used to derive block boundaries.
    piece_len: u32,
    /// One entry per block in the piece, in block order.
    blocks: Vec<BlockStatus>,
}

impl PieceDownload {
    pub fn new(index: PieceIndex, piece_len: u32) -> Self {
        let blocks = vec![BlockStatus::Free; block_count(piece_len)];
        Self {
            index,
            piece_len,
            blocks,
        }
    }

    pub fn piece_index(&self) -> PieceIndex {
        self.index
    }

    /// Picks up to `count` free blocks, marks them pending, and appends their
    /// [`BlockInfo`]s to `out`.
    pub fn pick_blocks(&mut self, count: usize, out: &mut Vec<BlockInfo>) {
        if count == 0 {
            return;
        }
        let mut picked = 0;
        for (block_index, status) in self.blocks.iter_mut().enumerate() {
            if picked == count {
                break;
            }
            if matches!(status, BlockStatus::Free) {
                *status = BlockStatus::Pending(Instant::now());
                let offset = block_index as u32 * crate::BLOCK_LEN;
                out.push(BlockInfo {
                    piece_index: self.index,
                    offset,
                    len: block_len(self.piece_len, block_index),
                });
                picked += 1;
            }
        }
    }

    /// Marks the block identified by `block_info` as received.
    ///
    /// No-op if the block doesn't belong to this piece or wasn't pending,
    /// which may happen with duplicate or unsolicited blocks.
    pub fn received_block(&mut self, block_info: BlockInfo) {
        if block_info.piece_index != self.index {
            return;
        }
        let block_index = block_info.index_in_piece();
        if let Some(status) = self.blocks.get_mut(block_index) {
            *status = BlockStatus::Received;
        }
    }

    /// Reverts every block that's been `Pending` for longer than `timeout`
    /// back to `Free`, returning their [`BlockInfo`]s so the caller can drop
    /// the matching entries from its own outgoing-request bookkeeping.
    pub fn expire_blocks(&mut self, timeout: Duration) -> Vec<BlockInfo> {
        let now = Instant::now();
        let mut expired = Vec::new();
        for (block_index, status) in self.blocks.iter_mut().enumerate() {
            if let BlockStatus::Pending(requested_at) = status {
                if now.duration_since(*requested_at) > timeout {
                    *status = BlockStatus::Free;
                    expired.push(BlockInfo {
                        piece_index: self.index,
                        offset: block_index as u32 * crate::BLOCK_LEN,
                        len: block_len(self.piece_len, block_index),
                    });
                }
            }
        }
        expired
    }

    /// Returns the number of blocks not yet received.
    pub fn count_missing_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|s| !matches!(s, BlockStatus::Received))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_blocks_marks_pending() {
        let mut download = PieceDownload::new(0, 3 * crate::BLOCK_LEN);
        let mut blocks = Vec::new();
        download.pick_blocks(2, &mut blocks);
        assert_eq!(blocks.len(), 2);
        assert_eq!(download.count_missing_blocks(), 3);

        // picking again shouldn't return the already pending blocks
        let mut more = Vec::new();
        download.pick_blocks(2, &mut more);
        assert_eq!(more.len(), 1);
    }

    #[test]
    fn test_received_block_completes_piece() {
        let mut download = PieceDownload::new(0, crate::BLOCK_LEN);
        let mut blocks = Vec::new();
        download.pick_blocks(1, &mut blocks);
        assert_eq!(download.count_missing_blocks(), 1);
        download.received_block(blocks[0]);
        assert_eq!(download.count_missing_blocks(), 0);
    }

    #[test]
    fn test_expire_blocks_frees_stale_pending() {
        let mut download = PieceDownload::new(0, crate::BLOCK_LEN);
        let mut blocks = Vec::new();
        download.pick_blocks(1, &mut blocks);

        // nothing to expire yet
        assert!(download.expire_blocks(Duration::from_secs(5)).is_empty());

        // a zero timeout means "anything pending has expired"
        let expired = download.expire_blocks(Duration::from_secs(0));
        assert_eq!(expired, blocks);
        assert_eq!(download.count_missing_blocks(), 1);

        // freed, so it can be picked again
        let mut repicked = Vec::new();
        download.pick_blocks(1, &mut repicked);
        assert_eq!(repicked, blocks);
    }
}
