//! Rarest-first piece selection.
//!
//! Tracks, for every piece in the torrage, how many of the peers we're
//! connected to have announced it, and picks the least available piece we
//! don't already have and aren't already downloading.

use crate::{
    error::{Error, Result},
    Bitfield, PieceIndex,
};

pub(crate) struct PiecePicker {
    /// The number of peers (that we've registered availability for) that
    /// have each piece.
    availability: Vec<u32>,
    /// Pieces we already have, fully and correctly, on disk.
    have: Bitfield,
    /// Pieces that have been picked (by us or another session) and are
    /// currently being downloaded, so we don't pick them twice.
    pending: Bitfield,
}

impl PiecePicker {
    /// Creates a piece picker for a torrent with `piece_count` pieces, none
    /// of which we have yet.
    pub fn new(piece_count: usize) -> Self {
        Self::with_completed(Bitfield::repeat(false, piece_count))
    }

    /// Creates a piece picker seeded with the pieces we already have, e.g.
    /// from a resume scan.
    pub fn with_completed(have: Bitfield) -> Self {
        let piece_count = have.len();
        Self {
            availability: vec![0; piece_count],
            pending: Bitfield::repeat(false, piece_count),
            have,
        }
    }

    /// Registers a peer's bitfield, returning whether we're interested in
    /// this peer (i.e. whether they have a piece we don't).
    pub fn register_availability(&mut self, bitfield: &Bitfield) -> Result<bool> {
        if bitfield.len() != self.availability.len() {
            return Err(Error::InvalidPieceIndex);
        }
        let mut interested = false;
        for (index, has_piece) in bitfield.iter().enumerate() {
            if *has_piece {
                self.availability[index] += 1;
                if !self.have[index] {
                    interested = true;
                }
            }
        }
        Ok(interested)
    }

    /// Registers that a single piece (announced via a `have` message)
    /// became available at a peer, returning whether it's a piece we don't
    /// have yet.
    pub fn register_have(&mut self, index: PieceIndex) -> Result<bool> {
        let availability = self
            .availability
            .get_mut(index)
            .ok_or(Error::InvalidPieceIndex)?;
        *availability += 1;
        Ok(!self.have[index])
    }

    /// Picks the rarest piece we don't have and isn't already being
    /// downloaded, marking it pending.
    pub fn pick_piece(&mut self) -> Option<PieceIndex> {
        let mut best: Option<(PieceIndex, u32)> = None;
        for (index, &availability) in self.availability.iter().enumerate() {
            if availability == 0 || self.have[index] || self.pending[index] {
                continue;
            }
            if best.map_or(true, |(_, best_availability)| {
                availability < best_availability
            }) {
                best = Some((index, availability));
            }
        }
        let (index, _) = best?;
        self.pending.set(index, true);
        Some(index)
    }

    /// Picks the rarest piece that `peer_pieces` has, that we don't have yet
    /// and isn't already being downloaded by another session.
    ///
    /// This is the per-session counterpart of [`Self::pick_piece`]: it's
    /// unsound for a session to request a piece its own peer never
    /// announced (spec.md §4.6 assumes the picked peer "has the piece").
    pub fn pick_piece_from(&mut self, peer_pieces: &Bitfield) -> Option<PieceIndex> {
        let mut best: Option<(PieceIndex, u32)> = None;
        for (index, &availability) in self.availability.iter().enumerate() {
            if availability == 0 || self.have[index] || self.pending[index] {
                continue;
            }
            if !peer_pieces.get(index).map(|has| *has).unwrap_or(false) {
                continue;
            }
            if best.map_or(true, |(_, best_availability)| {
                availability < best_availability
            }) {
                best = Some((index, availability));
            }
        }
        let (index, _) = best?;
        self.pending.set(index, true);
        Some(index)
    }

    /// Marks a piece as fully received, so it's no longer picked again.
    pub fn received_piece(&mut self, index: PieceIndex) {
        if index < self.have.len() {
            self.have.set(index, true);
            self.pending.set(index, false);
        }
    }

    /// Un-marks a piece as pending, e.g. because its session was dropped
    /// before the piece completed.
    pub fn abandon_piece(&mut self, index: PieceIndex) {
        if index < self.pending.len() {
            self.pending.set(index, false);
        }
    }

    /// Returns true once we have every piece in the torrent.
    pub fn is_complete(&self) -> bool {
        self.have.all()
    }

    /// Returns our current bitfield of completed pieces.
    pub fn own_bitfield(&self) -> &Bitfield {
        &self.have
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits(bits: &[bool]) -> Bitfield {
        bits.iter().copied().collect()
    }

    #[test]
    fn test_register_availability_reports_interest() {
        let mut picker = PiecePicker::new(4);
        let interested = picker
            .register_availability(&bits(&[true, false, true, false]))
            .unwrap();
        assert!(interested);
    }

    #[test]
    fn test_register_availability_rejects_wrong_length() {
        let mut picker = PiecePicker::new(4);
        assert!(picker.register_availability(&bits(&[true, false])).is_err());
    }

    #[test]
    fn test_pick_piece_prefers_rarest() {
        let mut picker = PiecePicker::new(3);
        // piece 0 available from 2 peers, piece 1 from 1 peer, piece 2 from
        // none
        picker
            .register_availability(&bits(&[true, true, false]))
            .unwrap();
        picker
            .register_availability(&bits(&[true, false, false]))
            .unwrap();
        assert_eq!(picker.pick_piece(), Some(1));
    }

    #[test]
    fn test_pick_piece_skips_pending_and_have() {
        let mut picker = PiecePicker::new(2);
        picker.register_availability(&bits(&[true, true])).unwrap();
        let first = picker.pick_piece().unwrap();
        // picking again shouldn't return the same (now pending) piece
        let second = picker.pick_piece().unwrap();
        assert_ne!(first, second);
        assert_eq!(picker.pick_piece(), None);

        picker.received_piece(first);
        picker.abandon_piece(second);
        assert_eq!(picker.pick_piece(), Some(second));
    }

    #[test]
    fn test_pick_piece_from_restricts_to_peer_bitfield() {
        let mut picker = PiecePicker::new(3);
        // all three pieces are available somewhere, but this particular
        // peer only has piece 2
        picker
            .register_availability(&bits(&[true, true, true]))
            .unwrap();
        let peer_pieces = bits(&[false, false, true]);
        assert_eq!(picker.pick_piece_from(&peer_pieces), Some(2));
        // nothing else left that this peer has
        assert_eq!(picker.pick_piece_from(&peer_pieces), None);
    }
}
