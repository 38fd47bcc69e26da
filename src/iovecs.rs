//! Helpers for vectored disk writes.
//!
//! A piece's blocks are kept as separate buffers until they've all arrived
//! (see [`crate::disk::io`]), so writing a completed piece to disk means
//! writing several buffers in one go, and since a piece may span more than
//! one file, the buffers sometimes need to be split at an arbitrary byte
//! offset that doesn't line up with a block boundary. This module provides
//! that splitting without requiring a piece to be copied into one
//! contiguous buffer first.

use nix::sys::uio::IoVec as NixIoVec;

/// A single buffer to be written, borrowed from wherever the piece's block
/// data lives.
#[derive(Clone, Copy)]
pub struct IoVec<'a>(&'a [u8]);

impl<'a> IoVec<'a> {
    pub fn from_slice(buf: &'a [u8]) -> Self {
        Self(buf)
    }

    pub fn as_slice(&self) -> &'a [u8] {
        self.0
    }

    fn as_nix(&self) -> NixIoVec<&'a [u8]> {
        NixIoVec::from_slice(self.0)
    }
}

/// A byte-limited view over a list of [`IoVec`]s, used to write at most as
/// many bytes as a single file can take, while keeping the unwritten
/// remainder (the "tail") available for the next file.
pub struct IoVecs<'a> {
    /// The buffers included in this view, trimmed to the requested bound (if
    /// any). These are the buffers actually handed to `pwritev`.
    bufs: Vec<IoVec<'a>>,
    /// Whatever didn't fit within the bound: the remainder of a split buffer,
    /// if any, followed by the buffers that weren't touched at all.
    tail: Vec<IoVec<'a>>,
}

impl<'a> IoVecs<'a> {
    /// Wraps the given buffers without any byte limit.
    pub fn unbounded(bufs: &[IoVec<'a>]) -> Self {
        Self {
            bufs: bufs.to_vec(),
            tail: Vec::new(),
        }
    }

    /// Wraps the given buffers, restricted to at most `limit` bytes,
    /// splitting the buffer that straddles the limit if necessary.
    pub fn bounded(bufs: &[IoVec<'a>], limit: usize) -> Self {
        let mut included = Vec::new();
        let mut tail = Vec::new();
        let mut remaining = limit;
        let mut iter = bufs.iter();
        for buf in &mut iter {
            if remaining == 0 {
                tail.push(*buf);
                continue;
            }
            let slice = buf.as_slice();
            if slice.len() <= remaining {
                remaining -= slice.len();
                included.push(*buf);
            } else {
                let (head, rest) = slice.split_at(remaining);
                included.push(IoVec::from_slice(head));
                tail.push(IoVec::from_slice(rest));
                remaining = 0;
            }
        }
        // whatever's left in the iterator wasn't touched at all
        tail.extend(iter.copied());
        Self {
            bufs: included,
            tail,
        }
    }

    /// Returns the buffers that still need to be written, in the form
    /// `nix::sys::uio::pwritev` expects.
    pub fn buffers(&self) -> Vec<NixIoVec<&'a [u8]>> {
        self.bufs.iter().map(IoVec::as_nix).collect()
    }

    /// Marks `n` bytes as having been written, dropping fully consumed
    /// buffers and trimming the one that was only partially written.
    pub fn advance(&mut self, mut n: usize) {
        while n > 0 {
            let done = match self.bufs.first().copied() {
                Some(buf) => {
                    let len = buf.as_slice().len();
                    if n < len {
                        self.bufs[0] = IoVec::from_slice(&buf.as_slice()[n..]);
                        n = 0;
                        false
                    } else {
                        n -= len;
                        true
                    }
                }
                None => break,
            };
            if done {
                self.bufs.remove(0);
            }
        }
    }

    /// Consumes this view and returns whatever didn't fit within the bound
    /// (empty if this was [`unbounded`](Self::unbounded) or nothing
    /// overflowed).
    pub fn into_tail(self) -> Vec<IoVec<'a>> {
        self.tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lens(bufs: &[IoVec]) -> Vec<usize> {
        bufs.iter().map(|b| b.as_slice().len()).collect()
    }

    #[test]
    fn test_bounded_split_mid_buffer() {
        let a = vec![0u8; 10];
        let b = vec![1u8; 10];
        let bufs = vec![IoVec::from_slice(&a), IoVec::from_slice(&b)];

        let view = IoVecs::bounded(&bufs, 15);
        assert_eq!(lens(&view.bufs), vec![10, 5]);
        let tail = view.into_tail();
        assert_eq!(lens(&tail), vec![5]);
        assert_eq!(tail[0].as_slice(), &[1u8; 5][..]);
    }

    #[test]
    fn test_bounded_exact_boundary() {
        let a = vec![0u8; 10];
        let b = vec![1u8; 10];
        let bufs = vec![IoVec::from_slice(&a), IoVec::from_slice(&b)];

        let view = IoVecs::bounded(&bufs, 10);
        assert_eq!(lens(&view.bufs), vec![10]);
        let tail = view.into_tail();
        assert_eq!(lens(&tail), vec![10]);
    }

    #[test]
    fn test_unbounded_keeps_everything() {
        let a = vec![0u8; 4];
        let bufs = vec![IoVec::from_slice(&a)];
        let view = IoVecs::unbounded(&bufs);
        assert_eq!(lens(&view.bufs), vec![4]);
        assert!(view.into_tail().is_empty());
    }

    #[test]
    fn test_advance_drops_and_trims() {
        let a = vec![0u8; 4];
        let b = vec![1u8; 4];
        let bufs = vec![IoVec::from_slice(&a), IoVec::from_slice(&b)];
        let mut view = IoVecs::unbounded(&bufs);
        view.advance(6);
        assert_eq!(lens(&view.bufs), vec![2]);
        view.advance(2);
        assert!(view.bufs.is_empty());
    }
}
