//! Pluggable peer-selection policy for choosing one candidate among several
//! eligible peers (spec.md §4.5).
//!
//! Authored fresh: this comes from the original prototype's central
//! scheduler, which, for every wanted piece, chose among the (possibly
//! several) connected peers that had it. This engine instead gives each peer
//! its own session task, so a session only ever requests blocks from the one
//! peer it's connected to -- there's no per-piece "which peer" choice left
//! on the download path (see DESIGN.md). [`PeerSelector`] is still
//! implemented faithfully to spec.md's three variants and wired in at
//! `torrent.rs`'s optimistic-unchoke round, the nearest point in this
//! architecture where one peer is chosen out of several eligible
//! candidates.

use rand::seq::SliceRandom;
use std::net::SocketAddr;

use crate::error::{Error, Result};

/// A peer eligible for selection, together with the statistic
/// `ProportionalRandom` ranks candidates by.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PeerCandidate {
    pub addr: SocketAddr,
    /// Bytes we've uploaded to this peer divided by bytes downloaded from
    /// them; `+inf` if we've downloaded nothing from them yet (see
    /// `counter::PeerStats::upload_ratio`).
    pub upload_ratio: f64,
}

/// The closed set of peer-selection policies (spec.md §4.5; REDESIGN FLAGS
/// asks for this to be modeled as a variant set rather than a runtime
/// subclass lookup).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerSelector {
    /// Uniform over all eligible candidates.
    Random,
    /// Weighted by `upload_ratio`; a candidate with a ratio of +inf
    /// deterministically selects the random fallback instead, since there's
    /// nothing to weight by when we haven't downloaded anything from them.
    ProportionalRandom,
    /// Declared by the original prototype but never implemented there.
    /// Intentionally left unimplemented rather than guessed at -- see
    /// DESIGN.md's Open Questions.
    AuctionStub,
}

impl PeerSelector {
    /// Picks one candidate out of `candidates` according to this policy.
    /// Returns `Ok(None)` if `candidates` is empty.
    pub fn select<'a>(
        &self,
        candidates: &'a [PeerCandidate],
    ) -> Result<Option<&'a PeerCandidate>> {
        if candidates.is_empty() {
            return Ok(None);
        }
        match self {
            Self::Random => Ok(candidates.choose(&mut rand::thread_rng())),
            Self::ProportionalRandom => {
                if candidates.iter().any(|c| c.upload_ratio.is_infinite()) {
                    return Ok(candidates.choose(&mut rand::thread_rng()));
                }
                let total: f64 = candidates.iter().map(|c| c.upload_ratio).sum();
                if total <= 0.0 {
                    return Ok(candidates.choose(&mut rand::thread_rng()));
                }
                let mut target = rand::random::<f64>() * total;
                for candidate in candidates {
                    target -= candidate.upload_ratio;
                    if target <= 0.0 {
                        return Ok(Some(candidate));
                    }
                }
                Ok(candidates.last())
            }
            Self::AuctionStub => Err(Error::NotImplemented(
                "auction-based proportional share peer selection",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(addr: &str, upload_ratio: f64) -> PeerCandidate {
        PeerCandidate {
            addr: addr.parse().unwrap(),
            upload_ratio,
        }
    }

    #[test]
    fn test_random_returns_none_for_empty_candidates() {
        assert!(PeerSelector::Random.select(&[]).unwrap().is_none());
    }

    #[test]
    fn test_random_picks_a_candidate() {
        let candidates = vec![candidate("127.0.0.1:1", 1.0), candidate("127.0.0.1:2", 2.0)];
        let picked = PeerSelector::Random.select(&candidates).unwrap();
        assert!(picked.is_some());
    }

    #[test]
    fn test_proportional_random_falls_back_on_infinite_ratio() {
        let candidates = vec![candidate("127.0.0.1:1", f64::INFINITY)];
        let picked = PeerSelector::ProportionalRandom.select(&candidates).unwrap();
        assert!(picked.is_some());
    }

    #[test]
    fn test_proportional_random_picks_among_finite_ratios() {
        let candidates = vec![candidate("127.0.0.1:1", 0.1), candidate("127.0.0.1:2", 5.0)];
        let picked = PeerSelector::ProportionalRandom.select(&candidates).unwrap();
        assert!(picked.is_some());
    }

    #[test]
    fn test_auction_stub_is_not_implemented() {
        let candidates = vec![candidate("127.0.0.1:1", 1.0)];
        assert!(PeerSelector::AuctionStub.select(&candidates).is_err());
    }
}
