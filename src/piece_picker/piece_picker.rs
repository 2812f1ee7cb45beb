use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::prelude::*;
use crate::torrent::{empty_bitfield, Bitfield};
use crate::PieceIndex;

use super::{InterestBucket, PieceFreq};

/// keeps per piece availability across the swarm and answers which piece to request next from
/// a given peer.
///
/// Pieces we do not have live in exactly one interest bucket, keyed by how many peers have
/// them. Every move between buckets is O(1): the piece leaves its bucket by swapping with the
/// last entry and lands at a uniformly random slot of the destination bucket, so that peers
/// running the same rarest-first policy do not all converge on the same piece.
#[derive(Debug)]
pub struct PiecePicker {
    numpieces: usize,
    have: Bitfield,
    // lookup from PieceIndex -> number of peers having it
    num_interests: Vec<PieceFreq>,
    // interests[i] holds every piece we lack that exactly i peers have
    interests: Vec<InterestBucket>,
    // lookup from PieceIndex -> slot in its interest bucket
    pos_in_interests: Vec<usize>,
    // crosscount[i] is the number of pieces with i copies, counting our own copy
    crosscount: Vec<usize>,
    started: Vec<PieceIndex>,
    seedstarted: Vec<PieceIndex>,
    numgot: usize,
    // fixed random order used while we own fewer than `rarest_first_cutoff` pieces
    scrambled: Vec<PieceIndex>,
    rarest_first_cutoff: usize,
    rng: StdRng,
}

impl PiecePicker {
    pub fn new(numpieces: usize, rarest_first_cutoff: usize) -> Self {
        Self::with_rng(numpieces, rarest_first_cutoff, StdRng::from_entropy())
    }

    pub fn with_rng(numpieces: usize, rarest_first_cutoff: usize, mut rng: StdRng) -> Self {
        let mut scrambled: Vec<PieceIndex> = (0..numpieces).collect();
        scrambled.shuffle(&mut rng);

        Self {
            numpieces,
            have: empty_bitfield(numpieces),
            num_interests: vec![0; numpieces],
            interests: vec![(0..numpieces).collect()],
            pos_in_interests: (0..numpieces).collect(),
            crosscount: vec![numpieces],
            started: Vec::new(),
            seedstarted: Vec::new(),
            numgot: 0,
            scrambled,
            rarest_first_cutoff,
            rng,
        }
    }

    /// a peer announced `piece`.
    pub fn got_have(&mut self, piece: PieceIndex) {
        let numint = self.num_interests[piece];
        let own = usize::from(self.have[piece]);

        self.crosscount[numint + own] -= 1;
        self.num_interests[piece] += 1;
        match self.crosscount.get_mut(numint + 1 + own) {
            Some(count) => *count += 1,
            None => self.crosscount.push(1),
        }

        if self.have[piece] {
            return;
        }

        if numint == self.interests.len() - 1 {
            trace!(level = numint + 1, "opening new interest bucket");
            self.interests.push(InterestBucket::new());
        }
        self.shift_over(piece, numint, numint + 1);
    }

    /// a peer that had `piece` went away.
    pub fn lost_have(&mut self, piece: PieceIndex) {
        let numint = self.num_interests[piece];
        assert!(numint > 0, "lost_have for piece {piece} that no peer has");
        let own = usize::from(self.have[piece]);

        self.crosscount[numint + own] -= 1;
        self.crosscount[numint - 1 + own] += 1;
        self.num_interests[piece] -= 1;

        if self.have[piece] {
            return;
        }
        self.shift_over(piece, numint, numint - 1);
    }

    fn shift_over(&mut self, piece: PieceIndex, from: PieceFreq, to: PieceFreq) {
        self.remove_from_bucket(piece, from);

        let dest = &mut self.interests[to];
        let len = dest.len();
        let slot = self.rng.gen_range(0..=len);
        if slot == len {
            dest.push(piece);
            self.pos_in_interests[piece] = len;
        } else {
            let displaced = dest[slot];
            dest.push(displaced);
            dest[slot] = piece;
            self.pos_in_interests[displaced] = len;
            self.pos_in_interests[piece] = slot;
        }
    }

    fn remove_from_bucket(&mut self, piece: PieceIndex, level: PieceFreq) {
        let pos = self.pos_in_interests[piece];
        let bucket = &mut self.interests[level];
        debug_assert_eq!(bucket[pos], piece, "interest bucket out of sync with positions");

        bucket.swap_remove(pos);
        if let Some(&moved) = bucket.get(pos) {
            self.pos_in_interests[moved] = pos;
        }
    }

    /// `piece` is being requested from at least one peer.
    pub fn requested(&mut self, piece: PieceIndex, seed: bool) {
        if !self.started.contains(&piece) {
            self.started.push(piece);
        }
        if seed && !self.seedstarted.contains(&piece) {
            self.seedstarted.push(piece);
        }
    }

    /// `piece` has been verified and stored.
    ///
    /// # Panics
    ///
    /// panics if the piece was already complete.
    pub fn complete(&mut self, piece: PieceIndex) {
        assert!(!self.have[piece], "piece {piece} completed twice");

        let numint = self.num_interests[piece];
        self.have.set(piece, true);
        self.crosscount[numint] -= 1;
        match self.crosscount.get_mut(numint + 1) {
            Some(count) => *count += 1,
            None => self.crosscount.push(1),
        }
        self.numgot += 1;

        self.remove_from_bucket(piece, numint);
        self.forget_started(piece);
        debug!(piece, numgot = self.numgot, "piece complete");
    }

    /// picks the next piece to request from a peer, `havefunc` tells whether that peer has a
    /// piece. in order of preference: a started piece (rarest first, ties broken at random), a
    /// piece in scrambled order while we have fewer than `rarest_first_cutoff` pieces, the
    /// rarest piece overall.
    pub fn next(&mut self, havefunc: impl Fn(PieceIndex) -> bool, seed: bool) -> Option<PieceIndex> {
        let started = if seed { &self.seedstarted } else { &self.started };

        let mut bests = Vec::new();
        let mut bestnum = PieceFreq::MAX;
        for &piece in started {
            if self.have[piece] || !havefunc(piece) {
                continue;
            }
            let numint = self.num_interests[piece];
            if numint < bestnum {
                bests.clear();
                bestnum = numint;
                bests.push(piece);
            } else if numint == bestnum {
                bests.push(piece);
            }
        }

        if let Some(&piece) = bests.choose(&mut self.rng) {
            trace!(piece, interest = bestnum, "continuing started piece");
            return Some(piece);
        }

        if self.numgot < self.rarest_first_cutoff {
            return self
                .scrambled
                .iter()
                .copied()
                .find(|&piece| !self.have[piece] && havefunc(piece));
        }

        // bucket 0 only holds pieces nobody has
        self.interests
            .iter()
            .skip(1)
            .find_map(|bucket| bucket.iter().copied().find(|&piece| havefunc(piece)))
    }

    pub fn am_i_complete(&self) -> bool {
        self.numgot == self.numpieces
    }

    /// sends `piece` to the back of its bucket and forgets that it was started, e.g. after it
    /// failed the hash check.
    pub fn bump(&mut self, piece: PieceIndex) {
        if !self.have[piece] {
            let bucket = &mut self.interests[self.num_interests[piece]];
            let pos = self.pos_in_interests[piece];
            bucket.remove(pos);
            bucket.push(piece);
            for (slot, &moved) in bucket.iter().enumerate().skip(pos) {
                self.pos_in_interests[moved] = slot;
            }
        }
        self.forget_started(piece);
    }

    fn forget_started(&mut self, piece: PieceIndex) {
        self.started.retain(|&p| p != piece);
        self.seedstarted.retain(|&p| p != piece);
    }

    pub fn numpieces(&self) -> usize {
        self.numpieces
    }

    pub fn numgot(&self) -> usize {
        self.numgot
    }

    pub fn has(&self, piece: PieceIndex) -> bool {
        self.have[piece]
    }

    pub fn num_interests(&self, piece: PieceIndex) -> PieceFreq {
        self.num_interests[piece]
    }

    pub fn crosscount(&self) -> &[usize] {
        &self.crosscount
    }

    pub fn is_started(&self, piece: PieceIndex) -> bool {
        self.started.contains(&piece)
    }

    pub fn is_seed_started(&self, piece: PieceIndex) -> bool {
        self.seedstarted.contains(&piece)
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let missing = self.have.count_zeros();
        let bucketed: usize = self.interests.iter().map(Vec::len).sum();
        assert_eq!(bucketed, missing);
        assert_eq!(self.crosscount.iter().sum::<usize>(), self.numpieces);

        for piece in 0..self.numpieces {
            if self.have[piece] {
                assert!(self.interests.iter().all(|bucket| !bucket.contains(&piece)));
                continue;
            }
            let bucket = &self.interests[self.num_interests[piece]];
            assert_eq!(bucket[self.pos_in_interests[piece]], piece);
        }

        for (level, &count) in self.crosscount.iter().enumerate() {
            let expected = (0..self.numpieces)
                .filter(|&p| self.num_interests[p] + usize::from(self.have[p]) == level)
                .count();
            assert_eq!(count, expected, "crosscount[{level}]");
        }
    }
}
