use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::prelude::*;
use crate::ConnId;

/// receives interest changes from uploads and decides who gets served.
pub trait Choker {
    fn connection_made(&mut self, conn: ConnId);

    fn connection_lost(&mut self, conn: ConnId);

    fn interested(&mut self, conn: ConnId);

    fn not_interested(&mut self, conn: ConnId);

    /// connections in their current round robin order, the first one holds the optimistic
    /// unchoke slot.
    fn connections(&self) -> &[ConnId];
}

/// what the choker needs to know about one connection when rechoking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChokeCandidate {
    pub interested: bool,
    pub choked: bool,
    pub snubbed: bool,
    /// the peer already has everything
    pub is_seed: bool,
    /// rate we download from the peer
    pub download_rate: f64,
    /// rate we upload to the peer
    pub upload_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokeDecision {
    pub conn: ConnId,
    pub unchoke: bool,
}

/// tit-for-tat choker: the `max_uploads - 1` interested peers that give us the best rate get
/// a slot, and the rest of the slots go to whoever comes first in a slowly rotating order.
#[derive(Debug)]
pub struct RoundRobinChoker {
    connections: Vec<ConnId>,
    max_uploads: usize,
    count: u64,
    needs_rechoke: bool,
    rng: StdRng,
}

impl RoundRobinChoker {
    const ROTATE_EVERY: u64 = 3;

    pub fn new(max_uploads: usize) -> Self {
        Self::with_rng(max_uploads, StdRng::from_entropy())
    }

    pub fn with_rng(max_uploads: usize, rng: StdRng) -> Self {
        Self {
            connections: Vec::new(),
            max_uploads,
            count: 0,
            needs_rechoke: false,
            rng,
        }
    }

    pub fn needs_rechoke(&self) -> bool {
        self.needs_rechoke
    }

    /// periodic tick: every third round the connection order rotates so that the first choked
    /// and interested connection becomes the optimistic unchoke.
    pub fn round_robin(
        &mut self,
        candidates: &HashMap<ConnId, ChokeCandidate>,
        seeding: bool,
    ) -> Vec<ChokeDecision> {
        self.count += 1;
        if self.count % Self::ROTATE_EVERY == 0 {
            let first = self.connections.iter().position(|conn| {
                candidates
                    .get(conn)
                    .is_some_and(|c| c.choked && c.interested)
            });
            if let Some(first) = first {
                trace!(optimistic = self.connections[first], "rotating choker order");
                self.connections.rotate_left(first);
            }
        }
        self.rechoke(candidates, seeding)
    }

    pub fn rechoke(
        &mut self,
        candidates: &HashMap<ConnId, ChokeCandidate>,
        seeding: bool,
    ) -> Vec<ChokeDecision> {
        self.needs_rechoke = false;

        let mut preferred: Vec<(f64, usize)> = self
            .connections
            .iter()
            .enumerate()
            .filter_map(|(slot, conn)| {
                let c = candidates.get(conn)?;
                (c.interested && !c.snubbed).then(|| {
                    let rate = if seeding { c.upload_rate } else { c.download_rate };
                    (rate, slot)
                })
            })
            .collect();
        preferred.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

        let prefcount = preferred.len().min(self.max_uploads.saturating_sub(1));
        let mut mask = vec![false; self.connections.len()];
        for &(_, slot) in &preferred[..prefcount] {
            mask[slot] = true;
        }

        let mut optimistic = self.max_uploads.saturating_sub(prefcount).max(1);
        let mut decisions = Vec::with_capacity(self.connections.len());
        for (slot, &conn) in self.connections.iter().enumerate() {
            let Some(c) = candidates.get(&conn) else {
                continue;
            };
            let unchoke = if mask[slot] {
                true
            } else if optimistic > 0 && !c.is_seed {
                if c.interested {
                    optimistic -= 1;
                }
                true
            } else {
                false
            };
            decisions.push(ChokeDecision { conn, unchoke });
        }

        debug!(
            preferred = prefcount,
            unchoked = decisions.iter().filter(|d| d.unchoke).count(),
            "rechoked"
        );
        decisions
    }
}

impl Choker for RoundRobinChoker {
    fn connection_made(&mut self, conn: ConnId) {
        // random slot, with the front weighted three times so newcomers reach the
        // optimistic unchoke sooner
        let len = self.connections.len() as isize;
        let slot = self.rng.gen_range(-2..=len).max(0) as usize;
        self.connections.insert(slot, conn);
    }

    fn connection_lost(&mut self, conn: ConnId) {
        self.connections.retain(|&c| c != conn);
        self.needs_rechoke = true;
    }

    fn interested(&mut self, conn: ConnId) {
        trace!(conn, "peer interested");
        self.needs_rechoke = true;
    }

    fn not_interested(&mut self, conn: ConnId) {
        trace!(conn, "peer not interested");
        self.needs_rechoke = true;
    }

    fn connections(&self) -> &[ConnId] {
        &self.connections
    }
}
