//! One download: the connection table, the piece picker, the upload rate limiter and the
//! choker, all driven from the same event loop.
//!
//! The embedding layer decodes peer messages and calls the matching `got_*` method, reports
//! drained transports through [`Session::connection_flushed`], and calls [`Session::poll`]
//! whenever [`Session::next_wakeup`] comes due.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use thiserror::Error;

use crate::choker::{ChokeCandidate, ChokeDecision, Choker, RoundRobinChoker};
use crate::config::EngineConfig;
use crate::feedback::{
    DownloadView, DownloaderFeedback, PeerSnapshot, Statistics, SwarmSnapshot, TransferRates,
    UploadView,
};
use crate::measure::Measure;
use crate::piece_picker::PiecePicker;
use crate::prelude::*;
use crate::rate_limiter::{Deadline, RateLimiter, SendQueue};
use crate::storage::{PieceStore, StorageError};
use crate::torrent::{Bitfield, PeerId};
use crate::transport::{SendError, Transport};
use crate::upload::{BlockRequest, Connection, RequestOutcome, UploadTotals};
use crate::{ConnId, PieceIndex};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnId),

    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnId),

    #[error("piece {index} out of range, torrent has {numpieces} pieces")]
    PieceOutOfRange { index: PieceIndex, numpieces: usize },

    #[error("bitfield has {got} bits, expected {expected}")]
    BitfieldLength { expected: usize, got: usize },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// the connections plus everything they need to pull blocks out of storage. this is what the
/// rate limiter sends through.
#[derive(Debug)]
struct ConnectionTable<S, T: Transport> {
    storage: S,
    connections: HashMap<ConnId, Connection<T>>,
    totals: UploadTotals,
    // time of the limiter call in progress
    now: Instant,
}

impl<S: PieceStore, T: Transport> SendQueue for ConnectionTable<S, T> {
    fn send_partial(&mut self, conn: ConnId, max_bytes: usize) -> Result<usize, SendError> {
        match self.connections.get_mut(&conn) {
            Some(c) => c.send_partial(max_bytes, &self.storage, &mut self.totals, self.now),
            None => Ok(0),
        }
    }

    fn is_flushed(&self, conn: ConnId) -> bool {
        self.connections.get(&conn).map_or(true, Connection::is_flushed)
    }

    fn is_closed(&self, conn: ConnId) -> bool {
        self.connections.get(&conn).map_or(true, Connection::is_closed)
    }
}

fn lookup<T: Transport>(
    connections: &mut HashMap<ConnId, Connection<T>>,
    id: ConnId,
) -> Result<&mut Connection<T>, SessionError> {
    connections
        .get_mut(&id)
        .ok_or(SessionError::UnknownConnection(id))
}

fn peer_snapshot<T: Transport>(conn: &mut Connection<T>, now: Instant) -> PeerSnapshot {
    let upload = UploadView {
        total: conn.upload().total(),
        rate: conn.upload_mut().get_rate(now),
        interested: conn.upload().is_interested(),
        choked: conn.upload().is_choked(),
    };
    let peer_id = conn.peer_id().clone();
    let ip = conn.addr().ip();
    let locally_initiated = conn.locally_initiated();

    let download = conn.download_mut();
    let speed = download.peer_measure.get_rate(now);
    PeerSnapshot {
        peer_id,
        ip,
        locally_initiated,
        upload,
        download: DownloadView {
            total: download.measure.get_total(),
            rate: download.measure.get_rate(now),
            interested: download.interested,
            choked: download.choked,
            snubbed: download.snubbed,
        },
        is_seed: download.is_seed(),
        completed: download.completed(),
        speed,
    }
}

#[derive(Debug)]
pub struct Session<S, T: Transport> {
    config: EngineConfig,
    table: ConnectionTable<S, T>,
    picker: PiecePicker,
    limiter: RateLimiter,
    deadline: Deadline,
    choker: RoundRobinChoker,
    feedback: DownloaderFeedback,
    total_down: Measure,
    discarded: u64,
    next_rechoke: Instant,
}

impl<S: PieceStore, T: Transport> Session<S, T> {
    pub fn new(config: EngineConfig, storage: S, now: Instant) -> Self {
        let numpieces = storage.get_have_list().len();
        let picker = PiecePicker::new(numpieces, config.rarest_first_cutoff);
        Self::with_picker(config, storage, picker, now)
    }

    /// like [`Session::new`] with a caller supplied picker, e.g. one with a seeded rng. the
    /// picker must be fresh and sized for `storage`.
    pub fn with_picker(config: EngineConfig, storage: S, mut picker: PiecePicker, now: Instant) -> Self {
        let have = storage.get_have_list();
        debug_assert_eq!(have.len(), picker.numpieces());
        for piece in have.iter_ones() {
            picker.complete(piece);
        }

        let mut limiter = RateLimiter::new(now);
        limiter.set_parameters(config.max_upload_rate, config.upload_unit_size, now);
        info!(
            numpieces = picker.numpieces(),
            have = picker.numgot(),
            max_upload_rate = config.max_upload_rate,
            "session started"
        );

        Self {
            table: ConnectionTable {
                storage,
                connections: HashMap::new(),
                totals: UploadTotals::new(&config, now),
                now,
            },
            picker,
            limiter,
            deadline: Deadline::default(),
            choker: RoundRobinChoker::new(config.max_uploads),
            feedback: DownloaderFeedback::new(),
            total_down: Measure::new(config.max_rate_period, now),
            discarded: 0,
            next_rechoke: now + config.round_robin_interval(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn picker(&self) -> &PiecePicker {
        &self.picker
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn storage(&self) -> &S {
        &self.table.storage
    }

    pub fn connection(&self, id: ConnId) -> Option<&Connection<T>> {
        self.table.connections.get(&id)
    }

    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut Connection<T>> {
        self.table.connections.get_mut(&id)
    }

    pub fn connection_ids(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.table.connections.keys().copied()
    }

    pub fn is_complete(&self) -> bool {
        self.picker.am_i_complete()
    }

    /// bytes thrown away because they failed the hash check.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// when `poll` next has work to do.
    pub fn next_wakeup(&self) -> Instant {
        self.deadline
            .at()
            .map_or(self.next_rechoke, |at| at.min(self.next_rechoke))
    }

    /// changes the global upload cap, 0 lifts it.
    pub fn set_upload_rate(&mut self, rate: u64, now: Instant) {
        self.config.max_upload_rate = rate;
        self.limiter
            .set_parameters(rate, self.config.upload_unit_size, now);
    }

    #[instrument(level = "debug", skip(self, peer_id, transport, now))]
    pub fn connection_made(
        &mut self,
        id: ConnId,
        peer_id: PeerId,
        addr: SocketAddr,
        locally_initiated: bool,
        transport: T,
        now: Instant,
    ) -> Result<(), SessionError> {
        if self.table.connections.contains_key(&id) {
            return Err(SessionError::DuplicateConnection(id));
        }
        let conn = Connection::new(
            id,
            peer_id,
            addr,
            locally_initiated,
            transport,
            &self.table.storage,
            &self.config,
            now,
        );
        self.table.connections.insert(id, conn);
        self.choker.connection_made(id);
        debug!(peer = %self.table.connections[&id].peer_id(), "connection made");
        Ok(())
    }

    /// forgets a connection: its pieces stop counting towards availability and it leaves the
    /// choker and the rate limiter.
    #[instrument(level = "debug", skip(self))]
    pub fn connection_lost(&mut self, id: ConnId) -> Result<(), SessionError> {
        let mut conn = self
            .table
            .connections
            .remove(&id)
            .ok_or(SessionError::UnknownConnection(id))?;
        conn.close();

        for piece in conn.download().have.iter_ones() {
            self.picker.lost_have(piece);
        }
        self.choker.connection_lost(id);
        self.limiter.clean_closed(&self.table);
        debug!(remaining = self.table.connections.len(), "connection lost");
        Ok(())
    }

    fn check_piece(&self, index: PieceIndex) -> Result<(), SessionError> {
        let numpieces = self.picker.numpieces();
        if index >= numpieces {
            return Err(SessionError::PieceOutOfRange { index, numpieces });
        }
        Ok(())
    }

    /// merges a peer's bitfield into what we know it has.
    pub fn got_bitfield(&mut self, id: ConnId, bitfield: &Bitfield) -> Result<(), SessionError> {
        let expected = self.picker.numpieces();
        if bitfield.len() != expected {
            return Err(SessionError::BitfieldLength {
                expected,
                got: bitfield.len(),
            });
        }

        let conn = lookup(&mut self.table.connections, id)?;
        let download = conn.download_mut();
        for piece in bitfield.iter_ones() {
            if !download.have[piece] {
                download.have.set(piece, true);
                self.picker.got_have(piece);
            }
        }
        trace!(conn = id, pieces = bitfield.count_ones(), "got bitfield");
        Ok(())
    }

    pub fn got_have(&mut self, id: ConnId, piece: PieceIndex, now: Instant) -> Result<(), SessionError> {
        self.check_piece(piece)?;
        let piece_size = self.table.storage.piece_size(piece) as u64;
        let conn = lookup(&mut self.table.connections, id)?;
        let download = conn.download_mut();
        if download.have[piece] {
            return Ok(());
        }
        download.have.set(piece, true);
        download.peer_measure.update_rate(now, piece_size);
        self.picker.got_have(piece);
        Ok(())
    }

    pub fn got_interested(&mut self, id: ConnId) -> Result<(), SessionError> {
        lookup(&mut self.table.connections, id)?.got_interested(&mut self.choker);
        Ok(())
    }

    pub fn got_not_interested(&mut self, id: ConnId) -> Result<(), SessionError> {
        lookup(&mut self.table.connections, id)?.got_not_interested(&mut self.choker);
        Ok(())
    }

    /// the peer choked or unchoked us.
    pub fn got_choke(&mut self, id: ConnId, choked: bool) -> Result<(), SessionError> {
        lookup(&mut self.table.connections, id)?.download_mut().choked = choked;
        Ok(())
    }

    #[instrument(level = "trace", skip(self, now))]
    pub fn got_request(
        &mut self,
        id: ConnId,
        request: BlockRequest,
        now: Instant,
    ) -> Result<RequestOutcome, SessionError> {
        let outcome = lookup(&mut self.table.connections, id)?.got_request(request);
        if outcome == (RequestOutcome::Buffered { flushed: true }) {
            self.queue_upload(id, now);
        }
        Ok(outcome)
    }

    pub fn got_cancel(&mut self, id: ConnId, request: BlockRequest) -> Result<bool, SessionError> {
        Ok(lookup(&mut self.table.connections, id)?.got_cancel(request))
    }

    /// the transport of `id` drained. a connection that still has requests to serve goes back
    /// on the rate limiter.
    pub fn connection_flushed(&mut self, id: ConnId, now: Instant) -> Result<(), SessionError> {
        if lookup(&mut self.table.connections, id)?.wants_to_send() {
            self.queue_upload(id, now);
        }
        Ok(())
    }

    pub fn choke(&mut self, id: ConnId) -> Result<(), SessionError> {
        lookup(&mut self.table.connections, id)?.choke();
        Ok(())
    }

    pub fn unchoke(&mut self, id: ConnId, now: Instant) -> Result<(), SessionError> {
        lookup(&mut self.table.connections, id)?.unchoke(now);
        Ok(())
    }

    fn queue_upload(&mut self, id: ConnId, now: Instant) {
        if self.limiter.is_queued(id) {
            return;
        }
        self.table.now = now;
        self.deadline.set_now(now);
        self.limiter
            .queue(id, now, &mut self.table, &mut self.deadline);
    }

    // a send error drops a connection from the ring even though it still has work, and
    // nothing else would put it back while its transport stays flushed
    fn requeue_stalled(&mut self, now: Instant) {
        let mut stalled: Vec<ConnId> = self
            .table
            .connections
            .iter()
            .filter(|&(&id, conn)| {
                conn.wants_to_send() && conn.is_flushed() && !self.limiter.is_queued(id)
            })
            .map(|(&id, _)| id)
            .collect();
        stalled.sort_unstable();
        for id in stalled {
            debug!(conn = id, "retrying upload after a failed send");
            self.queue_upload(id, now);
        }
    }

    /// next piece to ask `id` for, marked as requested. `seed` tells the picker whether the
    /// request goes to a peer that has everything.
    pub fn pick_piece(&mut self, id: ConnId, seed: bool) -> Result<Option<PieceIndex>, SessionError> {
        let conn = self
            .table
            .connections
            .get(&id)
            .ok_or(SessionError::UnknownConnection(id))?;
        let have = &conn.download().have;
        let piece = self.picker.next(|piece| have[piece], seed);
        if let Some(piece) = piece {
            self.picker.requested(piece, seed);
            self.table.storage.piece_started(piece);
            trace!(conn = id, piece, seed, "picked piece");
        }
        Ok(piece)
    }

    /// a whole piece arrived from `id`. on a hash match the piece is ours and every peer gets a
    /// HAVE, otherwise the piece goes to the back of its rarity bucket and the bytes
    /// count as discarded. returns whether the piece checked out.
    #[instrument(level = "debug", skip(self, data, now), fields(len = data.len()))]
    pub fn piece_received(
        &mut self,
        id: ConnId,
        piece: PieceIndex,
        data: Vec<u8>,
        now: Instant,
    ) -> Result<bool, SessionError> {
        self.check_piece(piece)?;
        let len = data.len() as u64;
        lookup(&mut self.table.connections, id)?
            .download_mut()
            .measure
            .update_rate(now, len);
        self.total_down.update_rate(now, len);

        if !self.table.storage.write_piece(piece, data)? {
            warn!(piece, "discarding piece that failed the hash check");
            self.picker.bump(piece);
            self.discarded += len;
            return Ok(false);
        }

        self.picker.complete(piece);
        for conn in self.table.connections.values_mut() {
            conn.send_have(piece);
        }
        debug!(piece, numgot = self.picker.numgot(), "piece complete");
        if self.picker.am_i_complete() {
            info!("download complete");
        }
        Ok(true)
    }

    fn choke_candidates(&mut self, now: Instant) -> HashMap<ConnId, ChokeCandidate> {
        self.table
            .connections
            .iter_mut()
            .map(|(&id, conn)| (id, conn.choke_candidate(now)))
            .collect()
    }

    fn apply_choking(&mut self, decisions: Vec<ChokeDecision>, now: Instant) {
        for ChokeDecision { conn, unchoke } in decisions {
            let Some(c) = self.table.connections.get_mut(&conn) else {
                continue;
            };
            if unchoke {
                c.unchoke(now);
            } else {
                c.choke();
            }
        }
    }

    /// runs whatever came due: a rate limiter wakeup, the periodic round robin, or a rechoke
    /// asked for by an interest change.
    pub fn poll(&mut self, now: Instant) {
        if self.deadline.take_due(now) {
            self.table.now = now;
            self.deadline.set_now(now);
            self.limiter
                .try_send(now, false, &mut self.table, &mut self.deadline);
        }
        self.requeue_stalled(now);

        let seeding = self.picker.am_i_complete();
        if now >= self.next_rechoke {
            self.next_rechoke = now + self.config.round_robin_interval();
            let candidates = self.choke_candidates(now);
            let decisions = self.choker.round_robin(&candidates, seeding);
            self.apply_choking(decisions, now);
        } else if self.choker.needs_rechoke() {
            let candidates = self.choke_candidates(now);
            let decisions = self.choker.rechoke(&candidates, seeding);
            self.apply_choking(decisions, now);
        }
    }

    pub fn statistics(&mut self, now: Instant, spew: bool, files: bool) -> Statistics {
        let peers: HashMap<ConnId, PeerSnapshot> = self
            .table
            .connections
            .iter_mut()
            .map(|(&id, conn)| (id, peer_snapshot(conn, now)))
            .collect();

        let totals = &mut self.table.totals;
        let rates = TransferRates {
            up_rate: totals.total_up.get_rate(now),
            up_rate2: totals.total_up2.get_rate(now),
            up_total: totals.total_up.get_total(),
            down_rate: self.total_down.get_rate(now),
            down_total: self.total_down.get_total(),
        };

        let snapshot = SwarmSnapshot {
            picker: &self.picker,
            storage: &self.table.storage,
            choker: &self.choker,
            peers: &peers,
            rates,
            discarded: self.discarded,
            finished: self.picker.am_i_complete(),
        };
        self.feedback.get_statistics(&snapshot, spew, files)
    }
}
