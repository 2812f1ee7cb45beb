use std::net::SocketAddr;
use std::time::Instant;

use crate::choker::{ChokeCandidate, Choker};
use crate::config::EngineConfig;
use crate::measure::Measure;
use crate::prelude::*;
use crate::storage::Storage;
use crate::torrent::{empty_bitfield, Bitfield, PeerId};
use crate::transport::{SendError, Transport};
use crate::{ConnId, PieceIndex};

use super::{BlockRequest, PeerLink, RequestOutcome, Upload, UploadTotals};

mod frame {
    use crate::torrent::Bitfield;

    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const PIECE: u8 = 7;

    fn header(out: &mut Vec<u8>, payload_len: usize, id: u8) {
        out.extend_from_slice(&(payload_len as u32 + 1).to_be_bytes());
        out.push(id);
    }

    pub fn control(id: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(5);
        header(&mut out, 0, id);
        out
    }

    pub fn have(index: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(9);
        header(&mut out, 4, HAVE);
        out.extend_from_slice(&index.to_be_bytes());
        out
    }

    pub fn bitfield(bits: &Bitfield) -> Vec<u8> {
        let mut packed = vec![0u8; bits.len().div_ceil(8)];
        for index in bits.iter_ones() {
            packed[index / 8] |= 0x80 >> (index % 8);
        }
        let mut out = Vec::with_capacity(5 + packed.len());
        header(&mut out, packed.len(), BITFIELD);
        out.extend_from_slice(&packed);
        out
    }

    pub fn piece(index: u32, begin: u32, block: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(13 + block.len());
        header(&mut out, 8 + block.len(), PIECE);
        out.extend_from_slice(&index.to_be_bytes());
        out.extend_from_slice(&begin.to_be_bytes());
        out.extend_from_slice(block);
        out
    }
}

/// outbound side of a connection. a PIECE message may leave in several rate limited slices, and
/// control messages that come up meanwhile wait in `outqueue` until the piece is done, so
/// nothing ever gets spliced into the middle of a frame.
#[derive(Debug)]
pub struct Wire<T: Transport> {
    transport: T,
    // framed PIECE message and how much of it already went out
    partial: Option<(Vec<u8>, usize)>,
    outqueue: Vec<u8>,
}

impl<T: Transport> Wire<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            partial: None,
            outqueue: Vec::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    fn send_control(&mut self, bytes: Vec<u8>) {
        self.outqueue.extend_from_slice(&bytes);
        if self.partial.is_some() {
            return;
        }
        if let Err(err) = self.flush_queued() {
            debug!(%err, "failed to write control message, keeping it queued");
        }
    }

    /// writes the queued control messages in one go. on error they stay queued.
    fn flush_queued(&mut self) -> Result<usize, SendError> {
        if self.outqueue.is_empty() {
            return Ok(0);
        }
        self.transport.write(&self.outqueue)?;
        let written = self.outqueue.len();
        self.outqueue.clear();
        Ok(written)
    }

    pub fn send_have(&mut self, index: PieceIndex) {
        self.send_control(frame::have(index as u32));
    }

    pub fn send_bitfield(&mut self, bitfield: &Bitfield) {
        self.send_control(frame::bitfield(bitfield));
    }

    fn has_partial(&self) -> bool {
        self.partial.is_some()
    }

    fn has_queued(&self) -> bool {
        !self.outqueue.is_empty()
    }

    fn start_piece(&mut self, request: BlockRequest, block: &[u8]) {
        self.partial = Some((frame::piece(request.index as u32, request.begin, block), 0));
    }

    /// writes at most `max_bytes` of the pending piece. when the piece completes, queued
    /// control messages ride along and count towards the returned total. once the tail is
    /// out the call succeeds, even if the queued messages have to wait for another try.
    fn write_partial(&mut self, max_bytes: usize) -> Result<usize, SendError> {
        let Some((message, sent)) = self.partial.as_mut() else {
            return Ok(0);
        };

        let remaining = message.len() - *sent;
        if max_bytes < remaining {
            self.transport.write(&message[*sent..*sent + max_bytes])?;
            *sent += max_bytes;
            return Ok(max_bytes);
        }

        self.transport.write(&message[*sent..])?;
        self.partial = None;

        match self.flush_queued() {
            Ok(queued) => Ok(remaining + queued),
            Err(err) => {
                debug!(%err, "piece sent, control messages stay queued");
                Ok(remaining)
            }
        }
    }
}

impl<T: Transport> PeerLink for Wire<T> {
    fn send_choke(&mut self) {
        self.send_control(frame::control(frame::CHOKE));
    }

    fn send_unchoke(&mut self) {
        self.send_control(frame::control(frame::UNCHOKE));
    }

    fn close(&mut self) {
        self.transport.close();
    }

    fn is_flushed(&self) -> bool {
        self.transport.is_flushed()
    }
}

/// what we know about the download side of a connection: the pieces the peer announced and
/// how fast it feeds us.
#[derive(Debug)]
pub struct PeerDownload {
    pub have: Bitfield,
    pub measure: Measure,
    /// rate at which the peer downloads from the whole swarm, estimated from its HAVEs
    pub peer_measure: Measure,
    pub interested: bool,
    pub choked: bool,
    pub snubbed: bool,
}

impl PeerDownload {
    pub fn new(numpieces: usize, config: &EngineConfig, now: Instant) -> Self {
        Self {
            have: empty_bitfield(numpieces),
            measure: Measure::new(config.max_rate_period, now),
            peer_measure: Measure::new(config.max_rate_period, now),
            interested: false,
            choked: true,
            snubbed: false,
        }
    }

    pub fn is_seed(&self) -> bool {
        self.have.count_zeros() == 0
    }

    pub fn completed(&self) -> f64 {
        if self.have.is_empty() {
            return 1.0;
        }
        self.have.count_ones() as f64 / self.have.len() as f64
    }
}

/// one peer connection: upload state machine, outbound framing and the download record.
#[derive(Debug)]
pub struct Connection<T: Transport> {
    id: ConnId,
    peer_id: PeerId,
    addr: SocketAddr,
    locally_initiated: bool,
    upload: Upload,
    wire: Wire<T>,
    download: PeerDownload,
}

impl<T: Transport> Connection<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ConnId,
        peer_id: PeerId,
        addr: SocketAddr,
        locally_initiated: bool,
        transport: T,
        storage: &dyn Storage,
        config: &EngineConfig,
        now: Instant,
    ) -> Self {
        let mut wire = Wire::new(transport);
        if storage.do_i_have_anything() {
            wire.send_bitfield(&storage.get_have_list());
        }
        let numpieces = storage.get_have_list().len();

        Self {
            id,
            peer_id,
            addr,
            locally_initiated,
            upload: Upload::new(config, now),
            wire,
            download: PeerDownload::new(numpieces, config, now),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn locally_initiated(&self) -> bool {
        self.locally_initiated
    }

    pub fn upload(&self) -> &Upload {
        &self.upload
    }

    pub fn upload_mut(&mut self) -> &mut Upload {
        &mut self.upload
    }

    pub fn download(&self) -> &PeerDownload {
        &self.download
    }

    pub fn download_mut(&mut self) -> &mut PeerDownload {
        &mut self.download
    }

    pub fn wire(&self) -> &Wire<T> {
        &self.wire
    }

    pub fn wire_mut(&mut self) -> &mut Wire<T> {
        &mut self.wire
    }

    pub fn is_flushed(&self) -> bool {
        self.wire.is_flushed()
    }

    pub fn is_closed(&self) -> bool {
        self.wire.is_closed()
    }

    pub fn close(&mut self) {
        self.wire.close();
    }

    pub fn got_interested(&mut self, choker: &mut dyn Choker) {
        self.upload.got_interested(self.id, choker);
    }

    pub fn got_not_interested(&mut self, choker: &mut dyn Choker) {
        self.upload.got_not_interested(self.id, choker);
    }

    pub fn got_request(&mut self, request: BlockRequest) -> RequestOutcome {
        self.upload.got_request(request, &mut self.wire)
    }

    pub fn got_cancel(&mut self, request: BlockRequest) -> bool {
        self.upload.got_cancel(request)
    }

    pub fn choke(&mut self) {
        self.upload.choke(&mut self.wire);
    }

    pub fn unchoke(&mut self, now: Instant) {
        self.upload.unchoke(now, &mut self.wire);
    }

    pub fn send_have(&mut self, index: PieceIndex) {
        self.wire.send_have(index);
    }

    /// whether the connection has upload work and should sit in the rate limiter ring.
    pub fn wants_to_send(&self) -> bool {
        !self.is_closed()
            && (self.wire.has_partial() || self.wire.has_queued() || self.upload.has_queries())
    }

    /// sends up to `max_bytes`, pulling the next block from storage when no piece message is
    /// in flight. returns the number of bytes handed to the transport.
    pub fn send_partial(
        &mut self,
        max_bytes: usize,
        storage: &dyn Storage,
        totals: &mut UploadTotals,
        now: Instant,
    ) -> Result<usize, SendError> {
        if self.is_closed() {
            return Ok(0);
        }
        if !self.wire.has_partial() {
            // leftovers from a failed flush go before the next piece
            let queued = self.wire.flush_queued()?;
            if queued > 0 {
                return Ok(queued);
            }
            let Some((request, block)) =
                self.upload
                    .get_upload_chunk(storage, totals, now, &mut self.wire)
            else {
                return Ok(0);
            };
            trace!(conn = self.id, ?request, "framing block");
            self.wire.start_piece(request, &block);
        }
        self.wire.write_partial(max_bytes)
    }

    pub fn choke_candidate(&mut self, now: Instant) -> ChokeCandidate {
        ChokeCandidate {
            interested: self.upload.is_interested(),
            choked: self.upload.is_choked(),
            snubbed: self.download.snubbed,
            is_seed: self.download.is_seed(),
            download_rate: self.download.measure.get_rate(now),
            upload_rate: self.upload.get_rate(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::choker::RoundRobinChoker;
    use crate::sim::SimTransport;
    use crate::storage::MemoryStorage;

    fn connection(storage: &MemoryStorage, now: Instant) -> Connection<SimTransport> {
        let addr = "127.0.0.1:6881".parse().unwrap();
        Connection::new(
            1,
            PeerId::random(),
            addr,
            true,
            SimTransport::unbounded(),
            storage,
            &EngineConfig::default(),
            now,
        )
    }

    fn serving(storage: &MemoryStorage, now: Instant) -> Connection<SimTransport> {
        let mut conn = connection(storage, now);
        conn.got_interested(&mut RoundRobinChoker::new(4));
        conn.unchoke(now);
        conn.wire_mut().transport_mut().take_written();
        conn
    }

    #[test]
    fn bitfield_is_sent_when_we_have_pieces() {
        let now = Instant::now();
        let storage = MemoryStorage::seeded(4, &[1u8; 10]);
        let conn = connection(&storage, now);
        assert_eq!(conn.wire().transport().written(), &[0, 0, 0, 2, 5, 0b1110_0000]);

        let empty = MemoryStorage::new(4, vec![[0; 20]; 3], 10);
        let conn = connection(&empty, now);
        assert!(conn.wire().transport().written().is_empty());
    }

    #[test]
    fn piece_goes_out_in_slices_with_header() {
        let now = Instant::now();
        let data: Vec<u8> = (0..64u8).collect();
        let storage = MemoryStorage::seeded(32, &data);
        let mut totals = UploadTotals::new(&EngineConfig::default(), now);
        let mut conn = serving(&storage, now);

        conn.got_request(BlockRequest::new(1, 4, 8));
        assert!(conn.wants_to_send());

        assert_eq!(conn.send_partial(10, &storage, &mut totals, now).unwrap(), 10);
        assert_eq!(conn.send_partial(10, &storage, &mut totals, now).unwrap(), 10);
        assert_eq!(conn.send_partial(10, &storage, &mut totals, now).unwrap(), 1);
        assert!(!conn.wants_to_send());
        assert_eq!(conn.send_partial(10, &storage, &mut totals, now).unwrap(), 0);

        let written = conn.wire_mut().transport_mut().take_written();
        assert_eq!(&written[..5], &[0, 0, 0, 17, 7]);
        assert_eq!(&written[5..13], &[0, 0, 0, 1, 0, 0, 0, 4]);
        assert_eq!(&written[13..], &data[36..44]);
    }

    #[test]
    fn choke_waits_for_the_piece_in_flight() {
        let now = Instant::now();
        let data = vec![9u8; 32];
        let storage = MemoryStorage::seeded(32, &data);
        let mut totals = UploadTotals::new(&EngineConfig::default(), now);
        let mut conn = serving(&storage, now);

        conn.got_request(BlockRequest::new(0, 0, 16));
        conn.got_request(BlockRequest::new(0, 16, 16));
        assert_eq!(conn.send_partial(5, &storage, &mut totals, now).unwrap(), 5);

        conn.choke();
        assert!(!conn.upload().has_queries());
        assert_eq!(conn.wire().transport().written().len(), 5);

        // rest of the piece (29 - 5) plus the deferred choke
        assert_eq!(conn.send_partial(1000, &storage, &mut totals, now).unwrap(), 24 + 5);
        let written = conn.wire_mut().transport_mut().take_written();
        assert_eq!(&written[written.len() - 5..], &[0, 0, 0, 1, 0]);
        assert_eq!(conn.send_partial(1000, &storage, &mut totals, now).unwrap(), 0);
    }

    #[test]
    fn control_frames_survive_a_failed_flush() {
        let now = Instant::now();
        let data = vec![9u8; 32];
        let storage = MemoryStorage::seeded(32, &data);
        let mut totals = UploadTotals::new(&EngineConfig::default(), now);
        let mut conn = serving(&storage, now);

        conn.got_request(BlockRequest::new(0, 0, 16));
        assert_eq!(conn.send_partial(5, &storage, &mut totals, now).unwrap(), 5);
        conn.choke();

        // the tail goes out, the deferred choke does not
        conn.wire_mut().transport_mut().fail_writes_after(1, 1);
        assert_eq!(conn.send_partial(1000, &storage, &mut totals, now).unwrap(), 24);
        assert_eq!(conn.wire().transport().written().len(), 29);
        assert!(conn.wants_to_send());

        assert_eq!(conn.send_partial(1000, &storage, &mut totals, now).unwrap(), 5);
        let written = conn.wire_mut().transport_mut().take_written();
        assert_eq!(&written[29..], &[0, 0, 0, 1, 0]);
        assert!(!conn.wants_to_send());
    }

    #[test]
    fn queued_control_frames_keep_their_order() {
        let now = Instant::now();
        let storage = MemoryStorage::seeded(32, &[1u8; 32]);
        let mut conn = serving(&storage, now);

        conn.wire_mut().transport_mut().fail_next_writes(1);
        conn.send_have(0);
        assert!(conn.wire().transport().written().is_empty());
        conn.choke();

        let written = conn.wire_mut().transport_mut().take_written();
        assert_eq!(written, [0, 0, 0, 5, 4, 0, 0, 0, 0, 0, 0, 0, 1, 0]);
        assert!(!conn.wants_to_send());
    }

    #[test]
    fn closed_connections_send_nothing() {
        let now = Instant::now();
        let storage = MemoryStorage::seeded(32, &[0u8; 32]);
        let mut totals = UploadTotals::new(&EngineConfig::default(), now);
        let mut conn = serving(&storage, now);
        conn.got_request(BlockRequest::new(0, 0, 16));
        conn.close();
        assert!(!conn.wants_to_send());
        assert_eq!(conn.send_partial(100, &storage, &mut totals, now).unwrap(), 0);
    }

    #[test]
    fn peer_download_progress() {
        let now = Instant::now();
        let mut download = PeerDownload::new(4, &EngineConfig::default(), now);
        assert!(!download.is_seed());
        download.have.set(0, true);
        assert_eq!(download.completed(), 0.25);
        download.have.fill(true);
        assert!(download.is_seed());
    }
}
