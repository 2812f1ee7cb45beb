use std::collections::VecDeque;
use std::time::Instant;

use crate::choker::Choker;
use crate::config::EngineConfig;
use crate::measure::Measure;
use crate::prelude::*;
use crate::storage::Storage;
use crate::{BlockLength, ConnId};

use super::BlockRequest;

/// the side of a connection an [`Upload`] talks back through.
pub trait PeerLink {
    fn send_choke(&mut self);

    fn send_unchoke(&mut self);

    fn close(&mut self);

    fn is_flushed(&self) -> bool;
}

/// what became of a block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// queued; `flushed` tells whether the transport is idle, in which case the connection
    /// should be put on the rate limiter if it is not there already.
    Buffered { flushed: bool },
    /// arrived after we choked the peer, dropped silently.
    Ignored,
    /// protocol violation, the connection was closed.
    Closed,
}

/// upload rate totals over the whole session, averaged over two different windows.
#[derive(Debug, Clone)]
pub struct UploadTotals {
    pub total_up: Measure,
    pub total_up2: Measure,
}

impl UploadTotals {
    pub fn new(config: &EngineConfig, now: Instant) -> Self {
        Self {
            total_up: Measure::with_fudge(config.max_rate_period, config.upload_rate_fudge, now),
            total_up2: Measure::new(config.max_rate_period_seedtime, now),
        }
    }

    fn record(&mut self, now: Instant, amount: u64) {
        self.total_up.update_rate(now, amount);
        self.total_up2.update_rate(now, amount);
    }
}

/// per connection upload state: whether we serve the peer, whether it wants anything, and the
/// blocks it asked for in arrival order.
#[derive(Debug)]
pub struct Upload {
    choked: bool,
    interested: bool,
    unchoke_time: Option<Instant>,
    buffer: VecDeque<BlockRequest>,
    measure: Measure,
    max_slice_length: BlockLength,
}

impl Upload {
    pub fn new(config: &EngineConfig, now: Instant) -> Self {
        Self {
            choked: true,
            interested: false,
            unchoke_time: None,
            buffer: VecDeque::new(),
            measure: Measure::with_fudge(config.max_rate_period, config.upload_rate_fudge, now),
            max_slice_length: config.max_slice_length,
        }
    }

    pub fn got_interested(&mut self, conn: ConnId, choker: &mut dyn Choker) {
        if !self.interested {
            self.interested = true;
            choker.interested(conn);
        }
    }

    pub fn got_not_interested(&mut self, conn: ConnId, choker: &mut dyn Choker) {
        if self.interested {
            self.interested = false;
            self.buffer.clear();
            choker.not_interested(conn);
        }
    }

    pub fn got_request(&mut self, request: BlockRequest, link: &mut impl PeerLink) -> RequestOutcome {
        if !self.interested || request.length > self.max_slice_length {
            warn!(
                ?request,
                interested = self.interested,
                "invalid request from peer, closing connection"
            );
            link.close();
            return RequestOutcome::Closed;
        }
        if self.choked {
            trace!(?request, "request arrived while choked, ignoring");
            return RequestOutcome::Ignored;
        }

        self.buffer.push_back(request);
        RequestOutcome::Buffered {
            flushed: link.is_flushed(),
        }
    }

    /// drops a queued request, returns whether it was still pending.
    pub fn got_cancel(&mut self, request: BlockRequest) -> bool {
        match self.buffer.iter().position(|r| *r == request) {
            Some(pos) => {
                self.buffer.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn choke(&mut self, link: &mut impl PeerLink) {
        if !self.choked {
            self.choked = true;
            self.buffer.clear();
            link.send_choke();
        }
    }

    pub fn unchoke(&mut self, time: Instant, link: &mut impl PeerLink) {
        if self.choked {
            self.choked = false;
            self.unchoke_time = Some(time);
            link.send_unchoke();
        }
    }

    /// pops the oldest request and reads it from storage. a request storage cannot satisfy is
    /// treated as a protocol violation and closes the connection.
    pub fn get_upload_chunk(
        &mut self,
        storage: &dyn Storage,
        totals: &mut UploadTotals,
        now: Instant,
        link: &mut impl PeerLink,
    ) -> Option<(BlockRequest, Vec<u8>)> {
        let request = self.buffer.pop_front()?;
        let Some(block) = storage.get_piece(request.index, request.begin, request.length) else {
            warn!(?request, "peer requested a block we cannot serve, closing connection");
            link.close();
            return None;
        };

        let amount = block.len() as u64;
        self.measure.update_rate(now, amount);
        totals.record(now, amount);
        Some((request, block))
    }

    pub fn has_queries(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn get_rate(&mut self, now: Instant) -> f64 {
        self.measure.get_rate(now)
    }

    pub fn total(&self) -> u64 {
        self.measure.get_total()
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn is_interested(&self) -> bool {
        self.interested
    }

    pub fn unchoke_time(&self) -> Option<Instant> {
        self.unchoke_time
    }

    pub fn pending(&self) -> impl Iterator<Item = &BlockRequest> {
        self.buffer.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::choker::RoundRobinChoker;
    use crate::storage::MemoryStorage;

    #[derive(Default)]
    struct RecordingLink {
        chokes: usize,
        unchokes: usize,
        closed: bool,
        busy: bool,
    }

    impl PeerLink for RecordingLink {
        fn send_choke(&mut self) {
            self.chokes += 1;
        }

        fn send_unchoke(&mut self) {
            self.unchokes += 1;
        }

        fn close(&mut self) {
            self.closed = true;
        }

        fn is_flushed(&self) -> bool {
            !self.busy
        }
    }

    fn serving_upload(now: Instant) -> (Upload, RecordingLink) {
        let mut upload = Upload::new(&EngineConfig::default(), now);
        let mut link = RecordingLink::default();
        let mut choker = RoundRobinChoker::new(4);
        upload.got_interested(0, &mut choker);
        upload.unchoke(now, &mut link);
        (upload, link)
    }

    #[test]
    fn interest_toggles_notify_choker_once() {
        let now = Instant::now();
        let mut upload = Upload::new(&EngineConfig::default(), now);
        let mut choker = RoundRobinChoker::new(4);

        upload.got_interested(3, &mut choker);
        assert!(choker.needs_rechoke());
        choker.rechoke(&Default::default(), false);
        upload.got_interested(3, &mut choker);
        assert!(!choker.needs_rechoke());
        assert!(upload.is_interested());

        upload.got_not_interested(3, &mut choker);
        assert!(!upload.is_interested());
        assert!(choker.needs_rechoke());
    }

    #[test]
    fn requests_from_uninterested_peers_close_the_connection() {
        let now = Instant::now();
        let mut upload = Upload::new(&EngineConfig::default(), now);
        let mut link = RecordingLink::default();
        let outcome = upload.got_request(BlockRequest::new(0, 0, 16_384), &mut link);
        assert_eq!(outcome, RequestOutcome::Closed);
        assert!(link.closed);
        assert!(!upload.has_queries());
    }

    #[test]
    fn oversized_requests_close_the_connection() {
        let now = Instant::now();
        let (mut upload, mut link) = serving_upload(now);
        let too_long = EngineConfig::default().max_slice_length + 1;
        let outcome = upload.got_request(BlockRequest::new(0, 0, too_long), &mut link);
        assert_eq!(outcome, RequestOutcome::Closed);
        assert!(link.closed);
    }

    #[test]
    fn requests_while_choked_are_ignored() {
        let now = Instant::now();
        let mut upload = Upload::new(&EngineConfig::default(), now);
        let mut link = RecordingLink::default();
        let mut choker = RoundRobinChoker::new(4);
        upload.got_interested(0, &mut choker);

        let outcome = upload.got_request(BlockRequest::new(0, 0, 100), &mut link);
        assert_eq!(outcome, RequestOutcome::Ignored);
        assert!(!link.closed);
        assert!(!upload.has_queries());
    }

    #[test]
    fn buffered_requests_report_transport_state() {
        let now = Instant::now();
        let (mut upload, mut link) = serving_upload(now);
        assert_eq!(
            upload.got_request(BlockRequest::new(0, 0, 100), &mut link),
            RequestOutcome::Buffered { flushed: true }
        );
        link.busy = true;
        assert_eq!(
            upload.got_request(BlockRequest::new(0, 100, 100), &mut link),
            RequestOutcome::Buffered { flushed: false }
        );
        assert_eq!(upload.pending().count(), 2);
    }

    #[test]
    fn cancel_is_idempotent() {
        let now = Instant::now();
        let (mut upload, mut link) = serving_upload(now);
        let request = BlockRequest::new(1, 0, 100);
        upload.got_request(request, &mut link);

        assert!(upload.got_cancel(request));
        assert!(!upload.got_cancel(request));
        assert!(!upload.got_cancel(BlockRequest::new(9, 9, 9)));
        assert!(!upload.has_queries());
    }

    #[test]
    fn choking_twice_sends_one_choke() {
        let now = Instant::now();
        let (mut upload, mut link) = serving_upload(now);
        upload.got_request(BlockRequest::new(0, 0, 10), &mut link);

        upload.choke(&mut link);
        upload.choke(&mut link);
        assert_eq!(link.chokes, 1);
        assert!(upload.is_choked());
        assert!(!upload.has_queries());
    }

    #[test]
    fn unchoke_records_time_once() {
        let now = Instant::now();
        let (mut upload, mut link) = serving_upload(now);
        upload.unchoke(now + std::time::Duration::from_secs(5), &mut link);
        assert_eq!(link.unchokes, 1);
        assert_eq!(upload.unchoke_time(), Some(now));
    }

    #[test]
    fn chunks_come_out_in_request_order_and_update_rates() {
        let now = Instant::now();
        let data: Vec<u8> = (0..4096u32).map(|i| i as u8).collect();
        let storage = MemoryStorage::seeded(2048, &data);
        let mut totals = UploadTotals::new(&EngineConfig::default(), now);
        let (mut upload, mut link) = serving_upload(now);

        upload.got_request(BlockRequest::new(1, 0, 10), &mut link);
        upload.got_request(BlockRequest::new(0, 5, 20), &mut link);

        let (first, block) = upload
            .get_upload_chunk(&storage, &mut totals, now, &mut link)
            .unwrap();
        assert_eq!(first, BlockRequest::new(1, 0, 10));
        assert_eq!(block, data[2048..2058]);

        let (second, block) = upload
            .get_upload_chunk(&storage, &mut totals, now, &mut link)
            .unwrap();
        assert_eq!(second.index, 0);
        assert_eq!(block.len(), 20);

        assert!(upload
            .get_upload_chunk(&storage, &mut totals, now, &mut link)
            .is_none());
        assert!(!link.closed);
        assert_eq!(upload.total(), 30);
        assert_eq!(totals.total_up.get_total(), 30);
        assert_eq!(totals.total_up2.get_total(), 30);
        assert!(upload.get_rate(now) > 0.0);
    }

    #[test]
    fn unavailable_blocks_close_the_connection() {
        let now = Instant::now();
        let storage = MemoryStorage::new(1024, vec![[0; 20]], 1024);
        let mut totals = UploadTotals::new(&EngineConfig::default(), now);
        let (mut upload, mut link) = serving_upload(now);

        upload.got_request(BlockRequest::new(0, 0, 10), &mut link);
        assert!(upload
            .get_upload_chunk(&storage, &mut totals, now, &mut link)
            .is_none());
        assert!(link.closed);
        assert_eq!(totals.total_up.get_total(), 0);
    }
}
