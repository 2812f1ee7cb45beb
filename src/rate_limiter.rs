use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::prelude::*;
use crate::transport::SendError;
use crate::ConnId;

/// the connections a [`RateLimiter`] hands bytes to, addressed by id.
pub trait SendQueue {
    /// sends at most `max_bytes` on `conn`, returns how many bytes went out.
    fn send_partial(&mut self, conn: ConnId, max_bytes: usize) -> Result<usize, SendError>;

    fn is_flushed(&self, conn: ConnId) -> bool;

    /// unknown connections count as closed.
    fn is_closed(&self, conn: ConnId) -> bool;
}

/// timer the rate limiter uses to get called back.
pub trait Scheduler {
    /// asks for [`RateLimiter::try_send`] to be called again after `delay`.
    fn schedule(&mut self, delay: Duration);
}

/// a single pending wakeup, the earliest request wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct Deadline {
    base: Option<Instant>,
    at: Option<Instant>,
}

impl Deadline {
    /// delays passed to `schedule` are taken relative to `now` until the next call.
    pub fn set_now(&mut self, now: Instant) {
        self.base = Some(now);
    }

    pub fn at(&self) -> Option<Instant> {
        self.at
    }

    /// clears and returns the deadline if it has passed.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.at {
            Some(at) if at <= now => {
                self.at = None;
                true
            }
            _ => false,
        }
    }
}

impl Scheduler for Deadline {
    fn schedule(&mut self, delay: Duration) {
        let Some(base) = self.base else {
            return;
        };
        let at = base + delay;
        self.at = Some(self.at.map_or(at, |current| current.min(at)));
    }
}

/// token bucket shared by every upload of a session.
///
/// Connections with something to send sit in a ring, each linking to the one after it.
/// `try_send` walks the ring from just after the connection served last, giving each at most
/// `unitsize` bytes, until the bytes sent outrun the credit earned since the previous call.
/// Connections that send nothing or whose transport backs up leave the ring, they queue
/// themselves again once they have work and a flushed transport.
#[derive(Debug)]
pub struct RateLimiter {
    // ring links, only connections in the ring have an entry
    next_upload: HashMap<ConnId, ConnId>,
    last: Option<ConnId>,
    upload_rate: f64,
    unitsize: usize,
    // bytes sent ahead of the earned credit, negative when we may send
    offset_amount: f64,
    lasttime: Instant,
}

impl RateLimiter {
    /// stands in for "no limit".
    pub const UNLIMITED_RATE: f64 = 1e10;

    /// connections are served round robin, one quantum each. anything much above one standard
    /// 16 KiB block (plus room for message headers) would favour peers asking for big blocks.
    pub const MAX_UNIT_SIZE: usize = 17_000;

    pub fn new(now: Instant) -> Self {
        Self {
            next_upload: HashMap::new(),
            last: None,
            upload_rate: Self::UNLIMITED_RATE,
            unitsize: Self::MAX_UNIT_SIZE,
            offset_amount: 0.0,
            lasttime: now,
        }
    }

    /// `rate` in bytes/sec, 0 means unlimited.
    pub fn set_parameters(&mut self, rate: u64, unitsize: usize, now: Instant) {
        let (rate, unitsize) = if rate == 0 {
            (Self::UNLIMITED_RATE, Self::MAX_UNIT_SIZE)
        } else {
            (rate as f64, unitsize.clamp(1, Self::MAX_UNIT_SIZE))
        };
        debug!(rate, unitsize, "rate limiter parameters set");

        self.upload_rate = rate;
        self.unitsize = unitsize;
        self.lasttime = now;
        self.offset_amount = 0.0;
    }

    pub fn upload_rate(&self) -> f64 {
        self.upload_rate
    }

    pub fn unitsize(&self) -> usize {
        self.unitsize
    }

    pub fn is_queued(&self, conn: ConnId) -> bool {
        self.next_upload.contains_key(&conn)
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_none()
    }

    /// connections in the order they will next be served.
    pub fn ring(&self) -> Vec<ConnId> {
        let Some(last) = self.last else {
            return Vec::new();
        };
        let mut ring = Vec::with_capacity(self.next_upload.len());
        let mut cur = self.next_upload[&last];
        loop {
            ring.push(cur);
            if cur == last {
                return ring;
            }
            cur = self.next_upload[&cur];
        }
    }

    /// puts `conn` at the end of the ring. a connection already in the ring stays where it
    /// is. queueing into an empty ring starts sending right away.
    pub fn queue(
        &mut self,
        conn: ConnId,
        now: Instant,
        sink: &mut impl SendQueue,
        scheduler: &mut impl Scheduler,
    ) {
        if self.is_queued(conn) {
            return;
        }
        match self.last {
            None => {
                trace!(conn, "ring was empty, sending now");
                self.next_upload.insert(conn, conn);
                self.last = Some(conn);
                self.try_send(now, true, sink, scheduler);
            }
            Some(last) => {
                let after = self.next_upload[&last];
                self.next_upload.insert(conn, after);
                self.next_upload.insert(last, conn);
                self.last = Some(conn);
            }
        }
    }

    /// spends the credit earned since the last call on the ring. with `check_time` the
    /// credit left over from an idle period is dropped, so that a long pause does not turn
    /// into a burst.
    pub fn try_send(
        &mut self,
        now: Instant,
        check_time: bool,
        sink: &mut impl SendQueue,
        scheduler: &mut impl Scheduler,
    ) {
        let elapsed = now.saturating_duration_since(self.lasttime).as_secs_f64();
        self.offset_amount -= elapsed * self.upload_rate;
        self.lasttime = now;
        if check_time {
            self.offset_amount = self.offset_amount.max(0.0);
        }

        let Some(mut last) = self.last else {
            return;
        };
        let mut cur = self.next_upload[&last];

        while self.offset_amount <= 0.0 {
            let sent = match sink.send_partial(cur, self.unitsize) {
                Ok(sent) => sent,
                Err(err) => {
                    warn!(conn = cur, %err, "send failed, treating as nothing sent");
                    0
                }
            };
            self.offset_amount += sent as f64;

            if sent == 0 || !sink.is_flushed(cur) {
                let after = self.next_upload[&cur];
                self.next_upload.remove(&cur);
                if cur == last {
                    self.last = None;
                    trace!("ring drained");
                    return;
                }
                self.next_upload.insert(last, after);
                cur = after;
            } else {
                last = cur;
                self.last = Some(cur);
                cur = self.next_upload[&cur];
            }
        }

        // rounded up so that the wakeup always lands at or after the credit is earned
        let delay = self.offset_amount / self.upload_rate;
        trace!(delay, "rescheduling");
        scheduler.schedule(Duration::from_nanos((delay * 1e9).ceil() as u64));
    }

    /// removes closed connections from the ring, keeping the order of the rest.
    pub fn clean_closed(&mut self, sink: &impl SendQueue) {
        let ring = self.ring();
        let (open, closed): (Vec<_>, Vec<_>) = ring.into_iter().partition(|&conn| !sink.is_closed(conn));
        if closed.is_empty() {
            return;
        }
        debug!(removed = closed.len(), remaining = open.len(), "cleaning closed connections");

        // the new `last` is the open connection closest before the old one, so service
        // resumes where it would have
        self.last = open.last().copied();
        self.next_upload.clear();
        for (i, &conn) in open.iter().enumerate() {
            self.next_upload.insert(conn, open[(i + 1) % open.len()]);
        }
    }
}
