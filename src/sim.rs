//! In-memory stand-ins for the network, used by the `simulate` command and by tests.

use std::io;

use crate::transport::{SendError, Transport};

/// transport with a fixed drain rate. bytes written pile up in a backlog that [`drain`]
/// empties, and the transport counts as flushed once the backlog is gone.
///
/// [`drain`]: SimTransport::drain
#[derive(Debug, Default)]
pub struct SimTransport {
    written: Vec<u8>,
    backlog: usize,
    bounded: bool,
    closed: bool,
    fail_writes: usize,
    // writes that still succeed before the failures start
    ok_writes: usize,
    delivered: u64,
}

impl SimTransport {
    /// a link that drains instantly.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// a link whose backlog only shrinks through [`SimTransport::drain`].
    pub fn bounded() -> Self {
        Self {
            bounded: true,
            ..Self::default()
        }
    }

    /// makes the next `count` writes fail.
    pub fn fail_next_writes(&mut self, count: usize) {
        self.fail_writes_after(0, count);
    }

    /// lets `ok` writes through, then makes the `count` after them fail.
    pub fn fail_writes_after(&mut self, ok: usize, count: usize) {
        self.ok_writes = ok;
        self.fail_writes = count;
    }

    /// moves up to `budget` bytes of backlog onto the wire, returns whether the transport went
    /// from backed up to flushed.
    pub fn drain(&mut self, budget: usize) -> bool {
        if self.backlog == 0 {
            return false;
        }
        let moved = budget.min(self.backlog);
        self.backlog -= moved;
        self.delivered += moved as u64;
        self.backlog == 0
    }

    pub fn backlog(&self) -> usize {
        self.backlog
    }

    /// bytes that actually left through [`SimTransport::drain`] (or instantly when unbounded).
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }

    pub fn take_written(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.written)
    }
}

impl Transport for SimTransport {
    fn write(&mut self, buf: &[u8]) -> Result<(), SendError> {
        if self.closed {
            return Err(SendError::Closed);
        }
        if self.ok_writes > 0 {
            self.ok_writes -= 1;
        } else if self.fail_writes > 0 {
            self.fail_writes -= 1;
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "simulated reset").into());
        }

        self.written.extend_from_slice(buf);
        if self.bounded {
            self.backlog += buf.len();
        } else {
            self.delivered += buf.len() as u64;
        }
        Ok(())
    }

    fn is_flushed(&self) -> bool {
        self.backlog == 0
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
