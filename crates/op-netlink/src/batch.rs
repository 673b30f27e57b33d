//! Outbound write coalescing
//!
//! Encoded requests are queued until `max_batch_size` of them are waiting
//! (or a flush is requested) and then written with one `send` call. Netlink
//! accepts several concatenated messages in one datagram.

use std::io;

use tracing::debug;

use crate::transport::Transport;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 16;

#[derive(Debug)]
pub struct BatchWriter {
    max_batch_size: usize,
    bypass: bool,
    buffer: Vec<u8>,
    queued: usize,
    writes: u64,
}

impl Default for BatchWriter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BATCH_SIZE)
    }
}

impl BatchWriter {
    /// A size of 1 degrades to one write per message.
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            bypass: false,
            buffer: Vec::new(),
            queued: 0,
            writes: 0,
        }
    }

    /// Flush on every enqueue regardless of the batch size.
    pub fn bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn set_bypass(&mut self, bypass: bool) {
        self.bypass = bypass;
    }

    pub fn set_max_batch_size(&mut self, max_batch_size: usize) {
        self.max_batch_size = max_batch_size.max(1);
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Messages waiting for the next flush.
    pub fn queued(&self) -> usize {
        self.queued
    }

    /// Underlying write calls issued so far.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Queue one encoded message, flushing if the batch is full.
    /// Returns true if a write was issued.
    pub fn enqueue<T: Transport + ?Sized>(
        &mut self,
        message: &[u8],
        transport: &mut T,
    ) -> io::Result<bool> {
        self.buffer.extend_from_slice(message);
        self.queued += 1;
        if self.bypass || self.queued >= self.max_batch_size {
            self.flush(transport)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Write everything queued in one call. On error the batch is kept for
    /// a retry.
    pub fn flush<T: Transport + ?Sized>(&mut self, transport: &mut T) -> io::Result<usize> {
        if self.queued == 0 {
            return Ok(0);
        }
        let written = transport.send(&self.buffer)?;
        debug!(messages = self.queued, bytes = written, "Flushed batch");
        self.writes += 1;
        self.buffer.clear();
        self.queued = 0;
        Ok(written)
    }
}
