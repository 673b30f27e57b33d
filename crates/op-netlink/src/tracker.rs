//! Request/reply correlation
//!
//! Every request gets a sequence number and a pending entry holding its
//! callback. Replies are matched back by sequence number. An entry is
//! removed from the table before its callback runs, so a callback fires at
//! most once even when a timeout and a late reply race.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{NetlinkError, Result};
use crate::message::{NetlinkMessage, OutgoingMessage};

/// Callback receiving every data reply of a request, or the error that
/// ended it.
pub type ReplyCallback = Box<dyn FnOnce(Result<Vec<NetlinkMessage>>) + Send + 'static>;

/// How many replies a request expects before it is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Complete on the kernel acknowledgement; echoed replies are collected.
    Ack,
    /// Complete after this many data replies, or an earlier ack/error/done.
    Replies(u32),
    /// Multi-part dump, complete on the terminating done message.
    Dump,
}

/// What [`RequestTracker::dispatch`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Reply recorded, more expected.
    Partial,
    /// Request finished and its callback ran.
    Completed,
    /// No pending request with that sequence number.
    Unknown,
    /// Message carried nothing to deliver (no-op).
    Ignored,
}

struct PendingRequest {
    expect: Expect,
    remaining: u32,
    replies: Vec<NetlinkMessage>,
    callback: ReplyCallback,
    deadline: Option<Instant>,
}

struct TrackerState {
    next_sequence: u32,
    pending: HashMap<u32, PendingRequest>,
}

impl TrackerState {
    /// Next free sequence number. Zero is reserved for unsolicited
    /// messages and numbers still pending are skipped after wrap-around.
    fn allocate(&mut self) -> u32 {
        loop {
            let seq = self.next_sequence;
            self.next_sequence = self.next_sequence.wrapping_add(1);
            if seq != 0 && !self.pending.contains_key(&seq) {
                return seq;
            }
        }
    }
}

/// Table of outstanding requests, shared between submitters and the driver.
pub struct RequestTracker {
    state: Mutex<TrackerState>,
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::with_initial_sequence(1)
    }

    /// Start allocating at `sequence`.
    pub fn with_initial_sequence(sequence: u32) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                next_sequence: sequence,
                pending: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a sequence number, write it into `message` and register the
    /// pending entry.
    pub fn submit(
        &self,
        message: &mut OutgoingMessage,
        expect: Expect,
        timeout: Option<Duration>,
        callback: ReplyCallback,
    ) -> u32 {
        let mut state = self.lock();
        let sequence = state.allocate();
        message.set_sequence(sequence);

        let remaining = match expect {
            Expect::Replies(n) => n.max(1),
            _ => 0,
        };
        state.pending.insert(
            sequence,
            PendingRequest {
                expect,
                remaining,
                replies: Vec::new(),
                callback,
                deadline: timeout.map(|t| Instant::now() + t),
            },
        );
        debug!(sequence, ?expect, pending = state.pending.len(), "Registered request");
        sequence
    }

    /// Route one received message to its pending request.
    pub fn dispatch(&self, msg: NetlinkMessage) -> Dispatch {
        let sequence = msg.sequence();
        let (entry, result) = {
            let mut state = self.lock();
            let Some(entry) = state.pending.get_mut(&sequence) else {
                warn!(sequence, "Dropping reply for unknown sequence number");
                return Dispatch::Unknown;
            };

            let outcome = if msg.is_error() {
                match msg.error_code() {
                    Ok(0) => Some(Ok(())),
                    Ok(code) => Some(Err(NetlinkError::Protocol { code })),
                    Err(e) => Some(Err(e)),
                }
            } else if msg.is_done() {
                Some(Ok(()))
            } else if msg.is_noop() {
                return Dispatch::Ignored;
            } else {
                entry.replies.push(msg);
                match entry.expect {
                    Expect::Replies(_) => {
                        entry.remaining = entry.remaining.saturating_sub(1);
                        (entry.remaining == 0).then_some(Ok(()))
                    }
                    Expect::Ack | Expect::Dump => None,
                }
            };

            match outcome {
                None => return Dispatch::Partial,
                Some(result) => match state.pending.remove(&sequence) {
                    Some(entry) => (entry, result),
                    None => return Dispatch::Unknown,
                },
            }
        };

        debug!(sequence, replies = entry.replies.len(), ok = result.is_ok(), "Request completed");
        let replies = entry.replies;
        (entry.callback)(result.map(|()| replies));
        Dispatch::Completed
    }

    /// Fail one request. Returns false if it was no longer pending.
    pub fn fail(&self, sequence: u32, error: NetlinkError) -> bool {
        let entry = self.lock().pending.remove(&sequence);
        match entry {
            Some(entry) => {
                (entry.callback)(Err(error));
                true
            }
            None => false,
        }
    }

    /// Drop a pending request without running its callback. Returns false
    /// if it was no longer pending.
    pub fn cancel(&self, sequence: u32) -> bool {
        self.lock().pending.remove(&sequence).is_some()
    }

    /// Fail every pending request and clear the table. Each callback runs
    /// exactly once, in sequence order.
    pub fn fail_all<F>(&self, make_error: F) -> usize
    where
        F: Fn() -> NetlinkError,
    {
        let mut drained: Vec<(u32, PendingRequest)> = self.lock().pending.drain().collect();
        drained.sort_by_key(|(seq, _)| *seq);
        let count = drained.len();
        for (_, entry) in drained {
            (entry.callback)(Err(make_error()));
        }
        if count > 0 {
            debug!(count, "Failed all pending requests");
        }
        count
    }

    /// Time out every request whose deadline is at or before `now`.
    pub fn expire(&self, now: Instant) -> usize {
        let expired: Vec<(u32, PendingRequest)> = {
            let mut state = self.lock();
            let sequences: Vec<u32> = state
                .pending
                .iter()
                .filter(|(_, p)| p.deadline.map_or(false, |d| d <= now))
                .map(|(seq, _)| *seq)
                .collect();
            sequences
                .into_iter()
                .filter_map(|seq| state.pending.remove(&seq).map(|p| (seq, p)))
                .collect()
        };

        let count = expired.len();
        for (sequence, entry) in expired {
            warn!(sequence, "Request timed out");
            (entry.callback)(Err(NetlinkError::Timeout { sequence }));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_pending(&self, sequence: u32) -> bool {
        self.lock().pending.contains_key(&sequence)
    }

    /// Earliest deadline among pending requests.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock().pending.values().filter_map(|p| p.deadline).min()
    }
}
