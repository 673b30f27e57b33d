//! Connection state machine and driver
//!
//! A connection is split in two:
//!
//! - [`NetlinkConnection`] owns the transport and is driven by exactly one
//!   thread, through [`NetlinkConnection::poll`] or the async
//!   [`NetlinkConnection::run`] loop.
//! - [`ConnectionHandle`] is cloneable and may be used from any thread to
//!   submit requests. Submissions reach the driver through a channel.
//!
//! States move `Uninitialized -> ResolvingFamilies -> Ready -> Closed`.
//! Bring-up failure moves straight to `Closed`. Only family lookups are
//! accepted before `Ready`.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::batch::BatchWriter;
use crate::config::ConnectionConfig;
use crate::error::{NetlinkError, Result};
use crate::family::{lookup_request, parse_family, Family, FamilySet};
use crate::message::{messages, NetlinkMessage, OutgoingMessage};
use crate::reply::PendingReply;
use crate::tracker::{Expect, ReplyCallback, RequestTracker};
use crate::transport::Transport;

/// How often the async driver sweeps for timed out requests.
pub const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Handler for unsolicited messages (sequence number 0).
pub type NotificationHandler = Box<dyn FnMut(NetlinkMessage) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Uninitialized,
    ResolvingFamilies,
    Ready,
    Closed,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Uninitialized => 0,
            ConnectionState::ResolvingFamilies => 1,
            ConnectionState::Ready => 2,
            ConnectionState::Closed => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Uninitialized,
            1 => ConnectionState::ResolvingFamilies,
            2 => ConnectionState::Ready,
            _ => ConnectionState::Closed,
        }
    }
}

// ============================================================================
// Shared state
// ============================================================================

struct Shared {
    state: AtomicU8,
    tracker: RequestTracker,
    families: RwLock<FamilySet>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    wakeup: Notify,
    pid: AtomicU32,
    timeout: Option<Duration>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let moved = self
            .state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            info!(?from, ?to, "Netlink connection state changed");
        }
        moved
    }

    /// Move to `Closed` and fail everything still pending.
    fn close(&self) {
        let previous = ConnectionState::from_u8(
            self.state
                .swap(ConnectionState::Closed.as_u8(), Ordering::AcqRel),
        );
        if previous != ConnectionState::Closed {
            let failed = self.tracker.fail_all(|| NetlinkError::ConnectionClosed);
            info!(?previous, failed, "Netlink connection closed");
        }
        self.wakeup.notify_one();
    }

    /// Register `message` with the tracker and hand it to the driver.
    fn enqueue(
        &self,
        mut message: OutgoingMessage,
        expect: Expect,
        callback: ReplyCallback,
    ) -> Result<u32> {
        message.set_pid(self.pid.load(Ordering::Relaxed));
        let sequence = self.tracker.submit(&mut message, expect, self.timeout, callback);

        if self.outbound.send(message.into_bytes()).is_err()
            || self.state() == ConnectionState::Closed
        {
            // Closed while submitting. If close() already failed the entry
            // the callback has its error; otherwise report it here.
            if self.tracker.cancel(sequence) {
                return Err(NetlinkError::ConnectionClosed);
            }
            return Ok(sequence);
        }

        self.wakeup.notify_one();
        Ok(sequence)
    }

    fn families(&self) -> std::sync::RwLockReadGuard<'_, FamilySet> {
        self.families.read().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Thread-safe submission handle.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Originator id written into request headers.
    pub fn local_pid(&self) -> u32 {
        self.shared.pid.load(Ordering::Relaxed)
    }

    /// A resolved family, `NotInitialized` if it was never resolved.
    pub fn family(&self, name: &str) -> Result<Family> {
        self.shared.families().get(name).cloned()
    }

    pub fn families(&self) -> Vec<Family> {
        let mut families: Vec<Family> = self.shared.families().iter().cloned().collect();
        families.sort_by(|a, b| a.name.cmp(&b.name));
        families
    }

    /// Requests registered and not yet completed.
    pub fn pending_requests(&self) -> usize {
        self.shared.tracker.pending_count()
    }

    /// Submit a request. Fails with `NotInitialized` before the connection
    /// is ready and `ConnectionClosed` after it closed; in both cases no
    /// sequence number is consumed.
    pub fn submit(
        &self,
        message: OutgoingMessage,
        expect: Expect,
        callback: ReplyCallback,
    ) -> Result<u32> {
        match self.state() {
            ConnectionState::Ready => self.shared.enqueue(message, expect, callback),
            ConnectionState::Closed => Err(NetlinkError::ConnectionClosed),
            ConnectionState::Uninitialized | ConnectionState::ResolvingFamilies => {
                Err(NetlinkError::NotInitialized)
            }
        }
    }

    /// Future form of [`submit`](Self::submit).
    pub fn request(
        &self,
        message: OutgoingMessage,
        expect: Expect,
    ) -> Result<PendingReply<Vec<NetlinkMessage>>> {
        let (callback, reply) = PendingReply::pair();
        self.submit(message, expect, Box::new(callback))?;
        Ok(reply)
    }

    /// Look up one family by name. Allowed in every state but `Closed`.
    /// A successful lookup is cached for the connection's lifetime.
    pub fn resolve_family<F>(&self, name: &str, callback: F) -> Result<u32>
    where
        F: FnOnce(Result<Family>) + Send + 'static,
    {
        if self.state() == ConnectionState::Closed {
            return Err(NetlinkError::ConnectionClosed);
        }

        let message = lookup_request(name)?;
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let requested = name.to_string();
        self.shared.enqueue(
            message,
            Expect::Replies(1),
            Box::new(move |result: Result<Vec<NetlinkMessage>>| {
                let result = result
                    .and_then(|replies| {
                        replies
                            .first()
                            .ok_or_else(|| NetlinkError::malformed("empty family reply"))
                            .and_then(parse_family)
                    })
                    .map_err(|e| match e {
                        NetlinkError::Protocol { code } if code == -libc::ENOENT => {
                            NetlinkError::FamilyNotFound(requested.clone())
                        }
                        other => other,
                    });

                if let (Ok(family), Some(shared)) = (&result, weak.upgrade()) {
                    info!(name = %family.name, id = family.id, version = family.version, "Resolved netlink family");
                    shared
                        .families
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(family.clone());
                }
                callback(result);
            }),
        )
    }

    /// Bring the connection up: resolve every family in `names`, then move
    /// to `Ready`. Any lookup failure closes the connection and reports
    /// `NotInitialized` to `on_ready`.
    pub fn initialize<F>(&self, names: &[&str], on_ready: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        if !self.shared.transition(
            ConnectionState::Uninitialized,
            ConnectionState::ResolvingFamilies,
        ) {
            return match self.state() {
                ConnectionState::Closed => Err(NetlinkError::ConnectionClosed),
                ConnectionState::Ready => {
                    on_ready(Ok(()));
                    Ok(())
                }
                // a bring-up is already running
                _ => Err(NetlinkError::NotInitialized),
            };
        }

        if names.is_empty() {
            self.shared
                .transition(ConnectionState::ResolvingFamilies, ConnectionState::Ready);
            on_ready(Ok(()));
            return Ok(());
        }

        let bringup = Arc::new(Bringup {
            remaining: AtomicUsize::new(names.len()),
            failed: AtomicBool::new(false),
            on_ready: Mutex::new(Some(Box::new(on_ready))),
        });

        for name in names {
            let pending = bringup.clone();
            let weak = Arc::downgrade(&self.shared);
            let submitted = self.resolve_family(name, move |result| {
                pending.resolved(weak.upgrade().as_deref(), result);
            });
            if let Err(e) = submitted {
                if !bringup.failed.swap(true, Ordering::AcqRel) {
                    self.shared.close();
                    bringup.finish(Err(NetlinkError::NotInitialized));
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Future form of [`initialize`](Self::initialize).
    pub fn initialize_async(&self, names: &[&str]) -> Result<PendingReply<()>> {
        let (callback, reply) = PendingReply::pair();
        self.initialize(names, callback)?;
        Ok(reply)
    }

    /// Close the connection: pending requests fail with `ConnectionClosed`
    /// and later submissions are rejected.
    pub fn close(&self) {
        self.shared.close();
    }
}

struct Bringup {
    remaining: AtomicUsize,
    failed: AtomicBool,
    on_ready: Mutex<Option<Box<dyn FnOnce(Result<()>) + Send>>>,
}

impl Bringup {
    /// One lookup finished. The last success moves the connection to
    /// `Ready`; the first failure closes it.
    fn resolved(&self, shared: Option<&Shared>, result: Result<Family>) {
        match result {
            Ok(_) => {
                let last = self.remaining.fetch_sub(1, Ordering::AcqRel) == 1;
                if !last || self.failed.load(Ordering::Acquire) {
                    return;
                }
                let ready = shared.map_or(false, |shared| {
                    shared.transition(ConnectionState::ResolvingFamilies, ConnectionState::Ready)
                });
                if ready {
                    self.finish(Ok(()));
                } else {
                    debug!("Connection closed before bring-up completed");
                    self.finish(Err(NetlinkError::ConnectionClosed));
                }
            }
            Err(e) => {
                if !self.failed.swap(true, Ordering::AcqRel) {
                    warn!(error = %e, suggestion = e.suggestion(), "Family resolution failed");
                    if let Some(shared) = shared {
                        shared.close();
                    }
                    self.finish(Err(NetlinkError::NotInitialized));
                }
            }
        }
    }

    fn finish(&self, result: Result<()>) {
        let callback = self
            .on_ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback(result);
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Driver side of a connection. Owned by one thread.
pub struct NetlinkConnection<T: Transport> {
    transport: T,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    writer: BatchWriter,
    recv_buf: Vec<u8>,
    max_reads_per_event: usize,
    notifications: Option<NotificationHandler>,
}

impl<T: Transport> NetlinkConnection<T> {
    pub fn new(transport: T, config: &ConnectionConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: AtomicU8::new(ConnectionState::Uninitialized.as_u8()),
            tracker: RequestTracker::new(),
            families: RwLock::new(FamilySet::new()),
            outbound: tx,
            wakeup: Notify::new(),
            pid: AtomicU32::new(transport.local_pid()),
            timeout: config.request_timeout(),
        });
        let writer =
            BatchWriter::new(config.max_batch_size).bypass(config.bypass_send_queue);
        debug!(
            max_batch_size = writer.max_batch_size(),
            bypass = config.bypass_send_queue,
            "Created netlink connection"
        );

        Self {
            transport,
            shared,
            outbound: rx,
            writer,
            recv_buf: Vec::with_capacity(config.recv_buffer_size),
            max_reads_per_event: config.max_reads_per_event.max(1),
            notifications: None,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Receive every unsolicited message, once per arrival.
    pub fn set_notification_handler<F>(&mut self, handler: F)
    where
        F: FnMut(NetlinkMessage) + Send + 'static,
    {
        self.notifications = Some(Box::new(handler));
    }

    pub fn set_bypass_send_queue(&mut self, bypass: bool) {
        self.writer.set_bypass(bypass);
    }

    pub fn set_max_batch_size(&mut self, max_batch_size: usize) {
        self.writer.set_max_batch_size(max_batch_size);
    }

    /// Underlying write calls issued so far.
    pub fn write_calls(&self) -> u64 {
        self.writer.writes()
    }

    /// Move submitted requests into the batch writer and flush.
    /// Returns the number of messages taken from the submission queue.
    pub fn handle_write_event(&mut self) -> Result<usize> {
        let mut drained = 0;
        while let Ok(bytes) = self.outbound.try_recv() {
            drained += 1;
            match self.writer.enqueue(&bytes, &mut self.transport) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(drained),
                Err(e) => return Err(e.into()),
            }
        }
        match self.writer.flush(&mut self.transport) {
            Ok(_) => Ok(drained),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(drained),
            Err(e) => Err(e.into()),
        }
    }

    /// Read available datagrams and dispatch the messages they carry.
    /// Returns the number of messages delivered.
    pub fn handle_read_event(&mut self) -> Result<usize> {
        self.read_available().map(|(delivered, _)| delivered)
    }

    /// Reads until the transport would block or the per-event cap is hit.
    /// The flag reports whether the transport was drained.
    fn read_available(&mut self) -> Result<(usize, bool)> {
        let mut delivered = 0;
        for _ in 0..self.max_reads_per_event {
            match self.transport.recv(&mut self.recv_buf) {
                Ok(0) => return Ok((delivered, true)),
                Ok(_) => delivered += self.process_datagram(),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return Ok((delivered, true))
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok((delivered, false))
    }

    fn process_datagram(&mut self) -> usize {
        let buf = std::mem::take(&mut self.recv_buf);
        let mut delivered = 0;
        for message in messages(&buf) {
            match message {
                Ok(message) => {
                    self.deliver(message);
                    delivered += 1;
                }
                Err(e) => {
                    let failed = self
                        .shared
                        .tracker
                        .fail_all(|| NetlinkError::Protocol { code: -libc::EPROTO });
                    warn!(error = %e, failed, "Malformed message header, aborting read cycle");
                    break;
                }
            }
        }
        self.recv_buf = buf;
        delivered
    }

    fn deliver(&mut self, message: NetlinkMessage) {
        if message.sequence() == 0 {
            match self.notifications.as_mut() {
                Some(handler) => handler(message),
                None => debug!(
                    message_type = message.header.message_type,
                    "Dropping unsolicited message"
                ),
            }
            return;
        }
        self.shared.tracker.dispatch(message);
    }

    /// Fail requests whose deadline passed.
    pub fn expire_requests(&self, now: Instant) -> usize {
        self.shared.tracker.expire(now)
    }

    /// One reactor step: write, read, expire. Returns messages delivered.
    pub fn poll(&mut self) -> Result<usize> {
        self.handle_write_event()?;
        let delivered = self.handle_read_event()?;
        self.expire_requests(Instant::now());
        Ok(delivered)
    }

    pub fn close(&mut self) {
        self.shared.close();
    }
}

impl<T: Transport> Drop for NetlinkConnection<T> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Borrowed descriptor registered with the reactor; the transport keeps
/// ownership of the socket.
struct SocketFd(RawFd);

impl AsRawFd for SocketFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl<T: Transport + AsRawFd> NetlinkConnection<T> {
    /// Drive the connection on the tokio reactor until it is closed.
    pub async fn run(mut self) -> Result<()> {
        let fd = AsyncFd::with_interest(SocketFd(self.transport.as_raw_fd()), Interest::READABLE)?;
        let shared = self.shared.clone();
        let mut sweep = tokio::time::interval(TIMEOUT_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(pid = self.transport.local_pid(), "Netlink driver started");

        let result = loop {
            if self.state() == ConnectionState::Closed {
                break Ok(());
            }
            if let Err(e) = self.handle_write_event() {
                break Err(e);
            }

            tokio::select! {
                ready = fd.readable() => {
                    let mut guard = match ready {
                        Ok(guard) => guard,
                        Err(e) => break Err(e.into()),
                    };
                    match self.read_available() {
                        Ok((_, true)) => guard.clear_ready(),
                        Ok((_, false)) => {}
                        Err(e) => break Err(e),
                    }
                }
                _ = shared.wakeup.notified() => {}
                _ = sweep.tick() => {
                    self.expire_requests(Instant::now());
                }
            }
        };

        if let Err(e) = &result {
            warn!(error = %e, "Netlink driver stopped on error");
        }
        self.close();
        result
    }
}
