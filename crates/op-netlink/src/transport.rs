//! Kernel transports
//!
//! [`NetlinkSocket`] is the real `NETLINK_GENERIC` socket, auto-bound and
//! non-blocking. [`MemoryTransport`] is an in-process loopback with scripted
//! inbound datagrams and recorded writes.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use netlink_sys::{protocols::NETLINK_GENERIC, Socket};
use tracing::debug;

/// Non-blocking datagram transport to the kernel.
///
/// `recv` returns `ErrorKind::WouldBlock` when nothing is queued.
pub trait Transport: Send {
    /// Write one buffer (possibly several concatenated messages).
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Receive one datagram into `buf`, replacing its contents.
    fn recv(&mut self, buf: &mut Vec<u8>) -> io::Result<usize>;

    /// Port id the kernel assigned to this end, used as the originator id.
    fn local_pid(&self) -> u32 {
        0
    }
}

// ============================================================================
// Netlink socket
// ============================================================================

/// Generic netlink socket.
pub struct NetlinkSocket {
    socket: Socket,
    pid: u32,
    recv_buffer_size: usize,
}

impl NetlinkSocket {
    /// Open, auto-bind and switch to non-blocking mode.
    pub fn open_generic(recv_buffer_size: usize) -> io::Result<Self> {
        let mut socket = Socket::new(NETLINK_GENERIC)?;
        let addr = socket.bind_auto()?;
        socket.set_non_blocking(true)?;
        let pid = addr.port_number();
        debug!(pid, "Opened generic netlink socket");
        Ok(Self {
            socket,
            pid,
            recv_buffer_size,
        })
    }

    /// Join a multicast group (e.g. a family's notification group).
    pub fn add_membership(&mut self, group: u32) -> io::Result<()> {
        self.socket.add_membership(group)
    }
}

impl Transport for NetlinkSocket {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf, 0)
    }

    fn recv(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        buf.clear();
        buf.reserve(self.recv_buffer_size);
        self.socket.recv(buf, 0)
    }

    fn local_pid(&self) -> u32 {
        self.pid
    }
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

// ============================================================================
// Loopback
// ============================================================================

#[derive(Default)]
struct MemoryState {
    inbound: VecDeque<Vec<u8>>,
    writes: Vec<Vec<u8>>,
    pid: u32,
}

/// Loopback transport. Clones share the same queues, so a test can keep
/// one clone while the connection owns another.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new(pid: u32) -> Self {
        let transport = Self::default();
        transport.lock().pid = pid;
        transport
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a datagram for the next `recv`.
    pub fn push_inbound(&self, datagram: impl Into<Vec<u8>>) {
        self.lock().inbound.push_back(datagram.into());
    }

    pub fn pending_inbound(&self) -> usize {
        self.lock().inbound.len()
    }

    /// Every buffer written so far, one entry per `send` call.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    pub fn take_writes(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.lock().writes)
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().writes.push(buf.to_vec());
        Ok(buf.len())
    }

    fn recv(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        match self.lock().inbound.pop_front() {
            Some(datagram) => {
                buf.clear();
                buf.extend_from_slice(&datagram);
                Ok(datagram.len())
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn local_pid(&self) -> u32 {
        self.lock().pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_transport_shares_queues() {
        let observer = MemoryTransport::new(294);
        let mut transport = observer.clone();

        transport.send(&[1, 2, 3]).unwrap();
        assert_eq!(observer.writes(), vec![vec![1, 2, 3]]);

        observer.push_inbound(vec![9u8; 4]);
        let mut buf = Vec::new();
        assert_eq!(transport.recv(&mut buf).unwrap(), 4);
        assert_eq!(buf, vec![9u8; 4]);

        let err = transport.recv(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(transport.local_pid(), 294);
    }

    #[test]
    #[ignore] // Needs a kernel with generic netlink
    fn test_open_generic_socket() {
        let socket = NetlinkSocket::open_generic(65536).expect("Failed to open socket");
        assert!(socket.local_pid() != 0);
    }
}
