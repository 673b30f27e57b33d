//! Netlink message framing
//!
//! Wire layout of one message (header fields in host byte order):
//!
//! ```text
//! | length u32 | type u16 | flags u16 | sequence u32 | pid u32 | payload ... |
//! ```
//!
//! Generic Netlink payloads start with a 4-byte family header
//! (`command u8, version u8, reserved u16`) followed by attributes.

use std::ops::{Deref, DerefMut};

use byteorder::{ByteOrder, NativeEndian};

use crate::attr::{align, AttrBuilder, AttrIter};
use crate::error::{NetlinkError, Result};

pub use netlink_packet_core::{
    NLMSG_DONE, NLMSG_ERROR, NLMSG_NOOP, NLMSG_OVERRUN, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP,
    NLM_F_ECHO, NLM_F_EXCL, NLM_F_MULTIPART, NLM_F_REQUEST,
};

/// Size of the netlink message header.
pub const NLMSG_HDRLEN: usize = 16;
/// Size of the generic netlink family header.
pub const GENL_HDRLEN: usize = 4;

// ============================================================================
// Headers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetlinkHeader {
    pub length: u32,
    pub message_type: u16,
    pub flags: u16,
    pub sequence: u32,
    pub pid: u32,
}

impl NetlinkHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < NLMSG_HDRLEN {
            return Err(NetlinkError::malformed(format!(
                "netlink header needs {} bytes, got {}",
                NLMSG_HDRLEN,
                buf.len()
            )));
        }
        Ok(Self {
            length: NativeEndian::read_u32(&buf[0..4]),
            message_type: NativeEndian::read_u16(&buf[4..6]),
            flags: NativeEndian::read_u16(&buf[6..8]),
            sequence: NativeEndian::read_u32(&buf[8..12]),
            pid: NativeEndian::read_u32(&buf[12..16]),
        })
    }

    /// Write the header into the first 16 bytes of `buf`.
    pub fn emit(&self, buf: &mut [u8]) {
        NativeEndian::write_u32(&mut buf[0..4], self.length);
        NativeEndian::write_u16(&mut buf[4..6], self.message_type);
        NativeEndian::write_u16(&mut buf[6..8], self.flags);
        NativeEndian::write_u32(&mut buf[8..12], self.sequence);
        NativeEndian::write_u32(&mut buf[12..16], self.pid);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenlHeader {
    pub command: u8,
    pub version: u8,
}

impl GenlHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < GENL_HDRLEN {
            return Err(NetlinkError::malformed("truncated generic netlink header"));
        }
        Ok(Self {
            command: buf[0],
            version: buf[1],
        })
    }
}

// ============================================================================
// Outgoing messages
// ============================================================================

/// Builds one request. Derefs to the [`AttrBuilder`] positioned after the
/// headers, so attributes and fixed family headers are written directly.
#[derive(Debug)]
pub struct MessageBuilder {
    attrs: AttrBuilder,
    message_type: u16,
    flags: u16,
}

impl MessageBuilder {
    /// Plain netlink message with an empty payload.
    pub fn new(message_type: u16, flags: u16) -> Self {
        Self {
            attrs: AttrBuilder::with_prefix(vec![0u8; NLMSG_HDRLEN]),
            message_type,
            flags,
        }
    }

    /// Generic netlink message for `family_id`, with the family header
    /// already written.
    pub fn genl(family_id: u16, flags: u16, command: u8, version: u8) -> Self {
        let mut builder = Self::new(family_id, flags);
        builder.attrs.put_u8(command);
        builder.attrs.put_u8(version);
        builder.attrs.put_zeros(2);
        builder
    }

    /// Finalize: every attribute must be closed. The header length is set
    /// to the full encoded size.
    pub fn build(self) -> Result<OutgoingMessage> {
        let mut bytes = self.attrs.finish()?;
        let length = u32::try_from(bytes.len())
            .map_err(|_| NetlinkError::malformed("message exceeds u32 length"))?;
        NetlinkHeader {
            length,
            message_type: self.message_type,
            flags: self.flags,
            sequence: 0,
            pid: 0,
        }
        .emit(&mut bytes);
        Ok(OutgoingMessage { bytes })
    }
}

impl Deref for MessageBuilder {
    type Target = AttrBuilder;

    fn deref(&self) -> &AttrBuilder {
        &self.attrs
    }
}

impl DerefMut for MessageBuilder {
    fn deref_mut(&mut self) -> &mut AttrBuilder {
        &mut self.attrs
    }
}

/// A fully encoded request waiting for its sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    bytes: Vec<u8>,
}

impl OutgoingMessage {
    pub fn header(&self) -> NetlinkHeader {
        // build() guarantees at least a full header
        NetlinkHeader {
            length: NativeEndian::read_u32(&self.bytes[0..4]),
            message_type: NativeEndian::read_u16(&self.bytes[4..6]),
            flags: NativeEndian::read_u16(&self.bytes[6..8]),
            sequence: NativeEndian::read_u32(&self.bytes[8..12]),
            pid: NativeEndian::read_u32(&self.bytes[12..16]),
        }
    }

    pub fn sequence(&self) -> u32 {
        NativeEndian::read_u32(&self.bytes[8..12])
    }

    pub fn set_sequence(&mut self, sequence: u32) {
        NativeEndian::write_u32(&mut self.bytes[8..12], sequence);
    }

    pub fn set_pid(&mut self, pid: u32) {
        NativeEndian::write_u32(&mut self.bytes[12..16], pid);
    }

    pub fn set_flags(&mut self, flags: u16) {
        NativeEndian::write_u16(&mut self.bytes[6..8], flags);
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

// ============================================================================
// Incoming messages
// ============================================================================

/// One received message with an owned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetlinkMessage {
    pub header: NetlinkHeader,
    pub payload: Vec<u8>,
}

impl NetlinkMessage {
    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    pub fn is_error(&self) -> bool {
        self.header.message_type == NLMSG_ERROR
    }

    pub fn is_done(&self) -> bool {
        self.header.message_type == NLMSG_DONE
    }

    pub fn is_noop(&self) -> bool {
        self.header.message_type == NLMSG_NOOP
    }

    pub fn is_multipart(&self) -> bool {
        self.header.flags & NLM_F_MULTIPART != 0
    }

    /// Error code of an error message; 0 is an acknowledgement.
    pub fn error_code(&self) -> Result<i32> {
        if self.payload.len() < 4 {
            return Err(NetlinkError::malformed("truncated error message"));
        }
        Ok(NativeEndian::read_i32(&self.payload[0..4]))
    }

    pub fn genl_header(&self) -> Result<GenlHeader> {
        GenlHeader::parse(&self.payload)
    }

    /// Bytes following the generic netlink header.
    pub fn genl_body(&self) -> Result<&[u8]> {
        self.payload
            .get(GENL_HDRLEN..)
            .ok_or_else(|| NetlinkError::malformed("truncated generic netlink header"))
    }

    /// Attributes after the generic header and `fixed_len` bytes of
    /// family-specific header.
    pub fn attrs(&self, fixed_len: usize) -> Result<AttrIter<'_>> {
        self.payload
            .get(GENL_HDRLEN + fixed_len..)
            .map(AttrIter::new)
            .ok_or_else(|| NetlinkError::malformed("payload shorter than family header"))
    }

    /// Decode exactly one message from `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        messages(buf)
            .next()
            .unwrap_or_else(|| Err(NetlinkError::malformed("empty buffer")))
    }

    /// Re-encode the message (used by loopback transports and tests).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; NLMSG_HDRLEN];
        let header = NetlinkHeader {
            length: (NLMSG_HDRLEN + self.payload.len()) as u32,
            ..self.header
        };
        header.emit(&mut bytes);
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Iterator splitting a datagram into messages.
///
/// A bad header is fatal for the rest of the buffer: the iterator yields the
/// error once and stops.
#[derive(Debug)]
pub struct MessageIter<'a> {
    buf: &'a [u8],
    offset: usize,
    failed: bool,
}

/// Split a received datagram into messages.
pub fn messages(buf: &[u8]) -> MessageIter<'_> {
    MessageIter {
        buf,
        offset: 0,
        failed: false,
    }
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = Result<NetlinkMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let rest = &self.buf[self.offset..];
        if rest.is_empty() {
            return None;
        }

        let header = match NetlinkHeader::parse(rest) {
            Ok(h) => h,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };
        let len = header.length as usize;
        if len < NLMSG_HDRLEN || len > rest.len() {
            self.failed = true;
            return Some(Err(NetlinkError::malformed(format!(
                "message length {} invalid, {} bytes available",
                len,
                rest.len()
            ))));
        }

        self.offset += align(len).min(rest.len());
        Some(Ok(NetlinkMessage {
            header,
            payload: rest[NLMSG_HDRLEN..len].to_vec(),
        }))
    }
}
