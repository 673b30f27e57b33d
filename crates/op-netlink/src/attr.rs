//! Netlink attribute (TLV) codec
//!
//! Attributes are laid out as a 2-byte length, a 2-byte type tag and the
//! value bytes, padded with zeroes to the next 4-byte boundary. The length
//! field stores the unpadded size (header included).
//!
//! Encoding goes through [`AttrBuilder`]: `begin` reserves the header and
//! returns a handle, `end` backpatches the length and pads. Handles form a
//! stack, so nested attributes must be closed innermost first.
//!
//! Decoding is lazy: [`AttrIter`] walks a buffer one attribute at a time and
//! hands out borrowed [`Attr`] views. Nothing is materialized unless the
//! caller collects it.

use byteorder::{BigEndian, ByteOrder, NativeEndian};

use crate::error::{NetlinkError, Result};

/// Size of the attribute header (length + type).
pub const NLA_HEADER_LEN: usize = 4;
/// Attribute alignment.
pub const NLA_ALIGNTO: usize = 4;
/// Flag bit marking a nested attribute.
pub const NLA_F_NESTED: u16 = 1 << 15;
/// Flag bit marking a value in network byte order.
pub const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
/// Mask selecting the type tag without flag bits.
pub const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

/// Round `len` up to the attribute alignment.
#[inline]
pub const fn align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// Byte order of a scalar value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    /// Host byte order (the kernel's default for netlink fields).
    Host,
    /// Network byte order, for fields documented as `__be*`.
    Network,
}

// ============================================================================
// Encoding
// ============================================================================

/// An open attribute. Must be passed back to [`AttrBuilder::end`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an open attribute must be closed with AttrBuilder::end"]
pub struct AttrHandle {
    offset: usize,
}

/// Append-only attribute writer.
#[derive(Debug, Default, Clone)]
pub struct AttrBuilder {
    buf: Vec<u8>,
    open: Vec<usize>,
}

impl AttrBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue writing after `prefix` (e.g. already written message headers).
    /// The prefix length should be a multiple of 4 so padding stays aligned.
    pub fn with_prefix(prefix: Vec<u8>) -> Self {
        Self {
            buf: prefix,
            open: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Number of attributes currently open.
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// Write a placeholder header for `kind` and open the attribute.
    pub fn begin(&mut self, kind: u16) -> AttrHandle {
        let offset = self.buf.len();
        let mut header = [0u8; NLA_HEADER_LEN];
        NativeEndian::write_u16(&mut header[2..4], kind);
        self.buf.extend_from_slice(&header);
        self.open.push(offset);
        AttrHandle { offset }
    }

    /// Close the innermost open attribute: backpatch its length and pad.
    ///
    /// Closing anything but the innermost attribute is rejected.
    pub fn end(&mut self, handle: AttrHandle) -> Result<()> {
        match self.open.last() {
            Some(&offset) if offset == handle.offset => {}
            _ => return Err(NetlinkError::UnbalancedAttribute),
        }
        self.open.pop();

        let len = self.buf.len() - handle.offset;
        let len = u16::try_from(len).map_err(|_| {
            NetlinkError::malformed(format!("attribute of {} bytes exceeds u16 length", len))
        })?;
        NativeEndian::write_u16(&mut self.buf[handle.offset..handle.offset + 2], len);
        self.pad();
        Ok(())
    }

    fn pad(&mut self) {
        let target = align(self.buf.len());
        self.buf.resize(target, 0);
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u16(&mut self, value: u16, endian: Endian) {
        let mut b = [0u8; 2];
        match endian {
            Endian::Host => NativeEndian::write_u16(&mut b, value),
            Endian::Network => BigEndian::write_u16(&mut b, value),
        }
        self.buf.extend_from_slice(&b);
    }

    pub fn put_u32(&mut self, value: u32, endian: Endian) {
        let mut b = [0u8; 4];
        match endian {
            Endian::Host => NativeEndian::write_u32(&mut b, value),
            Endian::Network => BigEndian::write_u32(&mut b, value),
        }
        self.buf.extend_from_slice(&b);
    }

    pub fn put_i32(&mut self, value: i32, endian: Endian) {
        self.put_u32(value as u32, endian);
    }

    pub fn put_u64(&mut self, value: u64, endian: Endian) {
        let mut b = [0u8; 8];
        match endian {
            Endian::Host => NativeEndian::write_u64(&mut b, value),
            Endian::Network => BigEndian::write_u64(&mut b, value),
        }
        self.buf.extend_from_slice(&b);
    }

    pub fn put_bytes(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(value);
    }

    pub fn put_zeros(&mut self, count: usize) {
        self.buf.resize(self.buf.len() + count, 0);
    }

    // ------------------------------------------------------------------------
    // Whole-attribute helpers
    // ------------------------------------------------------------------------

    /// Zero-length attribute whose presence is the value.
    pub fn attr_flag(&mut self, kind: u16) -> Result<()> {
        let h = self.begin(kind);
        self.end(h)
    }

    pub fn attr_u8(&mut self, kind: u16, value: u8) -> Result<()> {
        let h = self.begin(kind);
        self.put_u8(value);
        self.end(h)
    }

    pub fn attr_u16(&mut self, kind: u16, value: u16, endian: Endian) -> Result<()> {
        let h = self.begin(kind);
        self.put_u16(value, endian);
        self.end(h)
    }

    pub fn attr_u32(&mut self, kind: u16, value: u32, endian: Endian) -> Result<()> {
        let h = self.begin(kind);
        self.put_u32(value, endian);
        self.end(h)
    }

    pub fn attr_u64(&mut self, kind: u16, value: u64, endian: Endian) -> Result<()> {
        let h = self.begin(kind);
        self.put_u64(value, endian);
        self.end(h)
    }

    pub fn attr_bytes(&mut self, kind: u16, value: &[u8]) -> Result<()> {
        let h = self.begin(kind);
        self.put_bytes(value);
        self.end(h)
    }

    /// NUL-terminated string attribute.
    pub fn attr_str(&mut self, kind: u16, value: &str) -> Result<()> {
        let h = self.begin(kind);
        self.put_bytes(value.as_bytes());
        self.put_u8(0);
        self.end(h)
    }

    /// Open `kind`, let `fill` write its children, then close it.
    pub fn nested<F>(&mut self, kind: u16, fill: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let h = self.begin(kind);
        fill(self)?;
        self.end(h)
    }

    /// View the encoded bytes. Fails while any attribute is still open.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        if !self.open.is_empty() {
            return Err(NetlinkError::UnbalancedAttribute);
        }
        Ok(&self.buf)
    }

    /// Take the encoded bytes. Fails while any attribute is still open.
    pub fn finish(self) -> Result<Vec<u8>> {
        if !self.open.is_empty() {
            return Err(NetlinkError::UnbalancedAttribute);
        }
        Ok(self.buf)
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Borrowed view of one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr<'a> {
    kind: u16,
    value: &'a [u8],
}

impl<'a> Attr<'a> {
    /// Type tag with the nested/byte-order flag bits masked off.
    pub fn kind(&self) -> u16 {
        self.kind & NLA_TYPE_MASK
    }

    pub fn raw_kind(&self) -> u16 {
        self.kind
    }

    /// Unpadded value bytes.
    pub fn value(&self) -> &'a [u8] {
        self.value
    }

    pub fn reader(&self) -> ValueReader<'a> {
        ValueReader::new(self.value)
    }

    /// Iterate the value as a nested attribute stream.
    pub fn nested(&self) -> AttrIter<'a> {
        AttrIter::new(self.value)
    }

    pub fn get_u8(&self) -> Result<u8> {
        self.reader().get_u8()
    }

    pub fn get_u16(&self, endian: Endian) -> Result<u16> {
        self.reader().get_u16(endian)
    }

    pub fn get_u32(&self, endian: Endian) -> Result<u32> {
        self.reader().get_u32(endian)
    }

    pub fn get_i32(&self, endian: Endian) -> Result<i32> {
        self.reader().get_i32(endian)
    }

    pub fn get_u64(&self, endian: Endian) -> Result<u64> {
        self.reader().get_u64(endian)
    }

    /// String value with trailing NULs removed.
    pub fn get_str(&self) -> Result<&'a str> {
        std::str::from_utf8(self.value)
            .map(|s| s.trim_end_matches('\0'))
            .map_err(|e| NetlinkError::malformed(format!("invalid UTF-8 in attribute: {}", e)))
    }
}

/// Restartable iterator over a buffer of attributes.
///
/// Stops after the first malformed attribute.
#[derive(Debug, Clone)]
pub struct AttrIter<'a> {
    buf: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> AttrIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            failed: false,
        }
    }

    /// Start iterating at `offset` into `buf`.
    pub fn at(buf: &'a [u8], offset: usize) -> Self {
        Self {
            buf,
            offset: offset.min(buf.len()),
            failed: false,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    /// Read the next attribute, `Ok(None)` once the buffer is exhausted.
    pub fn next_attr(&mut self) -> Result<Option<Attr<'a>>> {
        if self.failed {
            return Ok(None);
        }
        let rest = &self.buf[self.offset..];
        if rest.is_empty() {
            return Ok(None);
        }
        if rest.len() < NLA_HEADER_LEN {
            self.failed = true;
            return Err(NetlinkError::malformed(format!(
                "truncated attribute header: {} bytes",
                rest.len()
            )));
        }

        let len = NativeEndian::read_u16(&rest[0..2]) as usize;
        let kind = NativeEndian::read_u16(&rest[2..4]);
        if len < NLA_HEADER_LEN || len > rest.len() {
            self.failed = true;
            return Err(NetlinkError::malformed(format!(
                "attribute {} length {} invalid, {} bytes remain",
                kind,
                len,
                rest.len()
            )));
        }

        // The last attribute may legally omit its trailing padding.
        self.offset += align(len).min(rest.len());
        Ok(Some(Attr {
            kind,
            value: &rest[NLA_HEADER_LEN..len],
        }))
    }

    /// First attribute with the given type, skipping the others.
    pub fn find(mut self, kind: u16) -> Result<Option<Attr<'a>>> {
        while let Some(attr) = self.next_attr()? {
            if attr.kind() == kind {
                return Ok(Some(attr));
            }
        }
        Ok(None)
    }
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = Result<Attr<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_attr().transpose()
    }
}

/// Cursor over a value's bytes for fixed-width fields.
#[derive(Debug, Clone)]
pub struct ValueReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ValueReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(NetlinkError::malformed(format!(
                "need {} bytes, {} remain",
                n,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self, endian: Endian) -> Result<u16> {
        let b = self.take(2)?;
        Ok(match endian {
            Endian::Host => NativeEndian::read_u16(b),
            Endian::Network => BigEndian::read_u16(b),
        })
    }

    pub fn get_u32(&mut self, endian: Endian) -> Result<u32> {
        let b = self.take(4)?;
        Ok(match endian {
            Endian::Host => NativeEndian::read_u32(b),
            Endian::Network => BigEndian::read_u32(b),
        })
    }

    pub fn get_i32(&mut self, endian: Endian) -> Result<i32> {
        self.get_u32(endian).map(|v| v as i32)
    }

    pub fn get_u64(&mut self, endian: Endian) -> Result<u64> {
        let b = self.take(8)?;
        Ok(match endian {
            Endian::Host => NativeEndian::read_u64(b),
            Endian::Network => BigEndian::read_u64(b),
        })
    }

    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let b = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(b);
        Ok(out)
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Everything not read yet.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attribute_spans(buf: &[u8]) -> Vec<usize> {
        let mut iter = AttrIter::new(buf);
        let mut spans = Vec::new();
        let mut last = 0;
        while let Some(_) = iter.next_attr().unwrap() {
            spans.push(iter.offset() - last);
            last = iter.offset();
        }
        spans
    }

    #[test]
    fn test_every_attribute_is_aligned() {
        let mut b = AttrBuilder::new();
        b.attr_u8(1, 0xff).unwrap();
        b.attr_u16(2, 0x1234, Endian::Network).unwrap();
        b.attr_str(3, "ovs").unwrap();
        b.attr_u32(4, 7, Endian::Host).unwrap();
        b.attr_bytes(5, &[1, 2, 3, 4, 5]).unwrap();
        b.attr_flag(6).unwrap();
        let bytes = b.finish().unwrap();

        let spans = attribute_spans(&bytes);
        assert_eq!(spans, vec![8, 8, 8, 8, 12, 4]);
        assert!(spans.iter().all(|s| s % 4 == 0));
    }

    #[test]
    fn test_length_field_is_unpadded() {
        let mut b = AttrBuilder::new();
        b.attr_u8(9, 1).unwrap();
        let bytes = b.finish().unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(NativeEndian::read_u16(&bytes[0..2]), 5);
        assert_eq!(NativeEndian::read_u16(&bytes[2..4]), 9);
        assert_eq!(&bytes[5..8], &[0, 0, 0]);
    }

    #[test]
    fn test_nested_length_sums_children() {
        let mut b = AttrBuilder::new();
        let parent = b.begin(1);
        b.attr_u8(2, 7).unwrap();
        b.attr_u16(3, 9, Endian::Host).unwrap();
        b.end(parent).unwrap();
        b.attr_u32(4, 1, Endian::Host).unwrap();
        let bytes = b.finish().unwrap();

        // header + two padded children of 8 bytes each
        assert_eq!(NativeEndian::read_u16(&bytes[0..2]), 20);

        let mut outer = AttrIter::new(&bytes);
        let parent = outer.next_attr().unwrap().unwrap();
        assert_eq!(parent.kind(), 1);
        let children: Vec<_> = parent.nested().map(|a| a.unwrap().kind()).collect();
        assert_eq!(children, vec![2, 3]);
        let sibling = outer.next_attr().unwrap().unwrap();
        assert_eq!(sibling.get_u32(Endian::Host).unwrap(), 1);
        assert!(outer.next_attr().unwrap().is_none());
    }

    #[test]
    fn test_closing_parent_before_child_is_rejected() {
        let mut b = AttrBuilder::new();
        let parent = b.begin(1);
        let _child = b.begin(2);
        assert!(matches!(b.end(parent), Err(NetlinkError::UnbalancedAttribute)));
    }

    #[test]
    fn test_unclosed_attribute_cannot_be_read() {
        let mut b = AttrBuilder::new();
        let h = b.begin(1);
        b.put_u32(5, Endian::Host);
        assert!(matches!(b.as_bytes(), Err(NetlinkError::UnbalancedAttribute)));
        b.end(h).unwrap();
        assert_eq!(b.as_bytes().unwrap().len(), 8);
    }

    #[test]
    fn test_byte_order() {
        let mut b = AttrBuilder::new();
        b.attr_u16(1, 0x0800, Endian::Network).unwrap();
        let bytes = b.finish().unwrap();
        assert_eq!(&bytes[4..6], &[0x08, 0x00]);

        let attr = AttrIter::new(&bytes).next_attr().unwrap().unwrap();
        assert_eq!(attr.get_u16(Endian::Network).unwrap(), 0x0800);
    }

    #[test]
    fn test_length_exceeding_buffer_is_malformed() {
        let mut bytes = vec![0u8; 8];
        NativeEndian::write_u16(&mut bytes[0..2], 32);
        let mut iter = AttrIter::new(&bytes);
        assert!(matches!(iter.next_attr(), Err(NetlinkError::MalformedMessage(_))));
        // the iterator stays stopped
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_short_scalar_is_malformed() {
        let mut b = AttrBuilder::new();
        b.attr_u16(1, 3, Endian::Host).unwrap();
        let bytes = b.finish().unwrap();
        let attr = AttrIter::new(&bytes).next_attr().unwrap().unwrap();
        assert!(matches!(attr.get_u32(Endian::Host), Err(NetlinkError::MalformedMessage(_))));
    }

    #[test]
    fn test_last_attribute_without_padding() {
        let mut b = AttrBuilder::new();
        b.attr_u8(1, 0xaa).unwrap();
        let mut bytes = b.finish().unwrap();
        bytes.truncate(5);
        let mut iter = AttrIter::new(&bytes);
        assert_eq!(iter.next_attr().unwrap().unwrap().get_u8().unwrap(), 0xaa);
        assert!(iter.next_attr().unwrap().is_none());
    }

    #[test]
    fn test_find_and_restart() {
        let mut b = AttrBuilder::new();
        b.attr_u32(1, 10, Endian::Host).unwrap();
        b.attr_str(2, "dp0").unwrap();
        let bytes = b.finish().unwrap();

        let name = AttrIter::new(&bytes).find(2).unwrap().unwrap();
        assert_eq!(name.get_str().unwrap(), "dp0");

        let resumed = AttrIter::at(&bytes, 8).next_attr().unwrap().unwrap();
        assert_eq!(resumed.kind(), 2);
    }

    #[test]
    fn test_value_reader_arrays() {
        let data = [1u8, 2, 3, 4, 5, 6, 0x12, 0x34];
        let mut r = ValueReader::new(&data);
        assert_eq!(r.get_array::<6>().unwrap(), [1, 2, 3, 4, 5, 6]);
        assert_eq!(r.get_u16(Endian::Network).unwrap(), 0x1234);
        assert!(r.is_empty());
        assert!(r.get_u8().is_err());
    }
}
