//! Tag-to-parser dispatch for flow keys and flow actions
//!
//! Built once at startup and shared (usually behind an `Arc`) by every
//! connection that decodes flows. Key tags and action tags live in separate
//! tables because their numbering overlaps.

use std::collections::HashMap;

use op_netlink::{Attr, AttrIter, NetlinkError, Result};
use tracing::warn;

use super::action::{FlowAction, ACTION_PARSERS};
use super::key::{FlowKey, KEY_PARSERS};

/// Parses one key attribute value; `None` when the bytes are short or hold
/// an invalid enumerated value.
pub type KeyParser = fn(&FieldRegistry, &[u8]) -> Option<FlowKey>;

/// Parses one action attribute value.
pub type ActionParser = fn(&FieldRegistry, &[u8]) -> Option<FlowAction>;

/// Outcome of decoding a single attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    Value(T),
    /// No parser registered for the tag.
    Unsupported(u16),
    /// A parser exists but rejected the bytes.
    Invalid(u16),
}

impl<T> Decoded<T> {
    pub fn value(self) -> Option<T> {
        match self {
            Decoded::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Strict form: unknown tags become `UnsupportedVariant`.
    pub fn into_result(self) -> Result<T> {
        match self {
            Decoded::Value(v) => Ok(v),
            Decoded::Unsupported(tag) => Err(NetlinkError::UnsupportedVariant(tag)),
            Decoded::Invalid(tag) => Err(NetlinkError::malformed(format!(
                "undecodable flow attribute {}",
                tag
            ))),
        }
    }
}

/// Variants decoded from a buffer of attributes, plus what was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedSet<T> {
    pub items: Vec<T>,
    pub unsupported: Vec<u16>,
    pub invalid: Vec<u16>,
    /// A malformed attribute header stopped decoding early.
    pub truncated: bool,
}

impl<T> Default for DecodedSet<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            unsupported: Vec::new(),
            invalid: Vec::new(),
            truncated: false,
        }
    }
}

impl<T> DecodedSet<T> {
    /// Nothing was dropped except unknown tags.
    pub fn is_complete(&self) -> bool {
        self.invalid.is_empty() && !self.truncated
    }

    /// Every item, or an error naming the first thing that was dropped.
    pub fn into_result(self) -> Result<Vec<T>> {
        if self.truncated {
            return Err(NetlinkError::malformed("truncated flow attribute list"));
        }
        if let Some(tag) = self.invalid.first() {
            return Err(NetlinkError::malformed(format!(
                "undecodable flow attribute {}",
                tag
            )));
        }
        match self.unsupported.first() {
            Some(tag) => Err(NetlinkError::UnsupportedVariant(*tag)),
            None => Ok(self.items),
        }
    }
}

#[derive(Clone)]
pub struct FieldRegistry {
    keys: HashMap<u16, KeyParser>,
    actions: HashMap<u16, ActionParser>,
}

impl Default for FieldRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for FieldRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.keys.keys().collect();
        let mut actions: Vec<_> = self.actions.keys().collect();
        keys.sort();
        actions.sort();
        f.debug_struct("FieldRegistry")
            .field("keys", &keys)
            .field("actions", &actions)
            .finish()
    }
}

impl FieldRegistry {
    /// Registry with no parsers.
    pub fn empty() -> Self {
        Self {
            keys: HashMap::new(),
            actions: HashMap::new(),
        }
    }

    /// Registry holding every built-in key and action variant.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        for (tag, parser) in KEY_PARSERS {
            registry.register_key(*tag, *parser);
        }
        for (tag, parser) in ACTION_PARSERS {
            registry.register_action(*tag, *parser);
        }
        registry
    }

    /// Add or replace the parser for a key tag.
    pub fn register_key(&mut self, tag: u16, parser: KeyParser) {
        self.keys.insert(tag, parser);
    }

    pub fn register_action(&mut self, tag: u16, parser: ActionParser) {
        self.actions.insert(tag, parser);
    }

    pub fn supports_key(&self, tag: u16) -> bool {
        self.keys.contains_key(&tag)
    }

    pub fn supports_action(&self, tag: u16) -> bool {
        self.actions.contains_key(&tag)
    }

    pub fn decode_key(&self, attr: &Attr<'_>) -> Decoded<FlowKey> {
        let tag = attr.kind();
        match self.keys.get(&tag) {
            None => Decoded::Unsupported(tag),
            Some(parse) => match parse(self, attr.value()) {
                Some(key) => Decoded::Value(key),
                None => Decoded::Invalid(tag),
            },
        }
    }

    pub fn decode_action(&self, attr: &Attr<'_>) -> Decoded<FlowAction> {
        let tag = attr.kind();
        match self.actions.get(&tag) {
            None => Decoded::Unsupported(tag),
            Some(parse) => match parse(self, attr.value()) {
                Some(action) => Decoded::Value(action),
                None => Decoded::Invalid(tag),
            },
        }
    }

    /// Decode a buffer of key attributes, skipping what can't be parsed.
    pub fn decode_keys(&self, buf: &[u8]) -> DecodedSet<FlowKey> {
        self.decode_all(buf, "key", |attr| self.decode_key(attr))
    }

    /// Decode a buffer of action attributes, skipping what can't be parsed.
    pub fn decode_actions(&self, buf: &[u8]) -> DecodedSet<FlowAction> {
        self.decode_all(buf, "action", |attr| self.decode_action(attr))
    }

    fn decode_all<T, F>(&self, buf: &[u8], what: &'static str, decode: F) -> DecodedSet<T>
    where
        F: Fn(&Attr<'_>) -> Decoded<T>,
    {
        let mut set = DecodedSet::default();
        for attr in AttrIter::new(buf) {
            let attr = match attr {
                Ok(attr) => attr,
                Err(e) => {
                    warn!(what, error = %e, "Stopped decoding malformed attribute list");
                    set.truncated = true;
                    break;
                }
            };
            match decode(&attr) {
                Decoded::Value(v) => set.items.push(v),
                Decoded::Unsupported(tag) => {
                    warn!(what, tag, "Skipping unsupported flow attribute");
                    set.unsupported.push(tag);
                }
                Decoded::Invalid(tag) => {
                    warn!(what, tag, len = attr.value().len(), "Skipping undecodable flow attribute");
                    set.invalid.push(tag);
                }
            }
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::key::{OVS_KEY_ATTR_IN_PORT, OVS_KEY_ATTR_IPV4};
    use op_netlink::{AttrBuilder, Endian};

    #[test]
    fn test_unknown_tags_are_skipped() {
        let mut b = AttrBuilder::new();
        b.attr_u32(OVS_KEY_ATTR_IN_PORT, 4, Endian::Host).unwrap();
        b.attr_u32(31, 0xdead, Endian::Host).unwrap();
        FlowKey::udp(1, 2).serialize(&mut b).unwrap();
        let bytes = b.finish().unwrap();

        let set = FieldRegistry::default().decode_keys(&bytes);
        assert_eq!(set.items, vec![FlowKey::InPort(4), FlowKey::udp(1, 2)]);
        assert_eq!(set.unsupported, vec![31]);
        assert!(set.is_complete());
    }

    #[test]
    fn test_invalid_variant_marks_set_incomplete() {
        let mut b = AttrBuilder::new();
        b.attr_bytes(OVS_KEY_ATTR_IPV4, &[1, 2, 3]).unwrap();
        FlowKey::InPort(1).serialize(&mut b).unwrap();
        let set = FieldRegistry::default().decode_keys(&b.finish().unwrap());
        assert_eq!(set.items, vec![FlowKey::InPort(1)]);
        assert_eq!(set.invalid, vec![OVS_KEY_ATTR_IPV4]);
        assert!(!set.is_complete());
    }

    #[test]
    fn test_malformed_header_stops_decoding() {
        let mut b = AttrBuilder::new();
        FlowKey::InPort(1).serialize(&mut b).unwrap();
        let mut bytes = b.finish().unwrap();
        bytes.extend_from_slice(&[0x40, 0x00, 0x03, 0x00]);
        let set = FieldRegistry::default().decode_keys(&bytes);
        assert_eq!(set.items.len(), 1);
        assert!(set.truncated);
    }

    #[test]
    fn test_strict_decode_raises_unsupported_variant() {
        let mut b = AttrBuilder::new();
        FlowKey::InPort(7).serialize(&mut b).unwrap();
        b.attr_u32(31, 0xdead, Endian::Host).unwrap();
        let bytes = b.finish().unwrap();
        let registry = FieldRegistry::default();

        let err = registry.decode_keys(&bytes).into_result().unwrap_err();
        assert!(matches!(err, NetlinkError::UnsupportedVariant(31)));

        let mut attrs = AttrIter::new(&bytes);
        let first = attrs.next().unwrap().unwrap();
        assert_eq!(registry.decode_key(&first).into_result().unwrap(), FlowKey::InPort(7));
        let second = attrs.next().unwrap().unwrap();
        assert!(matches!(
            registry.decode_action(&second).into_result(),
            Err(NetlinkError::UnsupportedVariant(31))
        ));
    }

    #[test]
    fn test_strict_decode_prefers_invalid_over_unsupported() {
        let mut b = AttrBuilder::new();
        b.attr_u32(31, 0, Endian::Host).unwrap();
        b.attr_bytes(OVS_KEY_ATTR_IPV4, &[1, 2, 3]).unwrap();
        let set = FieldRegistry::default().decode_keys(&b.finish().unwrap());
        assert!(matches!(set.into_result(), Err(NetlinkError::MalformedMessage(_))));
    }

    #[test]
    fn test_empty_registry_supports_nothing() {
        let mut registry = FieldRegistry::empty();
        let mut b = AttrBuilder::new();
        FlowKey::InPort(1).serialize(&mut b).unwrap();
        let bytes = b.finish().unwrap();
        assert_eq!(registry.decode_keys(&bytes).unsupported, vec![OVS_KEY_ATTR_IN_PORT]);

        fn constant(_: &FieldRegistry, _: &[u8]) -> Option<FlowKey> {
            Some(FlowKey::InPort(42))
        }
        registry.register_key(OVS_KEY_ATTR_IN_PORT, constant);
        assert!(registry.supports_key(OVS_KEY_ATTR_IN_PORT));
        assert_eq!(registry.decode_keys(&bytes).items, vec![FlowKey::InPort(42)]);
    }

    #[test]
    fn test_key_and_action_tags_are_separate() {
        let registry = FieldRegistry::default();
        // tag 1 is ENCAP as a key and OUTPUT as an action
        let mut b = AttrBuilder::new();
        b.attr_u32(1, 3, Endian::Host).unwrap();
        let bytes = b.finish().unwrap();
        assert_eq!(
            registry.decode_actions(&bytes).items,
            vec![FlowAction::Output(3)]
        );
        assert!(registry.supports_key(1) && registry.supports_action(1));
    }
}
