//! Flow keys, flow actions and the registry that decodes them

pub mod action;
pub mod key;
pub mod registry;

use std::hash::{Hash, Hasher};

use op_netlink::{AttrBuilder, Result};
use serde::Serialize;

pub use action::FlowAction;
pub use key::{FlowKey, FragType, KeyArp, KeyEthernet, KeyIcmp, KeyIpv4, KeyIpv6, KeyNd, KeyPorts};
pub use registry::{Decoded, DecodedSet, FieldRegistry};

/// IP protocol numbers used in IPv4/IPv6 keys.
pub struct IpProtocol;

impl IpProtocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const ICMPV6: u8 = 58;
}

/// The set of keys a flow matches on.
///
/// Keys are deduplicated on insertion and two matches are equal when they
/// hold the same keys in any order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlowMatch {
    keys: Vec<FlowKey>,
}

impl FlowMatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key. Returns false if an equal key was already present.
    pub fn add_key(&mut self, key: FlowKey) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        self.keys.push(key);
        true
    }

    pub fn with_key(mut self, key: FlowKey) -> Self {
        self.add_key(key);
        self
    }

    pub fn keys(&self) -> &[FlowKey] {
        &self.keys
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Write every key as a sibling attribute into the open builder.
    pub fn serialize(&self, b: &mut AttrBuilder) -> Result<()> {
        for key in &self.keys {
            key.serialize(b)?;
        }
        Ok(())
    }

    fn sorted(&self) -> Vec<&FlowKey> {
        let mut keys: Vec<&FlowKey> = self.keys.iter().collect();
        keys.sort();
        keys
    }
}

impl FromIterator<FlowKey> for FlowMatch {
    fn from_iter<I: IntoIterator<Item = FlowKey>>(iter: I) -> Self {
        let mut m = FlowMatch::new();
        for key in iter {
            m.add_key(key);
        }
        m
    }
}

impl PartialEq for FlowMatch {
    fn eq(&self, other: &Self) -> bool {
        self.keys.len() == other.keys.len() && self.keys.iter().all(|k| other.keys.contains(k))
    }
}

impl Eq for FlowMatch {}

impl Hash for FlowMatch {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sorted().hash(state);
    }
}
