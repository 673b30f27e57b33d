//! Flow action variants (`OVS_ACTION_ATTR_*`)

use op_netlink::{AttrBuilder, AttrIter, Endian, Result, ValueReader};
use serde::Serialize;

use super::key::FlowKey;
use super::registry::{ActionParser, FieldRegistry};

pub const OVS_ACTION_ATTR_OUTPUT: u16 = 1;
pub const OVS_ACTION_ATTR_USERSPACE: u16 = 2;
pub const OVS_ACTION_ATTR_SET: u16 = 3;
pub const OVS_ACTION_ATTR_PUSH_VLAN: u16 = 4;
pub const OVS_ACTION_ATTR_POP_VLAN: u16 = 5;
pub const OVS_ACTION_ATTR_SAMPLE: u16 = 6;

pub const OVS_USERSPACE_ATTR_PID: u16 = 1;
pub const OVS_USERSPACE_ATTR_USERDATA: u16 = 2;

pub const OVS_SAMPLE_ATTR_PROBABILITY: u16 = 1;
pub const OVS_SAMPLE_ATTR_ACTIONS: u16 = 2;

/// 802.1Q tag protocol identifier.
pub const ETH_P_8021Q: u16 = 0x8100;

/// One action applied to matched packets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum FlowAction {
    /// Send to a datapath port.
    Output(u32),
    /// Send to userspace through netlink port `pid`.
    Userspace { pid: u32, userdata: Option<u64> },
    /// Rewrite one header field.
    Set(FlowKey),
    PushVlan { tpid: u16, tci: u16 },
    PopVlan,
    /// Run `actions` with probability `probability / u32::MAX`.
    Sample {
        probability: u32,
        actions: Vec<FlowAction>,
    },
}

impl FlowAction {
    pub fn output(port_no: u32) -> Self {
        FlowAction::Output(port_no)
    }

    pub fn userspace(pid: u32) -> Self {
        FlowAction::Userspace {
            pid,
            userdata: None,
        }
    }

    /// Push an 802.1Q tag with the CFI bit set, as the kernel requires.
    pub fn push_vlan(tci: u16) -> Self {
        FlowAction::PushVlan {
            tpid: ETH_P_8021Q,
            tci: tci | 0x1000,
        }
    }

    pub fn tag(&self) -> u16 {
        match self {
            FlowAction::Output(_) => OVS_ACTION_ATTR_OUTPUT,
            FlowAction::Userspace { .. } => OVS_ACTION_ATTR_USERSPACE,
            FlowAction::Set(_) => OVS_ACTION_ATTR_SET,
            FlowAction::PushVlan { .. } => OVS_ACTION_ATTR_PUSH_VLAN,
            FlowAction::PopVlan => OVS_ACTION_ATTR_POP_VLAN,
            FlowAction::Sample { .. } => OVS_ACTION_ATTR_SAMPLE,
        }
    }

    pub fn serialize(&self, b: &mut AttrBuilder) -> Result<()> {
        let tag = self.tag();
        match self {
            FlowAction::Output(port) => b.attr_u32(tag, *port, Endian::Host),
            FlowAction::Userspace { pid, userdata } => b.nested(tag, |b| {
                b.attr_u32(OVS_USERSPACE_ATTR_PID, *pid, Endian::Host)?;
                if let Some(data) = userdata {
                    b.attr_u64(OVS_USERSPACE_ATTR_USERDATA, *data, Endian::Host)?;
                }
                Ok(())
            }),
            FlowAction::Set(key) => b.nested(tag, |b| key.serialize(b)),
            FlowAction::PushVlan { tpid, tci } => {
                let h = b.begin(tag);
                b.put_u16(*tpid, Endian::Network);
                b.put_u16(*tci, Endian::Network);
                b.end(h)
            }
            FlowAction::PopVlan => b.attr_flag(tag),
            FlowAction::Sample {
                probability,
                actions,
            } => b.nested(tag, |b| {
                b.attr_u32(OVS_SAMPLE_ATTR_PROBABILITY, *probability, Endian::Host)?;
                b.nested(OVS_SAMPLE_ATTR_ACTIONS, |b| {
                    for action in actions {
                        action.serialize(b)?;
                    }
                    Ok(())
                })
            }),
        }
    }
}

pub(crate) const ACTION_PARSERS: &[(u16, ActionParser)] = &[
    (OVS_ACTION_ATTR_OUTPUT, parse_output),
    (OVS_ACTION_ATTR_USERSPACE, parse_userspace),
    (OVS_ACTION_ATTR_SET, parse_set),
    (OVS_ACTION_ATTR_PUSH_VLAN, parse_push_vlan),
    (OVS_ACTION_ATTR_POP_VLAN, parse_pop_vlan),
    (OVS_ACTION_ATTR_SAMPLE, parse_sample),
];

fn parse_output(_: &FieldRegistry, buf: &[u8]) -> Option<FlowAction> {
    ValueReader::new(buf)
        .get_u32(Endian::Host)
        .ok()
        .map(FlowAction::Output)
}

fn parse_userspace(_: &FieldRegistry, buf: &[u8]) -> Option<FlowAction> {
    let mut pid = None;
    let mut userdata = None;
    for attr in AttrIter::new(buf) {
        let attr = attr.ok()?;
        match attr.kind() {
            OVS_USERSPACE_ATTR_PID => pid = Some(attr.get_u32(Endian::Host).ok()?),
            OVS_USERSPACE_ATTR_USERDATA => userdata = Some(attr.get_u64(Endian::Host).ok()?),
            _ => {}
        }
    }
    Some(FlowAction::Userspace {
        pid: pid?,
        userdata,
    })
}

fn parse_set(registry: &FieldRegistry, buf: &[u8]) -> Option<FlowAction> {
    let attr = AttrIter::new(buf).next()?.ok()?;
    registry.decode_key(&attr).value().map(FlowAction::Set)
}

fn parse_push_vlan(_: &FieldRegistry, buf: &[u8]) -> Option<FlowAction> {
    let mut r = ValueReader::new(buf);
    Some(FlowAction::PushVlan {
        tpid: r.get_u16(Endian::Network).ok()?,
        tci: r.get_u16(Endian::Network).ok()?,
    })
}

fn parse_pop_vlan(_: &FieldRegistry, _: &[u8]) -> Option<FlowAction> {
    Some(FlowAction::PopVlan)
}

fn parse_sample(registry: &FieldRegistry, buf: &[u8]) -> Option<FlowAction> {
    let mut probability = None;
    let mut actions = None;
    for attr in AttrIter::new(buf) {
        let attr = attr.ok()?;
        match attr.kind() {
            OVS_SAMPLE_ATTR_PROBABILITY => {
                probability = Some(attr.get_u32(Endian::Host).ok()?)
            }
            OVS_SAMPLE_ATTR_ACTIONS => {
                let inner = registry.decode_actions(attr.value());
                if !inner.is_complete() {
                    return None;
                }
                actions = Some(inner.items);
            }
            _ => {}
        }
    }
    Some(FlowAction::Sample {
        probability: probability?,
        actions: actions.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::key::{FlowKey, OVS_KEY_ATTR_ETHERNET};

    fn encode(action: &FlowAction) -> Vec<u8> {
        let mut b = AttrBuilder::new();
        action.serialize(&mut b).unwrap();
        b.finish().unwrap()
    }

    fn decode(bytes: &[u8]) -> Option<FlowAction> {
        let attr = AttrIter::new(bytes).next().unwrap().unwrap();
        FieldRegistry::default().decode_action(&attr).value()
    }

    #[test]
    fn test_every_variant_decodes_to_itself() {
        let actions = vec![
            FlowAction::output(0),
            FlowAction::output(u32::MAX),
            FlowAction::userspace(0x2789),
            FlowAction::Userspace {
                pid: 1,
                userdata: Some(u64::MAX),
            },
            FlowAction::Set(FlowKey::ethernet([1; 6], [2; 6])),
            FlowAction::push_vlan(100),
            FlowAction::PopVlan,
            FlowAction::Sample {
                probability: u32::MAX / 2,
                actions: vec![FlowAction::userspace(9), FlowAction::output(3)],
            },
        ];
        for action in actions {
            let bytes = encode(&action);
            assert_eq!(bytes.len() % 4, 0);
            assert_eq!(decode(&bytes), Some(action));
        }
    }

    #[test]
    fn test_zero_and_max_fields_decode_to_themselves() {
        let mut actions = Vec::new();
        for (b16, b32, b64) in [(0u16, 0u32, 0u64), (u16::MAX, u32::MAX, u64::MAX)] {
            actions.extend([
                FlowAction::Output(b32),
                FlowAction::Userspace {
                    pid: b32,
                    userdata: Some(b64),
                },
                FlowAction::Set(FlowKey::SkbMark(b32)),
                FlowAction::PushVlan { tpid: b16, tci: b16 },
                FlowAction::PopVlan,
                FlowAction::Sample {
                    probability: b32,
                    actions: vec![FlowAction::Output(b32)],
                },
                FlowAction::Sample {
                    probability: b32,
                    actions: Vec::new(),
                },
            ]);
        }
        for (tag, _) in ACTION_PARSERS {
            assert!(actions.iter().any(|a| a.tag() == *tag), "tag {}", tag);
        }
        for action in actions {
            let bytes = encode(&action);
            assert_eq!(decode(&bytes), Some(action));
        }
    }

    #[test]
    fn test_push_vlan_wire_layout() {
        let bytes = encode(&FlowAction::push_vlan(5));
        assert_eq!(&bytes[4..8], &[0x81, 0x00, 0x10, 0x05]);
    }

    #[test]
    fn test_pop_vlan_is_empty() {
        assert_eq!(encode(&FlowAction::PopVlan).len(), 4);
    }

    #[test]
    fn test_set_nests_one_key() {
        let bytes = encode(&FlowAction::Set(FlowKey::ethernet([0; 6], [0; 6])));
        let outer = AttrIter::new(&bytes).next().unwrap().unwrap();
        let inner = outer.nested().next().unwrap().unwrap();
        assert_eq!(inner.kind(), OVS_KEY_ATTR_ETHERNET);
        assert_eq!(inner.value().len(), 12);
    }

    #[test]
    fn test_userspace_without_pid_fails() {
        let mut b = AttrBuilder::new();
        b.nested(OVS_ACTION_ATTR_USERSPACE, |b| {
            b.attr_u64(OVS_USERSPACE_ATTR_USERDATA, 1, Endian::Host)
        })
        .unwrap();
        assert_eq!(decode(&b.finish().unwrap()), None);
    }
}
