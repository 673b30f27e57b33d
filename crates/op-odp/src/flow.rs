//! Kernel flows: match, actions and counters

use op_netlink::{AttrBuilder, Endian, NetlinkError, NetlinkMessage, Result, ValueReader};
use serde::Serialize;

use crate::family::{
    OVS_FLOW_ATTR_ACTIONS, OVS_FLOW_ATTR_KEY, OVS_FLOW_ATTR_STATS, OVS_FLOW_ATTR_TCP_FLAGS,
    OVS_FLOW_ATTR_USED, OVS_HEADER_SIZE,
};
use crate::flows::{FieldRegistry, FlowAction, FlowMatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FlowStats {
    pub n_packets: u64,
    pub n_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Flow {
    pub flow_match: FlowMatch,
    pub actions: Vec<FlowAction>,
    pub stats: Option<FlowStats>,
    /// Union of TCP flags seen on the flow.
    pub tcp_flags: Option<u8>,
    /// Last use in milliseconds of kernel monotonic time.
    pub last_used: Option<u64>,
    /// Some keys or actions in the kernel's reply could not be decoded.
    pub incomplete: bool,
}

impl Flow {
    pub fn new(flow_match: FlowMatch) -> Self {
        Self {
            flow_match,
            ..Default::default()
        }
    }

    pub fn with_action(mut self, action: FlowAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_actions(mut self, actions: impl IntoIterator<Item = FlowAction>) -> Self {
        self.actions.extend(actions);
        self
    }

    /// Write the KEY attribute.
    pub fn serialize_match(flow_match: &FlowMatch, b: &mut AttrBuilder) -> Result<()> {
        b.nested(OVS_FLOW_ATTR_KEY, |b| flow_match.serialize(b))
    }

    /// Write the ACTIONS attribute. An empty list is a drop flow.
    pub fn serialize_actions(actions: &[FlowAction], b: &mut AttrBuilder) -> Result<()> {
        b.nested(OVS_FLOW_ATTR_ACTIONS, |b| {
            for action in actions {
                action.serialize(b)?;
            }
            Ok(())
        })
    }

    /// Decode an `ovs_flow` reply.
    pub fn parse(msg: &NetlinkMessage, registry: &FieldRegistry) -> Result<Self> {
        let mut flow = Flow::default();
        let mut has_key = false;

        for attr in msg.attrs(OVS_HEADER_SIZE)? {
            let attr = attr?;
            match attr.kind() {
                OVS_FLOW_ATTR_KEY => {
                    has_key = true;
                    let keys = registry.decode_keys(attr.value());
                    flow.incomplete |= !keys.is_complete();
                    flow.flow_match = keys.items.into_iter().collect();
                }
                OVS_FLOW_ATTR_ACTIONS => {
                    let actions = registry.decode_actions(attr.value());
                    flow.incomplete |= !actions.is_complete();
                    flow.actions = actions.items;
                }
                OVS_FLOW_ATTR_STATS => {
                    let mut r = ValueReader::new(attr.value());
                    flow.stats = Some(FlowStats {
                        n_packets: r.get_u64(Endian::Host)?,
                        n_bytes: r.get_u64(Endian::Host)?,
                    });
                }
                OVS_FLOW_ATTR_TCP_FLAGS => flow.tcp_flags = Some(attr.get_u8()?),
                OVS_FLOW_ATTR_USED => flow.last_used = Some(attr.get_u64(Endian::Host)?),
                _ => {}
            }
        }

        if !has_key {
            return Err(NetlinkError::malformed("flow reply without key"));
        }
        Ok(flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::OVS_FLOW_CMD_NEW;
    use crate::flows::key::OVS_KEY_ATTR_IPV4;
    use crate::flows::FlowKey;
    use op_netlink::MessageBuilder;

    fn reply(fill: impl FnOnce(&mut MessageBuilder)) -> NetlinkMessage {
        let mut b = MessageBuilder::genl(27, 0, OVS_FLOW_CMD_NEW, 1);
        b.put_u32(3, Endian::Host);
        fill(&mut b);
        NetlinkMessage::parse(b.build().unwrap().as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_full_flow() {
        let m: FlowMatch = [FlowKey::InPort(2), FlowKey::Ethertype(0x0806)]
            .into_iter()
            .collect();
        let actions = vec![FlowAction::output(1), FlowAction::PopVlan];
        let msg = reply(|b| {
            Flow::serialize_match(&m, b).unwrap();
            Flow::serialize_actions(&actions, b).unwrap();
            let h = b.begin(OVS_FLOW_ATTR_STATS);
            b.put_u64(10, Endian::Host);
            b.put_u64(1500, Endian::Host);
            b.end(h).unwrap();
            b.attr_u8(OVS_FLOW_ATTR_TCP_FLAGS, 0x12).unwrap();
            b.attr_u64(OVS_FLOW_ATTR_USED, 123456, Endian::Host).unwrap();
        });

        let flow = Flow::parse(&msg, &FieldRegistry::default()).unwrap();
        assert_eq!(flow.flow_match, m);
        assert_eq!(flow.actions, actions);
        assert_eq!(
            flow.stats,
            Some(FlowStats {
                n_packets: 10,
                n_bytes: 1500
            })
        );
        assert_eq!(flow.tcp_flags, Some(0x12));
        assert_eq!(flow.last_used, Some(123456));
        assert!(!flow.incomplete);
    }

    #[test]
    fn test_bad_key_marks_flow_incomplete() {
        let msg = reply(|b| {
            b.nested(OVS_FLOW_ATTR_KEY, |b| {
                FlowKey::InPort(2).serialize(b)?;
                b.attr_bytes(OVS_KEY_ATTR_IPV4, &[0; 4])
            })
            .unwrap();
            Flow::serialize_actions(&[], b).unwrap();
        });
        let flow = Flow::parse(&msg, &FieldRegistry::default()).unwrap();
        assert!(flow.incomplete);
        assert_eq!(flow.flow_match.keys(), &[FlowKey::InPort(2)]);
        assert!(flow.actions.is_empty());
    }

    #[test]
    fn test_reply_without_key_is_malformed() {
        let msg = reply(|b| Flow::serialize_actions(&[], b).unwrap());
        assert!(matches!(
            Flow::parse(&msg, &FieldRegistry::default()),
            Err(NetlinkError::MalformedMessage(_))
        ));
    }
}
