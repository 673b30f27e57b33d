//! Packets injected through `OVS_PACKET_CMD_EXECUTE`

use op_netlink::{AttrBuilder, Result};
use serde::Serialize;

use crate::family::{OVS_PACKET_ATTR_ACTIONS, OVS_PACKET_ATTR_KEY, OVS_PACKET_ATTR_PACKET};
use crate::flows::{FlowAction, FlowMatch};

/// A frame plus the match describing it and the actions to run on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Packet {
    pub data: Vec<u8>,
    pub flow_match: FlowMatch,
    pub actions: Vec<FlowAction>,
}

impl Packet {
    pub fn new(data: Vec<u8>, flow_match: FlowMatch) -> Self {
        Self {
            data,
            flow_match,
            actions: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: FlowAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn serialize(&self, b: &mut AttrBuilder) -> Result<()> {
        b.attr_bytes(OVS_PACKET_ATTR_PACKET, &self.data)?;
        b.nested(OVS_PACKET_ATTR_KEY, |b| self.flow_match.serialize(b))?;
        b.nested(OVS_PACKET_ATTR_ACTIONS, |b| {
            for action in &self.actions {
                action.serialize(b)?;
            }
            Ok(())
        })
    }
}
