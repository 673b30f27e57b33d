//! Open vSwitch Generic Netlink families
//!
//! Command and attribute numbers from `include/uapi/linux/openvswitch.h`.

use op_netlink::{ConnectionHandle, Endian, Family, MessageBuilder, Result};

// ============================================================================
// OVS Netlink Family Names
// ============================================================================
pub const OVS_DATAPATH_FAMILY: &str = "ovs_datapath";
pub const OVS_VPORT_FAMILY: &str = "ovs_vport";
pub const OVS_FLOW_FAMILY: &str = "ovs_flow";
pub const OVS_PACKET_FAMILY: &str = "ovs_packet";

/// Families resolved during bring-up.
pub const REQUIRED_FAMILIES: [&str; 4] = [
    OVS_DATAPATH_FAMILY,
    OVS_VPORT_FAMILY,
    OVS_FLOW_FAMILY,
    OVS_PACKET_FAMILY,
];

/// Size of `struct ovs_header` (dp_ifindex).
pub const OVS_HEADER_SIZE: usize = 4;

// ============================================================================
// OVS Datapath
// ============================================================================
pub const OVS_DP_CMD_NEW: u8 = 1;
pub const OVS_DP_CMD_DEL: u8 = 2;
pub const OVS_DP_CMD_GET: u8 = 3;
pub const OVS_DP_CMD_SET: u8 = 4;

pub const OVS_DP_ATTR_NAME: u16 = 1;
pub const OVS_DP_ATTR_UPCALL_PID: u16 = 2;
pub const OVS_DP_ATTR_STATS: u16 = 3;
pub const OVS_DP_ATTR_MEGAFLOW_STATS: u16 = 4;
pub const OVS_DP_ATTR_USER_FEATURES: u16 = 5;

// ============================================================================
// OVS Vport
// ============================================================================
pub const OVS_VPORT_CMD_NEW: u8 = 1;
pub const OVS_VPORT_CMD_DEL: u8 = 2;
pub const OVS_VPORT_CMD_GET: u8 = 3;
pub const OVS_VPORT_CMD_SET: u8 = 4;

pub const OVS_VPORT_ATTR_PORT_NO: u16 = 1;
pub const OVS_VPORT_ATTR_TYPE: u16 = 2;
pub const OVS_VPORT_ATTR_NAME: u16 = 3;
pub const OVS_VPORT_ATTR_OPTIONS: u16 = 4;
pub const OVS_VPORT_ATTR_UPCALL_PID: u16 = 5;
pub const OVS_VPORT_ATTR_STATS: u16 = 6;

pub const OVS_TUNNEL_ATTR_DST_PORT: u16 = 1;

// ============================================================================
// OVS Flow
// ============================================================================
pub const OVS_FLOW_CMD_NEW: u8 = 1;
pub const OVS_FLOW_CMD_DEL: u8 = 2;
pub const OVS_FLOW_CMD_GET: u8 = 3;
pub const OVS_FLOW_CMD_SET: u8 = 4;

pub const OVS_FLOW_ATTR_KEY: u16 = 1;
pub const OVS_FLOW_ATTR_ACTIONS: u16 = 2;
pub const OVS_FLOW_ATTR_STATS: u16 = 3;
pub const OVS_FLOW_ATTR_TCP_FLAGS: u16 = 4;
pub const OVS_FLOW_ATTR_USED: u16 = 5;
pub const OVS_FLOW_ATTR_CLEAR: u16 = 6;

// ============================================================================
// OVS Packet
// ============================================================================
pub const OVS_PACKET_CMD_EXECUTE: u8 = 3;

pub const OVS_PACKET_ATTR_PACKET: u16 = 1;
pub const OVS_PACKET_ATTR_KEY: u16 = 2;
pub const OVS_PACKET_ATTR_ACTIONS: u16 = 3;

/// The four OVS families as resolved on one connection.
#[derive(Debug, Clone)]
pub struct OvsFamilies {
    pub datapath: Family,
    pub vport: Family,
    pub flow: Family,
    pub packet: Family,
}

impl OvsFamilies {
    /// Fails with `NotInitialized` until bring-up resolved all of them.
    pub fn from_handle(handle: &ConnectionHandle) -> Result<Self> {
        Ok(Self {
            datapath: handle.family(OVS_DATAPATH_FAMILY)?,
            vport: handle.family(OVS_VPORT_FAMILY)?,
            flow: handle.family(OVS_FLOW_FAMILY)?,
            packet: handle.family(OVS_PACKET_FAMILY)?,
        })
    }
}

/// Start an OVS request: generic header at the family's version followed
/// by `struct ovs_header`.
pub fn ovs_request(family: &Family, flags: u16, command: u8, dp_ifindex: u32) -> MessageBuilder {
    let mut builder = family.request(flags, command);
    builder.put_u32(dp_ifindex, Endian::Host);
    builder
}

#[cfg(test)]
mod tests {
    use super::*;
    use op_netlink::message::{GENL_HDRLEN, NLMSG_HDRLEN, NLM_F_REQUEST};
    use std::collections::BTreeMap;

    #[test]
    fn test_ovs_request_layout() {
        let family = Family {
            name: OVS_FLOW_FAMILY.to_string(),
            id: 27,
            version: 1,
            header_size: 4,
            max_attr: 8,
            commands: BTreeMap::new(),
            multicast_groups: BTreeMap::new(),
        };
        let msg = ovs_request(&family, NLM_F_REQUEST, OVS_FLOW_CMD_GET, 7)
            .build()
            .unwrap();
        let bytes = msg.as_bytes();
        assert_eq!(bytes.len(), NLMSG_HDRLEN + GENL_HDRLEN + OVS_HEADER_SIZE);
        assert_eq!(msg.header().message_type, 27);
        assert_eq!(bytes[NLMSG_HDRLEN], OVS_FLOW_CMD_GET);
        assert_eq!(bytes[NLMSG_HDRLEN + 1], 1);
        assert_eq!(
            u32::from_ne_bytes(bytes[20..24].try_into().unwrap()),
            7
        );
    }
}
