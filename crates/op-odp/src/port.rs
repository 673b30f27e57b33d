//! Datapath ports (`ovs_vport` family)

use op_netlink::{AttrBuilder, AttrIter, Endian, NetlinkError, NetlinkMessage, Result, ValueReader};
use serde::Serialize;

use crate::family::{
    OVS_HEADER_SIZE, OVS_TUNNEL_ATTR_DST_PORT, OVS_VPORT_ATTR_NAME, OVS_VPORT_ATTR_OPTIONS,
    OVS_VPORT_ATTR_PORT_NO, OVS_VPORT_ATTR_STATS, OVS_VPORT_ATTR_TYPE, OVS_VPORT_ATTR_UPCALL_PID,
};

// ============================================================================
// OVS Vport Types
// ============================================================================
pub const OVS_VPORT_TYPE_UNSPEC: u32 = 0;
pub const OVS_VPORT_TYPE_NETDEV: u32 = 1;
pub const OVS_VPORT_TYPE_INTERNAL: u32 = 2;
pub const OVS_VPORT_TYPE_GRE: u32 = 3;
pub const OVS_VPORT_TYPE_VXLAN: u32 = 4;
pub const OVS_VPORT_TYPE_GENEVE: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PortType {
    Unspec,
    Netdev,
    Internal,
    Gre,
    Vxlan,
    Geneve,
    Unknown(u32),
}

impl PortType {
    pub fn from_u32(value: u32) -> Self {
        match value {
            OVS_VPORT_TYPE_UNSPEC => PortType::Unspec,
            OVS_VPORT_TYPE_NETDEV => PortType::Netdev,
            OVS_VPORT_TYPE_INTERNAL => PortType::Internal,
            OVS_VPORT_TYPE_GRE => PortType::Gre,
            OVS_VPORT_TYPE_VXLAN => PortType::Vxlan,
            OVS_VPORT_TYPE_GENEVE => PortType::Geneve,
            unknown => PortType::Unknown(unknown),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            PortType::Unspec => OVS_VPORT_TYPE_UNSPEC,
            PortType::Netdev => OVS_VPORT_TYPE_NETDEV,
            PortType::Internal => OVS_VPORT_TYPE_INTERNAL,
            PortType::Gre => OVS_VPORT_TYPE_GRE,
            PortType::Vxlan => OVS_VPORT_TYPE_VXLAN,
            PortType::Geneve => OVS_VPORT_TYPE_GENEVE,
            PortType::Unknown(v) => v,
        }
    }

    /// Tunnel types carry a UDP destination port option.
    pub fn is_udp_tunnel(self) -> bool {
        matches!(self, PortType::Vxlan | PortType::Geneve)
    }
}

impl std::str::FromStr for PortType {
    type Err = NetlinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "netdev" | "system" => Ok(PortType::Netdev),
            "internal" => Ok(PortType::Internal),
            "gre" => Ok(PortType::Gre),
            "vxlan" => Ok(PortType::Vxlan),
            "geneve" => Ok(PortType::Geneve),
            other => Err(NetlinkError::malformed(format!("unknown port type '{}'", other))),
        }
    }
}

/// How a request names its port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortId {
    Name(String),
    Number(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PortStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Port {
    pub name: String,
    pub port_type: PortType,
    /// Assigned by the kernel when absent on create.
    pub port_no: Option<u32>,
    pub dp_index: u32,
    pub upcall_pid: Option<u32>,
    /// UDP destination port of vxlan/geneve tunnels.
    pub dst_port: Option<u16>,
    pub stats: Option<PortStats>,
}

impl Port {
    pub fn new(name: impl Into<String>, port_type: PortType) -> Self {
        Self {
            name: name.into(),
            port_type,
            port_no: None,
            dp_index: 0,
            upcall_pid: None,
            dst_port: None,
            stats: None,
        }
    }

    pub fn with_upcall_pid(mut self, pid: u32) -> Self {
        self.upcall_pid = Some(pid);
        self
    }

    pub fn with_dst_port(mut self, port: u16) -> Self {
        self.dst_port = Some(port);
        self
    }

    pub fn id(&self) -> PortId {
        match self.port_no {
            Some(no) => PortId::Number(no),
            None => PortId::Name(self.name.clone()),
        }
    }

    /// Attributes for a create request.
    pub fn serialize_new(&self, b: &mut AttrBuilder) -> Result<()> {
        b.attr_u32(OVS_VPORT_ATTR_TYPE, self.port_type.to_u32(), Endian::Host)?;
        b.attr_str(OVS_VPORT_ATTR_NAME, &self.name)?;
        // the kernel requires an upcall pid on create
        b.attr_u32(
            OVS_VPORT_ATTR_UPCALL_PID,
            self.upcall_pid.unwrap_or(0),
            Endian::Host,
        )?;
        if let Some(no) = self.port_no {
            b.attr_u32(OVS_VPORT_ATTR_PORT_NO, no, Endian::Host)?;
        }
        self.serialize_options(b)
    }

    /// Attributes for a set request: identity plus what may change.
    pub fn serialize_set(&self, b: &mut AttrBuilder) -> Result<()> {
        serialize_id(&self.id(), b)?;
        if let Some(pid) = self.upcall_pid {
            b.attr_u32(OVS_VPORT_ATTR_UPCALL_PID, pid, Endian::Host)?;
        }
        self.serialize_options(b)
    }

    fn serialize_options(&self, b: &mut AttrBuilder) -> Result<()> {
        match self.dst_port {
            Some(port) if self.port_type.is_udp_tunnel() => b.nested(OVS_VPORT_ATTR_OPTIONS, |b| {
                b.attr_u16(OVS_TUNNEL_ATTR_DST_PORT, port, Endian::Host)
            }),
            _ => Ok(()),
        }
    }

    /// Decode an `ovs_vport` reply.
    pub fn parse(msg: &NetlinkMessage) -> Result<Self> {
        let dp_index = ValueReader::new(msg.genl_body()?).get_u32(Endian::Host)?;
        let mut port = Port::new(String::new(), PortType::Unspec);
        port.dp_index = dp_index;
        let mut name = None;

        for attr in msg.attrs(OVS_HEADER_SIZE)? {
            let attr = attr?;
            match attr.kind() {
                OVS_VPORT_ATTR_PORT_NO => port.port_no = Some(attr.get_u32(Endian::Host)?),
                OVS_VPORT_ATTR_TYPE => {
                    port.port_type = PortType::from_u32(attr.get_u32(Endian::Host)?)
                }
                OVS_VPORT_ATTR_NAME => name = Some(attr.get_str()?.to_string()),
                OVS_VPORT_ATTR_UPCALL_PID => {
                    // newer kernels send an array of pids; keep the first
                    port.upcall_pid = Some(attr.get_u32(Endian::Host)?)
                }
                OVS_VPORT_ATTR_STATS => {
                    let mut r = attr.reader();
                    port.stats = Some(PortStats {
                        rx_packets: r.get_u64(Endian::Host)?,
                        tx_packets: r.get_u64(Endian::Host)?,
                        rx_bytes: r.get_u64(Endian::Host)?,
                        tx_bytes: r.get_u64(Endian::Host)?,
                        rx_errors: r.get_u64(Endian::Host)?,
                        tx_errors: r.get_u64(Endian::Host)?,
                        rx_dropped: r.get_u64(Endian::Host)?,
                        tx_dropped: r.get_u64(Endian::Host)?,
                    });
                }
                OVS_VPORT_ATTR_OPTIONS => {
                    if let Some(opt) = AttrIter::new(attr.value()).find(OVS_TUNNEL_ATTR_DST_PORT)? {
                        port.dst_port = Some(opt.get_u16(Endian::Host)?);
                    }
                }
                _ => {}
            }
        }

        port.name = name.ok_or_else(|| NetlinkError::malformed("port reply without name"))?;
        Ok(port)
    }
}

/// Write the attribute that identifies a port in get/set/delete requests.
pub fn serialize_id(id: &PortId, b: &mut AttrBuilder) -> Result<()> {
    match id {
        PortId::Name(name) => b.attr_str(OVS_VPORT_ATTR_NAME, name),
        PortId::Number(no) => b.attr_u32(OVS_VPORT_ATTR_PORT_NO, *no, Endian::Host),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::OVS_VPORT_CMD_NEW;
    use op_netlink::MessageBuilder;

    #[test]
    fn test_port_type_conversion() {
        assert!(matches!(PortType::from_u32(2), PortType::Internal));
        assert_eq!(PortType::Vxlan.to_u32(), 4);
        assert_eq!(PortType::from_u32(42), PortType::Unknown(42));
        assert_eq!("geneve".parse::<PortType>().unwrap(), PortType::Geneve);
        assert!("bogus".parse::<PortType>().is_err());
    }

    #[test]
    fn test_reply_round_trip() {
        let port = Port::new("vx0", PortType::Vxlan)
            .with_upcall_pid(77)
            .with_dst_port(4789);

        let mut b = MessageBuilder::genl(25, 0, OVS_VPORT_CMD_NEW, 1);
        b.put_u32(3, Endian::Host);
        port.serialize_new(&mut b).unwrap();
        b.attr_u32(OVS_VPORT_ATTR_PORT_NO, 5, Endian::Host).unwrap();
        let msg = NetlinkMessage::parse(b.build().unwrap().as_bytes()).unwrap();

        let parsed = Port::parse(&msg).unwrap();
        assert_eq!(parsed.name, "vx0");
        assert_eq!(parsed.port_type, PortType::Vxlan);
        assert_eq!(parsed.port_no, Some(5));
        assert_eq!(parsed.dp_index, 3);
        assert_eq!(parsed.upcall_pid, Some(77));
        assert_eq!(parsed.dst_port, Some(4789));
        assert_eq!(parsed.id(), PortId::Number(5));
    }

    #[test]
    fn test_options_only_for_udp_tunnels() {
        let mut b = AttrBuilder::new();
        Port::new("eth0", PortType::Netdev)
            .with_dst_port(4789)
            .serialize_new(&mut b)
            .unwrap();
        let bytes = b.finish().unwrap();
        assert!(AttrIter::new(&bytes)
            .find(OVS_VPORT_ATTR_OPTIONS)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_tunnel_dst_port_wire_layout() {
        let mut b = AttrBuilder::new();
        Port::new("vx0", PortType::Vxlan)
            .with_dst_port(4789)
            .serialize_new(&mut b)
            .unwrap();
        let bytes = b.finish().unwrap();

        let options = AttrIter::new(&bytes)
            .find(OVS_VPORT_ATTR_OPTIONS)
            .unwrap()
            .unwrap();
        let value = options.value();
        // nested header: length 6, tag 1, then the port in host order
        assert_eq!(u16::from_ne_bytes([value[0], value[1]]), 6);
        assert_eq!(u16::from_ne_bytes([value[2], value[3]]), 1);
        assert_eq!(u16::from_ne_bytes([value[4], value[5]]), 4789);
    }
}
