//! Flow key variants (`OVS_KEY_ATTR_*`)
//!
//! Every variant owns fixed-width fields laid out as the kernel's
//! `struct ovs_key_*`. Fields the kernel declares `__be*` travel in network
//! byte order; the rest are host order.

use std::net::{Ipv4Addr, Ipv6Addr};

use op_netlink::{AttrBuilder, Endian, Result, ValueReader};
use serde::Serialize;

use super::registry::{FieldRegistry, KeyParser};

// ============================================================================
// OVS Key Attributes
// ============================================================================
pub const OVS_KEY_ATTR_ENCAP: u16 = 1;
pub const OVS_KEY_ATTR_PRIORITY: u16 = 2;
pub const OVS_KEY_ATTR_IN_PORT: u16 = 3;
pub const OVS_KEY_ATTR_ETHERNET: u16 = 4;
pub const OVS_KEY_ATTR_VLAN: u16 = 5;
pub const OVS_KEY_ATTR_ETHERTYPE: u16 = 6;
pub const OVS_KEY_ATTR_IPV4: u16 = 7;
pub const OVS_KEY_ATTR_IPV6: u16 = 8;
pub const OVS_KEY_ATTR_TCP: u16 = 9;
pub const OVS_KEY_ATTR_UDP: u16 = 10;
pub const OVS_KEY_ATTR_ICMP: u16 = 11;
pub const OVS_KEY_ATTR_ICMPV6: u16 = 12;
pub const OVS_KEY_ATTR_ARP: u16 = 13;
pub const OVS_KEY_ATTR_ND: u16 = 14;
pub const OVS_KEY_ATTR_SKB_MARK: u16 = 15;
pub const OVS_KEY_ATTR_TCP_FLAGS: u16 = 18;

/// IP fragment classification (`enum ovs_frag_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum FragType {
    None,
    First,
    Later,
}

impl FragType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FragType::None),
            1 => Some(FragType::First),
            2 => Some(FragType::Later),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            FragType::None => 0,
            FragType::First => 1,
            FragType::Later => 2,
        }
    }
}

pub type MacAddr = [u8; 6];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct KeyEthernet {
    pub src: MacAddr,
    pub dst: MacAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct KeyIpv4 {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub tos: u8,
    pub ttl: u8,
    pub frag: FragType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct KeyIpv6 {
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub label: u32,
    pub proto: u8,
    pub tclass: u8,
    pub hlimit: u8,
    pub frag: FragType,
}

/// TCP or UDP ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct KeyPorts {
    pub src: u16,
    pub dst: u16,
}

/// ICMP or ICMPv6 type and code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct KeyIcmp {
    pub icmp_type: u8,
    pub code: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct KeyArp {
    pub sip: Ipv4Addr,
    pub tip: Ipv4Addr,
    pub op: u16,
    pub sha: MacAddr,
    pub tha: MacAddr,
}

/// IPv6 neighbour discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct KeyNd {
    pub target: Ipv6Addr,
    pub sll: MacAddr,
    pub tll: MacAddr,
}

/// One packet-matching field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum FlowKey {
    /// Keys of the frame inside an 802.1Q tag.
    Encap(Vec<FlowKey>),
    Priority(u32),
    InPort(u32),
    Ethernet(KeyEthernet),
    /// 802.1Q TCI
    Vlan(u16),
    Ethertype(u16),
    Ipv4(KeyIpv4),
    Ipv6(KeyIpv6),
    Tcp(KeyPorts),
    Udp(KeyPorts),
    Icmp(KeyIcmp),
    Icmpv6(KeyIcmp),
    Arp(KeyArp),
    Nd(KeyNd),
    SkbMark(u32),
    TcpFlags(u16),
}

impl FlowKey {
    pub fn ethernet(src: MacAddr, dst: MacAddr) -> Self {
        FlowKey::Ethernet(KeyEthernet { src, dst })
    }

    /// Unfragmented IPv4 with zero tos/ttl.
    pub fn ipv4(src: Ipv4Addr, dst: Ipv4Addr, proto: u8) -> Self {
        FlowKey::Ipv4(KeyIpv4 {
            src,
            dst,
            proto,
            tos: 0,
            ttl: 0,
            frag: FragType::None,
        })
    }

    pub fn tcp(src: u16, dst: u16) -> Self {
        FlowKey::Tcp(KeyPorts { src, dst })
    }

    pub fn udp(src: u16, dst: u16) -> Self {
        FlowKey::Udp(KeyPorts { src, dst })
    }

    pub fn icmp(icmp_type: u8, code: u8) -> Self {
        FlowKey::Icmp(KeyIcmp { icmp_type, code })
    }

    pub fn icmpv6(icmp_type: u8, code: u8) -> Self {
        FlowKey::Icmpv6(KeyIcmp { icmp_type, code })
    }

    pub fn tag(&self) -> u16 {
        match self {
            FlowKey::Encap(_) => OVS_KEY_ATTR_ENCAP,
            FlowKey::Priority(_) => OVS_KEY_ATTR_PRIORITY,
            FlowKey::InPort(_) => OVS_KEY_ATTR_IN_PORT,
            FlowKey::Ethernet(_) => OVS_KEY_ATTR_ETHERNET,
            FlowKey::Vlan(_) => OVS_KEY_ATTR_VLAN,
            FlowKey::Ethertype(_) => OVS_KEY_ATTR_ETHERTYPE,
            FlowKey::Ipv4(_) => OVS_KEY_ATTR_IPV4,
            FlowKey::Ipv6(_) => OVS_KEY_ATTR_IPV6,
            FlowKey::Tcp(_) => OVS_KEY_ATTR_TCP,
            FlowKey::Udp(_) => OVS_KEY_ATTR_UDP,
            FlowKey::Icmp(_) => OVS_KEY_ATTR_ICMP,
            FlowKey::Icmpv6(_) => OVS_KEY_ATTR_ICMPV6,
            FlowKey::Arp(_) => OVS_KEY_ATTR_ARP,
            FlowKey::Nd(_) => OVS_KEY_ATTR_ND,
            FlowKey::SkbMark(_) => OVS_KEY_ATTR_SKB_MARK,
            FlowKey::TcpFlags(_) => OVS_KEY_ATTR_TCP_FLAGS,
        }
    }

    /// Write this key as one complete attribute.
    pub fn serialize(&self, b: &mut AttrBuilder) -> Result<()> {
        let tag = self.tag();
        match self {
            FlowKey::Encap(keys) => b.nested(tag, |b| {
                for key in keys {
                    key.serialize(b)?;
                }
                Ok(())
            }),
            FlowKey::Priority(v) | FlowKey::InPort(v) | FlowKey::SkbMark(v) => {
                b.attr_u32(tag, *v, Endian::Host)
            }
            FlowKey::Vlan(v) | FlowKey::Ethertype(v) | FlowKey::TcpFlags(v) => {
                b.attr_u16(tag, *v, Endian::Network)
            }
            FlowKey::Ethernet(k) => {
                let h = b.begin(tag);
                b.put_bytes(&k.src);
                b.put_bytes(&k.dst);
                b.end(h)
            }
            FlowKey::Ipv4(k) => {
                let h = b.begin(tag);
                b.put_u32(u32::from(k.src), Endian::Network);
                b.put_u32(u32::from(k.dst), Endian::Network);
                b.put_u8(k.proto);
                b.put_u8(k.tos);
                b.put_u8(k.ttl);
                b.put_u8(k.frag.as_u8());
                b.end(h)
            }
            FlowKey::Ipv6(k) => {
                let h = b.begin(tag);
                b.put_bytes(&k.src.octets());
                b.put_bytes(&k.dst.octets());
                b.put_u32(k.label, Endian::Network);
                b.put_u8(k.proto);
                b.put_u8(k.tclass);
                b.put_u8(k.hlimit);
                b.put_u8(k.frag.as_u8());
                b.end(h)
            }
            FlowKey::Tcp(k) | FlowKey::Udp(k) => {
                let h = b.begin(tag);
                b.put_u16(k.src, Endian::Network);
                b.put_u16(k.dst, Endian::Network);
                b.end(h)
            }
            FlowKey::Icmp(k) | FlowKey::Icmpv6(k) => {
                let h = b.begin(tag);
                b.put_u8(k.icmp_type);
                b.put_u8(k.code);
                b.end(h)
            }
            FlowKey::Arp(k) => {
                let h = b.begin(tag);
                b.put_u32(u32::from(k.sip), Endian::Network);
                b.put_u32(u32::from(k.tip), Endian::Network);
                b.put_u16(k.op, Endian::Network);
                b.put_bytes(&k.sha);
                b.put_bytes(&k.tha);
                // struct ovs_key_arp is padded to 24 bytes
                b.put_zeros(2);
                b.end(h)
            }
            FlowKey::Nd(k) => {
                let h = b.begin(tag);
                b.put_bytes(&k.target.octets());
                b.put_bytes(&k.sll);
                b.put_bytes(&k.tll);
                b.end(h)
            }
        }
    }
}

// ============================================================================
// Parsers
// ============================================================================

/// Parsers for every key variant, keyed by attribute tag.
pub(crate) const KEY_PARSERS: &[(u16, KeyParser)] = &[
    (OVS_KEY_ATTR_ENCAP, parse_encap),
    (OVS_KEY_ATTR_PRIORITY, parse_priority),
    (OVS_KEY_ATTR_IN_PORT, parse_in_port),
    (OVS_KEY_ATTR_ETHERNET, parse_ethernet),
    (OVS_KEY_ATTR_VLAN, parse_vlan),
    (OVS_KEY_ATTR_ETHERTYPE, parse_ethertype),
    (OVS_KEY_ATTR_IPV4, parse_ipv4),
    (OVS_KEY_ATTR_IPV6, parse_ipv6),
    (OVS_KEY_ATTR_TCP, parse_tcp),
    (OVS_KEY_ATTR_UDP, parse_udp),
    (OVS_KEY_ATTR_ICMP, parse_icmp),
    (OVS_KEY_ATTR_ICMPV6, parse_icmpv6),
    (OVS_KEY_ATTR_ARP, parse_arp),
    (OVS_KEY_ATTR_ND, parse_nd),
    (OVS_KEY_ATTR_SKB_MARK, parse_skb_mark),
    (OVS_KEY_ATTR_TCP_FLAGS, parse_tcp_flags),
];

fn parse_encap(registry: &FieldRegistry, buf: &[u8]) -> Option<FlowKey> {
    let inner = registry.decode_keys(buf);
    inner.is_complete().then(|| FlowKey::Encap(inner.items))
}

fn parse_priority(_: &FieldRegistry, buf: &[u8]) -> Option<FlowKey> {
    ValueReader::new(buf)
        .get_u32(Endian::Host)
        .ok()
        .map(FlowKey::Priority)
}

fn parse_in_port(_: &FieldRegistry, buf: &[u8]) -> Option<FlowKey> {
    ValueReader::new(buf)
        .get_u32(Endian::Host)
        .ok()
        .map(FlowKey::InPort)
}

fn parse_skb_mark(_: &FieldRegistry, buf: &[u8]) -> Option<FlowKey> {
    ValueReader::new(buf)
        .get_u32(Endian::Host)
        .ok()
        .map(FlowKey::SkbMark)
}

fn parse_vlan(_: &FieldRegistry, buf: &[u8]) -> Option<FlowKey> {
    ValueReader::new(buf)
        .get_u16(Endian::Network)
        .ok()
        .map(FlowKey::Vlan)
}

fn parse_ethertype(_: &FieldRegistry, buf: &[u8]) -> Option<FlowKey> {
    ValueReader::new(buf)
        .get_u16(Endian::Network)
        .ok()
        .map(FlowKey::Ethertype)
}

fn parse_tcp_flags(_: &FieldRegistry, buf: &[u8]) -> Option<FlowKey> {
    ValueReader::new(buf)
        .get_u16(Endian::Network)
        .ok()
        .map(FlowKey::TcpFlags)
}

fn parse_ethernet(_: &FieldRegistry, buf: &[u8]) -> Option<FlowKey> {
    let mut r = ValueReader::new(buf);
    Some(FlowKey::Ethernet(KeyEthernet {
        src: r.get_array().ok()?,
        dst: r.get_array().ok()?,
    }))
}

fn parse_ipv4(_: &FieldRegistry, buf: &[u8]) -> Option<FlowKey> {
    let mut r = ValueReader::new(buf);
    Some(FlowKey::Ipv4(KeyIpv4 {
        src: Ipv4Addr::from(r.get_u32(Endian::Network).ok()?),
        dst: Ipv4Addr::from(r.get_u32(Endian::Network).ok()?),
        proto: r.get_u8().ok()?,
        tos: r.get_u8().ok()?,
        ttl: r.get_u8().ok()?,
        frag: FragType::from_u8(r.get_u8().ok()?)?,
    }))
}

fn parse_ipv6(_: &FieldRegistry, buf: &[u8]) -> Option<FlowKey> {
    let mut r = ValueReader::new(buf);
    Some(FlowKey::Ipv6(KeyIpv6 {
        src: Ipv6Addr::from(r.get_array::<16>().ok()?),
        dst: Ipv6Addr::from(r.get_array::<16>().ok()?),
        label: r.get_u32(Endian::Network).ok()?,
        proto: r.get_u8().ok()?,
        tclass: r.get_u8().ok()?,
        hlimit: r.get_u8().ok()?,
        frag: FragType::from_u8(r.get_u8().ok()?)?,
    }))
}

fn parse_ports(buf: &[u8]) -> Option<KeyPorts> {
    let mut r = ValueReader::new(buf);
    Some(KeyPorts {
        src: r.get_u16(Endian::Network).ok()?,
        dst: r.get_u16(Endian::Network).ok()?,
    })
}

fn parse_tcp(_: &FieldRegistry, buf: &[u8]) -> Option<FlowKey> {
    parse_ports(buf).map(FlowKey::Tcp)
}

fn parse_udp(_: &FieldRegistry, buf: &[u8]) -> Option<FlowKey> {
    parse_ports(buf).map(FlowKey::Udp)
}

fn parse_icmp_fields(buf: &[u8]) -> Option<KeyIcmp> {
    let mut r = ValueReader::new(buf);
    Some(KeyIcmp {
        icmp_type: r.get_u8().ok()?,
        code: r.get_u8().ok()?,
    })
}

fn parse_icmp(_: &FieldRegistry, buf: &[u8]) -> Option<FlowKey> {
    parse_icmp_fields(buf).map(FlowKey::Icmp)
}

fn parse_icmpv6(_: &FieldRegistry, buf: &[u8]) -> Option<FlowKey> {
    parse_icmp_fields(buf).map(FlowKey::Icmpv6)
}

fn parse_arp(_: &FieldRegistry, buf: &[u8]) -> Option<FlowKey> {
    let mut r = ValueReader::new(buf);
    Some(FlowKey::Arp(KeyArp {
        sip: Ipv4Addr::from(r.get_u32(Endian::Network).ok()?),
        tip: Ipv4Addr::from(r.get_u32(Endian::Network).ok()?),
        op: r.get_u16(Endian::Network).ok()?,
        sha: r.get_array().ok()?,
        tha: r.get_array().ok()?,
    }))
}

fn parse_nd(_: &FieldRegistry, buf: &[u8]) -> Option<FlowKey> {
    let mut r = ValueReader::new(buf);
    Some(FlowKey::Nd(KeyNd {
        target: Ipv6Addr::from(r.get_array::<16>().ok()?),
        sll: r.get_array().ok()?,
        tll: r.get_array().ok()?,
    }))
}
