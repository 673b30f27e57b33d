//! Generic Netlink family resolution
//!
//! Families are looked up by name through the well-known control family
//! (`nlctrl`, id 0x10). The reply carries the numeric id, the version and
//! nested tables of supported operations and multicast groups.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::attr::Endian;
use crate::error::{NetlinkError, Result};
use crate::message::{MessageBuilder, NetlinkMessage, OutgoingMessage, NLM_F_REQUEST};

// ============================================================================
// Control family constants (include/uapi/linux/genetlink.h)
// ============================================================================
pub const GENL_ID_CTRL: u16 = 0x10;
pub const CTRL_VERSION: u8 = 1;

pub const CTRL_CMD_NEWFAMILY: u8 = 1;
pub const CTRL_CMD_DELFAMILY: u8 = 2;
pub const CTRL_CMD_GETFAMILY: u8 = 3;

pub const CTRL_ATTR_FAMILY_ID: u16 = 1;
pub const CTRL_ATTR_FAMILY_NAME: u16 = 2;
pub const CTRL_ATTR_VERSION: u16 = 3;
pub const CTRL_ATTR_HDRSIZE: u16 = 4;
pub const CTRL_ATTR_MAXATTR: u16 = 5;
pub const CTRL_ATTR_OPS: u16 = 6;
pub const CTRL_ATTR_MCAST_GROUPS: u16 = 7;

pub const CTRL_ATTR_OP_ID: u16 = 1;
pub const CTRL_ATTR_OP_FLAGS: u16 = 2;

pub const CTRL_ATTR_MCAST_GRP_NAME: u16 = 1;
pub const CTRL_ATTR_MCAST_GRP_ID: u16 = 2;

/// A resolved family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Family {
    pub name: String,
    pub id: u16,
    pub version: u32,
    pub header_size: u32,
    pub max_attr: u32,
    /// Supported command opcode -> operation flags.
    pub commands: BTreeMap<u32, u32>,
    /// Multicast group name -> group id.
    pub multicast_groups: BTreeMap<String, u32>,
}

impl Family {
    /// Whether the kernel advertised `command`. Families that report no
    /// operation table are assumed to accept everything.
    pub fn supports(&self, command: u8) -> bool {
        self.commands.is_empty() || self.commands.contains_key(&(command as u32))
    }

    pub fn command_flags(&self, command: u8) -> Option<u32> {
        self.commands.get(&(command as u32)).copied()
    }

    pub fn multicast_group(&self, name: &str) -> Option<u32> {
        self.multicast_groups.get(name).copied()
    }

    /// Start a request for `command` at this family's id and version.
    pub fn request(&self, flags: u16, command: u8) -> MessageBuilder {
        MessageBuilder::genl(self.id, flags, command, self.version as u8)
    }
}

/// Build the `CTRL_CMD_GETFAMILY` lookup for `name`.
pub fn lookup_request(name: &str) -> Result<OutgoingMessage> {
    let mut builder =
        MessageBuilder::genl(GENL_ID_CTRL, NLM_F_REQUEST, CTRL_CMD_GETFAMILY, CTRL_VERSION);
    builder.attr_str(CTRL_ATTR_FAMILY_NAME, name)?;
    builder.build()
}

/// Parse a control family reply into a [`Family`].
pub fn parse_family(msg: &NetlinkMessage) -> Result<Family> {
    if msg.is_error() {
        return Err(NetlinkError::Protocol {
            code: msg.error_code()?,
        });
    }

    let mut id = None;
    let mut name = None;
    let mut family = Family {
        name: String::new(),
        id: 0,
        version: 0,
        header_size: 0,
        max_attr: 0,
        commands: BTreeMap::new(),
        multicast_groups: BTreeMap::new(),
    };

    for attr in msg.attrs(0)? {
        let attr = attr?;
        match attr.kind() {
            CTRL_ATTR_FAMILY_ID => id = Some(attr.get_u16(Endian::Host)?),
            CTRL_ATTR_FAMILY_NAME => name = Some(attr.get_str()?.to_string()),
            CTRL_ATTR_VERSION => family.version = attr.get_u32(Endian::Host)?,
            CTRL_ATTR_HDRSIZE => family.header_size = attr.get_u32(Endian::Host)?,
            CTRL_ATTR_MAXATTR => family.max_attr = attr.get_u32(Endian::Host)?,
            CTRL_ATTR_OPS => {
                for op in attr.nested() {
                    let mut op_id = None;
                    let mut op_flags = 0;
                    for field in op?.nested() {
                        let field = field?;
                        match field.kind() {
                            CTRL_ATTR_OP_ID => op_id = Some(field.get_u32(Endian::Host)?),
                            CTRL_ATTR_OP_FLAGS => op_flags = field.get_u32(Endian::Host)?,
                            _ => {}
                        }
                    }
                    if let Some(op_id) = op_id {
                        family.commands.insert(op_id, op_flags);
                    }
                }
            }
            CTRL_ATTR_MCAST_GROUPS => {
                for group in attr.nested() {
                    let mut grp_name = None;
                    let mut grp_id = None;
                    for field in group?.nested() {
                        let field = field?;
                        match field.kind() {
                            CTRL_ATTR_MCAST_GRP_NAME => {
                                grp_name = Some(field.get_str()?.to_string())
                            }
                            CTRL_ATTR_MCAST_GRP_ID => grp_id = Some(field.get_u32(Endian::Host)?),
                            _ => {}
                        }
                    }
                    if let (Some(n), Some(i)) = (grp_name, grp_id) {
                        family.multicast_groups.insert(n, i);
                    }
                }
            }
            _ => {}
        }
    }

    family.id = id.ok_or_else(|| NetlinkError::malformed("family reply without id"))?;
    family.name = name.ok_or_else(|| NetlinkError::malformed("family reply without name"))?;
    Ok(family)
}

/// Families resolved for the lifetime of one connection.
#[derive(Debug, Clone, Default)]
pub struct FamilySet {
    families: HashMap<String, Family>,
}

impl FamilySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, family: Family) {
        self.families.insert(family.name.clone(), family);
    }

    /// Look up a resolved family. Missing families mean bring-up has not
    /// completed.
    pub fn get(&self, name: &str) -> Result<&Family> {
        self.families.get(name).ok_or(NetlinkError::NotInitialized)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.families.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Family> {
        self.families.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::AttrIter;
    use crate::message::GENL_HDRLEN;

    fn family_reply(name: &str, id: u16, version: u32, ops: &[(u32, u32)]) -> NetlinkMessage {
        let mut b = MessageBuilder::genl(GENL_ID_CTRL, 0, CTRL_CMD_NEWFAMILY, 2);
        b.attr_str(CTRL_ATTR_FAMILY_NAME, name).unwrap();
        b.attr_u16(CTRL_ATTR_FAMILY_ID, id, Endian::Host).unwrap();
        b.attr_u32(CTRL_ATTR_VERSION, version, Endian::Host).unwrap();
        b.nested(CTRL_ATTR_OPS, |b| {
            for (i, (op, flags)) in ops.iter().enumerate() {
                b.nested(i as u16 + 1, |b| {
                    b.attr_u32(CTRL_ATTR_OP_ID, *op, Endian::Host)?;
                    b.attr_u32(CTRL_ATTR_OP_FLAGS, *flags, Endian::Host)
                })?;
            }
            Ok(())
        })
        .unwrap();
        b.nested(CTRL_ATTR_MCAST_GROUPS, |b| {
            b.nested(1, |b| {
                b.attr_u32(CTRL_ATTR_MCAST_GRP_ID, 5, Endian::Host)?;
                b.attr_str(CTRL_ATTR_MCAST_GRP_NAME, name)
            })
        })
        .unwrap();
        NetlinkMessage::parse(b.build().unwrap().as_bytes()).unwrap()
    }

    #[test]
    fn test_lookup_request_layout() {
        let req = lookup_request("ovs_datapath").unwrap();
        let msg = NetlinkMessage::parse(req.as_bytes()).unwrap();
        assert_eq!(msg.header.message_type, GENL_ID_CTRL);
        assert_eq!(msg.genl_header().unwrap().command, CTRL_CMD_GETFAMILY);

        let name = AttrIter::new(&msg.payload[GENL_HDRLEN..])
            .find(CTRL_ATTR_FAMILY_NAME)
            .unwrap()
            .unwrap();
        assert_eq!(name.get_str().unwrap(), "ovs_datapath");
        assert_eq!(name.value().len(), "ovs_datapath".len() + 1);
    }

    #[test]
    fn test_parse_family() {
        let msg = family_reply("ovs_flow", 27, 1, &[(1, 0xb), (3, 0xe)]);
        let family = parse_family(&msg).unwrap();
        assert_eq!(family.id, 27);
        assert_eq!(family.name, "ovs_flow");
        assert_eq!(family.version, 1);
        assert!(family.supports(3));
        assert!(!family.supports(4));
        assert_eq!(family.command_flags(1), Some(0xb));
        assert_eq!(family.multicast_group("ovs_flow"), Some(5));
    }

    #[test]
    fn test_parse_family_requires_id() {
        let mut b = MessageBuilder::genl(GENL_ID_CTRL, 0, CTRL_CMD_NEWFAMILY, 2);
        b.attr_str(CTRL_ATTR_FAMILY_NAME, "ovs_vport").unwrap();
        let msg = NetlinkMessage::parse(b.build().unwrap().as_bytes()).unwrap();
        assert!(matches!(parse_family(&msg), Err(NetlinkError::MalformedMessage(_))));
    }

    #[test]
    fn test_family_set_missing_is_not_initialized() {
        let mut set = FamilySet::new();
        assert!(matches!(set.get("ovs_datapath"), Err(NetlinkError::NotInitialized)));
        set.insert(parse_family(&family_reply("ovs_datapath", 24, 1, &[])).unwrap());
        assert_eq!(set.get("ovs_datapath").unwrap().id, 24);
        assert!(set.get("ovs_datapath").unwrap().supports(9));
    }
}
