//! Datapath objects (`ovs_datapath` family)

use op_netlink::{Endian, NetlinkError, NetlinkMessage, Result, ValueReader};
use serde::Serialize;

use crate::family::{
    OVS_DP_ATTR_MEGAFLOW_STATS, OVS_DP_ATTR_NAME, OVS_DP_ATTR_STATS, OVS_DP_ATTR_USER_FEATURES,
    OVS_HEADER_SIZE,
};

/// How a request names its datapath.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatapathId {
    Name(String),
    Index(u32),
}

impl DatapathId {
    /// Value for `ovs_header.dp_ifindex`; 0 when looking up by name.
    pub fn ifindex(&self) -> u32 {
        match self {
            DatapathId::Name(_) => 0,
            DatapathId::Index(index) => *index,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            DatapathId::Name(name) => Some(name),
            DatapathId::Index(_) => None,
        }
    }
}

impl From<&str> for DatapathId {
    fn from(name: &str) -> Self {
        DatapathId::Name(name.to_string())
    }
}

impl From<u32> for DatapathId {
    fn from(index: u32) -> Self {
        DatapathId::Index(index)
    }
}

impl std::fmt::Display for DatapathId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatapathId::Name(name) => write!(f, "{}", name),
            DatapathId::Index(index) => write!(f, "#{}", index),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DatapathStats {
    pub n_hit: u64,
    pub n_missed: u64,
    pub n_lost: u64,
    pub n_flows: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MegaflowStats {
    pub n_mask_hit: u64,
    pub n_masks: u32,
    pub n_cache_hit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Datapath {
    pub name: String,
    pub index: u32,
    pub stats: Option<DatapathStats>,
    pub megaflow_stats: Option<MegaflowStats>,
    pub user_features: Option<u32>,
}

impl Datapath {
    pub fn id(&self) -> DatapathId {
        DatapathId::Index(self.index)
    }

    /// Decode an `ovs_datapath` reply.
    pub fn parse(msg: &NetlinkMessage) -> Result<Self> {
        let body = msg.genl_body()?;
        let index = ValueReader::new(body).get_u32(Endian::Host)?;

        let mut name = None;
        let mut datapath = Datapath {
            name: String::new(),
            index,
            stats: None,
            megaflow_stats: None,
            user_features: None,
        };

        for attr in msg.attrs(OVS_HEADER_SIZE)? {
            let attr = attr?;
            match attr.kind() {
                OVS_DP_ATTR_NAME => name = Some(attr.get_str()?.to_string()),
                OVS_DP_ATTR_STATS => {
                    let mut r = attr.reader();
                    datapath.stats = Some(DatapathStats {
                        n_hit: r.get_u64(Endian::Host)?,
                        n_missed: r.get_u64(Endian::Host)?,
                        n_lost: r.get_u64(Endian::Host)?,
                        n_flows: r.get_u64(Endian::Host)?,
                    });
                }
                OVS_DP_ATTR_MEGAFLOW_STATS => {
                    let mut r = attr.reader();
                    let n_mask_hit = r.get_u64(Endian::Host)?;
                    let n_masks = r.get_u32(Endian::Host)?;
                    r.skip(4)?;
                    datapath.megaflow_stats = Some(MegaflowStats {
                        n_mask_hit,
                        n_masks,
                        n_cache_hit: r.get_u64(Endian::Host)?,
                    });
                }
                OVS_DP_ATTR_USER_FEATURES => {
                    datapath.user_features = Some(attr.get_u32(Endian::Host)?)
                }
                _ => {}
            }
        }

        datapath.name = name.ok_or_else(|| NetlinkError::malformed("datapath reply without name"))?;
        Ok(datapath)
    }
}
