//! op-odp: Open vSwitch datapath client
//!
//! This crate provides:
//! - The `ovs_datapath`, `ovs_vport`, `ovs_flow` and `ovs_packet` families
//! - Flow keys and actions with an extensible decoder registry
//! - Datapath, port and flow objects decoded from kernel replies
//! - Typed operations on top of an `op_netlink` connection

pub mod connection;
pub mod datapath;
pub mod family;
pub mod flow;
pub mod flows;
pub mod packet;
pub mod port;

pub use connection::OvsDatapathConnection;
pub use datapath::{Datapath, DatapathId, DatapathStats, MegaflowStats};
pub use family::{OvsFamilies, REQUIRED_FAMILIES};
pub use flow::{Flow, FlowStats};
pub use flows::{FieldRegistry, FlowAction, FlowKey, FlowMatch, IpProtocol};
pub use packet::Packet;
pub use port::{Port, PortId, PortStats, PortType};

/// Prelude for convenient imports
pub mod prelude {
    pub use super::connection::OvsDatapathConnection;
    pub use super::datapath::{Datapath, DatapathId};
    pub use super::flow::Flow;
    pub use super::flows::{FieldRegistry, FlowAction, FlowKey, FlowMatch};
    pub use super::port::{Port, PortId, PortType};
}
