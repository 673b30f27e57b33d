//! Typed datapath operations over a netlink connection
//!
//! Every operation builds its request, submits it through the
//! [`ConnectionHandle`] and decodes the replies before invoking the caller's
//! callback exactly once. Operations fail synchronously with
//! `NotInitialized` until the OVS families are resolved.
//!
//! ```ignore
//! let ovs = OvsDatapathConnection::new(conn.handle(), Arc::new(FieldRegistry::default()));
//! ovs.initialize_async()?.await?;
//! let (callback, reply) = PendingReply::pair();
//! ovs.datapaths_enumerate(callback)?;
//! for dp in reply.await? { println!("{}", dp.name); }
//! ```

use std::sync::Arc;

use op_netlink::message::{NLM_F_ACK, NLM_F_DUMP, NLM_F_ECHO, NLM_F_REQUEST};
use op_netlink::{
    ConnectionHandle, Endian, Expect, NetlinkError, NetlinkMessage, OutgoingMessage, PendingReply,
    Result,
};
use tracing::{debug, warn};

use crate::datapath::{Datapath, DatapathId};
use crate::family::{
    ovs_request, OvsFamilies, OVS_DP_ATTR_NAME, OVS_DP_ATTR_UPCALL_PID, OVS_DP_CMD_DEL,
    OVS_DP_CMD_GET, OVS_DP_CMD_NEW, OVS_DP_CMD_SET, OVS_FLOW_ATTR_CLEAR, OVS_FLOW_CMD_DEL,
    OVS_FLOW_CMD_GET, OVS_FLOW_CMD_NEW, OVS_FLOW_CMD_SET, OVS_PACKET_CMD_EXECUTE,
    OVS_VPORT_CMD_DEL, OVS_VPORT_CMD_GET, OVS_VPORT_CMD_NEW, OVS_VPORT_CMD_SET,
    REQUIRED_FAMILIES,
};
use crate::flow::Flow;
use crate::flows::{FieldRegistry, FlowMatch};
use crate::packet::Packet;
use crate::port::{serialize_id, Port, PortId};

/// Open vSwitch datapath client.
#[derive(Clone)]
pub struct OvsDatapathConnection {
    handle: ConnectionHandle,
    registry: Arc<FieldRegistry>,
}

impl OvsDatapathConnection {
    pub fn new(handle: ConnectionHandle, registry: Arc<FieldRegistry>) -> Self {
        Self { handle, registry }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn registry(&self) -> &Arc<FieldRegistry> {
        &self.registry
    }

    /// Resolve the OVS families; `on_ready` gets `NotInitialized` if any
    /// of them is missing (usually the openvswitch module isn't loaded).
    pub fn initialize<F>(&self, on_ready: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.handle.initialize(&REQUIRED_FAMILIES, on_ready)
    }

    pub fn initialize_async(&self) -> Result<PendingReply<()>> {
        self.handle.initialize_async(&REQUIRED_FAMILIES)
    }

    fn families(&self) -> Result<OvsFamilies> {
        OvsFamilies::from_handle(&self.handle)
    }

    fn execute<T, D, F>(
        &self,
        message: OutgoingMessage,
        expect: Expect,
        decode: D,
        callback: F,
    ) -> Result<u32>
    where
        T: 'static,
        D: FnOnce(Vec<NetlinkMessage>) -> Result<T> + Send + 'static,
        F: FnOnce(Result<T>) + Send + 'static,
    {
        self.handle.submit(
            message,
            expect,
            Box::new(move |replies: Result<Vec<NetlinkMessage>>| callback(replies.and_then(decode))),
        )
    }

    // ========================================================================
    // Datapaths
    // ========================================================================

    pub fn datapaths_enumerate<F>(&self, callback: F) -> Result<u32>
    where
        F: FnOnce(Result<Vec<Datapath>>) + Send + 'static,
    {
        let families = self.families()?;
        let msg = ovs_request(
            &families.datapath,
            NLM_F_REQUEST | NLM_F_DUMP,
            OVS_DP_CMD_GET,
            0,
        )
        .build()?;
        debug!("Enumerating datapaths");
        self.execute(msg, Expect::Dump, |r| Ok(decode_each(&r, Datapath::parse)), callback)
    }

    /// Create a datapath whose upcalls go to this connection.
    pub fn datapaths_create<F>(&self, name: &str, callback: F) -> Result<u32>
    where
        F: FnOnce(Result<Datapath>) + Send + 'static,
    {
        let families = self.families()?;
        let mut b = ovs_request(
            &families.datapath,
            NLM_F_REQUEST | NLM_F_ECHO,
            OVS_DP_CMD_NEW,
            0,
        );
        b.attr_str(OVS_DP_ATTR_NAME, name)?;
        b.attr_u32(OVS_DP_ATTR_UPCALL_PID, self.handle.local_pid(), Endian::Host)?;
        debug!(name, "Creating datapath");
        self.execute(b.build()?, Expect::Replies(1), decode_one(Datapath::parse), callback)
    }

    pub fn datapaths_get<F>(&self, id: DatapathId, callback: F) -> Result<u32>
    where
        F: FnOnce(Result<Datapath>) + Send + 'static,
    {
        let msg = self.datapath_request(&id, NLM_F_REQUEST, OVS_DP_CMD_GET)?;
        self.execute(msg, Expect::Replies(1), decode_one(Datapath::parse), callback)
    }

    /// Point the datapath's upcalls at `upcall_pid`.
    pub fn datapaths_set<F>(&self, id: DatapathId, upcall_pid: u32, callback: F) -> Result<u32>
    where
        F: FnOnce(Result<Datapath>) + Send + 'static,
    {
        let families = self.families()?;
        let mut b = ovs_request(
            &families.datapath,
            NLM_F_REQUEST | NLM_F_ECHO,
            OVS_DP_CMD_SET,
            id.ifindex(),
        );
        if let Some(name) = id.name() {
            b.attr_str(OVS_DP_ATTR_NAME, name)?;
        }
        b.attr_u32(OVS_DP_ATTR_UPCALL_PID, upcall_pid, Endian::Host)?;
        self.execute(b.build()?, Expect::Replies(1), decode_one(Datapath::parse), callback)
    }

    /// Delete a datapath; the callback receives its last state.
    pub fn datapaths_delete<F>(&self, id: DatapathId, callback: F) -> Result<u32>
    where
        F: FnOnce(Result<Datapath>) + Send + 'static,
    {
        let msg = self.datapath_request(&id, NLM_F_REQUEST | NLM_F_ECHO, OVS_DP_CMD_DEL)?;
        debug!(datapath = %id, "Deleting datapath");
        self.execute(msg, Expect::Replies(1), decode_one(Datapath::parse), callback)
    }

    fn datapath_request(&self, id: &DatapathId, flags: u16, command: u8) -> Result<OutgoingMessage> {
        let families = self.families()?;
        let mut b = ovs_request(&families.datapath, flags, command, id.ifindex());
        if let Some(name) = id.name() {
            b.attr_str(OVS_DP_ATTR_NAME, name)?;
        }
        b.build()
    }

    // ========================================================================
    // Ports
    // ========================================================================

    pub fn ports_enumerate<F>(&self, datapath: &Datapath, callback: F) -> Result<u32>
    where
        F: FnOnce(Result<Vec<Port>>) + Send + 'static,
    {
        let families = self.families()?;
        let msg = ovs_request(
            &families.vport,
            NLM_F_REQUEST | NLM_F_DUMP,
            OVS_VPORT_CMD_GET,
            datapath.index,
        )
        .build()?;
        self.execute(msg, Expect::Dump, |r| Ok(decode_each(&r, Port::parse)), callback)
    }

    pub fn ports_create<F>(&self, datapath: &Datapath, port: &Port, callback: F) -> Result<u32>
    where
        F: FnOnce(Result<Port>) + Send + 'static,
    {
        let families = self.families()?;
        let mut b = ovs_request(
            &families.vport,
            NLM_F_REQUEST | NLM_F_ECHO,
            OVS_VPORT_CMD_NEW,
            datapath.index,
        );
        port.serialize_new(&mut b)?;
        debug!(datapath = %datapath.name, port = %port.name, "Creating port");
        self.execute(b.build()?, Expect::Replies(1), decode_one(Port::parse), callback)
    }

    pub fn ports_get<F>(&self, datapath: &Datapath, id: PortId, callback: F) -> Result<u32>
    where
        F: FnOnce(Result<Port>) + Send + 'static,
    {
        let families = self.families()?;
        let mut b = ovs_request(&families.vport, NLM_F_REQUEST, OVS_VPORT_CMD_GET, datapath.index);
        serialize_id(&id, &mut b)?;
        self.execute(b.build()?, Expect::Replies(1), decode_one(Port::parse), callback)
    }

    /// Update a port's upcall pid and tunnel options.
    pub fn ports_set<F>(&self, datapath: &Datapath, port: &Port, callback: F) -> Result<u32>
    where
        F: FnOnce(Result<Port>) + Send + 'static,
    {
        let families = self.families()?;
        let mut b = ovs_request(
            &families.vport,
            NLM_F_REQUEST | NLM_F_ECHO,
            OVS_VPORT_CMD_SET,
            datapath.index,
        );
        port.serialize_set(&mut b)?;
        self.execute(b.build()?, Expect::Replies(1), decode_one(Port::parse), callback)
    }

    pub fn ports_delete<F>(&self, datapath: &Datapath, id: PortId, callback: F) -> Result<u32>
    where
        F: FnOnce(Result<Port>) + Send + 'static,
    {
        let families = self.families()?;
        let mut b = ovs_request(
            &families.vport,
            NLM_F_REQUEST | NLM_F_ECHO,
            OVS_VPORT_CMD_DEL,
            datapath.index,
        );
        serialize_id(&id, &mut b)?;
        debug!(datapath = %datapath.name, port = ?id, "Deleting port");
        self.execute(b.build()?, Expect::Replies(1), decode_one(Port::parse), callback)
    }

    // ========================================================================
    // Flows
    // ========================================================================

    pub fn flows_enumerate<F>(&self, datapath: &Datapath, callback: F) -> Result<u32>
    where
        F: FnOnce(Result<Vec<Flow>>) + Send + 'static,
    {
        let families = self.families()?;
        let msg = ovs_request(
            &families.flow,
            NLM_F_REQUEST | NLM_F_DUMP,
            OVS_FLOW_CMD_GET,
            datapath.index,
        )
        .build()?;
        let registry = self.registry.clone();
        self.execute(
            msg,
            Expect::Dump,
            move |r| Ok(decode_each(&r, |m| Flow::parse(m, &registry))),
            callback,
        )
    }

    pub fn flows_create<F>(&self, datapath: &Datapath, flow: &Flow, callback: F) -> Result<u32>
    where
        F: FnOnce(Result<Flow>) + Send + 'static,
    {
        let families = self.families()?;
        let mut b = ovs_request(
            &families.flow,
            NLM_F_REQUEST | NLM_F_ECHO,
            OVS_FLOW_CMD_NEW,
            datapath.index,
        );
        Flow::serialize_match(&flow.flow_match, &mut b)?;
        Flow::serialize_actions(&flow.actions, &mut b)?;
        debug!(
            datapath = %datapath.name,
            keys = flow.flow_match.len(),
            actions = flow.actions.len(),
            "Creating flow"
        );
        let registry = self.registry.clone();
        self.execute(
            b.build()?,
            Expect::Replies(1),
            move |r| first(&r).and_then(|m| Flow::parse(m, &registry)),
            callback,
        )
    }

    /// Look a flow up by its match. A missing flow is `Ok(None)`.
    pub fn flows_get<F>(&self, datapath: &Datapath, flow_match: &FlowMatch, callback: F) -> Result<u32>
    where
        F: FnOnce(Result<Option<Flow>>) + Send + 'static,
    {
        let families = self.families()?;
        let mut b = ovs_request(&families.flow, NLM_F_REQUEST, OVS_FLOW_CMD_GET, datapath.index);
        Flow::serialize_match(flow_match, &mut b)?;
        let registry = self.registry.clone();
        self.handle.submit(
            b.build()?,
            Expect::Replies(1),
            Box::new(move |replies: Result<Vec<NetlinkMessage>>| {
                let result = match replies {
                    Ok(r) => first(&r).and_then(|m| Flow::parse(m, &registry)).map(Some),
                    Err(NetlinkError::Protocol { code }) if code == -libc::ENOENT => Ok(None),
                    Err(e) => Err(e),
                };
                callback(result)
            }),
        )
    }

    /// Replace a flow's actions, optionally zeroing its counters.
    pub fn flows_set<F>(
        &self,
        datapath: &Datapath,
        flow: &Flow,
        clear_stats: bool,
        callback: F,
    ) -> Result<u32>
    where
        F: FnOnce(Result<Flow>) + Send + 'static,
    {
        let families = self.families()?;
        let mut b = ovs_request(
            &families.flow,
            NLM_F_REQUEST | NLM_F_ECHO,
            OVS_FLOW_CMD_SET,
            datapath.index,
        );
        Flow::serialize_match(&flow.flow_match, &mut b)?;
        Flow::serialize_actions(&flow.actions, &mut b)?;
        if clear_stats {
            b.attr_flag(OVS_FLOW_ATTR_CLEAR)?;
        }
        let registry = self.registry.clone();
        self.execute(
            b.build()?,
            Expect::Replies(1),
            move |r| first(&r).and_then(|m| Flow::parse(m, &registry)),
            callback,
        )
    }

    /// Delete one flow; the callback receives its final counters.
    pub fn flows_delete<F>(
        &self,
        datapath: &Datapath,
        flow_match: &FlowMatch,
        callback: F,
    ) -> Result<u32>
    where
        F: FnOnce(Result<Flow>) + Send + 'static,
    {
        let families = self.families()?;
        let mut b = ovs_request(
            &families.flow,
            NLM_F_REQUEST | NLM_F_ECHO,
            OVS_FLOW_CMD_DEL,
            datapath.index,
        );
        Flow::serialize_match(flow_match, &mut b)?;
        let registry = self.registry.clone();
        self.execute(
            b.build()?,
            Expect::Replies(1),
            move |r| first(&r).and_then(|m| Flow::parse(m, &registry)),
            callback,
        )
    }

    /// Delete every flow in the datapath.
    pub fn flows_flush<F>(&self, datapath: &Datapath, callback: F) -> Result<u32>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let families = self.families()?;
        let msg = ovs_request(
            &families.flow,
            NLM_F_REQUEST | NLM_F_ACK,
            OVS_FLOW_CMD_DEL,
            datapath.index,
        )
        .build()?;
        debug!(datapath = %datapath.name, "Flushing flows");
        self.execute(msg, Expect::Ack, |_| Ok(()), callback)
    }

    // ========================================================================
    // Packets
    // ========================================================================

    /// Run `packet.actions` on `packet.data` inside the datapath.
    pub fn packets_execute<F>(&self, datapath: &Datapath, packet: &Packet, callback: F) -> Result<u32>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let families = self.families()?;
        let mut b = ovs_request(
            &families.packet,
            NLM_F_REQUEST | NLM_F_ACK,
            OVS_PACKET_CMD_EXECUTE,
            datapath.index,
        );
        packet.serialize(&mut b)?;
        self.execute(b.build()?, Expect::Ack, |_| Ok(()), callback)
    }
}

fn first(replies: &[NetlinkMessage]) -> Result<&NetlinkMessage> {
    replies
        .first()
        .ok_or_else(|| NetlinkError::malformed("request completed without a reply"))
}

fn decode_one<T: 'static>(
    parse: fn(&NetlinkMessage) -> Result<T>,
) -> impl FnOnce(Vec<NetlinkMessage>) -> Result<T> + Send + 'static {
    move |replies| first(&replies).and_then(parse)
}

/// Decode every message of a dump, dropping the ones that fail.
fn decode_each<T, P>(replies: &[NetlinkMessage], parse: P) -> Vec<T>
where
    P: Fn(&NetlinkMessage) -> Result<T>,
{
    replies
        .iter()
        .filter_map(|m| match parse(m) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(sequence = m.sequence(), error = %e, "Skipping undecodable dump entry");
                None
            }
        })
        .collect()
}
