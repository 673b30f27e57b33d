//! op-odp: Open vSwitch kernel datapath client
//!
//! Talks to the `openvswitch` kernel module over Generic Netlink and prints
//! the results as JSON.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use op_netlink::{ConnectionConfig, NetlinkConnection, NetlinkSocket, PendingReply};
use op_odp::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "op-odp")]
#[command(about = "Inspect and program the Open vSwitch kernel datapath")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Messages coalesced into one socket write
    #[arg(long)]
    batch_size: Option<usize>,

    /// Per-request timeout in milliseconds (0 disables)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the resolved Generic Netlink families
    Families,
    /// Manage datapaths
    #[command(subcommand)]
    Datapath(DatapathCommand),
    /// Manage datapath ports
    #[command(subcommand)]
    Port(PortCommand),
    /// Manage kernel flows
    #[command(subcommand)]
    Flow(FlowCommand),
}

#[derive(Subcommand, Debug)]
enum DatapathCommand {
    /// List datapaths
    List,
    /// Show one datapath
    Show { name: String },
    /// Create a datapath
    Create { name: String },
    /// Delete a datapath
    Delete { name: String },
}

#[derive(Subcommand, Debug)]
enum PortCommand {
    /// List the ports of a datapath
    List { datapath: String },
    /// Add a port
    Add {
        datapath: String,
        name: String,
        /// netdev, internal, gre, vxlan or geneve
        #[arg(long = "type", default_value = "netdev")]
        port_type: PortType,
        /// UDP destination port for vxlan/geneve
        #[arg(long)]
        dst_port: Option<u16>,
    },
    /// Delete a port
    Delete { datapath: String, name: String },
}

#[derive(Subcommand, Debug)]
enum FlowCommand {
    /// List the flows of a datapath
    List { datapath: String },
    /// Forward everything arriving on one port to another
    Add {
        datapath: String,
        #[arg(long)]
        in_port: u32,
        /// Output port; the flow drops packets when omitted
        #[arg(long)]
        output: Option<u32>,
    },
    /// Delete the flow matching an input port
    Delete {
        datapath: String,
        #[arg(long)]
        in_port: u32,
    },
    /// Delete every flow
    Flush { datapath: String },
}

#[derive(Serialize)]
struct Done<'a> {
    status: &'a str,
    datapath: &'a str,
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("op_odp=info".parse()?)
        .add_directive("op_netlink=info".parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs)?;

    let mut config = ConnectionConfig::from_env();
    if let Some(batch_size) = args.batch_size {
        config.max_batch_size = batch_size.max(1);
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.request_timeout_ms = timeout_ms;
    }
    debug!(?config, "Connection configuration");

    let socket = NetlinkSocket::open_generic(config.recv_buffer_size)
        .context("Failed to open generic netlink socket")?;
    let conn = NetlinkConnection::new(socket, &config);
    let ovs = OvsDatapathConnection::new(conn.handle(), Arc::new(FieldRegistry::default()));
    let driver = tokio::spawn(conn.run());

    ovs.initialize_async()?
        .await
        .context("Open vSwitch families unavailable (is the openvswitch module loaded?)")?;
    info!("Datapath connection ready");

    let output = run(&ovs, args.command).await;
    ovs.handle().close();
    driver.await?.context("Netlink driver failed")?;

    println!("{}", serde_json::to_string_pretty(&output?)?);
    Ok(())
}

async fn run(ovs: &OvsDatapathConnection, command: Commands) -> Result<Value> {
    match command {
        Commands::Families => Ok(serde_json::to_value(ovs.handle().families())?),
        Commands::Datapath(cmd) => datapath_command(ovs, cmd).await,
        Commands::Port(cmd) => port_command(ovs, cmd).await,
        Commands::Flow(cmd) => flow_command(ovs, cmd).await,
    }
}

async fn lookup_datapath(ovs: &OvsDatapathConnection, name: &str) -> Result<Datapath> {
    let (callback, reply) = PendingReply::pair();
    ovs.datapaths_get(DatapathId::from(name), callback)?;
    reply
        .await
        .with_context(|| format!("Datapath '{}' not found", name))
}

async fn datapath_command(ovs: &OvsDatapathConnection, cmd: DatapathCommand) -> Result<Value> {
    let value = match cmd {
        DatapathCommand::List => {
            let (callback, reply) = PendingReply::pair();
            ovs.datapaths_enumerate(callback)?;
            serde_json::to_value(reply.await.context("Failed to list datapaths")?)?
        }
        DatapathCommand::Show { name } => serde_json::to_value(lookup_datapath(ovs, &name).await?)?,
        DatapathCommand::Create { name } => {
            let (callback, reply) = PendingReply::pair();
            ovs.datapaths_create(&name, callback)?;
            let datapath = reply
                .await
                .with_context(|| format!("Failed to create datapath '{}'", name))?;
            info!(name = %datapath.name, index = datapath.index, "Created datapath");
            serde_json::to_value(datapath)?
        }
        DatapathCommand::Delete { name } => {
            let (callback, reply) = PendingReply::pair();
            ovs.datapaths_delete(DatapathId::from(name.as_str()), callback)?;
            serde_json::to_value(
                reply
                    .await
                    .with_context(|| format!("Failed to delete datapath '{}'", name))?,
            )?
        }
    };
    Ok(value)
}

async fn port_command(ovs: &OvsDatapathConnection, cmd: PortCommand) -> Result<Value> {
    let value = match cmd {
        PortCommand::List { datapath } => {
            let dp = lookup_datapath(ovs, &datapath).await?;
            let (callback, reply) = PendingReply::pair();
            ovs.ports_enumerate(&dp, callback)?;
            serde_json::to_value(reply.await.context("Failed to list ports")?)?
        }
        PortCommand::Add {
            datapath,
            name,
            port_type,
            dst_port,
        } => {
            let dp = lookup_datapath(ovs, &datapath).await?;
            let mut port = Port::new(name.clone(), port_type).with_upcall_pid(ovs.handle().local_pid());
            if let Some(dst_port) = dst_port {
                port = port.with_dst_port(dst_port);
            }
            let (callback, reply) = PendingReply::pair();
            ovs.ports_create(&dp, &port, callback)?;
            serde_json::to_value(
                reply
                    .await
                    .with_context(|| format!("Failed to add port '{}'", name))?,
            )?
        }
        PortCommand::Delete { datapath, name } => {
            let dp = lookup_datapath(ovs, &datapath).await?;
            let (callback, reply) = PendingReply::pair();
            ovs.ports_delete(&dp, PortId::Name(name.clone()), callback)?;
            serde_json::to_value(
                reply
                    .await
                    .with_context(|| format!("Failed to delete port '{}'", name))?,
            )?
        }
    };
    Ok(value)
}

async fn flow_command(ovs: &OvsDatapathConnection, cmd: FlowCommand) -> Result<Value> {
    let value = match cmd {
        FlowCommand::List { datapath } => {
            let dp = lookup_datapath(ovs, &datapath).await?;
            let (callback, reply) = PendingReply::pair();
            ovs.flows_enumerate(&dp, callback)?;
            serde_json::to_value(reply.await.context("Failed to list flows")?)?
        }
        FlowCommand::Add {
            datapath,
            in_port,
            output,
        } => {
            let dp = lookup_datapath(ovs, &datapath).await?;
            let mut flow = Flow::new(FlowMatch::new().with_key(FlowKey::InPort(in_port)));
            if let Some(port) = output {
                flow = flow.with_action(FlowAction::output(port));
            }
            let (callback, reply) = PendingReply::pair();
            ovs.flows_create(&dp, &flow, callback)?;
            serde_json::to_value(reply.await.context("Failed to add flow")?)?
        }
        FlowCommand::Delete { datapath, in_port } => {
            let dp = lookup_datapath(ovs, &datapath).await?;
            let (callback, reply) = PendingReply::pair();
            ovs.flows_delete(
                &dp,
                &FlowMatch::new().with_key(FlowKey::InPort(in_port)),
                callback,
            )?;
            serde_json::to_value(reply.await.context("Failed to delete flow")?)?
        }
        FlowCommand::Flush { datapath } => {
            let dp = lookup_datapath(ovs, &datapath).await?;
            let (callback, reply) = PendingReply::pair();
            ovs.flows_flush(&dp, callback)?;
            reply.await.context("Failed to flush flows")?;
            serde_json::to_value(Done {
                status: "flushed",
                datapath: &dp.name,
            })?
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_add() {
        let args = Args::try_parse_from([
            "op-odp", "port", "add", "ovs-system", "vx0", "--type", "vxlan", "--dst-port", "4789",
        ])
        .unwrap();
        match args.command {
            Commands::Port(PortCommand::Add {
                port_type, dst_port, ..
            }) => {
                assert_eq!(port_type, PortType::Vxlan);
                assert_eq!(dst_port, Some(4789));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_unknown_port_type() {
        assert!(Args::try_parse_from(["op-odp", "port", "add", "dp", "p", "--type", "bogus"]).is_err());
    }

    #[test]
    fn test_global_overrides() {
        let args =
            Args::try_parse_from(["op-odp", "--batch-size", "8", "--timeout-ms", "0", "datapath", "list"])
                .unwrap();
        assert_eq!(args.batch_size, Some(8));
        assert_eq!(args.timeout_ms, Some(0));
        assert!(matches!(args.command, Commands::Datapath(DatapathCommand::List)));
    }
}
