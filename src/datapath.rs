//! IPVLAN datapath setup inside a pod's network namespace (§4.12). Only the
//! companion CNI plug-in executable calls into this module — the daemon itself
//! never touches netlink or a pod's netns.

use crate::types::NetConf;
use anyhow::{Context, Result};
use futures::stream::TryStreamExt;
use ipnetwork::Ipv4Network;
use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::net::IpAddr;
use std::os::unix::io::AsRawFd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVlanMode {
    L2,
    L3,
    L3s,
}

impl IpVlanMode {
    pub fn parse(mode: &str) -> Result<Self> {
        match mode {
            "" | "l2" => Ok(Self::L2),
            "l3" => Ok(Self::L3),
            "l3s" => Ok(Self::L3s),
            other => anyhow::bail!("unknown ipvlan mode: {other}"),
        }
    }

    fn to_netlink(self) -> u16 {
        match self {
            Self::L2 => 0,
            Self::L3 => 1,
            Self::L3s => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IpVlanArgs {
    pub master: String,
    pub mode: String,
    pub mtu: u32,
}

/// Create an ipvlan slave on `args.master`, move it into the namespace at
/// `netns_path`, rename it to `if_name`, and assign the address/route `conf`
/// describes. Mirrors the reference CNI driver's create-then-move-then-configure
/// shape (§4.12).
pub async fn setup(netns_path: &str, if_name: &str, args: &IpVlanArgs, conf: &NetConf) -> Result<()> {
    let mode = IpVlanMode::parse(&args.mode)?;
    let tmp_name = format!("tmp{}", std::process::id());

    let (connection, handle, _) = rtnetlink::new_connection().context("opening host netlink socket")?;
    tokio::spawn(connection);

    let master_link = handle
        .link()
        .get()
        .match_name(args.master.clone())
        .execute()
        .try_next()
        .await
        .with_context(|| format!("looking up master interface {}", args.master))?
        .ok_or_else(|| anyhow::anyhow!("master interface {} not found", args.master))?;
    let master_index = master_link.header.index;

    handle
        .link()
        .add()
        .ipvlan(tmp_name.clone(), master_index, mode.to_netlink())
        .mtu(args.mtu)
        .execute()
        .await
        .context("creating ipvlan slave")?;

    let slave = handle
        .link()
        .get()
        .match_name(tmp_name.clone())
        .execute()
        .try_next()
        .await
        .context("refetching the newly created ipvlan slave")?
        .ok_or_else(|| anyhow::anyhow!("ipvlan slave {tmp_name} vanished after creation"))?;
    let slave_index = slave.header.index;

    let ns_file = File::open(netns_path).with_context(|| format!("opening netns {netns_path}"))?;
    handle
        .link()
        .set(slave_index)
        .setns_by_fd(ns_file.as_raw_fd())
        .execute()
        .await
        .context("moving ipvlan slave into the pod netns")?;

    configure_in_netns(&ns_file, slave_index, if_name, conf).await
}

/// Switch into the pod's netns, rename and bring up the slave, assign its address
/// and default route, then switch back. This process is multi-threaded (tokio),
/// so `setns` here affects only the calling OS thread; the netlink connection
/// created inside is scoped to that namespace for its lifetime.
async fn configure_in_netns(ns_file: &File, link_index: u32, if_name: &str, conf: &NetConf) -> Result<()> {
    let host_ns = File::open("/proc/self/ns/net").context("opening host netns for the return trip")?;
    setns(ns_file.as_raw_fd(), CloneFlags::CLONE_NEWNET).context("entering pod netns")?;

    let result = assign_address(link_index, if_name, conf).await;

    setns(host_ns.as_raw_fd(), CloneFlags::CLONE_NEWNET).context("returning to host netns")?;
    result
}

async fn assign_address(link_index: u32, if_name: &str, conf: &NetConf) -> Result<()> {
    let (connection, handle, _) = rtnetlink::new_connection().context("opening pod netlink socket")?;
    tokio::spawn(connection);

    handle
        .link()
        .set(link_index)
        .name(if_name.to_string())
        .up()
        .execute()
        .await
        .context("renaming and activating the ipvlan slave")?;

    let addr: IpAddr = conf
        .basic
        .pod_ip
        .ipv4
        .parse()
        .with_context(|| format!("parsing pod ip {}", conf.basic.pod_ip.ipv4))?;
    let pod_cidr: Ipv4Network = conf
        .basic
        .pod_cidr
        .ipv4
        .parse()
        .with_context(|| format!("parsing pod cidr {}", conf.basic.pod_cidr.ipv4))?;

    handle
        .address()
        .add(link_index, addr, pod_cidr.prefix())
        .execute()
        .await
        .context("assigning the pod ip address")?;

    if !conf.basic.gateway_ip.ipv4.is_empty() {
        let gateway: std::net::Ipv4Addr = conf
            .basic
            .gateway_ip
            .ipv4
            .parse()
            .with_context(|| format!("parsing gateway ip {}", conf.basic.gateway_ip.ipv4))?;
        handle
            .route()
            .add()
            .v4()
            .gateway(gateway)
            .execute()
            .await
            .context("adding the default route")?;
    }

    Ok(())
}
