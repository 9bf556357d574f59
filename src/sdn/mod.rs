//! Collaborator interface for the virtualised-network-service control plane (§4.8).
//!
//! `SdnClient` is the seam the Port Factory and the Reconciler are written against;
//! [`neutron::NeutronClient`] is the one concrete implementation shipped here.

pub mod factory;
pub mod neutron;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const DEVICE_OWNER: &str = "network:secondary";

#[derive(Debug, Clone)]
pub struct CreatePortOpts {
    pub name: String,
    pub network_id: String,
    pub subnet_id: String,
    pub device_owner: String,
    pub fixed_ip: Option<String>,
}

/// A port as the SDN itself reports it, before CIDR/gateway/MTU are joined in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdnPort {
    pub id: String,
    pub name: String,
    pub mac_address: String,
    pub fixed_ip: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub cidr: String,
    pub gateway_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub mtu: u32,
}

/// This node's identity on the SDN, used to scope port ownership tags (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub uuid: String,
    pub name: String,
    pub project_id: String,
}

pub const FAKE_NODE_UUID: &str = "fake-uuid-from-rubble";

#[async_trait]
pub trait SdnClient: Send + Sync {
    async fn create_port(&self, opts: CreatePortOpts) -> anyhow::Result<SdnPort>;
    async fn delete_port(&self, id: &str) -> anyhow::Result<()>;
    async fn add_tag(&self, resource_type: &str, resource_id: &str, tag: &str) -> anyhow::Result<()>;
    async fn list_ports(
        &self,
        network_id: &str,
        device_owner: &str,
        tag: &str,
    ) -> anyhow::Result<Vec<SdnPort>>;
    async fn get_subnet(&self, id: &str) -> anyhow::Result<Subnet>;
    async fn get_network(&self, id: &str) -> anyhow::Result<Network>;
    async fn get_network_id(&self, name_or_id: &str) -> anyhow::Result<String>;
    async fn get_subnet_id(&self, name_or_id: &str) -> anyhow::Result<String>;
    async fn fetch_node_identity(&self) -> anyhow::Result<NodeInfo>;
}
