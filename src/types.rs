use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Every kind of thing the pool can manage carries an id, a type tag and a primary
/// IPv4 address. `Port` is the only concrete variant this crate implements.
pub trait NetworkResource: Send + Sync + std::fmt::Debug {
    fn resource_id(&self) -> &str;
    fn resource_type(&self) -> &'static str;
    fn ip_address(&self) -> &str;
}

pub const RESOURCE_TYPE_PORT: &str = "port";

/// An SDN-side network attachment: a MAC, one fixed IPv4, and the subnet it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub id: String,
    pub name: String,
    pub subnet_id: String,
    pub mac: String,
    pub ip: String,
    pub cidr: String,
    pub gateway: String,
    pub mtu: u32,
}

impl NetworkResource for Port {
    fn resource_id(&self) -> &str {
        &self.id
    }

    fn resource_type(&self) -> &'static str {
        RESOURCE_TYPE_PORT
    }

    fn ip_address(&self) -> &str {
        &self.ip
    }
}

/// Annotation keys the manager looks for when deciding on stickiness or a static IP.
pub mod annotations {
    pub const STATIC_IP: &str = "rubble.io/ip-address";
    pub const STICKY: &str = "rubble.io/ip-sticky";
}

/// What the orchestrator and the k8s client hand back about a pod.
#[derive(Debug, Clone)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub pod_ip: Option<String>,
    pub ip_stick_duration: Duration,
    pub static_ip: Option<String>,
}

impl PodInfo {
    pub fn key(&self) -> String {
        pod_key(&self.namespace, &self.name)
    }
}

pub fn pod_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// One resource a pod currently holds, as recorded in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceItem {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: String,
}

/// The ledger value: a pod and every resource it owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodResources {
    pub namespace: String,
    pub name: String,
    pub resources: Vec<ResourceItem>,
}

impl PodResources {
    pub fn key(&self) -> String {
        pod_key(&self.namespace, &self.name)
    }

    pub fn resources_of_type(&self, resource_type: &str) -> Vec<&ResourceItem> {
        self.resources
            .iter()
            .filter(|r| r.resource_type == resource_type)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Wire protocol between the daemon and the plug-in executable, §6.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IpSet {
    pub ipv4: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicInfo {
    pub pod_ip: IpSet,
    pub pod_cidr: IpSet,
    pub gateway_ip: IpSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EniInfo {
    pub mac: String,
    pub gateway_ip: IpSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConf {
    pub basic: BasicInfo,
    pub eni: EniInfo,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IpType {
    EniMultiIp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateIpRequest {
    pub netns: String,
    pub pod_name: String,
    pub pod_namespace: String,
    pub infra_container_id: String,
    pub if_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateIpReply {
    pub success: bool,
    pub ip_type: IpType,
    pub ipv4: bool,
    pub net_confs: Vec<NetConf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseIpRequest {
    pub pod_name: String,
    pub pod_namespace: String,
    pub infra_container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseIpReply {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetIpInfoRequest {
    pub pod_name: String,
    pub pod_namespace: String,
    pub infra_container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetIpInfoReply {
    pub success: bool,
    pub net_confs: Vec<NetConf>,
}

/// One JSON line in, one JSON line out; tagged by operation so a single socket
/// framer can dispatch all three RPCs (§4.11).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "payload")]
pub enum SocketRequest {
    AllocateIp(AllocateIpRequest),
    ReleaseIp(ReleaseIpRequest),
    GetIpInfo(GetIpInfoRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "payload")]
pub enum SocketResponse {
    AllocateIp(AllocateIpReply),
    ReleaseIp(ReleaseIpReply),
    GetIpInfo(GetIpInfoReply),
    Error { message: String },
}
