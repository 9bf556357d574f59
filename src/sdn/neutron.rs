//! REST client for the reference SDN control plane (OpenStack Neutron). Out of scope
//! for the core engineering in this spec; implemented to the depth needed to compile
//! and to let the Port Factory and Reconciler exercise a real HTTP transport.

use super::{CreatePortOpts, Network, NodeInfo, SdnClient, SdnPort, Subnet};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

const METADATA_URL: &str = "http://169.254.169.254/openstack/latest/meta_data.json";

pub struct NeutronClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

impl NeutronClient {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v2.0/{}", self.endpoint.trim_end_matches('/'), path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .header("X-Auth-Token", &self.token)
    }
}

#[derive(Deserialize)]
struct PortEnvelope {
    port: RawPort,
}

#[derive(Deserialize)]
struct PortsEnvelope {
    ports: Vec<RawPort>,
}

#[derive(Deserialize)]
struct RawPort {
    id: String,
    name: String,
    mac_address: String,
    fixed_ips: Vec<RawFixedIp>,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
struct RawFixedIp {
    ip_address: String,
}

impl From<RawPort> for SdnPort {
    fn from(p: RawPort) -> Self {
        SdnPort {
            id: p.id,
            name: p.name,
            mac_address: p.mac_address,
            fixed_ip: p
                .fixed_ips
                .into_iter()
                .next()
                .map(|f| f.ip_address)
                .unwrap_or_default(),
            status: p.status,
        }
    }
}

#[derive(Deserialize)]
struct SubnetEnvelope {
    subnet: RawSubnet,
}

#[derive(Deserialize)]
struct RawSubnet {
    id: String,
    cidr: String,
    gateway_ip: String,
}

#[derive(Deserialize)]
struct NetworkEnvelope {
    network: RawNetwork,
}

#[derive(Deserialize)]
struct NetworksEnvelope {
    networks: Vec<RawNetwork>,
}

#[derive(Deserialize)]
struct RawNetwork {
    id: String,
    #[serde(default)]
    mtu: u32,
}

#[async_trait]
impl SdnClient for NeutronClient {
    async fn create_port(&self, opts: CreatePortOpts) -> anyhow::Result<SdnPort> {
        let mut fixed_ip = json!({ "subnet_id": opts.subnet_id });
        if let Some(ip) = &opts.fixed_ip {
            fixed_ip["ip_address"] = json!(ip);
        }
        let body = json!({
            "port": {
                "name": opts.name,
                "network_id": opts.network_id,
                "device_owner": opts.device_owner,
                "fixed_ips": [fixed_ip],
            }
        });

        let resp = self
            .request(reqwest::Method::POST, "ports")
            .json(&body)
            .send()
            .await
            .context("create_port: request failed")?
            .error_for_status()
            .context("create_port: non-success status")?
            .json::<PortEnvelope>()
            .await
            .context("create_port: invalid response body")?;

        Ok(resp.port.into())
    }

    async fn delete_port(&self, id: &str) -> anyhow::Result<()> {
        self.request(reqwest::Method::DELETE, &format!("ports/{id}"))
            .send()
            .await
            .context("delete_port: request failed")?
            .error_for_status()
            .context("delete_port: non-success status")?;
        Ok(())
    }

    async fn add_tag(&self, resource_type: &str, resource_id: &str, tag: &str) -> anyhow::Result<()> {
        let encoded_tag = urlencode(tag);
        self.request(
            reqwest::Method::PUT,
            &format!("{resource_type}/{resource_id}/tags/{encoded_tag}"),
        )
        .send()
        .await
        .context("add_tag: request failed")?
        .error_for_status()
        .context("add_tag: non-success status")?;
        Ok(())
    }

    async fn list_ports(
        &self,
        network_id: &str,
        device_owner: &str,
        tag: &str,
    ) -> anyhow::Result<Vec<SdnPort>> {
        let path = format!(
            "ports?network_id={network_id}&device_owner={device_owner}&tags={}",
            urlencode(tag)
        );
        let resp = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .context("list_ports: request failed")?
            .error_for_status()
            .context("list_ports: non-success status")?
            .json::<PortsEnvelope>()
            .await
            .context("list_ports: invalid response body")?;

        Ok(resp.ports.into_iter().map(SdnPort::from).collect())
    }

    async fn get_subnet(&self, id: &str) -> anyhow::Result<Subnet> {
        let resp = self
            .request(reqwest::Method::GET, &format!("subnets/{id}"))
            .send()
            .await
            .context("get_subnet: request failed")?
            .error_for_status()
            .context("get_subnet: non-success status")?
            .json::<SubnetEnvelope>()
            .await
            .context("get_subnet: invalid response body")?;

        Ok(Subnet {
            id: resp.subnet.id,
            cidr: resp.subnet.cidr,
            gateway_ip: resp.subnet.gateway_ip,
        })
    }

    async fn get_network(&self, id: &str) -> anyhow::Result<Network> {
        let resp = self
            .request(reqwest::Method::GET, &format!("networks/{id}"))
            .send()
            .await
            .context("get_network: request failed")?
            .error_for_status()
            .context("get_network: non-success status")?
            .json::<NetworkEnvelope>()
            .await
            .context("get_network: invalid response body")?;

        Ok(Network {
            id: resp.network.id,
            mtu: resp.network.mtu,
        })
    }

    async fn get_network_id(&self, name_or_id: &str) -> anyhow::Result<String> {
        let resp = self
            .request(reqwest::Method::GET, &format!("networks?name={name_or_id}"))
            .send()
            .await
            .context("get_network_id: request failed")?
            .error_for_status()
            .context("get_network_id: non-success status")?
            .json::<NetworksEnvelope>()
            .await
            .context("get_network_id: invalid response body")?;

        resp.networks
            .into_iter()
            .next()
            .map(|n| n.id)
            .ok_or_else(|| anyhow!("network not found: {name_or_id}"))
    }

    async fn get_subnet_id(&self, name_or_id: &str) -> anyhow::Result<String> {
        // The reference deployment accepts a subnet id directly; names are resolved
        // through the same list-by-name shape as networks.
        let resp = self
            .request(reqwest::Method::GET, &format!("subnets?name={name_or_id}"))
            .send()
            .await
            .context("get_subnet_id: request failed")?
            .error_for_status()
            .context("get_subnet_id: non-success status")?
            .json::<serde_json::Value>()
            .await
            .context("get_subnet_id: invalid response body")?;

        resp["subnets"][0]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("subnet not found: {name_or_id}"))
    }

    async fn fetch_node_identity(&self) -> anyhow::Result<NodeInfo> {
        #[derive(Deserialize)]
        struct Metadata {
            uuid: String,
            #[serde(default)]
            name: String,
            #[serde(default)]
            project_id: String,
        }

        let meta = reqwest::get(METADATA_URL)
            .await
            .context("fetch_node_identity: metadata endpoint unreachable")?
            .error_for_status()
            .context("fetch_node_identity: metadata endpoint returned an error")?
            .json::<Metadata>()
            .await
            .context("fetch_node_identity: invalid metadata body")?;

        Ok(NodeInfo {
            uuid: meta.uuid,
            name: meta.name,
            project_id: meta.project_id,
        })
    }
}

fn urlencode(s: &str) -> String {
    s.replace(':', "%3A").replace('/', "%2F")
}
