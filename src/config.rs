//! Daemon configuration (§4.9): a JSON file for the pool/network shape plus a CLI
//! surface (via `clap`) for operational overrides, following the reference
//! implementation's `DaemonConfigure` field set.

use crate::sdn::{NodeInfo, SdnClient, FAKE_NODE_UUID};
use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "sdn-port-agentd", about = "Pre-warmed SDN port pool daemon")]
pub struct Cli {
    /// Path to the daemon's JSON configuration file.
    #[arg(long, default_value = "/etc/sdn-port-agent/config.json")]
    pub config: PathBuf,

    /// Unix socket the CNI plug-in executable talks to (§4.11).
    #[arg(long, default_value = "/var/run/sdn-port-agent/agent.sock")]
    pub socket_path: PathBuf,

    /// Directory backing the embedded ledger (§4.2).
    #[arg(long, default_value = "/var/lib/sdn-port-agent/ledger")]
    pub ledger_path: PathBuf,

    /// Base URL of the SDN control-plane API.
    #[arg(long, env = "SDN_ENDPOINT")]
    pub sdn_endpoint: String,

    /// Auth token for the SDN control-plane API.
    #[arg(long, env = "SDN_TOKEN")]
    pub sdn_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub service_cidr: String,
    pub net_id: String,
    pub subnet_id: String,
    pub max_pool_size: usize,
    pub min_pool_size: usize,
    pub max_idle_size: usize,
    pub min_idle_size: usize,
    pub period_secs: u64,
    pub node_name: String,
}

impl DaemonConfig {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }
}

/// Resolve this node's SDN identity, falling back to a stand-in uuid so the daemon
/// can still start against a control plane without a working metadata service
/// (useful in local/dev deployments).
pub async fn resolve_node_identity(client: &dyn SdnClient, node_name: &str) -> NodeInfo {
    match client.fetch_node_identity().await {
        Ok(info) => info,
        Err(e) => {
            tracing::warn!(error = %e, "node identity lookup failed, using a placeholder uuid");
            NodeInfo {
                uuid: FAKE_NODE_UUID.to_string(),
                name: node_name.to_string(),
                project_id: String::new(),
            }
        }
    }
}
