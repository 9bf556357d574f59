//! Collaborator interface for the orchestrator (§4.9): the manager and the
//! allocation socket server only ever see [`OrchestratorClient`], never `kube`
//! directly.

pub mod kube_client;

use crate::types::PodInfo;
use async_trait::async_trait;

#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<PodInfo>;

    /// Every pod currently scheduled onto `node_name`, optionally narrowed by a
    /// label selector. Used by the reconciler to tell live allocations from
    /// orphaned ones at start-up (§4.7).
    async fn list_local_pods(&self, node_name: &str, label_selector: Option<&str>) -> anyhow::Result<Vec<PodInfo>>;
}
