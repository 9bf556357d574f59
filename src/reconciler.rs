//! Start-up reconciliation (§4.7): classify every port this node already owns on
//! the SDN as idle or in-use by cross-referencing the ledger's pod→port mapping
//! against the set of pods actually still scheduled on this node, then seed the
//! pool with that state. Never creates or deletes SDN resources — it only decides
//! where existing ones belong.

use crate::orchestrator::OrchestratorClient;
use crate::pool::SimpleObjectPool;
use crate::sdn::factory::PortFactory;
use crate::storage::Ledger;
use crate::types::{PodResources, RESOURCE_TYPE_PORT};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub async fn reconcile(
    factory: &PortFactory,
    ledger: &Ledger<PodResources>,
    pool: &Arc<SimpleObjectPool<PortFactory>>,
    orchestrator: &dyn OrchestratorClient,
    node_name: &str,
    label_selector: Option<&str>,
) -> anyhow::Result<()> {
    let owned_ports = factory.list_owned().await?;

    let mut port_to_pod: HashMap<String, String> = HashMap::new();
    for pod_resources in ledger.list() {
        let key = pod_resources.key();
        for item in pod_resources.resources_of_type(RESOURCE_TYPE_PORT) {
            port_to_pod.insert(item.id.clone(), key.clone());
        }
    }

    let local_pods: HashSet<String> = orchestrator
        .list_local_pods(node_name, label_selector)
        .await?
        .into_iter()
        .map(|p| p.key())
        .collect();

    let mut idle = Vec::new();
    let mut in_use = Vec::new();
    for port in owned_ports {
        match port_to_pod.get(&port.id) {
            Some(pod_key) if local_pods.contains(pod_key) => {
                tracing::info!(port_id = %port.id, pod = %pod_key, "reconciled port as in-use");
                in_use.push((pod_key.clone(), port));
            }
            Some(pod_key) => {
                // The ledger still attributes this port to a pod, but that pod is
                // no longer scheduled here — a GC candidate, not a live allocation.
                tracing::info!(port_id = %port.id, pod = %pod_key, "reconciled port as idle (pod no longer local)");
                idle.push(port);
            }
            None => {
                tracing::info!(port_id = %port.id, "reconciled port as idle");
                idle.push(port);
            }
        }
    }

    let idle_count = idle.len();
    let in_use_count = in_use.len();
    pool.seed(idle, in_use).await;
    tracing::info!(idle = idle_count, in_use = in_use_count, "reconciliation complete");
    Ok(())
}
