//! `kube`-backed [`OrchestratorClient`] (§4.9). Ported from the reference
//! implementation's pod-to-`PodInfo` conversion: a pod sticks to its port for five
//! minutes after release if it opted in via annotation or is owned by a
//! StatefulSet, both signals a controller uses to avoid handing the same pod a
//! fresh IP on every restart.

use super::OrchestratorClient;
use crate::types::{annotations, PodInfo};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use std::time::Duration;

const STICK_DURATION_FOR_WORKLOAD: Duration = Duration::from_secs(5 * 60);

pub struct KubeOrchestratorClient {
    client: Client,
}

impl KubeOrchestratorClient {
    pub async fn try_new() -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl OrchestratorClient for KubeOrchestratorClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<PodInfo> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = api.get(name).await?;
        Ok(convert_pod(&pod))
    }

    async fn list_local_pods(&self, node_name: &str, label_selector: Option<&str>) -> anyhow::Result<Vec<PodInfo>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let mut params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = api.list(&params).await?;
        Ok(list.items.iter().map(convert_pod).collect())
    }
}

fn convert_pod(pod: &Pod) -> PodInfo {
    let meta = &pod.metadata;
    let namespace = meta.namespace.clone().unwrap_or_default();
    let name = meta.name.clone().unwrap_or_default();
    let pod_ip = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.clone())
        .filter(|ip| !ip.is_empty());

    let anns = meta.annotations.as_ref();
    let static_ip = anns.and_then(|a| a.get(annotations::STATIC_IP)).cloned();
    let sticky_flag = anns
        .and_then(|a| a.get(annotations::STICKY))
        .map(|v| v == "true")
        .unwrap_or(false);

    let owned_by_workload = meta
        .owner_references
        .as_ref()
        .map(|refs| {
            refs.iter()
                .any(|r| r.kind.eq_ignore_ascii_case("statefulset"))
        })
        .unwrap_or(false);

    let ip_stick_duration = if sticky_flag || owned_by_workload {
        STICK_DURATION_FOR_WORKLOAD
    } else {
        Duration::ZERO
    };

    PodInfo {
        namespace,
        name,
        pod_ip,
        ip_stick_duration,
        static_ip,
    }
}
