//! End-to-end exercise of the allocation path through the public service trait,
//! backed by a stub SDN client so no real control plane is required.

use async_trait::async_trait;
use sdn_port_agent::manager::ResourceManager;
use sdn_port_agent::orchestrator::OrchestratorClient;
use sdn_port_agent::pool::SimpleObjectPool;
use sdn_port_agent::sdn::factory::PortFactory;
use sdn_port_agent::sdn::{CreatePortOpts, Network, NodeInfo, SdnClient, SdnPort, Subnet};
use sdn_port_agent::service::{AgentService, AllocationService};
use sdn_port_agent::storage::Ledger;
use sdn_port_agent::types::{
    AllocateIpRequest, GetIpInfoRequest, PodInfo, PodResources, ReleaseIpRequest,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct StubSdn {
    next: AtomicUsize,
}

#[async_trait]
impl SdnClient for StubSdn {
    async fn create_port(&self, opts: CreatePortOpts) -> anyhow::Result<SdnPort> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        Ok(SdnPort {
            id: opts.fixed_ip.clone().unwrap_or_else(|| format!("port-{n}")),
            name: opts.name,
            mac_address: "aa:bb:cc:dd:ee:ff".into(),
            fixed_ip: opts.fixed_ip.unwrap_or_else(|| format!("10.0.0.{}", n + 10)),
            status: "ACTIVE".into(),
        })
    }

    async fn delete_port(&self, _id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn add_tag(&self, _resource_type: &str, _resource_id: &str, _tag: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn list_ports(&self, _network_id: &str, _device_owner: &str, _tag: &str) -> anyhow::Result<Vec<SdnPort>> {
        Ok(vec![])
    }

    async fn get_subnet(&self, id: &str) -> anyhow::Result<Subnet> {
        Ok(Subnet {
            id: id.to_string(),
            cidr: "10.0.0.0/24".into(),
            gateway_ip: "10.0.0.1".into(),
        })
    }

    async fn get_network(&self, id: &str) -> anyhow::Result<Network> {
        Ok(Network { id: id.to_string(), mtu: 1500 })
    }

    async fn get_network_id(&self, name_or_id: &str) -> anyhow::Result<String> {
        Ok(name_or_id.to_string())
    }

    async fn get_subnet_id(&self, name_or_id: &str) -> anyhow::Result<String> {
        Ok(name_or_id.to_string())
    }

    async fn fetch_node_identity(&self) -> anyhow::Result<NodeInfo> {
        Ok(NodeInfo {
            uuid: "node-test".into(),
            name: "test-node".into(),
            project_id: "proj".into(),
        })
    }
}

struct StubOrchestrator;

#[async_trait]
impl OrchestratorClient for StubOrchestrator {
    async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<PodInfo> {
        let static_ip = if name == "pinned" { Some("10.0.0.200".to_string()) } else { None };
        let ip_stick_duration = if name.starts_with("web-") {
            Duration::from_secs(300)
        } else {
            Duration::from_secs(0)
        };
        Ok(PodInfo {
            namespace: namespace.to_string(),
            name: name.to_string(),
            pod_ip: None,
            ip_stick_duration,
            static_ip,
        })
    }

    async fn list_local_pods(&self, _node_name: &str, _label_selector: Option<&str>) -> anyhow::Result<Vec<PodInfo>> {
        Ok(vec![])
    }
}

async fn build_service(ledger_path: &std::path::Path) -> AgentService<PortFactory> {
    let db = sled::open(ledger_path).unwrap();
    let ledger = Arc::new(Ledger::<PodResources>::open(&db, "pod_ports").unwrap());
    let factory = Arc::new(PortFactory::new(
        Arc::new(StubSdn { next: AtomicUsize::new(0) }),
        "net-1".into(),
        "subnet-1".into(),
        "rubble.io/node".into(),
        "node-test".into(),
    ));
    let pool = SimpleObjectPool::new(factory.clone(), 8, 1, 4).await.unwrap();
    let manager = ResourceManager::new(pool, factory, ledger);
    AgentService::new(manager, Arc::new(StubOrchestrator))
}

#[tokio::test]
async fn full_allocate_release_reallocate_workflow() {
    let dir = tempfile::tempdir().unwrap();
    let service = build_service(&dir.path().join("ledger.db")).await;

    let allocate_req = AllocateIpRequest {
        netns: "/proc/1/ns/net".into(),
        pod_name: "web-0".into(),
        pod_namespace: "default".into(),
        infra_container_id: "container-1".into(),
        if_name: "eth0".into(),
    };

    let first = service.allocate_ip(allocate_req.clone()).await.unwrap();
    assert!(first.success);
    let first_ip = first.net_confs[0].basic.pod_ip.ipv4.clone();

    let info = service
        .get_ip_info(GetIpInfoRequest {
            pod_name: "web-0".into(),
            pod_namespace: "default".into(),
            infra_container_id: "container-1".into(),
        })
        .await
        .unwrap();
    assert_eq!(info.net_confs[0].basic.pod_ip.ipv4, first_ip);

    service
        .release_ip(ReleaseIpRequest {
            pod_name: "web-0".into(),
            pod_namespace: "default".into(),
            infra_container_id: "container-1".into(),
        })
        .await
        .unwrap();

    // web-0 sticks for 5 minutes (StatefulSet-style naming in the stub
    // orchestrator), so reallocating right away reclaims the same port.
    let second = service.allocate_ip(allocate_req).await.unwrap();
    assert_eq!(second.net_confs[0].basic.pod_ip.ipv4, first_ip);
}

#[tokio::test]
async fn a_pinned_pod_always_gets_its_static_ip() {
    let dir = tempfile::tempdir().unwrap();
    let service = build_service(&dir.path().join("ledger.db")).await;

    let reply = service
        .allocate_ip(AllocateIpRequest {
            netns: "/proc/1/ns/net".into(),
            pod_name: "pinned".into(),
            pod_namespace: "default".into(),
            infra_container_id: "container-2".into(),
            if_name: "eth0".into(),
        })
        .await
        .unwrap();

    assert_eq!(reply.net_confs[0].basic.pod_ip.ipv4, "10.0.0.200");
}

#[tokio::test]
async fn distinct_pods_get_distinct_ports() {
    let dir = tempfile::tempdir().unwrap();
    let service = build_service(&dir.path().join("ledger.db")).await;

    let a = service
        .allocate_ip(AllocateIpRequest {
            netns: "/proc/1/ns/net".into(),
            pod_name: "app-a".into(),
            pod_namespace: "default".into(),
            infra_container_id: "container-a".into(),
            if_name: "eth0".into(),
        })
        .await
        .unwrap();
    let b = service
        .allocate_ip(AllocateIpRequest {
            netns: "/proc/1/ns/net".into(),
            pod_name: "app-b".into(),
            pod_namespace: "default".into(),
            infra_container_id: "container-b".into(),
            if_name: "eth0".into(),
        })
        .await
        .unwrap();

    assert_ne!(
        a.net_confs[0].basic.pod_ip.ipv4,
        b.net_confs[0].basic.pod_ip.ipv4
    );
}
