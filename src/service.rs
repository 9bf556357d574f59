//! Allocation service (§4.1/§4.9): turns the three CNI-facing RPCs into calls on
//! the resource manager, converting between the wire types and the orchestrator's
//! view of the pod. This is what the socket server dispatches onto.

use crate::error::PoolError;
use crate::manager::ResourceManager;
use crate::orchestrator::OrchestratorClient;
use crate::pool::ObjectFactory;
use crate::types::{
    AllocateIpReply, AllocateIpRequest, BasicInfo, EniInfo, GetIpInfoReply, GetIpInfoRequest, IpSet,
    IpType, NetConf, ReleaseIpReply, ReleaseIpRequest,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long a single allocation RPC is allowed to run before its wait on the pool
/// is cancelled (the factory call itself, once started, still always completes).
const DEFAULT_CNI_TIMEOUT: Duration = Duration::from_secs(20);

#[async_trait]
pub trait AllocationService: Send + Sync {
    async fn allocate_ip(&self, req: AllocateIpRequest) -> anyhow::Result<AllocateIpReply>;
    async fn release_ip(&self, req: ReleaseIpRequest) -> anyhow::Result<ReleaseIpReply>;
    async fn get_ip_info(&self, req: GetIpInfoRequest) -> anyhow::Result<GetIpInfoReply>;
}

pub struct AgentService<F: ObjectFactory> {
    manager: ResourceManager<F>,
    orchestrator: Arc<dyn OrchestratorClient>,
}

impl<F: ObjectFactory + 'static> AgentService<F> {
    pub fn new(manager: ResourceManager<F>, orchestrator: Arc<dyn OrchestratorClient>) -> Self {
        Self { manager, orchestrator }
    }

    async fn with_timeout<T>(
        &self,
        f: impl std::future::Future<Output = crate::error::Result<T>>,
        cancel: CancellationToken,
    ) -> crate::error::Result<T> {
        let timeout_cancel = cancel.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(DEFAULT_CNI_TIMEOUT).await;
            timeout_cancel.cancel();
        });
        let result = f.await;
        timer.abort();
        result
    }
}

#[async_trait]
impl<F: ObjectFactory + 'static> AllocationService for AgentService<F> {
    async fn allocate_ip(&self, req: AllocateIpRequest) -> anyhow::Result<AllocateIpReply> {
        let pod = self.orchestrator.get_pod(&req.pod_namespace, &req.pod_name).await?;

        let cancel = CancellationToken::new();
        let port = self
            .with_timeout(self.manager.allocate(&pod, &cancel), cancel.clone())
            .await?;

        Ok(AllocateIpReply {
            success: true,
            ip_type: IpType::EniMultiIp,
            ipv4: true,
            net_confs: vec![net_conf_from_port(&port)?],
        })
    }

    async fn release_ip(&self, req: ReleaseIpRequest) -> anyhow::Result<ReleaseIpReply> {
        // Check the ledger by key before fetching the pod: a CNI DEL retry after
        // the first release already succeeded often arrives once the pod object
        // itself is gone from the cluster, and get_pod would fail for no reason.
        let key = crate::types::pod_key(&req.pod_namespace, &req.pod_name);
        if !self.manager.has_record(&key) {
            return Ok(ReleaseIpReply { success: true });
        }

        let pod = self.orchestrator.get_pod(&req.pod_namespace, &req.pod_name).await?;
        self.manager.release(&pod).await?;
        Ok(ReleaseIpReply { success: true })
    }

    async fn get_ip_info(&self, req: GetIpInfoRequest) -> anyhow::Result<GetIpInfoReply> {
        let pod = self.orchestrator.get_pod(&req.pod_namespace, &req.pod_name).await?;
        let port = self.manager.get_info(&pod).await?;
        Ok(GetIpInfoReply {
            success: true,
            net_confs: vec![net_conf_from_port(&port)?],
        })
    }
}

fn net_conf_from_port(port: &crate::types::Port) -> anyhow::Result<NetConf> {
    if port.cidr.is_empty() || port.gateway.is_empty() {
        return Err(PoolError::InvalidState.into());
    }

    Ok(NetConf {
        basic: BasicInfo {
            pod_ip: IpSet { ipv4: port.ip.clone() },
            pod_cidr: IpSet { ipv4: port.cidr.clone() },
            gateway_ip: IpSet { ipv4: port.gateway.clone() },
        },
        eni: EniInfo {
            mac: port.mac.clone(),
            gateway_ip: IpSet { ipv4: port.gateway.clone() },
        },
    })
}
