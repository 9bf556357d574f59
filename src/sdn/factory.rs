//! Port Factory (§4.3): the only piece of this crate allowed to create or delete
//! SDN-backed ports. Everything else — the pool, the manager, the reconciler — goes
//! through this seam instead of talking to [`SdnClient`] directly.

use crate::error::{PoolError, Result};
use crate::pool::ObjectFactory;
use crate::sdn::{self, CreatePortOpts, Network, SdnClient, SdnPort, Subnet};
use crate::types::Port;
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct PortFactory {
    client: Arc<dyn SdnClient>,
    network_id: String,
    subnet_id: String,
    tag_prefix: String,
    node_uuid: String,
    /// Ports this factory has created and not yet disposed of, mirroring the
    /// reference implementation's bookkeeping of what it is responsible for.
    created: Mutex<Vec<Port>>,
}

impl PortFactory {
    pub fn new(
        client: Arc<dyn SdnClient>,
        network_id: String,
        subnet_id: String,
        tag_prefix: String,
        node_uuid: String,
    ) -> Self {
        Self {
            client,
            network_id,
            subnet_id,
            tag_prefix,
            node_uuid,
            created: Mutex::new(Vec::new()),
        }
    }

    fn owner_tag(&self) -> String {
        format!("{}:{}", self.tag_prefix, self.node_uuid)
    }

    /// Every port this node owns on the SDN, with subnet/network metadata joined in.
    /// Used by the reconciler at start-up (§4.10), never by the steady-state pool.
    pub async fn list_owned(&self) -> Result<Vec<Port>> {
        let tag = self.owner_tag();
        let (subnet, network, ports) = tokio::try_join!(
            self.client.get_subnet(&self.subnet_id),
            self.client.get_network(&self.network_id),
            self.client
                .list_ports(&self.network_id, sdn::DEVICE_OWNER, &tag),
        )
        .map_err(PoolError::Factory)?;

        Ok(ports
            .into_iter()
            .map(|p| assemble(p, &subnet, &network))
            .collect())
    }
}

#[async_trait]
impl ObjectFactory for PortFactory {
    type Resource = Port;

    async fn create(&self, preferred_ip: Option<String>) -> Result<Port> {
        let opts = CreatePortOpts {
            name: format!("rubble-port-{}", random_suffix()),
            network_id: self.network_id.clone(),
            subnet_id: self.subnet_id.clone(),
            device_owner: sdn::DEVICE_OWNER.to_string(),
            fixed_ip: preferred_ip,
        };

        let (created, subnet, network) = tokio::try_join!(
            self.client.create_port(opts),
            self.client.get_subnet(&self.subnet_id),
            self.client.get_network(&self.network_id),
        )
        .map_err(PoolError::Factory)?;

        let tag = self.owner_tag();
        if let Err(e) = self.client.add_tag("ports", &created.id, &tag).await {
            tracing::warn!(port_id = %created.id, error = %e, "tagging new port failed, deleting it");
            let _ = self.client.delete_port(&created.id).await;
            return Err(PoolError::Factory(e));
        }

        let port = assemble(created, &subnet, &network);
        self.created.lock().await.push(port.clone());
        Ok(port)
    }

    async fn dispose(&self, resource: Port) -> Result<()> {
        self.client
            .delete_port(&resource.id)
            .await
            .map_err(PoolError::Factory)?;
        self.created.lock().await.retain(|p| p.id != resource.id);
        Ok(())
    }
}

fn assemble(port: SdnPort, subnet: &Subnet, network: &Network) -> Port {
    Port {
        id: port.id,
        name: port.name,
        subnet_id: subnet.id.clone(),
        mac: port.mac_address,
        ip: port.fixed_ip,
        cidr: subnet.cidr.clone(),
        gateway: subnet.gateway_ip.clone(),
        mtu: network.mtu,
    }
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}
