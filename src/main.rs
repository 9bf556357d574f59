use anyhow::Context;
use clap::Parser;
use sdn_port_agent::config::{self, Cli, DaemonConfig};
use sdn_port_agent::manager::ResourceManager;
use sdn_port_agent::orchestrator::kube_client::KubeOrchestratorClient;
use sdn_port_agent::pool::SimpleObjectPool;
use sdn_port_agent::reconciler;
use sdn_port_agent::sdn::factory::PortFactory;
use sdn_port_agent::sdn::neutron::NeutronClient;
use sdn_port_agent::service::{AgentService, AllocationService};
use sdn_port_agent::storage::Ledger;
use sdn_port_agent::types::PodResources;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sdn_port_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let daemon_config = DaemonConfig::load(&cli.config).context("loading daemon configuration")?;
    tracing::info!(?daemon_config, "starting sdn-port-agentd");

    let sdn_client: Arc<dyn sdn_port_agent::sdn::SdnClient> =
        Arc::new(NeutronClient::new(cli.sdn_endpoint.clone(), cli.sdn_token.clone()));

    let node = config::resolve_node_identity(sdn_client.as_ref(), &daemon_config.node_name).await;
    tracing::info!(node_uuid = %node.uuid, node_name = %node.name, "resolved node identity");

    let net_id = sdn_client
        .get_network_id(&daemon_config.net_id)
        .await
        .context("resolving network id")?;
    let subnet_id = sdn_client
        .get_subnet_id(&daemon_config.subnet_id)
        .await
        .context("resolving subnet id")?;

    let factory = Arc::new(PortFactory::new(
        sdn_client,
        net_id,
        subnet_id,
        "rubble.io/node".to_string(),
        node.uuid,
    ));

    let pool = SimpleObjectPool::new(
        factory.clone(),
        daemon_config.max_pool_size,
        daemon_config.min_idle_size,
        daemon_config.max_idle_size,
    )
    .await
    .context("preloading the resource pool")?;

    std::fs::create_dir_all(&cli.ledger_path).context("creating ledger directory")?;
    let db = sled::open(&cli.ledger_path).context("opening the embedded ledger database")?;
    let ledger = Arc::new(Ledger::<PodResources>::open(&db, "pod_ports").context("opening pod_ports tree")?);

    let orchestrator = Arc::new(
        KubeOrchestratorClient::try_new()
            .await
            .context("building the orchestrator client")?,
    );

    reconciler::reconcile(&factory, &ledger, &pool, orchestrator.as_ref(), &daemon_config.node_name, None)
        .await
        .context("reconciling existing SDN ports at start-up")?;

    let shutdown = CancellationToken::new();
    let maintenance_handle = pool.spawn_maintenance(shutdown.clone());

    let manager = ResourceManager::new(pool.clone(), factory.clone(), ledger);
    let service: Arc<dyn AllocationService> = Arc::new(AgentService::new(manager, orchestrator));

    let socket_shutdown = shutdown.clone();
    let socket_path = cli.socket_path.clone();
    let socket_handle = tokio::spawn(async move {
        if let Err(e) = sdn_port_agent::socket::serve(&socket_path, service, socket_shutdown).await {
            tracing::error!(error = %e, "allocation socket server exited with an error");
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received");
    shutdown.cancel();

    let _ = tokio::join!(maintenance_handle, socket_handle);
    Ok(())
}
