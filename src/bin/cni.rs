//! CNI-style plug-in executable (§4.12). Invoked once per pod network attach/detach
//! by the kubelet's CNI shim: reads the network config on stdin and the pod
//! identity from `CNI_ARGS`, asks the daemon over its allocation socket for (or to
//! release) a port, wires up the ipvlan datapath on ADD, and prints the CNI result
//! on stdout.

use anyhow::{bail, Context};
use sdn_port_agent::datapath::{self, IpVlanArgs};
use sdn_port_agent::types::{
    AllocateIpReply, GetIpInfoReply, NetConf, ReleaseIpReply, SocketRequest, SocketResponse,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

const DEFAULT_SOCKET_PATH: &str = "/var/run/sdn-port-agent/agent.sock";
const DEFAULT_CNI_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Deserialize)]
struct StdinNetConf {
    #[serde(default)]
    master: String,
    #[serde(default)]
    mode: String,
    #[serde(default)]
    mtu: u32,
}

#[derive(Debug)]
struct K8sArgs {
    pod_name: String,
    pod_namespace: String,
    infra_container_id: String,
}

#[derive(Debug, Serialize)]
struct CniIpConfig {
    address: String,
    gateway: String,
}

#[derive(Debug, Serialize)]
struct CniInterface {
    name: String,
}

#[derive(Debug, Serialize)]
struct CniResult {
    #[serde(rename = "cniVersion")]
    cni_version: String,
    interfaces: Vec<CniInterface>,
    ips: Vec<CniIpConfig>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "sdn_port_agent=info".into()),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building the single-threaded runtime for the CNI call")?;
    runtime.block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let command = std::env::var("CNI_COMMAND").context("CNI_COMMAND is required")?;
    let container_id = std::env::var("CNI_CONTAINERID").unwrap_or_default();
    let netns = std::env::var("CNI_NETNS").unwrap_or_default();
    let if_name = std::env::var("CNI_IFNAME").unwrap_or_else(|_| "eth0".to_string());
    let cni_args = std::env::var("CNI_ARGS").unwrap_or_default();
    let k8s_args = parse_k8s_args(&cni_args, &container_id)?;

    let mut stdin_data = String::new();
    std::io::stdin()
        .read_to_string(&mut stdin_data)
        .context("reading network config from stdin")?;
    let net_conf: StdinNetConf = serde_json::from_str(&stdin_data).context("parsing network config")?;

    let socket_path =
        std::env::var("SDN_PORT_AGENT_SOCKET").unwrap_or_else(|_| DEFAULT_SOCKET_PATH.to_string());

    match command.as_str() {
        "ADD" => cmd_add(&socket_path, &netns, &if_name, &net_conf, &k8s_args).await,
        "DEL" => cmd_del(&socket_path, &k8s_args).await,
        "CHECK" => cmd_check(&socket_path, &k8s_args).await,
        other => bail!("unsupported CNI_COMMAND: {other}"),
    }
}

async fn cmd_add(
    socket_path: &str,
    netns: &str,
    if_name: &str,
    net_conf: &StdinNetConf,
    k8s_args: &K8sArgs,
) -> anyhow::Result<()> {
    let request = SocketRequest::AllocateIp(sdn_port_agent::types::AllocateIpRequest {
        netns: netns.to_string(),
        pod_name: k8s_args.pod_name.clone(),
        pod_namespace: k8s_args.pod_namespace.clone(),
        infra_container_id: k8s_args.infra_container_id.clone(),
        if_name: if_name.to_string(),
    });

    let response = call_agent(socket_path, request).await?;
    let reply: AllocateIpReply = match response {
        SocketResponse::AllocateIp(reply) => reply,
        SocketResponse::Error { message } => bail!("allocate_ip failed: {message}"),
        _ => bail!("unexpected response to allocate_ip"),
    };
    if !reply.success {
        bail!("allocate_ip reported failure");
    }

    let conf = reply
        .net_confs
        .first()
        .context("allocate_ip reply carried no network config")?;

    let ipvlan_args = IpVlanArgs {
        master: net_conf.master.clone(),
        mode: net_conf.mode.clone(),
        mtu: net_conf.mtu,
    };
    datapath::setup(netns, if_name, &ipvlan_args, conf)
        .await
        .context("setting up the ipvlan datapath")?;

    print_result(if_name, conf)
}

async fn cmd_del(socket_path: &str, k8s_args: &K8sArgs) -> anyhow::Result<()> {
    let request = SocketRequest::ReleaseIp(sdn_port_agent::types::ReleaseIpRequest {
        pod_name: k8s_args.pod_name.clone(),
        pod_namespace: k8s_args.pod_namespace.clone(),
        infra_container_id: k8s_args.infra_container_id.clone(),
    });

    match call_agent(socket_path, request).await? {
        SocketResponse::ReleaseIp(ReleaseIpReply { success: true }) => Ok(()),
        SocketResponse::ReleaseIp(ReleaseIpReply { success: false }) => bail!("release_ip reported failure"),
        SocketResponse::Error { message } => bail!("release_ip failed: {message}"),
        _ => bail!("unexpected response to release_ip"),
    }
}

async fn cmd_check(socket_path: &str, k8s_args: &K8sArgs) -> anyhow::Result<()> {
    let request = SocketRequest::GetIpInfo(sdn_port_agent::types::GetIpInfoRequest {
        pod_name: k8s_args.pod_name.clone(),
        pod_namespace: k8s_args.pod_namespace.clone(),
        infra_container_id: k8s_args.infra_container_id.clone(),
    });

    match call_agent(socket_path, request).await? {
        SocketResponse::GetIpInfo(GetIpInfoReply { success: true, .. }) => Ok(()),
        SocketResponse::GetIpInfo(GetIpInfoReply { success: false, .. }) => bail!("get_ip_info reported failure"),
        SocketResponse::Error { message } => bail!("get_ip_info failed: {message}"),
        _ => bail!("unexpected response to get_ip_info"),
    }
}

async fn call_agent(socket_path: &str, request: SocketRequest) -> anyhow::Result<SocketResponse> {
    let stream = tokio::time::timeout(DEFAULT_CNI_TIMEOUT, UnixStream::connect(socket_path))
        .await
        .context("timed out connecting to the agent socket")?
        .with_context(|| format!("connecting to agent socket at {socket_path}"))?;

    let (reader, mut writer) = stream.into_split();
    let mut line = serde_json::to_string(&request)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await.context("sending request to agent")?;

    let mut reply_line = String::new();
    tokio::time::timeout(DEFAULT_CNI_TIMEOUT, BufReader::new(reader).read_line(&mut reply_line))
        .await
        .context("timed out waiting for agent reply")?
        .context("reading agent reply")?;

    serde_json::from_str(reply_line.trim()).context("parsing agent reply")
}

fn parse_k8s_args(cni_args: &str, container_id: &str) -> anyhow::Result<K8sArgs> {
    let mut fields: HashMap<&str, &str> = HashMap::new();
    for pair in cni_args.split(';').filter(|s| !s.is_empty()) {
        if let Some((key, value)) = pair.split_once('=') {
            fields.insert(key, value);
        }
    }

    Ok(K8sArgs {
        pod_name: fields
            .get("K8S_POD_NAME")
            .map(|s| s.to_string())
            .context("K8S_POD_NAME is required in CNI_ARGS")?,
        pod_namespace: fields
            .get("K8S_POD_NAMESPACE")
            .map(|s| s.to_string())
            .context("K8S_POD_NAMESPACE is required in CNI_ARGS")?,
        infra_container_id: fields
            .get("K8S_POD_INFRA_CONTAINER_ID")
            .map(|s| s.to_string())
            .unwrap_or_else(|| container_id.to_string()),
    })
}

fn print_result(if_name: &str, conf: &NetConf) -> anyhow::Result<()> {
    let result = CniResult {
        cni_version: "1.0.0".to_string(),
        interfaces: vec![CniInterface { name: if_name.to_string() }],
        ips: vec![CniIpConfig {
            address: format!("{}/{}", conf.basic.pod_ip.ipv4, cidr_prefix(&conf.basic.pod_cidr.ipv4)),
            gateway: conf.basic.gateway_ip.ipv4.clone(),
        }],
    };
    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

fn cidr_prefix(cidr: &str) -> &str {
    cidr.split('/').nth(1).unwrap_or("32")
}
