//! Allocation socket server (§4.11): one JSON object per line over a Unix domain
//! socket, in place of the HTTP framing the teacher used — the CNI plug-in
//! executable is the only client and needs nothing richer than request/reply.

use crate::service::AllocationService;
use crate::types::{SocketRequest, SocketResponse};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

pub async fn serve(
    socket_path: &Path,
    service: Arc<dyn AllocationService>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    tracing::info!(path = %socket_path.display(), "allocation socket listening");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("allocation socket server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, _addr) = accepted?;
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, service).await {
                        tracing::warn!(error = %e, "allocation connection ended with an error");
                    }
                });
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, service: Arc<dyn AllocationService>) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<SocketRequest>(&line) {
            Ok(request) => dispatch(&service, request).await,
            Err(e) => SocketResponse::Error {
                message: format!("invalid request: {e}"),
            },
        };

        let mut encoded = serde_json::to_string(&response)?;
        encoded.push('\n');
        writer.write_all(encoded.as_bytes()).await?;
    }
    Ok(())
}

async fn dispatch(service: &Arc<dyn AllocationService>, request: SocketRequest) -> SocketResponse {
    match request {
        SocketRequest::AllocateIp(req) => match service.allocate_ip(req).await {
            Ok(reply) => SocketResponse::AllocateIp(reply),
            Err(e) => SocketResponse::Error { message: e.to_string() },
        },
        SocketRequest::ReleaseIp(req) => match service.release_ip(req).await {
            Ok(reply) => SocketResponse::ReleaseIp(reply),
            Err(e) => SocketResponse::Error { message: e.to_string() },
        },
        SocketRequest::GetIpInfo(req) => match service.get_ip_info(req).await {
            Ok(reply) => SocketResponse::GetIpInfo(reply),
            Err(e) => SocketResponse::Error { message: e.to_string() },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AllocateIpReply, AllocateIpRequest, GetIpInfoReply, GetIpInfoRequest, IpType, ReleaseIpReply, ReleaseIpRequest};
    use async_trait::async_trait;

    struct EchoService;

    #[async_trait]
    impl AllocationService for EchoService {
        async fn allocate_ip(&self, req: AllocateIpRequest) -> anyhow::Result<AllocateIpReply> {
            tracing::debug!(pod = %req.pod_name, "handled allocate");
            Ok(AllocateIpReply {
                success: true,
                ip_type: IpType::EniMultiIp,
                ipv4: true,
                net_confs: vec![],
            })
        }

        async fn release_ip(&self, _req: ReleaseIpRequest) -> anyhow::Result<ReleaseIpReply> {
            Ok(ReleaseIpReply { success: true })
        }

        async fn get_ip_info(&self, _req: GetIpInfoRequest) -> anyhow::Result<GetIpInfoReply> {
            Ok(GetIpInfoReply { success: true, net_confs: vec![] })
        }
    }

    #[tokio::test]
    async fn a_round_trip_request_gets_a_matching_reply() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("agent.sock");
        let shutdown = CancellationToken::new();

        let server_shutdown = shutdown.clone();
        let server_path = socket_path.clone();
        let handle = tokio::spawn(async move {
            serve(&server_path, Arc::new(EchoService), server_shutdown).await.unwrap();
        });

        // give the listener a moment to bind
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut stream = UnixStream::connect(&socket_path).await.unwrap();
        let request = SocketRequest::ReleaseIp(ReleaseIpRequest {
            pod_name: "web-0".into(),
            pod_namespace: "default".into(),
            infra_container_id: "abc".into(),
        });
        let mut line = serde_json::to_string(&request).unwrap();
        line.push('\n');
        stream.write_all(line.as_bytes()).await.unwrap();

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        reader.read_line(&mut response_line).await.unwrap();
        let response: SocketResponse = serde_json::from_str(response_line.trim()).unwrap();
        assert!(matches!(response, SocketResponse::ReleaseIp(ReleaseIpReply { success: true })));

        shutdown.cancel();
        handle.await.unwrap();
    }
}
