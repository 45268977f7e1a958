//! TCP [`ShardClient`].

use crate::error::{Error, NetworkError, Result};
use crate::network::rpc::{Message, ShardCommandRequest, ShardCommandResponse};
use crate::network::{read_message, write_message, ShardClient};
use crate::types::ShardDescriptor;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// Opens one connection per command to the shard's endpoint.
#[derive(Debug, Clone)]
pub struct TcpShardClient {
    connect_timeout: Duration,
}

impl Default for TcpShardClient {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
        }
    }
}

impl TcpShardClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl ShardClient for TcpShardClient {
    async fn run_command(
        &self,
        shard: &ShardDescriptor,
        request: ShardCommandRequest,
    ) -> Result<ShardCommandResponse> {
        let addr = connect_target(shard)?;

        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: "connection timeout".into(),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        let request_id = request.request_id;
        write_message(&mut stream, &Message::ShardCommand(request)).await?;

        match read_message(&mut stream).await? {
            Some(Message::ShardCommandReply(resp)) if resp.request_id == request_id => Ok(resp),
            Some(Message::ShardCommandReply(resp)) => Err(NetworkError::UnexpectedResponse(
                format!("reply for request {} while waiting for {}", resp.request_id, request_id),
            )
            .into()),
            Some(other) => {
                Err(NetworkError::UnexpectedResponse(format!("{:?}", other)).into())
            }
            None => Err(NetworkError::ConnectionClosed.into()),
        }
    }
}

/// The `host:port` to dial for `shard`. Hostnames are resolved on connect.
fn connect_target(shard: &ShardDescriptor) -> Result<&str> {
    let endpoint = shard.endpoint.as_str();
    let well_formed = endpoint
        .rsplit_once(':')
        .is_some_and(|(host, port)| {
            !host.is_empty()
                && !host.contains(|c: char| c == '/' || c == ',' || c.is_whitespace())
                && port.parse::<u16>().is_ok()
        });
    if !well_formed {
        return Err(Error::Config(format!(
            "shard {} has an unusable endpoint '{}'",
            shard.id, endpoint
        )));
    }
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::network::rpc::ShardCommand;
    use crate::network::{CommandHandler, ParticipantServer};
    use crate::types::{Namespace, ShardId};
    use std::sync::Arc;

    struct NotFoundHandler;

    #[async_trait]
    impl CommandHandler for NotFoundHandler {
        async fn handle(&self, request: ShardCommandRequest) -> ShardCommandResponse {
            ShardCommandResponse::error(request.request_id, ErrorKind::NamespaceNotFound, "ns not found")
        }
    }

    fn request(id: u64) -> ShardCommandRequest {
        let ns = Namespace::new("app", "users").unwrap();
        ShardCommandRequest::new(id, "app", ShardCommand::DropCollectionParticipant { ns })
    }

    #[tokio::test]
    async fn test_round_trip_over_tcp() {
        let (server, shutdown_tx) = ParticipantServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            ShardId::new("b"),
            Arc::new(NotFoundHandler),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let client = TcpShardClient::new();
        let shard = ShardDescriptor::new("b", addr.to_string());
        let resp = client.run_command(&shard, request(5)).await.unwrap();
        assert_eq!(resp.request_id, 5);
        assert_eq!(resp.status.kind(), Some(ErrorKind::NamespaceNotFound));

        let _ = shutdown_tx.send(()).await;
    }

    #[tokio::test]
    async fn test_unreachable_shard_is_network_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = TcpShardClient::new().with_connect_timeout(Duration::from_millis(200));
        let shard = ShardDescriptor::new("c", addr.to_string());
        let err = client.run_command(&shard, request(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[tokio::test]
    async fn test_connect_by_hostname() {
        let (server, shutdown_tx) = ParticipantServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            ShardId::new("b"),
            Arc::new(NotFoundHandler),
        )
        .await
        .unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(server.run());

        let client = TcpShardClient::new();
        let shard = ShardDescriptor::new("b", format!("localhost:{}", port));
        let resp = client.run_command(&shard, request(9)).await.unwrap();
        assert_eq!(resp.request_id, 9);

        let _ = shutdown_tx.send(()).await;
    }

    #[tokio::test]
    async fn test_bad_endpoint() {
        let client = TcpShardClient::new();
        for endpoint in ["", "shard-b", "shard-b:port", ":27018", "rs0/host1:27018,host2:27018"] {
            let shard = ShardDescriptor::new("c", endpoint);
            let err = client.run_command(&shard, request(1)).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Config, "endpoint '{}'", endpoint);
        }
    }
}
