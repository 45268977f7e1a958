//! TCP server accepting shard commands on a participant.

use crate::error::{NetworkError, Result};
use crate::network::rpc::Message;
use crate::network::{read_message, write_message, CommandHandler};
use crate::types::ShardId;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// TCP front end for a shard's [`CommandHandler`].
pub struct ParticipantServer {
    listener: TcpListener,

    shard_id: ShardId,

    handler: Arc<dyn CommandHandler>,

    shutdown_rx: mpsc::Receiver<()>,
}

impl ParticipantServer {
    /// Bind the listening socket. Returns the server and its shutdown sender.
    pub async fn bind(
        bind_addr: SocketAddr,
        shard_id: ShardId,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(Self, mpsc::Sender<()>)> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(NetworkError::Io)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let server = Self {
            listener,
            shard_id,
            handler,
            shutdown_rx,
        };

        Ok((server, shutdown_tx))
    }

    /// Address actually bound, useful with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(NetworkError::Io)?)
    }

    /// Serve until the shutdown sender fires or is dropped.
    pub async fn run(mut self) -> Result<()> {
        info!(shard = %self.shard_id, addr = ?self.listener.local_addr().ok(), "Participant server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler).await {
                                    debug!(error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!(shard = %self.shard_id, "Participant server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        mut stream: TcpStream,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<()> {
        while let Some(msg) = read_message(&mut stream).await? {
            match msg {
                Message::ShardCommand(request) => {
                    let response = handler.handle(request).await;
                    write_message(&mut stream, &Message::ShardCommandReply(response)).await?;
                }
                other => {
                    warn!(message = ?other, "Ignoring unexpected message");
                }
            }
        }
        Ok(())
    }
}
