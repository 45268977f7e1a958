//! Network communication layer.
//!
//! Coordinators reach participants through a [`ShardClient`]. Messages are
//! bincode-encoded and sent as 4-byte big-endian length-prefixed frames over
//! TCP; [`LocalShardClient`] skips the wire and calls handlers in-process.

pub mod client;
pub mod local;
pub mod rpc;
pub mod server;

pub use client::TcpShardClient;
pub use local::LocalShardClient;
pub use rpc::{
    CommandStatus, Message, ShardCommand, ShardCommandRequest, ShardCommandResponse,
    DROP_COLLECTION_PARTICIPANT,
};
pub use server::ParticipantServer;

use crate::error::{NetworkError, Result};
use crate::types::ShardDescriptor;
use async_trait::async_trait;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Sends shard-local commands to participants.
///
/// An `Err` means the command outcome is unknown (connection, framing or
/// timeout failure). A command the participant rejected comes back as an
/// `Ok` response with an error status.
#[async_trait]
pub trait ShardClient: Send + Sync + fmt::Debug {
    async fn run_command(
        &self,
        shard: &ShardDescriptor,
        request: ShardCommandRequest,
    ) -> Result<ShardCommandResponse>;
}

/// Serves shard-local commands on a participant.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, request: ShardCommandRequest) -> ShardCommandResponse;
}

/// Write one length-prefixed message.
pub(crate) async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = rpc::frame_message(msg)?;
    writer.write_all(&framed).await.map_err(NetworkError::Io)?;
    writer.flush().await.map_err(NetworkError::Io)?;
    Ok(())
}

/// Read one length-prefixed message. `None` on a clean close before the
/// length prefix.
pub(crate) async fn read_message<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e).into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > rpc::MAX_MESSAGE_SIZE {
        return Err(NetworkError::MessageTooLarge(len).into());
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await.map_err(NetworkError::Io)?;
    Ok(Some(rpc::decode_message(&data)?))
}
