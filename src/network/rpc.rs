//! RPC message types for coordinator to participant communication.

use crate::error::{Error, ErrorKind, NetworkError, Result};
use crate::types::{ChunkVersion, Namespace, WriteConcern};
use serde::{Deserialize, Serialize};

/// Wire name of the shard-local drop command.
pub const DROP_COLLECTION_PARTICIPANT: &str = "_shardsvrDropCollectionParticipant";

/// Largest frame either side accepts.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Network message wrapper for all communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Command sent by a DDL coordinator to one shard.
    ShardCommand(ShardCommandRequest),

    /// Reply to a [`Message::ShardCommand`].
    ShardCommandReply(ShardCommandResponse),
}

/// Shard-local command carried by a [`ShardCommandRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardCommand {
    /// Drop the collection and its local sharding metadata.
    DropCollectionParticipant { ns: Namespace },
}

impl ShardCommand {
    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            ShardCommand::DropCollectionParticipant { .. } => DROP_COLLECTION_PARTICIPANT,
        }
    }

    /// Namespace the command acts on.
    pub fn namespace(&self) -> &Namespace {
        match self {
            ShardCommand::DropCollectionParticipant { ns } => ns,
        }
    }

    /// Context attached to a shard's failure.
    pub fn failure_context(&self, shard: &str) -> String {
        match self {
            ShardCommand::DropCollectionParticipant { .. } => {
                format!("Error dropping collection on shard {}", shard)
            }
        }
    }
}

/// A command addressed to one shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardCommandRequest {
    /// Unique request ID for correlation.
    pub request_id: u64,

    /// Database the command runs against.
    pub db: String,

    pub command: ShardCommand,

    pub write_concern: WriteConcern,

    /// Routing version the sender believes the shard is at.
    pub shard_version: ChunkVersion,
}

impl ShardCommandRequest {
    /// A request with majority write concern that skips the participant's
    /// version check.
    pub fn new(request_id: u64, db: impl Into<String>, command: ShardCommand) -> Self {
        Self {
            request_id,
            db: db.into(),
            command,
            write_concern: WriteConcern::Majority,
            shard_version: ChunkVersion::IGNORED,
        }
    }

    pub fn with_write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.write_concern = write_concern;
        self
    }
}

/// Command status as reported by the participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Ok,
    Error { kind: ErrorKind, message: String },
}

impl CommandStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, CommandStatus::Ok)
    }

    /// The error kind, `None` for `Ok`.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            CommandStatus::Ok => None,
            CommandStatus::Error { kind, .. } => Some(*kind),
        }
    }

    /// Convert to a local result.
    pub fn into_result(self) -> Result<()> {
        match self {
            CommandStatus::Ok => Ok(()),
            CommandStatus::Error { kind, message } => Err(Error::remote(kind, message)),
        }
    }
}

impl From<&Error> for CommandStatus {
    fn from(e: &Error) -> Self {
        CommandStatus::Error {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Reply to a [`ShardCommandRequest`].
///
/// The command status and the write concern outcome are reported
/// separately: a command may succeed locally and still fail to replicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCommandResponse {
    /// The request ID this is responding to.
    pub request_id: u64,

    pub status: CommandStatus,

    /// Set when the write concern could not be satisfied.
    pub write_concern_error: Option<String>,
}

impl ShardCommandResponse {
    /// Create a success response.
    pub fn ok(request_id: u64) -> Self {
        Self {
            request_id,
            status: CommandStatus::Ok,
            write_concern_error: None,
        }
    }

    /// Create an error response.
    pub fn error(request_id: u64, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            request_id,
            status: CommandStatus::Error {
                kind,
                message: message.into(),
            },
            write_concern_error: None,
        }
    }

    /// Create a response from a local result.
    pub fn from_result(request_id: u64, result: &Result<()>) -> Self {
        Self {
            request_id,
            status: match result {
                Ok(()) => CommandStatus::Ok,
                Err(e) => CommandStatus::from(e),
            },
            write_concern_error: None,
        }
    }

    /// Attach a write concern error.
    pub fn with_write_concern_error(mut self, message: impl Into<String>) -> Self {
        self.write_concern_error = Some(message.into());
        self
    }
}

/// Encode a message to bytes.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

/// Decode a message from bytes.
pub fn decode_message(data: &[u8]) -> Result<Message> {
    Ok(bincode::deserialize(data)?)
}

/// Frame a message with length prefix for TCP transmission.
pub fn frame_message(msg: &Message) -> Result<Vec<u8>> {
    let data = encode_message(msg)?;
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(NetworkError::MessageTooLarge(data.len()).into());
    }
    let len = data.len() as u32;

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&data);

    Ok(framed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Namespace {
        Namespace::new("app", "users").unwrap()
    }

    #[test]
    fn test_request_defaults() {
        let req = ShardCommandRequest::new(7, "app", ShardCommand::DropCollectionParticipant { ns: ns() });
        assert_eq!(req.write_concern, WriteConcern::Majority);
        assert!(req.shard_version.is_ignored());
        assert_eq!(req.command.name(), "_shardsvrDropCollectionParticipant");
        assert_eq!(
            req.command.failure_context("shardB"),
            "Error dropping collection on shard shardB"
        );
    }

    #[test]
    fn test_response_from_result() {
        let resp = ShardCommandResponse::from_result(3, &Ok(()));
        assert!(resp.status.is_ok());

        let err = Error::NamespaceNotFound("app.users".into());
        let resp = ShardCommandResponse::from_result(3, &Err(err));
        assert_eq!(resp.status.kind(), Some(ErrorKind::NamespaceNotFound));

        let back = resp.status.into_result().unwrap_err();
        assert_eq!(back.kind(), ErrorKind::NamespaceNotFound);
    }

    #[test]
    fn test_frame_message() {
        let msg = Message::ShardCommandReply(
            ShardCommandResponse::error(9, ErrorKind::StaleEpoch, "epoch mismatch")
                .with_write_concern_error("waiting for replication timed out"),
        );

        let framed = frame_message(&msg).unwrap();

        // First 4 bytes should be length
        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(len, framed.len() - 4);

        match decode_message(&framed[4..]).unwrap() {
            Message::ShardCommandReply(resp) => {
                assert_eq!(resp.request_id, 9);
                assert_eq!(resp.status.kind(), Some(ErrorKind::StaleEpoch));
                assert!(resp.write_concern_error.is_some());
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }
}
