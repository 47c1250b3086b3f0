//! Typed payloads exchanged over the broker and persisted in the store.
//!
//! Every struct serializes with camelCase field names so the wire format stays
//! compatible with the snapshot workers consuming and producing these messages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Validation failure for a decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    InvertedRange { begin: u64, end: u64 },
    EmptyField { field: &'static str },
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageError::InvertedRange { begin, end } => {
                write!(f, "epoch range is inverted (begin {begin} > end {end})")
            }
            MessageError::EmptyField { field } => write!(f, "{field} cannot be empty"),
        }
    }
}

impl std::error::Error for MessageError {}

/// Inclusive range of block heights treated as one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epoch {
    pub begin: u64,
    pub end: u64,
}

impl Epoch {
    pub fn new(begin: u64, end: u64) -> Result<Self, MessageError> {
        let epoch = Self { begin, end };
        epoch.validate()?;
        Ok(epoch)
    }

    /// Number of blocks covered by the range.
    pub fn span(&self) -> u64 {
        self.end.saturating_sub(self.begin).saturating_add(1)
    }

    pub fn validate(&self) -> Result<(), MessageError> {
        if self.begin > self.end {
            return Err(MessageError::InvertedRange {
                begin: self.begin,
                end: self.end,
            });
        }
        Ok(())
    }
}

/// One distribution event for an epoch. Also the persisted checkpoint shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochBroadcast {
    pub begin: u64,
    pub end: u64,
    pub broadcast_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch_id: Option<u64>,
}

impl EpochBroadcast {
    /// Stamps a fresh broadcast id onto `epoch`.
    pub fn new(epoch: Epoch) -> Self {
        Self {
            begin: epoch.begin,
            end: epoch.end,
            broadcast_id: new_broadcast_id(),
            epoch_id: None,
        }
    }

    pub fn epoch(&self) -> Epoch {
        Epoch {
            begin: self.begin,
            end: self.end,
        }
    }

    pub fn validate(&self) -> Result<(), MessageError> {
        self.epoch().validate()?;
        if self.broadcast_id.trim().is_empty() {
            return Err(MessageError::EmptyField {
                field: "broadcastId",
            });
        }
        Ok(())
    }
}

/// Per-(epoch, project) work unit produced by fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotProcessMessage {
    pub begin: u64,
    pub end: u64,
    pub broadcast_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch_id: Option<u64>,
    pub contract: String,
    pub project_type: String,
}

impl SnapshotProcessMessage {
    pub fn for_project(broadcast: &EpochBroadcast, project_type: &str, contract: &str) -> Self {
        Self {
            begin: broadcast.begin,
            end: broadcast.end,
            broadcast_id: broadcast.broadcast_id.clone(),
            epoch_id: broadcast.epoch_id,
            contract: contract.trim().to_lowercase(),
            project_type: project_type.to_owned(),
        }
    }
}

/// Completion report emitted by a snapshot worker for one project and epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotFinalizedMessage {
    pub epoch_id: u64,
    pub project_id: String,
    pub snapshot_cid: String,
    pub begin: u64,
    pub end: u64,
    #[serde(default)]
    pub timestamp: u64,
}

impl SnapshotFinalizedMessage {
    pub fn validate(&self) -> Result<(), MessageError> {
        Epoch {
            begin: self.begin,
            end: self.end,
        }
        .validate()?;
        if self.project_id.trim().is_empty() {
            return Err(MessageError::EmptyField { field: "projectId" });
        }
        Ok(())
    }
}

/// Envelope forwarded to the payload-commit stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadCommitMessage {
    pub message: SnapshotFinalizedMessage,
    pub web3_storage: bool,
    pub source_chain_id: u64,
}

/// Bundle of finalized messages for a completed join set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateMessage {
    pub messages: Vec<SnapshotFinalizedMessage>,
    pub timestamp: u64,
    pub broadcast_id: String,
}

impl AggregateMessage {
    pub fn new(messages: Vec<SnapshotFinalizedMessage>) -> Self {
        Self {
            messages,
            timestamp: unix_timestamp(),
            broadcast_id: new_broadcast_id(),
        }
    }
}

/// Response body of the epoch authority endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochAuthorityReport {
    pub epoch_start_block_height: u64,
    pub epoch_end_block_height: u64,
}

impl EpochAuthorityReport {
    pub fn into_epoch(self) -> Result<Epoch, MessageError> {
        Epoch::new(self.epoch_start_block_height, self.epoch_end_block_height)
    }
}

/// Observability record appended to a broadcast's processing log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingLogEntry {
    pub worker: String,
    pub update: ProcessingUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingUpdate {
    pub action: String,
    pub info: PublishInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishInfo {
    pub routing_key: String,
    pub msg: serde_json::Value,
}

pub fn new_broadcast_id() -> String {
    Uuid::new_v4().to_string()
}

/// Seconds since the unix epoch; zero if the clock is before 1970.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
