//! Decodes inbound deliveries into typed events by routing-key suffix.

use crate::broker::Delivery;
use crate::messages::{EpochBroadcast, MessageError, SnapshotFinalizedMessage};
use crate::topics::{event_suffix, EPOCH_RELEASED, SNAPSHOT_FINALIZED};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    EpochReleased(EpochBroadcast),
    SnapshotFinalized(SnapshotFinalizedMessage),
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::EpochReleased(_) => EPOCH_RELEASED,
            InboundMessage::SnapshotFinalized(_) => SNAPSHOT_FINALIZED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// No handler exists for the routing key's event suffix.
    UnknownRoutingKey(String),
    /// The body does not decode, or decodes to an invalid message.
    Malformed { event: &'static str, reason: String },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnknownRoutingKey(key) => write!(f, "unknown routing key {key}"),
            DecodeError::Malformed { event, reason } => {
                write!(f, "malformed {event} message: {reason}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

pub fn decode(delivery: &Delivery) -> Result<InboundMessage, DecodeError> {
    match event_suffix(&delivery.routing_key) {
        EPOCH_RELEASED => {
            let broadcast: EpochBroadcast = parse(EPOCH_RELEASED, &delivery.body)?;
            broadcast
                .validate()
                .map_err(|err| malformed(EPOCH_RELEASED, err))?;
            Ok(InboundMessage::EpochReleased(broadcast))
        }
        SNAPSHOT_FINALIZED => {
            let finalized: SnapshotFinalizedMessage = parse(SNAPSHOT_FINALIZED, &delivery.body)?;
            finalized
                .validate()
                .map_err(|err| malformed(SNAPSHOT_FINALIZED, err))?;
            Ok(InboundMessage::SnapshotFinalized(finalized))
        }
        _ => Err(DecodeError::UnknownRoutingKey(delivery.routing_key.clone())),
    }
}

fn parse<T: serde::de::DeserializeOwned>(event: &'static str, body: &[u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(body).map_err(|err| DecodeError::Malformed {
        event,
        reason: err.to_string(),
    })
}

fn malformed(event: &'static str, err: MessageError) -> DecodeError {
    DecodeError::Malformed {
        event,
        reason: err.to_string(),
    }
}
