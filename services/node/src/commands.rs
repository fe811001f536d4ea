//! Dispatch intents flowing through the command bus.

use bytes::Bytes;
use fabric_protocol::ResponseType;
use uuid::Uuid;

/// Write `payload` to every connection in the target participant's
/// collective.  Emitters must resolve cross-node routing first; a missing
/// local collective is a hard error at the handler.
#[derive(Debug, Clone)]
pub struct MessageDispatchCommand {
    pub participant_identifier: String,
    pub payload: Bytes,
    pub response_type: ResponseType,
    pub sent_at: u64,
}

/// Mirror `payload` to every device of the participant except the
/// originating connection.
#[derive(Debug, Clone)]
pub struct DeviceBroadcastCommand {
    pub participant_identifier: String,
    pub source_unique_identifier: Uuid,
    pub response_type: ResponseType,
    pub payload: Bytes,
}
