use serde::{Deserialize, Serialize};

/// Commands sent FROM a peer TO the signaling relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalCommand {
    /// Join a room, leaving any room the session was in before
    Join {
        #[serde(rename = "roomId")]
        room_id: String,
    },

    /// Session description offer, relayed verbatim
    Offer {
        #[serde(rename = "roomId")]
        room_id: String,
        payload: serde_json::Value,
    },

    /// Session description answer, relayed verbatim
    Answer {
        #[serde(rename = "roomId")]
        room_id: String,
        payload: serde_json::Value,
    },

    /// Connectivity candidate, relayed verbatim
    IceCandidate {
        #[serde(rename = "roomId")]
        room_id: String,
        payload: serde_json::Value,
    },

    /// Leave the room explicitly
    Leave {
        #[serde(rename = "roomId")]
        room_id: String,
    },
}

impl SignalCommand {
    pub fn room_id(&self) -> &str {
        match self {
            Self::Join { room_id }
            | Self::Offer { room_id, .. }
            | Self::Answer { room_id, .. }
            | Self::IceCandidate { room_id, .. }
            | Self::Leave { room_id } => room_id,
        }
    }
}

/// Events sent FROM the relay TO a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalEvent {
    /// Relay confirms the join to the joiner
    Joined {
        #[serde(rename = "roomId")]
        room_id: String,
    },

    /// Another session joined the room
    PeerJoined {
        #[serde(rename = "roomId")]
        room_id: String,
    },

    Offer {
        #[serde(rename = "roomId")]
        room_id: String,
        payload: serde_json::Value,
    },

    Answer {
        #[serde(rename = "roomId")]
        room_id: String,
        payload: serde_json::Value,
    },

    IceCandidate {
        #[serde(rename = "roomId")]
        room_id: String,
        payload: serde_json::Value,
    },

    /// A member left or its socket closed
    PeerLeft {
        #[serde(rename = "roomId")]
        room_id: String,
    },
}

impl SignalEvent {
    /// Relayable commands map one-to-one onto the event delivered to the
    /// other members. Room bookkeeping commands return `None`.
    pub fn relayed(cmd: SignalCommand) -> Option<Self> {
        match cmd {
            SignalCommand::Offer { room_id, payload } => Some(Self::Offer { room_id, payload }),
            SignalCommand::Answer { room_id, payload } => Some(Self::Answer { room_id, payload }),
            SignalCommand::IceCandidate { room_id, payload } => {
                Some(Self::IceCandidate { room_id, payload })
            }
            SignalCommand::Join { .. } | SignalCommand::Leave { .. } => None,
        }
    }
}
