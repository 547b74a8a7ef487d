use std::collections::HashMap;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use warp::ws::Message;

use crate::{connection::ConnId, error::ProtocolError};

/// Events a player sends. The wire form is `{"type": .., "content": ..}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Join { room: String },
    Ready,
    StartGame,
    WordComplete { word: String },
    RoomStatus,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Value,
}

#[derive(Deserialize)]
struct JoinContent {
    room: String,
}

#[derive(Deserialize)]
struct WordContent {
    word: String,
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(ProtocolError::Envelope)?;
        let message = match envelope.kind.as_str() {
            "join" => {
                let JoinContent { room } = serde_json::from_value(envelope.content)
                    .map_err(|e| ProtocolError::Content("join", e))?;
                ClientMessage::Join { room }
            }
            "ready" => ClientMessage::Ready,
            "startGame" => ClientMessage::StartGame,
            "wordComplete" => {
                let WordContent { word } = serde_json::from_value(envelope.content)
                    .map_err(|e| ProtocolError::Content("wordComplete", e))?;
                ClientMessage::WordComplete { word }
            }
            "roomStatus" => ClientMessage::RoomStatus,
            _ => return Err(ProtocolError::UnknownType(envelope.kind)),
        };
        Ok(message)
    }
}

/// Events broadcast to a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Join {
        username: String,
        content: String,
    },
    RoomStatus {
        players: HashMap<ConnId, bool>,
    },
    StartGame {
        text: String,
        #[serde(rename = "startTime")]
        start_time: u64,
    },
    UserProgress {
        userid: ConnId,
        percentage: u8,
    },
    PlayerRank {
        playerrank: HashMap<ConnId, usize>,
    },
    EndGame,
}

impl ServerMessage {
    pub fn joined(username: &str) -> Self {
        ServerMessage::Join {
            username: username.to_string(),
            content: format!("{username} joined the game"),
        }
    }

    pub fn rank(id: ConnId, position: usize) -> Self {
        ServerMessage::PlayerRank {
            playerrank: HashMap::from([(id, position)]),
        }
    }
}

impl ServerMessage {
    /// Encodes the event as a text frame. A failure is logged and yields
    /// `None` so nothing half-formed reaches a socket.
    pub fn to_frame(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(serialized) => Some(Message::text(serialized)),
            Err(e) => {
                warn!("failed to serialize {self:?}: {e}");
                None
            }
        }
    }
}
