use serde::{Deserialize, Serialize};

use crate::error::ErrorBody;
use crate::models::Message;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    #[serde(rename = "joinRoom")]
    JoinRoom { project_id: String },
    #[serde(rename = "leaveRoom")]
    LeaveRoom { project_id: String },
    #[serde(rename = "sendMessage")]
    SendMessage { project_id: String, content: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    #[serde(rename = "connected")]
    Connected {
        connection_id: String,
        user_id: String,
    },
    #[serde(rename = "roomJoined")]
    RoomJoined { project_id: String },
    #[serde(rename = "roomLeft")]
    RoomLeft { project_id: String },
    #[serde(rename = "messageCreated")]
    MessageCreated { message: Message },
    #[serde(rename = "error")]
    Error {
        #[serde(flatten)]
        error: ErrorBody,
    },
}

impl ClientMessage {
    /// Parses one text frame, rejecting unknown kinds and missing fields.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
