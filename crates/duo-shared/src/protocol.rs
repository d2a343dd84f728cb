use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ProtocolError;
use crate::types::{RoomId, UserId};

/// Delivery state of a chat message. Ordered: `Sent < Delivered < Seen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Seen,
}

/// Payload kind carried in the `type` field of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    /// Reference returned by the upload store; the server never fetches it.
    File {
        url: String,
        #[serde(rename = "fileType", default)]
        file_type: String,
    },
}

/// Events sent by a client over its WebSocket.
///
/// Wire shape: `{"event": "send_message", "data": {...}}`; unit events omit `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Enter matchmaking.
    JoinQueue,

    /// Leave the current room, signal the partner, re-queue.
    NextPartner,

    SendMessage(OutgoingMessage),

    MessageStatusUpdate(StatusUpdateRequest),

    SendFriendRequest(FriendRequestTarget),

    RespondFriendRequest(FriendResponse),

    RemoveFriend(RemoveFriendRequest),

    UpdateProfile(ProfileFields),
}

/// Events pushed by the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    ChatStart(ChatStart),
    PartnerInfo(PartnerInfo),
    PartnerDisconnected,
    Searching,
    ReceiveMessage(RelayedMessage),
    /// Server acknowledgment that a message was handed to its recipient(s).
    MessageAck(MessageAck),
    MessageStatusUpdate(StatusNotice),
    IncomingFriendRequest(FriendRequestNotice),
    FriendRequestAccepted(FriendProfile),
    FriendAdded(FriendProfile),
    FriendRemoved(FriendRemoved),
    /// A single malformed operation was rejected.
    Error(ErrorNotice),
}

// ─── Client payloads ───

/// A chat payload as submitted by the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    #[serde(default)]
    pub msg_id: String,
    /// Text body, or the original file name for file messages.
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub kind: MessageKind,
    /// Present for friend (direct) messages, absent for room messages.
    #[serde(default, alias = "recipientUserId", skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdateRequest {
    #[serde(default)]
    pub msg_id: String,
    pub status: MessageStatus,
    #[serde(default, alias = "recipientUserId", skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequestTarget {
    pub to_user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendResponse {
    pub from_user_id: UserId,
    #[serde(default)]
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveFriendRequest {
    pub friend_id: UserId,
}

/// Self-asserted profile fields. Absent or empty fields never overwrite
/// existing values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    /// Accepts a JSON string or number.
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub age: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_seed: Option<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    }))
}

// ─── Server payloads ───

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStart {
    pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartnerInfo {
    pub partner_user_id: UserId,
    pub nickname: String,
    pub age: String,
    pub avatar_seed: String,
}

/// A chat message as delivered to the recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedMessage {
    pub msg_id: String,
    pub message: String,
    #[serde(flatten)]
    pub kind: MessageKind,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<UserId>,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAck {
    pub msg_id: String,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotice {
    pub msg_id: String,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequestNotice {
    pub from_user_id: UserId,
    pub nickname: String,
    pub avatar_seed: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendProfile {
    pub friend_id: UserId,
    pub nickname: String,
    pub avatar_seed: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRemoved {
    pub friend_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub message: String,
}

impl ClientEvent {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Wire name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinQueue => "join_queue",
            ClientEvent::NextPartner => "next_partner",
            ClientEvent::SendMessage(_) => "send_message",
            ClientEvent::MessageStatusUpdate(_) => "message_status_update",
            ClientEvent::SendFriendRequest(_) => "send_friend_request",
            ClientEvent::RespondFriendRequest(_) => "respond_friend_request",
            ClientEvent::RemoveFriend(_) => "remove_friend",
            ClientEvent::UpdateProfile(_) => "update_profile",
        }
    }
}

impl ServerEvent {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorNotice {
            message: message.into(),
        })
    }
}
