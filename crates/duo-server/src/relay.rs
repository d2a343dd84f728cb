//! Message relay.
//!
//! Routes a chat payload either to every live connection of an addressed
//! user (friend path) or to the sender's current room partner (stranger
//! path), and forwards delivery-status transitions the same way. The relay
//! keeps no per-message state. The sender's `message_ack` is queued before
//! the message leaves, and each outbound queue is FIFO, so a recipient's
//! status updates always reach the sender after its ack.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use duo_shared::protocol::{
    MessageAck, MessageKind, OutgoingMessage, RelayedMessage, StatusNotice, StatusUpdateRequest,
};
use duo_shared::{ConnectionId, MessageStatus, ServerEvent, UserId};

use crate::error::HubError;
use crate::presence::PresenceRegistry;
use crate::rooms::RoomManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Addressed to a user; queued on this many of their connections.
    Direct { connections: usize },
    /// Forwarded to the room partner.
    Room { partner: ConnectionId },
    /// Sender has no room and no recipient was named.
    Dropped,
}

pub struct MessageRelay {
    presence: Arc<PresenceRegistry>,
    rooms: Arc<RoomManager>,
}

impl MessageRelay {
    pub fn new(presence: Arc<PresenceRegistry>, rooms: Arc<RoomManager>) -> Self {
        Self { presence, rooms }
    }

    /// Relay a chat message from `from`. The sender gets a `message_ack`
    /// unless the message had nowhere to go.
    ///
    /// The ack is queued before the message is handed to the recipient, so
    /// any status update the recipient sends back lands behind it.
    pub fn send(&self, from: ConnectionId, message: OutgoingMessage) -> Result<RelayOutcome, HubError> {
        validate(&message)?;
        let sender_id = self
            .presence
            .user_of(from)
            .ok_or(HubError::UnknownConnection(from))?;

        let msg_id = message.msg_id.clone();
        let recipient = addressed(message.to_user_id);
        let Some(target) = self.resolve(from, recipient.clone()) else {
            debug!(conn = %from, msg_id = %msg_id, "Not in a room, dropping message");
            return Ok(RelayOutcome::Dropped);
        };

        self.presence.send_to_connection(
            from,
            ServerEvent::MessageAck(MessageAck {
                msg_id: msg_id.clone(),
                status: MessageStatus::Sent,
            }),
        );

        let event = ServerEvent::ReceiveMessage(RelayedMessage {
            msg_id: message.msg_id,
            message: message.message,
            kind: message.kind,
            sender_id,
            to_user_id: recipient,
            status: MessageStatus::Sent,
            timestamp: Utc::now(),
        });
        let outcome = self.deliver(target, event);

        debug!(conn = %from, msg_id = %msg_id, outcome = ?outcome, "Relayed message");
        Ok(outcome)
    }

    /// Forward a delivery-status transition back towards the original sender.
    pub fn update_status(
        &self,
        from: ConnectionId,
        update: StatusUpdateRequest,
    ) -> Result<RelayOutcome, HubError> {
        if update.msg_id.trim().is_empty() {
            return Err(HubError::Malformed("status update without msgId".into()));
        }
        if self.presence.user_of(from).is_none() {
            return Err(HubError::UnknownConnection(from));
        }

        let Some(target) = self.resolve(from, addressed(update.to_user_id)) else {
            debug!(conn = %from, msg_id = %update.msg_id, "Not in a room, dropping status update");
            return Ok(RelayOutcome::Dropped);
        };

        let event = ServerEvent::MessageStatusUpdate(StatusNotice {
            msg_id: update.msg_id.clone(),
            status: update.status,
        });
        let outcome = self.deliver(target, event);

        debug!(
            conn = %from,
            msg_id = %update.msg_id,
            status = ?update.status,
            outcome = ?outcome,
            "Relayed status update"
        );
        Ok(outcome)
    }

    /// Where an event from `from` goes: the named user, else the room
    /// partner. `None` when neither exists.
    fn resolve(&self, from: ConnectionId, recipient: Option<UserId>) -> Option<Target> {
        match recipient {
            Some(user) => Some(Target::User(user)),
            None => self.rooms.partner_of(from).map(Target::Partner),
        }
    }

    fn deliver(&self, target: Target, event: ServerEvent) -> RelayOutcome {
        match target {
            Target::User(user) => RelayOutcome::Direct {
                connections: self.presence.send_to_user(&user, &event),
            },
            Target::Partner(partner) => {
                self.presence.send_to_connection(partner, event);
                RelayOutcome::Room { partner }
            }
        }
    }
}

enum Target {
    User(UserId),
    Partner(ConnectionId),
}

/// A blank recipient means "my room partner".
fn addressed(to_user_id: Option<UserId>) -> Option<UserId> {
    to_user_id.filter(|id| !id.is_blank())
}

fn validate(message: &OutgoingMessage) -> Result<(), HubError> {
    if message.msg_id.trim().is_empty() {
        return Err(HubError::Malformed("message without msgId".into()));
    }
    match &message.kind {
        MessageKind::Text if message.message.trim().is_empty() => {
            Err(HubError::Malformed("empty text message".into()))
        }
        MessageKind::File { url, .. } if url.trim().is_empty() => {
            Err(HubError::Malformed("file message without url".into()))
        }
        _ => Ok(()),
    }
}
