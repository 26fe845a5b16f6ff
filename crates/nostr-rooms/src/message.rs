use nostr::{Event, EventBuilder, Keys, Kind, PublicKey, Timestamp};
use serde::{Deserialize, Serialize};

use crate::utils::{key_version_of, key_version_tag, room_reference, root_tag, sign, EventCursor};
use crate::{
    is_kind, Error, MessageType, Result, RoomKey, DECRYPT_FAILED_PLACEHOLDER, ROOM_MESSAGE_KIND,
};

/// Plaintext of a room message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub text: String,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
}

impl MessagePayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            message_type: MessageType::Text,
        }
    }
}

pub fn build_room_message(
    sender: &Keys,
    key: &RoomKey,
    payload: &MessagePayload,
    created_at: Timestamp,
) -> Result<Event> {
    let content = key.encrypt(&serde_json::to_string(payload)?)?;
    sign(
        EventBuilder::new(Kind::from(ROOM_MESSAGE_KIND), content)
            .tag(root_tag(&key.room_id)?)
            .tag(key_version_tag(key.version)?)
            .custom_created_at(created_at),
        sender,
    )
}

/// A room message event before decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMessage {
    pub id: String,
    pub room_id: String,
    pub sender: PublicKey,
    pub key_version: Option<u32>,
    pub ciphertext: String,
    pub created_at: u64,
}

impl RoomMessage {
    pub fn from_event(event: &Event) -> Result<Self> {
        if !is_kind(event, ROOM_MESSAGE_KIND) {
            return Err(Error::InvalidEvent("Not a room message".to_string()));
        }
        let room_id = room_reference(event)
            .ok_or_else(|| Error::InvalidEvent("Message without room reference".to_string()))?;
        Ok(Self {
            id: event.id.to_hex(),
            room_id,
            sender: event.pubkey,
            key_version: key_version_of(event),
            ciphertext: event.content.clone(),
            created_at: event.created_at.as_u64(),
        })
    }

    pub fn cursor(&self) -> EventCursor {
        EventCursor::new(self.created_at, self.id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Decrypted(MessagePayload),
    Failed { reason: String },
}

/// A message as rendered in a room feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMessage {
    pub id: String,
    pub room_id: String,
    pub sender: PublicKey,
    pub created_at: u64,
    pub key_version: Option<u32>,
    pub body: MessageBody,
    /// Sent locally, not yet seen on a relay.
    pub pending: bool,
}

impl DisplayMessage {
    pub fn text(&self) -> &str {
        match &self.body {
            MessageBody::Decrypted(payload) => &payload.text,
            MessageBody::Failed { .. } => DECRYPT_FAILED_PLACEHOLDER,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match &self.body {
            MessageBody::Decrypted(payload) => payload.message_type,
            MessageBody::Failed { .. } => MessageType::Text,
        }
    }

    pub fn decrypt_failed(&self) -> bool {
        matches!(self.body, MessageBody::Failed { .. })
    }

    pub fn cursor(&self) -> EventCursor {
        EventCursor::new(self.created_at, self.id.clone())
    }
}

/// Decrypts a message with the key `lookup` returns for its declared version.
/// Never fails: any problem becomes a placeholder body.
pub fn decrypt_room_message<F>(message: &RoomMessage, lookup: F) -> DisplayMessage
where
    F: Fn(&str, u32) -> Option<RoomKey>,
{
    let body = match try_decrypt(message, lookup) {
        Ok(payload) => MessageBody::Decrypted(payload),
        Err(e) => {
            tracing::debug!(event_id = %message.id, error = %e, "room message not decrypted");
            MessageBody::Failed {
                reason: e.to_string(),
            }
        }
    };

    DisplayMessage {
        id: message.id.clone(),
        room_id: message.room_id.clone(),
        sender: message.sender,
        created_at: message.created_at,
        key_version: message.key_version,
        body,
        pending: false,
    }
}

fn try_decrypt<F>(message: &RoomMessage, lookup: F) -> Result<MessagePayload>
where
    F: Fn(&str, u32) -> Option<RoomKey>,
{
    let version = message
        .key_version
        .ok_or_else(|| Error::InvalidEvent("Message without key_version".to_string()))?;
    let key = lookup(&message.room_id, version).ok_or_else(|| Error::MissingKey {
        room_id: message.room_id.clone(),
        version,
    })?;
    let plaintext = key.decrypt(&message.ciphertext)?;
    serde_json::from_str(&plaintext)
        .map_err(|e| Error::Decryption(format!("Invalid message payload: {e}")))
}
