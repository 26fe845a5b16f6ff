use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const ROOM_CREATION_KIND: u16 = 4460;
pub const ROOM_INVITE_KIND: u16 = 4461;
pub const ROOM_INVITE_RESPONSE_KIND: u16 = 4462;
pub const ROOM_MESSAGE_KIND: u16 = 4463;
pub const ROOM_KEY_KIND: u16 = 4464;
pub const ROOM_LEAVE_KIND: u16 = 4465;
pub const ROOM_ARCHIVE_KIND: u16 = 4466;

/// Legacy NIP-04 direct message kind, cached as ciphertext only.
pub const ENCRYPTED_DM_KIND: u16 = 4;
/// NIP-59 gift wrap kind, cached as ciphertext only.
pub const GIFT_WRAP_KIND: u16 = 1059;

pub const KEY_VERSION_TAG: &str = "key_version";

/// Marker for the room reference in `e` tags.
pub const ROOT_MARKER: &str = "root";
/// Marker for the referenced invite in an invite response.
pub const REPLY_MARKER: &str = "reply";
pub const RECEIVER_MARKER: &str = "receiver";
pub const SENDER_MARKER: &str = "sender";

/// Rendered in place of a message body that could not be decrypted.
pub const DECRYPT_FAILED_PLACEHOLDER: &str = "could not decrypt";

/// First key version of every room.
pub const INITIAL_KEY_VERSION: u32 = 1;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// How far behind the newest membership change an event may be timestamped
/// and still be folded in order.
pub const MEMBERSHIP_SKEW_SECS: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Member => "member",
        }
    }

    /// Owners and admins may invite, remove members and rotate keys.
    pub fn can_manage(&self) -> bool {
        matches!(self, Role::Owner | Role::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Role::Owner),
            "admin" => Ok(Role::Admin),
            "member" => Ok(Role::Member),
            other => Err(crate::Error::InvalidEvent(format!("Unknown role: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    System,
}
