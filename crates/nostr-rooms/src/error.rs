use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Unknown room: {0}")]
    UnknownRoom(String),

    #[error("Unknown invite: {0}")]
    UnknownInvite(String),

    #[error("Invite {0} was already answered")]
    InviteAnswered(String),

    #[error("No key cached for room {room_id} version {version}")]
    MissingKey { room_id: String, version: u32 },

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Relay request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),

    #[error(transparent)]
    NostrKey(#[from] nostr::key::Error),

    #[error(transparent)]
    Nostr(#[from] nostr::event::Error),

    #[error(transparent)]
    Nip44(#[from] nostr::nips::nip44::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
