pub mod cache;
pub mod client;
pub mod error;
pub mod feed;
pub mod file_storage;
pub mod group_key;
pub mod invite;
pub mod membership;
pub mod message;
pub mod poller;
pub mod query;
pub mod room;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod types;
pub mod utils;

pub use cache::LocalCache;
pub use client::{Clock, IngestReport, InviteView, RoomClient, RoomClientOptions};
pub use error::{Error, Result};
pub use feed::RoomFeed;
pub use file_storage::FileStorageAdapter;
pub use group_key::{
    build_key_distribution, open_key_distribution, parse_key_envelope, receive_keys, KeyEnvelope,
    KeyScanReport, RoomKey,
};
pub use invite::{
    build_invite, build_invite_response, invite_status, open_invite, parse_invite,
    parse_invite_response, Invite, InviteResponse, InviteResponseStatus, InviteStatus,
    OpenedInvite,
};
pub use membership::{
    build_leave, reconstruct_membership, Member, MembershipAction, MembershipChange,
    MembershipProjection, MembershipSnapshot,
};
pub use message::{
    build_room_message, decrypt_room_message, DisplayMessage, MessageBody, MessagePayload,
    RoomMessage,
};
pub use poller::{spawn_poll, PollConfig, PollHandle, PollRegistry};
pub use query::RoomQuery;
pub use room::{
    build_room_archive, build_room_creation, parse_room_archive, parse_room_creation, Room,
    RoomCreation, RoomMetadata,
};
pub use storage::{InMemoryStorage, StorageAdapter};
pub use sync::{RoomSync, SyncUpdate};
pub use transport::{fetch_with_timeout, publish_with_timeout, MemoryRelay, RelayTransport};
pub use types::*;
pub use utils::{is_kind, EventCursor};
