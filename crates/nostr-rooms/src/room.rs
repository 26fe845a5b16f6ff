use nostr::{Event, EventBuilder, Keys, Kind, PublicKey, Timestamp};
use serde::{Deserialize, Serialize};

use crate::membership::Member;
use crate::utils::{key_version_of, key_version_tag, make_tag, pubkey_from_hex, room_reference, root_tag, sign};
use crate::{is_kind, Error, Result, Role, INITIAL_KEY_VERSION, ROOM_ARCHIVE_KIND, ROOM_CREATION_KIND};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
}

impl RoomMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            about: None,
        }
    }
}

/// A parsed room creation event.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomCreation {
    pub room_id: String,
    pub owner: PublicKey,
    pub metadata: RoomMetadata,
    /// Initial members in tag order, owner first.
    pub initial_members: Vec<(PublicKey, Role)>,
    pub key_version: u32,
    pub created_at: u64,
}

/// Current view of a room, assembled from its creation event, membership fold
/// and the local key cache.
#[derive(Debug, Clone, Serialize)]
pub struct Room {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    pub owner: PublicKey,
    /// Highest key version held locally, 0 when no key is cached.
    pub key_version: u32,
    pub members: Vec<Member>,
    pub archived: bool,
    pub created_at: u64,
}

pub fn build_room_creation(
    owner: &Keys,
    metadata: &RoomMetadata,
    admins: &[PublicKey],
    members: &[PublicKey],
    created_at: Timestamp,
) -> Result<Event> {
    let owner_pk = owner.public_key();
    let mut tags = vec![make_tag(&["p", &owner_pk.to_hex(), "", Role::Owner.as_str()])?];

    let mut seen = vec![owner_pk];
    for (pubkey, role) in admins
        .iter()
        .map(|pk| (pk, Role::Admin))
        .chain(members.iter().map(|pk| (pk, Role::Member)))
    {
        if seen.contains(pubkey) {
            continue;
        }
        seen.push(*pubkey);
        tags.push(make_tag(&["p", &pubkey.to_hex(), "", role.as_str()])?);
    }
    tags.push(key_version_tag(INITIAL_KEY_VERSION)?);

    sign(
        EventBuilder::new(Kind::from(ROOM_CREATION_KIND), serde_json::to_string(metadata)?)
            .tags(tags)
            .custom_created_at(created_at),
        owner,
    )
}

pub fn parse_room_creation(event: &Event) -> Result<RoomCreation> {
    if !is_kind(event, ROOM_CREATION_KIND) {
        return Err(Error::InvalidEvent(format!(
            "Expected kind {}, got {}",
            ROOM_CREATION_KIND,
            event.kind.as_u16()
        )));
    }

    let metadata: RoomMetadata = serde_json::from_str(&event.content)
        .map_err(|e| Error::InvalidEvent(format!("Invalid room metadata: {e}")))?;

    // The signer is the owner no matter what the tags claim.
    let owner = event.pubkey;
    let mut initial_members = vec![(owner, Role::Owner)];

    for tag in event.tags.iter() {
        let parts = tag.as_slice();
        if parts.first().map(|s| s.as_str()) != Some("p") {
            continue;
        }
        let Some(pubkey) = parts.get(1).and_then(|hex| pubkey_from_hex(hex).ok()) else {
            tracing::warn!(room_id = %event.id, "ignoring member tag with invalid pubkey");
            continue;
        };
        if initial_members.iter().any(|(pk, _)| *pk == pubkey) {
            continue;
        }
        let role = match parts.get(3).map(|s| s.as_str()) {
            None | Some("") => Role::Member,
            Some(marker) => match marker.parse::<Role>() {
                Ok(Role::Owner) => Role::Admin,
                Ok(role) => role,
                Err(_) => {
                    tracing::warn!(room_id = %event.id, marker, "ignoring member tag with unknown role");
                    continue;
                }
            },
        };
        initial_members.push((pubkey, role));
    }

    Ok(RoomCreation {
        room_id: event.id.to_hex(),
        owner,
        metadata,
        initial_members,
        key_version: key_version_of(event).unwrap_or(INITIAL_KEY_VERSION),
        created_at: event.created_at.as_u64(),
    })
}

pub fn build_room_archive(owner: &Keys, room_id: &str, created_at: Timestamp) -> Result<Event> {
    sign(
        EventBuilder::new(Kind::from(ROOM_ARCHIVE_KIND), "")
            .tag(root_tag(room_id)?)
            .custom_created_at(created_at),
        owner,
    )
}

/// Returns the archived room id and the archiving author.
pub fn parse_room_archive(event: &Event) -> Result<(String, PublicKey)> {
    if !is_kind(event, ROOM_ARCHIVE_KIND) {
        return Err(Error::InvalidEvent("Not a room archive event".to_string()));
    }
    let room_id = room_reference(event)
        .ok_or_else(|| Error::InvalidEvent("Archive event without room reference".to_string()))?;
    Ok((room_id, event.pubkey))
}
