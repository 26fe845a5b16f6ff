use anyhow::{anyhow, Result};
use nostr_rooms::{Member, RelayTransport, Role, Room, RoomMetadata, RoomSync};
use serde::Serialize;

use super::parse_pubkey;
use crate::output::Output;

#[derive(Serialize)]
pub(crate) struct RoomInfo {
    id: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    about: Option<String>,
    owner: String,
    key_version: u32,
    archived: bool,
    created_at: u64,
    members: Vec<MemberInfo>,
}

#[derive(Serialize)]
struct MemberInfo {
    pubkey: String,
    role: Role,
    joined_at: u64,
}

#[derive(Serialize)]
struct RoomList {
    rooms: Vec<RoomInfo>,
}

#[derive(Serialize)]
struct MemberList {
    room_id: String,
    members: Vec<MemberInfo>,
}

impl From<&Member> for MemberInfo {
    fn from(m: &Member) -> Self {
        MemberInfo {
            pubkey: m.pubkey.to_hex(),
            role: m.role,
            joined_at: m.joined_at,
        }
    }
}

impl From<Room> for RoomInfo {
    fn from(room: Room) -> Self {
        RoomInfo {
            members: room.members.iter().map(MemberInfo::from).collect(),
            id: room.id,
            name: room.name,
            about: room.about,
            owner: room.owner.to_hex(),
            key_version: room.key_version,
            archived: room.archived,
            created_at: room.created_at,
        }
    }
}

/// Polls a room and returns its current view.
pub(crate) async fn refresh<T: RelayTransport + 'static>(
    sync: &RoomSync<T>,
    room_id: &str,
) -> Result<Room> {
    sync.poll_room(room_id).await?;
    let client = sync.client();
    let room = client.lock().await.room(room_id);
    room.ok_or_else(|| anyhow!("Room not found: {room_id}"))
}

pub async fn create<T: RelayTransport + 'static>(
    sync: &RoomSync<T>,
    name: &str,
    about: Option<String>,
    admins: &[String],
    members: &[String],
    output: &Output,
) -> Result<()> {
    let admins = admins
        .iter()
        .map(|a| parse_pubkey(a))
        .collect::<Result<Vec<_>>>()?;
    let members = members
        .iter()
        .map(|m| parse_pubkey(m))
        .collect::<Result<Vec<_>>>()?;

    let metadata = RoomMetadata {
        name: name.to_string(),
        about,
    };
    let room_id = sync.create_room(metadata, &admins, &members).await?;
    sync.persist().await?;

    let client = sync.client();
    let room = client.lock().await.room(&room_id);
    let room = room.ok_or_else(|| anyhow!("Room not found: {room_id}"))?;
    output.success("room.create", RoomInfo::from(room));
    Ok(())
}

/// Lists known rooms after checking the inbox for new ones.
pub async fn list<T: RelayTransport + 'static>(sync: &RoomSync<T>, output: &Output) -> Result<()> {
    sync.poll_inbox().await?;
    sync.persist().await?;

    let client = sync.client();
    let rooms = client.lock().await.rooms();
    output.success(
        "room.list",
        RoomList {
            rooms: rooms.into_iter().map(RoomInfo::from).collect(),
        },
    );
    Ok(())
}

pub async fn show<T: RelayTransport + 'static>(
    sync: &RoomSync<T>,
    room_id: &str,
    output: &Output,
) -> Result<()> {
    let room = refresh(sync, room_id).await?;
    sync.persist().await?;
    output.success("room.show", RoomInfo::from(room));
    Ok(())
}

pub async fn members<T: RelayTransport + 'static>(
    sync: &RoomSync<T>,
    room_id: &str,
    output: &Output,
) -> Result<()> {
    let room = refresh(sync, room_id).await?;
    sync.persist().await?;
    output.success(
        "room.members",
        MemberList {
            room_id: room.id,
            members: room.members.iter().map(MemberInfo::from).collect(),
        },
    );
    Ok(())
}

pub async fn archive<T: RelayTransport + 'static>(
    sync: &RoomSync<T>,
    room_id: &str,
    output: &Output,
) -> Result<()> {
    refresh(sync, room_id).await?;
    sync.archive_room(room_id).await?;
    sync.persist().await?;
    output.success_message("room.archive", &format!("Archived room {room_id}"));
    Ok(())
}

pub async fn leave<T: RelayTransport + 'static>(
    sync: &RoomSync<T>,
    room_id: &str,
    output: &Output,
) -> Result<()> {
    refresh(sync, room_id).await?;
    sync.leave_room(room_id).await?;
    sync.persist().await?;
    output.success_message("leave", &format!("Left room {room_id}"));
    Ok(())
}

pub async fn remove<T: RelayTransport + 'static>(
    sync: &RoomSync<T>,
    room_id: &str,
    member: &str,
    output: &Output,
) -> Result<()> {
    let target = parse_pubkey(member)?;
    refresh(sync, room_id).await?;
    sync.remove_member(room_id, &target).await?;
    sync.persist().await?;
    output.success_message(
        "remove",
        &format!("Removed {} from room {room_id}", target.to_hex()),
    );
    Ok(())
}
