use anyhow::{anyhow, Result};
use nostr_rooms::{InviteView, RelayTransport, RoomSync};
use serde::Serialize;

use super::{parse_pubkey, room};
use crate::output::Output;

#[derive(Serialize)]
struct InviteSent {
    id: String,
    room_id: String,
    invitee: String,
}

#[derive(Serialize)]
struct InviteList {
    invites: Vec<InviteView>,
}

#[derive(Serialize)]
struct InviteAnswer {
    invite_id: String,
    room_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    room_name: Option<String>,
    status: &'static str,
}

pub async fn send<T: RelayTransport + 'static>(
    sync: &RoomSync<T>,
    room_id: &str,
    invitee: &str,
    output: &Output,
) -> Result<()> {
    let invitee = parse_pubkey(invitee)?;
    room::refresh(sync, room_id).await?;
    let event = sync.invite(room_id, &invitee).await?;
    sync.persist().await?;

    output.success(
        "invite.send",
        InviteSent {
            id: event.id.to_hex(),
            room_id: room_id.to_string(),
            invitee: invitee.to_hex(),
        },
    );
    Ok(())
}

/// Lists received invites, or the ones we sent with `sent`.
pub async fn list<T: RelayTransport + 'static>(
    sync: &RoomSync<T>,
    sent: bool,
    output: &Output,
) -> Result<()> {
    sync.poll_inbox().await?;
    let client = sync.client();
    let invites = {
        let client = client.lock().await;
        if sent {
            client.sent_invites()
        } else {
            client.invites()
        }
    };
    output.success("invite.list", InviteList { invites });
    Ok(())
}

/// Finds a received invite and loads the responses already published for its room.
async fn load_invite<T: RelayTransport + 'static>(
    sync: &RoomSync<T>,
    invite_id: &str,
) -> Result<InviteView> {
    sync.poll_inbox().await?;
    let find = || async {
        let client = sync.client();
        let invites = client.lock().await.invites();
        invites.into_iter().find(|view| view.invite.id == invite_id)
    };
    let view = find()
        .await
        .ok_or_else(|| anyhow!("Invite not found: {invite_id}"))?;
    sync.poll_room(&view.invite.room_id).await?;
    find()
        .await
        .ok_or_else(|| anyhow!("Invite not found: {invite_id}"))
}

pub async fn accept<T: RelayTransport + 'static>(
    sync: &RoomSync<T>,
    invite_id: &str,
    output: &Output,
) -> Result<()> {
    let view = load_invite(sync, invite_id).await?;
    sync.accept_invite(invite_id).await?;
    sync.poll_room(&view.invite.room_id).await?;
    sync.persist().await?;

    output.success(
        "invite.accept",
        InviteAnswer {
            invite_id: invite_id.to_string(),
            room_id: view.invite.room_id,
            room_name: view.room_name,
            status: "accepted",
        },
    );
    Ok(())
}

pub async fn reject<T: RelayTransport + 'static>(
    sync: &RoomSync<T>,
    invite_id: &str,
    output: &Output,
) -> Result<()> {
    let view = load_invite(sync, invite_id).await?;
    sync.reject_invite(invite_id).await?;
    sync.persist().await?;

    output.success(
        "invite.reject",
        InviteAnswer {
            invite_id: invite_id.to_string(),
            room_id: view.invite.room_id,
            room_name: view.room_name,
            status: "rejected",
        },
    );
    Ok(())
}
