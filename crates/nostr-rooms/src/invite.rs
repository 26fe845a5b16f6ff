use nostr::{Event, EventBuilder, Keys, Kind, PublicKey, Timestamp};
use serde::{Deserialize, Serialize};

use crate::group_key::{open_pairwise, seal_pairwise, KeyPayload};
use crate::utils::{
    first_tag_value, make_tag, marked_tag_value, pubkey_from_hex, room_reference, root_tag, sign,
    EventCursor,
};
use crate::{
    is_kind, Error, Result, RoomKey, RECEIVER_MARKER, REPLY_MARKER, ROOM_INVITE_KIND,
    ROOM_INVITE_RESPONSE_KIND, SENDER_MARKER,
};

/// Public envelope of an invite event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invite {
    pub id: String,
    pub room_id: String,
    pub inviter: PublicKey,
    pub invitee: PublicKey,
    pub created_at: u64,
}

/// An invite decrypted by its invitee.
#[derive(Debug, Clone)]
pub struct OpenedInvite {
    pub invite: Invite,
    pub room_name: Option<String>,
    pub key: RoomKey,
}

pub fn build_invite(
    inviter: &Keys,
    invitee: &PublicKey,
    key: &RoomKey,
    room_name: &str,
    created_at: Timestamp,
) -> Result<Event> {
    let payload = KeyPayload::for_key(key, Some(room_name.to_string()));
    let content = seal_pairwise(inviter, invitee, &payload)?;
    let tags = vec![
        root_tag(&key.room_id)?,
        make_tag(&["p", &invitee.to_hex(), "", RECEIVER_MARKER])?,
        make_tag(&["p", &inviter.public_key().to_hex(), "", SENDER_MARKER])?,
    ];
    sign(
        EventBuilder::new(Kind::from(ROOM_INVITE_KIND), content)
            .tags(tags)
            .custom_created_at(created_at),
        inviter,
    )
}

pub fn parse_invite(event: &Event) -> Result<Invite> {
    if !is_kind(event, ROOM_INVITE_KIND) {
        return Err(Error::InvalidEvent(format!(
            "Expected kind {}, got {}",
            ROOM_INVITE_KIND,
            event.kind.as_u16()
        )));
    }
    let room_id = room_reference(event)
        .ok_or_else(|| Error::InvalidEvent("Invite without room reference".to_string()))?;
    let invitee = marked_tag_value(event, "p", RECEIVER_MARKER)
        .or_else(|| first_tag_value(event, "p"))
        .ok_or_else(|| Error::InvalidEvent("Invite without invitee".to_string()))?;

    Ok(Invite {
        id: event.id.to_hex(),
        room_id,
        inviter: event.pubkey,
        invitee: pubkey_from_hex(&invitee)?,
        created_at: event.created_at.as_u64(),
    })
}

pub fn open_invite(me: &Keys, event: &Event) -> Result<OpenedInvite> {
    let invite = parse_invite(event)?;
    if invite.invitee != me.public_key() {
        return Err(Error::NotAuthorized(
            "Invite is addressed to someone else".to_string(),
        ));
    }
    let payload = open_pairwise(me, &invite.inviter, &event.content)?;
    let room_name = payload.room_name.clone();
    let key = payload.into_key()?;
    if key.room_id != invite.room_id {
        return Err(Error::InvalidEvent(
            "Invite payload names a different room".to_string(),
        ));
    }

    Ok(OpenedInvite {
        invite,
        room_name,
        key,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InviteResponseStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResponseContent {
    status: InviteResponseStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteResponse {
    pub id: String,
    pub room_id: String,
    pub invite_id: String,
    pub responder: PublicKey,
    pub status: InviteResponseStatus,
    pub created_at: u64,
}

pub fn build_invite_response(
    keys: &Keys,
    room_id: &str,
    invite_id: &str,
    inviter: &PublicKey,
    status: InviteResponseStatus,
    created_at: Timestamp,
) -> Result<Event> {
    let content = serde_json::to_string(&ResponseContent { status })?;
    let tags = vec![
        root_tag(room_id)?,
        make_tag(&["e", invite_id, "", REPLY_MARKER])?,
        make_tag(&["p", &inviter.to_hex()])?,
    ];
    sign(
        EventBuilder::new(Kind::from(ROOM_INVITE_RESPONSE_KIND), content)
            .tags(tags)
            .custom_created_at(created_at),
        keys,
    )
}

pub fn parse_invite_response(event: &Event) -> Result<InviteResponse> {
    if !is_kind(event, ROOM_INVITE_RESPONSE_KIND) {
        return Err(Error::InvalidEvent("Not an invite response".to_string()));
    }
    let room_id = room_reference(event)
        .ok_or_else(|| Error::InvalidEvent("Invite response without room reference".to_string()))?;
    let invite_id = marked_tag_value(event, "e", REPLY_MARKER)
        .ok_or_else(|| Error::InvalidEvent("Invite response without invite reference".to_string()))?;
    let content: ResponseContent = serde_json::from_str(&event.content)
        .map_err(|e| Error::InvalidEvent(format!("Invalid invite response: {e}")))?;

    Ok(InviteResponse {
        id: event.id.to_hex(),
        room_id,
        invite_id,
        responder: event.pubkey,
        status: content.status,
        created_at: event.created_at.as_u64(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InviteStatus {
    Pending,
    Accepted,
    Rejected,
}

/// The invitee's first response wins; responses by anyone else are ignored.
pub fn invite_status<'a, I>(invite: &Invite, responses: I) -> InviteStatus
where
    I: IntoIterator<Item = &'a InviteResponse>,
{
    responses
        .into_iter()
        .filter(|r| r.invite_id == invite.id && r.responder == invite.invitee)
        .min_by_key(|r| EventCursor::new(r.created_at, r.id.clone()))
        .map_or(InviteStatus::Pending, |r| match r.status {
            InviteResponseStatus::Accepted => InviteStatus::Accepted,
            InviteResponseStatus::Rejected => InviteStatus::Rejected,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Keys, Keys, RoomKey, Event) {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let key = RoomKey::generate("room-1", 1);
        let event =
            build_invite(&alice, &bob.public_key(), &key, "Plans", Timestamp::from(50)).unwrap();
        (alice, bob, key, event)
    }

    fn respond(invite: &Invite, who: &Keys, status: InviteResponseStatus, at: u64) -> InviteResponse {
        let event = build_invite_response(
            who,
            &invite.room_id,
            &invite.id,
            &invite.inviter,
            status,
            Timestamp::from(at),
        )
        .unwrap();
        parse_invite_response(&event).unwrap()
    }

    #[test]
    fn invitee_opens_invite() {
        let (alice, bob, key, event) = setup();
        let opened = open_invite(&bob, &event).unwrap();
        assert_eq!(opened.invite.inviter, alice.public_key());
        assert_eq!(opened.invite.invitee, bob.public_key());
        assert_eq!(opened.invite.room_id, "room-1");
        assert_eq!(opened.room_name.as_deref(), Some("Plans"));
        assert_eq!(opened.key, key);
    }

    #[test]
    fn invite_content_hides_key() {
        let (_, _, key, event) = setup();
        assert!(!event.content.contains(&key.to_hex()));
    }

    #[test]
    fn others_cannot_open_invite() {
        let (_, _, _, event) = setup();
        let eve = Keys::generate();
        assert!(matches!(open_invite(&eve, &event), Err(Error::NotAuthorized(_))));
    }

    #[test]
    fn response_roundtrip() {
        let (_, bob, _, event) = setup();
        let invite = parse_invite(&event).unwrap();
        let response = respond(&invite, &bob, InviteResponseStatus::Accepted, 60);
        assert_eq!(response.room_id, "room-1");
        assert_eq!(response.invite_id, invite.id);
        assert_eq!(response.responder, bob.public_key());
        assert_eq!(response.status, InviteResponseStatus::Accepted);
    }

    #[test]
    fn first_response_wins() {
        let (_, bob, _, event) = setup();
        let invite = parse_invite(&event).unwrap();
        assert_eq!(invite_status(&invite, []), InviteStatus::Pending);

        let reject = respond(&invite, &bob, InviteResponseStatus::Rejected, 60);
        let accept = respond(&invite, &bob, InviteResponseStatus::Accepted, 70);
        assert_eq!(invite_status(&invite, [&accept, &reject]), InviteStatus::Rejected);
    }

    #[test]
    fn responses_from_others_are_ignored() {
        let (_, _, _, event) = setup();
        let invite = parse_invite(&event).unwrap();
        let mallory = Keys::generate();
        let fake = respond(&invite, &mallory, InviteResponseStatus::Accepted, 60);
        assert_eq!(invite_status(&invite, [&fake]), InviteStatus::Pending);
    }

    #[test]
    fn response_requires_invite_reference() {
        let bob = Keys::generate();
        let event = sign(
            EventBuilder::new(Kind::from(ROOM_INVITE_RESPONSE_KIND), r#"{"status":"accepted"}"#)
                .tag(root_tag("room-1").unwrap()),
            &bob,
        )
        .unwrap();
        assert!(parse_invite_response(&event).is_err());
    }
}
