//! Room membership as a fold over the room's event history.
//!
//! The creation event seeds the member list. Accepted invite responses and
//! leave/removal events are then applied in `(created_at, id)` order, so every
//! viewer holding the same events computes the same members regardless of the
//! order the relays delivered them in. An accept only counts when it answers a
//! known invite addressed to its author, sent by someone who could invite at
//! that point of the history.

use nostr::{Event, EventBuilder, Keys, Kind, PublicKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::invite::{parse_invite, parse_invite_response, Invite, InviteResponseStatus};
use crate::room::{parse_room_creation, RoomCreation};
use crate::utils::{first_tag_value, make_tag, pubkey_from_hex, room_reference, root_tag, sign, EventCursor};
use crate::{
    is_kind, Error, Result, Role, MEMBERSHIP_SKEW_SECS, ROOM_INVITE_KIND,
    ROOM_INVITE_RESPONSE_KIND, ROOM_LEAVE_KIND,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub pubkey: PublicKey,
    pub role: Role,
    pub joined_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum MembershipAction {
    /// The author accepted `invite_id`.
    Join { invite_id: String },
    /// The author left (`target == author`) or removed `target`.
    Remove { target: PublicKey },
}

/// A membership-relevant event reduced to what the fold needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipChange {
    pub id: String,
    pub room_id: String,
    pub author: PublicKey,
    pub created_at: u64,
    pub action: MembershipAction,
}

impl MembershipChange {
    /// Returns `Ok(None)` for events that do not change membership, such as
    /// rejected invites or unrelated kinds.
    pub fn from_event(event: &Event) -> Result<Option<Self>> {
        let action = if is_kind(event, ROOM_INVITE_RESPONSE_KIND) {
            let response = parse_invite_response(event)?;
            if response.status != InviteResponseStatus::Accepted {
                return Ok(None);
            }
            MembershipAction::Join {
                invite_id: response.invite_id,
            }
        } else if is_kind(event, ROOM_LEAVE_KIND) {
            let target = match first_tag_value(event, "p") {
                Some(hex) => pubkey_from_hex(&hex)?,
                None => event.pubkey,
            };
            MembershipAction::Remove { target }
        } else {
            return Ok(None);
        };

        let room_id = room_reference(event)
            .ok_or_else(|| Error::InvalidEvent("Membership event without room reference".to_string()))?;

        Ok(Some(Self {
            id: event.id.to_hex(),
            room_id,
            author: event.pubkey,
            created_at: event.created_at.as_u64(),
            action,
        }))
    }

    fn cursor(&self) -> EventCursor {
        EventCursor::new(self.created_at, self.id.clone())
    }

    pub fn is_leave(&self) -> bool {
        matches!(&self.action, MembershipAction::Remove { target } if *target == self.author)
    }
}

/// Builds a leave (`target == signer`) or removal event.
pub fn build_leave(
    keys: &Keys,
    room_id: &str,
    target: &PublicKey,
    reason: Option<&str>,
    created_at: Timestamp,
) -> Result<Event> {
    sign(
        EventBuilder::new(Kind::from(ROOM_LEAVE_KIND), reason.unwrap_or_default())
            .tag(root_tag(room_id)?)
            .tag(make_tag(&["p", &target.to_hex()])?)
            .custom_created_at(created_at),
        keys,
    )
}

/// Serializable checkpoint of a projection.
///
/// `members`, `consumed` and `cursor` describe the settled state. `recent`
/// holds the changes after `cursor` that are still inside the skew window and
/// are replayed on restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipSnapshot {
    pub room_id: String,
    pub members: Vec<Member>,
    pub cursor: Option<EventCursor>,
    /// Invites already used by an accept.
    #[serde(default)]
    pub consumed: BTreeSet<String>,
    #[serde(default)]
    pub invites: Vec<Invite>,
    #[serde(default)]
    pub recent: Vec<MembershipChange>,
}

#[derive(Debug, Clone, Default)]
struct FoldState {
    members: HashMap<PublicKey, Member>,
    consumed: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct MembershipProjection {
    room_id: String,
    /// State before any logged change: the creation seed or the settled part
    /// of the history.
    base: FoldState,
    base_cursor: Option<EventCursor>,
    log: BTreeMap<EventCursor, MembershipChange>,
    invites: HashMap<String, Invite>,
    state: FoldState,
    cursor: Option<EventCursor>,
}

impl MembershipProjection {
    pub fn new(creation: &RoomCreation) -> Self {
        let members: HashMap<PublicKey, Member> = creation
            .initial_members
            .iter()
            .map(|(pubkey, role)| {
                (
                    *pubkey,
                    Member {
                        pubkey: *pubkey,
                        role: *role,
                        joined_at: creation.created_at,
                    },
                )
            })
            .collect();
        let base = FoldState {
            members,
            consumed: BTreeSet::new(),
        };

        Self {
            room_id: creation.room_id.clone(),
            state: base.clone(),
            base,
            base_cursor: None,
            log: BTreeMap::new(),
            invites: HashMap::new(),
            cursor: None,
        }
    }

    pub fn from_snapshot(snapshot: MembershipSnapshot) -> Self {
        let base = FoldState {
            members: snapshot.members.into_iter().map(|m| (m.pubkey, m)).collect(),
            consumed: snapshot.consumed,
        };
        let invites = snapshot
            .invites
            .into_iter()
            .filter(|invite| invite.room_id == snapshot.room_id)
            .map(|invite| (invite.id.clone(), invite))
            .collect();
        let log = snapshot
            .recent
            .into_iter()
            .filter(|change| change.room_id == snapshot.room_id)
            .filter(|change| snapshot.cursor.as_ref().map_or(true, |c| change.cursor() > *c))
            .map(|change| (change.cursor(), change))
            .collect();

        let mut projection = Self {
            room_id: snapshot.room_id,
            state: base.clone(),
            base,
            base_cursor: snapshot.cursor,
            log,
            invites,
            cursor: None,
        };
        projection.replay();
        projection
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Last applied change, or the settled cursor.
    pub fn cursor(&self) -> Option<&EventCursor> {
        self.cursor.as_ref()
    }

    /// Timestamp membership fetches should start from. Everything after the
    /// settled state is fetched again so that late-stamped events are not missed.
    pub fn fetch_since(&self) -> Option<u64> {
        self.base_cursor.as_ref().map(|c| c.created_at)
    }

    /// Applies one change. Returns false when it was already applied, belongs to
    /// another room or predates the settled state.
    pub fn apply(&mut self, change: MembershipChange) -> bool {
        if change.room_id != self.room_id {
            return false;
        }
        let cursor = change.cursor();
        if self.base_cursor.as_ref().is_some_and(|base| cursor <= *base) {
            return false;
        }
        if self.log.contains_key(&cursor) {
            return false;
        }

        let in_order = self.cursor.as_ref().map_or(true, |last| cursor > *last);
        if in_order {
            fold(&mut self.state, &self.invites, &change);
            self.log.insert(cursor.clone(), change);
            self.cursor = Some(cursor);
        } else {
            tracing::debug!(room_id = %self.room_id, event_id = %change.id, "replaying membership log");
            self.log.insert(cursor, change);
            self.replay();
        }
        true
    }

    /// Records an invite of this room. Accepts that arrived before it are
    /// folded again.
    pub fn add_invite(&mut self, invite: Invite) -> bool {
        if invite.room_id != self.room_id
            || self.invites.contains_key(&invite.id)
            || self.base.consumed.contains(&invite.id)
        {
            return false;
        }
        let answered = self.log.values().any(|change| {
            matches!(&change.action, MembershipAction::Join { invite_id } if *invite_id == invite.id)
        });
        self.invites.insert(invite.id.clone(), invite);
        if answered {
            self.replay();
        }
        true
    }

    /// Parses and applies an invite, accept or leave event. Malformed events
    /// are logged and skipped.
    pub fn apply_event(&mut self, event: &Event) -> bool {
        if is_kind(event, ROOM_INVITE_KIND) {
            return match parse_invite(event) {
                Ok(invite) => self.add_invite(invite),
                Err(e) => {
                    tracing::warn!(event_id = %event.id, error = %e, "skipping malformed invite");
                    false
                }
            };
        }
        match MembershipChange::from_event(event) {
            Ok(Some(change)) => self.apply(change),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(event_id = %event.id, error = %e, "skipping malformed membership event");
                false
            }
        }
    }

    fn replay(&mut self) {
        let mut state = self.base.clone();
        for change in self.log.values() {
            fold(&mut state, &self.invites, change);
        }
        self.state = state;
        self.cursor = self
            .log
            .keys()
            .next_back()
            .cloned()
            .or_else(|| self.base_cursor.clone());
    }

    /// Current members: owner, admins, then members, each by join time.
    pub fn members(&self) -> Vec<Member> {
        sorted_members(&self.state.members)
    }

    pub fn role_of(&self, pubkey: &PublicKey) -> Option<Role> {
        self.state.members.get(pubkey).map(|m| m.role)
    }

    pub fn contains(&self, pubkey: &PublicKey) -> bool {
        self.state.members.contains_key(pubkey)
    }

    pub fn owner(&self) -> Option<PublicKey> {
        self.state
            .members
            .values()
            .find(|m| m.role == Role::Owner)
            .map(|m| m.pubkey)
    }

    pub fn snapshot(&self) -> MembershipSnapshot {
        let mut invites: Vec<Invite> = self.invites.values().cloned().collect();
        invites.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        MembershipSnapshot {
            room_id: self.room_id.clone(),
            members: sorted_members(&self.base.members),
            cursor: self.base_cursor.clone(),
            consumed: self.base.consumed.clone(),
            invites,
            recent: self.log.values().cloned().collect(),
        }
    }

    /// Settles logged changes older than the skew window behind the newest
    /// change. Changes at or before the settled cursor are ignored afterwards.
    pub fn compact(&mut self) {
        let Some(newest) = self.cursor.as_ref().map(|c| c.created_at) else {
            return;
        };
        let horizon = EventCursor::new(newest.saturating_sub(MEMBERSHIP_SKEW_SECS), String::new());
        let recent = self.log.split_off(&horizon);
        for (cursor, change) in std::mem::replace(&mut self.log, recent) {
            fold(&mut self.base, &self.invites, &change);
            self.base_cursor = Some(cursor);
        }
        self.invites.retain(|id, _| !self.base.consumed.contains(id));
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }
}

fn sorted_members(members: &HashMap<PublicKey, Member>) -> Vec<Member> {
    let mut members: Vec<Member> = members.values().cloned().collect();
    members.sort_by(|a, b| {
        (a.role, a.joined_at, a.pubkey.to_hex()).cmp(&(b.role, b.joined_at, b.pubkey.to_hex()))
    });
    members
}

fn fold(state: &mut FoldState, invites: &HashMap<String, Invite>, change: &MembershipChange) {
    match &change.action {
        MembershipAction::Join { invite_id } => {
            if state.members.contains_key(&change.author) {
                return;
            }
            let valid = invites.get(invite_id).is_some_and(|invite| {
                invite.invitee == change.author
                    && invite.created_at <= change.created_at
                    && !state.consumed.contains(invite_id)
                    && state
                        .members
                        .get(&invite.inviter)
                        .is_some_and(|m| m.role.can_manage())
            });
            if !valid {
                tracing::debug!(
                    event_id = %change.id,
                    author = %change.author,
                    "ignoring accept without a matching invite"
                );
                return;
            }
            state.consumed.insert(invite_id.clone());
            state.members.insert(
                change.author,
                Member {
                    pubkey: change.author,
                    role: Role::Member,
                    joined_at: change.created_at,
                },
            );
        }
        MembershipAction::Remove { target } => {
            let members = &mut state.members;
            let Some(target_role) = members.get(target).map(|m| m.role) else {
                return;
            };
            if target_role == Role::Owner {
                tracing::debug!(event_id = %change.id, "ignoring attempt to remove the owner");
                return;
            }
            if *target != change.author {
                let allowed = match members.get(&change.author).map(|m| m.role) {
                    Some(Role::Owner) => true,
                    Some(Role::Admin) => target_role == Role::Member,
                    _ => false,
                };
                if !allowed {
                    tracing::debug!(
                        event_id = %change.id,
                        author = %change.author,
                        "ignoring removal without rights"
                    );
                    return;
                }
            }
            members.remove(target);
        }
    }
}

/// Computes the member list from a creation event and any set of related
/// invite, accept and leave events.
pub fn reconstruct_membership<'a, I>(creation: &Event, events: I) -> Result<Vec<Member>>
where
    I: IntoIterator<Item = &'a Event>,
{
    let creation = parse_room_creation(creation)?;
    let mut projection = MembershipProjection::new(&creation);
    for event in events {
        projection.apply_event(event);
    }
    Ok(projection.members())
}
