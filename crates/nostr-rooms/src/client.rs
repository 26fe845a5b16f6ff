use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use nostr::{Event, Keys, PublicKey, Timestamp};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::LocalCache;
use crate::feed::RoomFeed;
use crate::group_key::{
    build_key_distribution, parse_key_envelope, receive_keys, KeyEnvelope, KeyScanReport,
};
use crate::invite::{
    build_invite, build_invite_response, invite_status, open_invite, parse_invite,
    parse_invite_response, Invite, InviteResponse, InviteResponseStatus, InviteStatus,
    OpenedInvite,
};
use crate::membership::{build_leave, Member, MembershipProjection};
use crate::message::{
    build_room_message, decrypt_room_message, DisplayMessage, MessagePayload, RoomMessage,
};
use crate::room::{
    build_room_archive, build_room_creation, parse_room_archive, parse_room_creation, Room,
    RoomCreation, RoomMetadata,
};
use crate::utils::{now_seconds, room_reference};
use crate::{
    is_kind, Error, InMemoryStorage, Result, Role, RoomKey, RoomQuery, StorageAdapter,
    ENCRYPTED_DM_KIND, GIFT_WRAP_KIND, ROOM_ARCHIVE_KIND, ROOM_CREATION_KIND, ROOM_INVITE_KIND,
    ROOM_INVITE_RESPONSE_KIND, ROOM_KEY_KIND, ROOM_LEAVE_KIND, ROOM_MESSAGE_KIND,
};

/// Seconds since the Unix epoch.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

const MAX_PENDING_PER_ROOM: usize = 128;
const MAX_SEEN_EVENTS: usize = 10_000;

pub struct RoomClientOptions {
    pub keys: Keys,
    pub storage: Option<Arc<dyn StorageAdapter>>,
    pub clock: Option<Clock>,
}

impl RoomClientOptions {
    pub fn new(keys: Keys) -> Self {
        Self {
            keys,
            storage: None,
            clock: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteView {
    #[serde(flatten)]
    pub invite: Invite,
    pub room_name: Option<String>,
    pub status: InviteStatus,
}

/// What a call to [`RoomClient::ingest`] changed.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub new_rooms: Vec<String>,
    pub archived: Vec<String>,
    pub keys: KeyScanReport,
    /// Ids of newly received invites addressed to us.
    pub invites: Vec<String>,
    pub membership_changes: usize,
    /// Messages added to a feed or confirmed, in ingest order.
    pub messages: Vec<DisplayMessage>,
    /// Earlier messages that decrypted after new keys arrived.
    pub recovered: usize,
    pub dms: usize,
    /// Events held back until their room's creation event is known.
    pub buffered: usize,
    pub skipped: usize,
}

impl IngestReport {
    pub fn merge(&mut self, other: IngestReport) {
        self.new_rooms.extend(other.new_rooms);
        self.archived.extend(other.archived);
        self.keys.merge(other.keys);
        self.invites.extend(other.invites);
        self.membership_changes += other.membership_changes;
        self.messages.extend(other.messages);
        self.recovered += other.recovered;
        self.dms += other.dms;
        self.buffered += other.buffered;
        self.skipped += other.skipped;
    }

    pub fn is_empty(&self) -> bool {
        self.new_rooms.is_empty()
            && self.archived.is_empty()
            && self.keys.cached.is_empty()
            && self.invites.is_empty()
            && self.membership_changes == 0
            && self.messages.is_empty()
            && self.recovered == 0
            && self.dms == 0
    }
}

/// Ids of ingested events. The oldest are forgotten once full; ingest is
/// idempotent, so a forgotten id only costs a second look.
#[derive(Default)]
struct SeenEvents {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenEvents {
    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: String) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > MAX_SEEN_EVENTS {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, id: &str) {
        if self.ids.remove(id) {
            self.order.retain(|seen| seen != id);
        }
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.order.clear();
    }
}

struct RoomState {
    creation: RoomCreation,
    membership: MembershipProjection,
    feed: RoomFeed,
    archived: bool,
}

#[derive(Default)]
struct Batch {
    creations: Vec<Event>,
    archives: Vec<Event>,
    keys: Vec<Event>,
    invites: Vec<Event>,
    memberships: Vec<Event>,
    messages: Vec<Event>,
    dms: Vec<Event>,
}

impl Batch {
    fn push(&mut self, event: Event) -> bool {
        let bucket = match event.kind.as_u16() {
            ROOM_CREATION_KIND => &mut self.creations,
            ROOM_ARCHIVE_KIND => &mut self.archives,
            ROOM_KEY_KIND => &mut self.keys,
            ROOM_INVITE_KIND => &mut self.invites,
            ROOM_INVITE_RESPONSE_KIND | ROOM_LEAVE_KIND => &mut self.memberships,
            ROOM_MESSAGE_KIND => &mut self.messages,
            ENCRYPTED_DM_KIND | GIFT_WRAP_KIND => &mut self.dms,
            _ => return false,
        };
        bucket.push(event);
        true
    }
}

/// Local state of one user across all rooms: folds fetched events into rooms,
/// memberships, feeds and invites, and builds the signed events for local
/// actions. Performs no I/O besides the local cache; publishing is left to
/// the caller.
pub struct RoomClient {
    keys: Keys,
    cache: LocalCache,
    clock: Clock,
    rooms: HashMap<String, RoomState>,
    received_invites: HashMap<String, OpenedInvite>,
    sent_invites: HashMap<String, Invite>,
    responses: HashMap<String, InviteResponse>,
    pending: HashMap<String, Vec<Event>>,
    seen: SeenEvents,
}

impl RoomClient {
    /// Creates a client and restores rooms known from the cache.
    pub fn new(opts: RoomClientOptions) -> Result<Self> {
        let storage = opts
            .storage
            .unwrap_or_else(|| Arc::new(InMemoryStorage::new()));
        let mut client = Self {
            keys: opts.keys,
            cache: LocalCache::new(storage),
            clock: opts.clock.unwrap_or_else(|| Arc::new(now_seconds) as Clock),
            rooms: HashMap::new(),
            received_invites: HashMap::new(),
            sent_invites: HashMap::new(),
            responses: HashMap::new(),
            pending: HashMap::new(),
            seen: SeenEvents::default(),
        };

        for event in client.cache.room_creations()? {
            if let Err(e) = client.add_room(&event) {
                warn!(event_id = %event.id, error = %e, "dropping cached room");
            }
        }
        Ok(client)
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    fn now(&self) -> Timestamp {
        Timestamp::from((self.clock)())
    }

    fn state(&self, room_id: &str) -> Result<&RoomState> {
        self.rooms
            .get(room_id)
            .ok_or_else(|| Error::UnknownRoom(room_id.to_string()))
    }

    fn state_mut(&mut self, room_id: &str) -> Result<&mut RoomState> {
        self.rooms
            .get_mut(room_id)
            .ok_or_else(|| Error::UnknownRoom(room_id.to_string()))
    }

    fn my_role(&self, room_id: &str) -> Result<Option<Role>> {
        Ok(self.state(room_id)?.membership.role_of(&self.public_key()))
    }

    fn require_active(&self, room_id: &str) -> Result<()> {
        if self.state(room_id)?.archived {
            return Err(Error::NotAuthorized(format!("Room {room_id} is archived")));
        }
        Ok(())
    }

    fn require_manager(&self, room_id: &str) -> Result<Role> {
        match self.my_role(room_id)? {
            Some(role) if role.can_manage() => Ok(role),
            _ => Err(Error::NotAuthorized(
                "Only the owner or an admin can do this".to_string(),
            )),
        }
    }

    /// Registers a room from its creation event. Returns the room id when it was new.
    fn add_room(&mut self, event: &Event) -> Result<Option<String>> {
        let creation = parse_room_creation(event)?;
        let room_id = creation.room_id.clone();
        if self.rooms.contains_key(&room_id) {
            return Ok(None);
        }

        let membership = match self.cache.get_membership_snapshot(&room_id) {
            Ok(Some(snapshot)) if snapshot.room_id == room_id => {
                MembershipProjection::from_snapshot(snapshot)
            }
            Ok(_) => MembershipProjection::new(&creation),
            Err(e) => {
                warn!(room_id = %room_id, error = %e, "ignoring unreadable membership snapshot");
                MembershipProjection::new(&creation)
            }
        };

        let mut feed = RoomFeed::new(room_id.clone());
        if let Ok(Some(since)) = self.cache.get_cursor(&room_id) {
            feed.restore_since(since);
        }
        let archived = self.cache.is_archived(&room_id).unwrap_or(false);

        self.cache.put_room_creation(event)?;
        self.rooms.insert(
            room_id.clone(),
            RoomState {
                creation,
                membership,
                feed,
                archived,
            },
        );
        Ok(Some(room_id))
    }

    // === Ingest ===

    /// Folds fetched events into local state. Events are verified, deduplicated
    /// by id and applied kind by kind; nothing here fails the whole batch.
    pub fn ingest(&mut self, events: &[Event]) -> IngestReport {
        let mut report = IngestReport::default();
        let mut batch = Batch::default();

        for event in events {
            let id = event.id.to_hex();
            if self.seen.contains(&id) {
                continue;
            }
            if let Err(e) = event.verify() {
                warn!(event_id = %id, error = %e, "skipping event with invalid signature");
                report.skipped += 1;
                continue;
            }
            if batch.push(event.clone()) {
                self.seen.insert(id);
            }
        }

        self.apply_batch(batch, &mut report);
        report
    }

    fn apply_batch(&mut self, mut batch: Batch, report: &mut IngestReport) {
        let me = self.public_key();

        for event in std::mem::take(&mut batch.creations) {
            match self.add_room(&event) {
                Ok(Some(room_id)) => {
                    info!(room_id = %room_id, "room discovered");
                    for buffered in self.pending.remove(&room_id).unwrap_or_default() {
                        batch.push(buffered);
                    }
                    report.new_rooms.push(room_id);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(event_id = %event.id, error = %e, "skipping malformed room creation");
                    report.skipped += 1;
                }
            }
        }

        for event in std::mem::take(&mut batch.archives) {
            let (room_id, author) = match parse_room_archive(&event) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(event_id = %event.id, error = %e, "skipping malformed archive event");
                    report.skipped += 1;
                    continue;
                }
            };
            match self.rooms.get_mut(&room_id) {
                Some(state) if author == state.creation.owner => {
                    if !state.archived {
                        state.archived = true;
                        report.archived.push(room_id);
                    }
                }
                Some(_) => debug!(room_id = %room_id, "ignoring archive from non-owner"),
                None => {
                    buffer_event(&mut self.pending, &mut self.seen, room_id, event);
                    report.buffered += 1;
                }
            }
        }

        let (keys, held) = self.hold_unknown_room_keys(std::mem::take(&mut batch.keys));
        report.buffered += held;
        let rooms = &self.rooms;
        report.keys = receive_keys(&self.keys, keys.iter(), &self.cache, false, |envelope| {
            may_distribute_keys(rooms, envelope)
        });

        for event in std::mem::take(&mut batch.invites) {
            let invite = match parse_invite(&event) {
                Ok(invite) => invite,
                Err(e) => {
                    warn!(event_id = %event.id, error = %e, "skipping malformed invite");
                    report.skipped += 1;
                    continue;
                }
            };
            let Some(state) = self.rooms.get_mut(&invite.room_id) else {
                buffer_event(&mut self.pending, &mut self.seen, invite.room_id, event);
                report.buffered += 1;
                continue;
            };
            if state.membership.add_invite(invite.clone()) {
                report.membership_changes += 1;
            }
            let may_invite = state
                .membership
                .role_of(&invite.inviter)
                .is_some_and(|role| role.can_manage());
            if !may_invite {
                debug!(invite_id = %invite.id, "ignoring invite from non-manager");
                continue;
            }
            if invite.inviter == me {
                self.sent_invites.insert(invite.id.clone(), invite.clone());
            }
            if invite.invitee == me && !self.received_invites.contains_key(&invite.id) {
                match open_invite(&self.keys, &event) {
                    Ok(opened) => {
                        report.invites.push(invite.id.clone());
                        self.received_invites.insert(invite.id, opened);
                    }
                    Err(e) => warn!(invite_id = %invite.id, error = %e, "failed to open invite"),
                }
            }
        }

        for event in std::mem::take(&mut batch.memberships) {
            if is_kind(&event, ROOM_INVITE_RESPONSE_KIND) {
                match parse_invite_response(&event) {
                    Ok(response) => {
                        self.responses.insert(response.id.clone(), response);
                    }
                    Err(e) => {
                        warn!(event_id = %event.id, error = %e, "skipping malformed invite response");
                        report.skipped += 1;
                        continue;
                    }
                }
            }
            let Some(room_id) = room_reference(&event) else {
                warn!(event_id = %event.id, "skipping membership event without room");
                report.skipped += 1;
                continue;
            };
            match self.rooms.get_mut(&room_id) {
                Some(state) => {
                    if state.membership.apply_event(&event) {
                        report.membership_changes += 1;
                    }
                }
                None => {
                    buffer_event(&mut self.pending, &mut self.seen, room_id, event);
                    report.buffered += 1;
                }
            }
        }

        let cache = &self.cache;
        let lookup = |room_id: &str, version: u32| cache.get_room_key(room_id, version).ok().flatten();

        for event in std::mem::take(&mut batch.messages) {
            let message = match RoomMessage::from_event(&event) {
                Ok(message) => message,
                Err(e) => {
                    warn!(event_id = %event.id, error = %e, "skipping malformed room message");
                    report.skipped += 1;
                    continue;
                }
            };
            match self.rooms.get_mut(&message.room_id) {
                Some(state) => {
                    if state.feed.ingest(&message, &lookup) {
                        if let Some(display) = state.feed.get(&message.id) {
                            report.messages.push(display.clone());
                        }
                    }
                }
                None => {
                    buffer_event(&mut self.pending, &mut self.seen, message.room_id, event);
                    report.buffered += 1;
                }
            }
        }

        let refreshed: BTreeSet<&str> = report.keys.cached.iter().map(|(room, _)| room.as_str()).collect();
        for room_id in refreshed {
            if let Some(state) = self.rooms.get_mut(room_id) {
                report.recovered += state.feed.retry_failed(&lookup);
            }
        }

        for event in std::mem::take(&mut batch.dms) {
            match self.cache.put_dm_event(&me, &event) {
                Ok(true) => report.dms += 1,
                Ok(false) => {}
                Err(e) => warn!(event_id = %event.id, error = %e, "failed to cache DM"),
            }
        }
    }

    /// Re-scans key distributions. With `force`, cached keys are decrypted again
    /// and overwritten.
    pub fn refresh_keys(&mut self, events: &[Event], force: bool) -> KeyScanReport {
        let (events, _) = self.hold_unknown_room_keys(events.to_vec());
        let rooms = &self.rooms;
        let report = receive_keys(&self.keys, events.iter(), &self.cache, force, |envelope| {
            may_distribute_keys(rooms, envelope)
        });

        let cache = &self.cache;
        let lookup = |room_id: &str, version: u32| cache.get_room_key(room_id, version).ok().flatten();
        for (room_id, _) in &report.cached {
            if let Some(state) = self.rooms.get_mut(room_id) {
                state.feed.retry_failed(&lookup);
            }
        }
        report
    }

    /// Holds back key distributions addressed to us for rooms not known yet.
    /// Their sender can only be checked once the room's members are.
    fn hold_unknown_room_keys(&mut self, events: Vec<Event>) -> (Vec<Event>, usize) {
        let me = self.public_key();
        let mut known = Vec::with_capacity(events.len());
        let mut held = 0;
        for event in events {
            match parse_key_envelope(&event) {
                Ok(envelope)
                    if envelope.receiver == me && !self.rooms.contains_key(&envelope.room_id) =>
                {
                    buffer_event(&mut self.pending, &mut self.seen, envelope.room_id, event);
                    held += 1;
                }
                _ => known.push(event),
            }
        }
        (known, held)
    }

    // === Local actions ===

    /// Creates a room with a first key distributed to every initial member,
    /// ourselves included. Returns the room id and the events to publish.
    pub fn create_room(
        &mut self,
        metadata: RoomMetadata,
        admins: &[PublicKey],
        members: &[PublicKey],
    ) -> Result<(String, Vec<Event>)> {
        let now = self.now();
        let creation = build_room_creation(&self.keys, &metadata, admins, members, now)?;
        let room_id = creation.id.to_hex();

        let key = RoomKey::generate(&room_id, crate::INITIAL_KEY_VERSION);
        self.cache.put_room_key(&key)?;
        self.add_room(&creation)?;

        let recipients: Vec<PublicKey> = self
            .state(&room_id)?
            .membership
            .members()
            .iter()
            .map(|m| m.pubkey)
            .collect();

        let mut events = vec![creation];
        for recipient in recipients {
            events.push(build_key_distribution(&self.keys, &recipient, &key, now)?);
        }

        info!(room_id = %room_id, members = events.len() - 1, "room created");
        Ok((room_id, events))
    }

    pub fn invite(&mut self, room_id: &str, invitee: &PublicKey) -> Result<Event> {
        self.require_active(room_id)?;
        self.require_manager(room_id)?;
        let state = self.state(room_id)?;
        let room_name = state.creation.metadata.name.clone();
        let key = self
            .cache
            .latest_room_key(room_id)?
            .ok_or_else(|| Error::MissingKey {
                room_id: room_id.to_string(),
                version: state.creation.key_version,
            })?;

        let event = build_invite(&self.keys, invitee, &key, &room_name, self.now())?;
        let invite = parse_invite(&event)?;
        self.state_mut(room_id)?.membership.add_invite(invite.clone());
        self.sent_invites.insert(invite.id.clone(), invite);
        Ok(event)
    }

    /// Accepts an invite: caches the room key it carries and returns the
    /// response to publish.
    pub fn accept_invite(&mut self, invite_id: &str) -> Result<Event> {
        let opened = self.answerable_invite(invite_id)?;
        self.cache.put_room_key(&opened.key)?;
        self.respond(&opened.invite, InviteResponseStatus::Accepted)
    }

    pub fn reject_invite(&mut self, invite_id: &str) -> Result<Event> {
        let opened = self.answerable_invite(invite_id)?;
        self.respond(&opened.invite, InviteResponseStatus::Rejected)
    }

    fn answerable_invite(&self, invite_id: &str) -> Result<OpenedInvite> {
        let opened = self
            .received_invites
            .get(invite_id)
            .cloned()
            .ok_or_else(|| Error::UnknownInvite(invite_id.to_string()))?;
        if invite_status(&opened.invite, self.responses.values()) != InviteStatus::Pending {
            return Err(Error::InviteAnswered(invite_id.to_string()));
        }
        Ok(opened)
    }

    fn respond(&mut self, invite: &Invite, status: InviteResponseStatus) -> Result<Event> {
        let event = build_invite_response(
            &self.keys,
            &invite.room_id,
            &invite.id,
            &invite.inviter,
            status,
            self.now(),
        )?;
        let response = parse_invite_response(&event)?;
        self.responses.insert(response.id.clone(), response);
        if let Some(state) = self.rooms.get_mut(&invite.room_id) {
            state.membership.add_invite(invite.clone());
            state.membership.apply_event(&event);
        }
        Ok(event)
    }

    pub fn leave_room(&mut self, room_id: &str) -> Result<Event> {
        let me = self.public_key();
        match self.my_role(room_id)? {
            None => return Err(Error::NotAuthorized(format!("Not a member of {room_id}"))),
            Some(Role::Owner) => {
                return Err(Error::NotAuthorized(
                    "The owner cannot leave the room".to_string(),
                ))
            }
            Some(_) => {}
        }
        let event = build_leave(&self.keys, room_id, &me, None, self.now())?;
        self.state_mut(room_id)?.membership.apply_event(&event);
        Ok(event)
    }

    pub fn remove_member(&mut self, room_id: &str, target: &PublicKey) -> Result<Event> {
        let my_role = self.require_manager(room_id)?;
        let target_role = self
            .state(room_id)?
            .membership
            .role_of(target)
            .ok_or_else(|| Error::NotAuthorized(format!("{target} is not a member")))?;
        match (my_role, target_role) {
            (_, Role::Owner) => {
                return Err(Error::NotAuthorized(
                    "The owner cannot be removed".to_string(),
                ))
            }
            (Role::Admin, Role::Admin) => {
                return Err(Error::NotAuthorized(
                    "Only the owner can remove admins".to_string(),
                ))
            }
            _ => {}
        }

        let event = build_leave(&self.keys, room_id, target, None, self.now())?;
        self.state_mut(room_id)?.membership.apply_event(&event);
        Ok(event)
    }

    pub fn archive_room(&mut self, room_id: &str) -> Result<Event> {
        if self.my_role(room_id)? != Some(Role::Owner) {
            return Err(Error::NotAuthorized(
                "Only the owner can archive a room".to_string(),
            ));
        }
        let event = build_room_archive(&self.keys, room_id, self.now())?;
        self.state_mut(room_id)?.archived = true;
        Ok(event)
    }

    /// Generates the next key version and distributes it to every current member.
    pub fn rotate_key(&mut self, room_id: &str) -> Result<Vec<Event>> {
        self.require_active(room_id)?;
        self.require_manager(room_id)?;
        let state = self.state(room_id)?;

        let current = self
            .cache
            .room_key_versions(room_id)?
            .last()
            .copied()
            .unwrap_or(0)
            .max(state.creation.key_version);
        let key = RoomKey::generate(room_id, current + 1);
        let recipients: Vec<PublicKey> = state.membership.members().iter().map(|m| m.pubkey).collect();

        self.cache.put_room_key(&key)?;
        let now = self.now();
        let events = recipients
            .iter()
            .map(|recipient| build_key_distribution(&self.keys, recipient, &key, now))
            .collect::<Result<Vec<_>>>()?;

        info!(room_id = %room_id, version = key.version, recipients = events.len(), "room key rotated");
        Ok(events)
    }

    /// Encrypts a message with the room's latest key and adds a pending copy
    /// to the feed.
    pub fn send_message(&mut self, room_id: &str, payload: MessagePayload) -> Result<Event> {
        self.require_active(room_id)?;
        if self.my_role(room_id)?.is_none() {
            return Err(Error::NotAuthorized(format!("Not a member of {room_id}")));
        }
        let key = self
            .cache
            .latest_room_key(room_id)?
            .ok_or_else(|| Error::MissingKey {
                room_id: room_id.to_string(),
                version: self
                    .state(room_id)
                    .map(|s| s.creation.key_version)
                    .unwrap_or(crate::INITIAL_KEY_VERSION),
            })?;

        let event = build_room_message(&self.keys, &key, &payload, self.now())?;
        let message = RoomMessage::from_event(&event)?;
        let display = decrypt_room_message(&message, |_, _| Some(key.clone()));
        self.state_mut(room_id)?.feed.insert_pending(display);
        Ok(event)
    }

    // === Views ===

    pub fn room(&self, room_id: &str) -> Option<Room> {
        let state = self.rooms.get(room_id)?;
        let key_version = self
            .cache
            .room_key_versions(room_id)
            .ok()
            .and_then(|versions| versions.last().copied())
            .unwrap_or(0);
        Some(Room {
            id: room_id.to_string(),
            name: state.creation.metadata.name.clone(),
            about: state.creation.metadata.about.clone(),
            owner: state.creation.owner,
            key_version,
            members: state.membership.members(),
            archived: state.archived,
            created_at: state.creation.created_at,
        })
    }

    /// All known rooms, oldest first.
    pub fn rooms(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self.rooms.keys().filter_map(|id| self.room(id)).collect();
        rooms.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        rooms
    }

    pub fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn members(&self, room_id: &str) -> Result<Vec<Member>> {
        Ok(self.state(room_id)?.membership.members())
    }

    pub fn role_of(&self, room_id: &str, pubkey: &PublicKey) -> Option<Role> {
        self.rooms.get(room_id)?.membership.role_of(pubkey)
    }

    pub fn feed(&self, room_id: &str) -> Option<&RoomFeed> {
        self.rooms.get(room_id).map(|state| &state.feed)
    }

    pub fn messages(&self, room_id: &str) -> Result<Vec<DisplayMessage>> {
        Ok(self.state(room_id)?.feed.messages().cloned().collect())
    }

    /// Invites addressed to us, oldest first.
    pub fn invites(&self) -> Vec<InviteView> {
        let mut views: Vec<InviteView> = self
            .received_invites
            .values()
            .map(|opened| InviteView {
                invite: opened.invite.clone(),
                room_name: opened.room_name.clone(),
                status: invite_status(&opened.invite, self.responses.values()),
            })
            .collect();
        views.sort_by(|a, b| (a.invite.created_at, &a.invite.id).cmp(&(b.invite.created_at, &b.invite.id)));
        views
    }

    /// Invites we sent, oldest first.
    pub fn sent_invites(&self) -> Vec<InviteView> {
        let mut views: Vec<InviteView> = self
            .sent_invites
            .values()
            .map(|invite| InviteView {
                invite: invite.clone(),
                room_name: self
                    .rooms
                    .get(&invite.room_id)
                    .map(|state| state.creation.metadata.name.clone()),
                status: invite_status(invite, self.responses.values()),
            })
            .collect();
        views.sort_by(|a, b| (a.invite.created_at, &a.invite.id).cmp(&(b.invite.created_at, &b.invite.id)));
        views
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Rooms we hold an invite for but whose creation event is still unknown.
    pub fn invited_rooms(&self) -> Vec<String> {
        let me = self.public_key();
        let mut rooms: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, events)| {
                events
                    .iter()
                    .filter(|event| is_kind(event, ROOM_INVITE_KIND))
                    .any(|event| parse_invite(event).is_ok_and(|invite| invite.invitee == me))
            })
            .map(|(room_id, _)| room_id.clone())
            .collect();
        rooms.sort();
        rooms
    }

    // === Queries ===

    /// Everything tagged to us: room creations, invites, responses to our
    /// invites and key distributions.
    pub fn inbox_query(&self, since: Option<u64>) -> RoomQuery {
        RoomQuery::new()
            .kinds([
                ROOM_CREATION_KIND,
                ROOM_INVITE_KIND,
                ROOM_INVITE_RESPONSE_KIND,
                ROOM_KEY_KIND,
            ])
            .pubkeys([self.public_key()])
            .since(since)
    }

    /// Queries that bring a room view up to date: membership, archive and
    /// messages since the last seen event.
    pub fn room_queries(&self, room_id: &str) -> Vec<RoomQuery> {
        let mut queries = self.membership_queries(room_id);
        queries.push(self.message_query(room_id));
        queries
    }

    /// Creation events of the given rooms.
    pub fn creation_query(&self, room_ids: &[String]) -> RoomQuery {
        RoomQuery::new().ids(room_ids).kinds([ROOM_CREATION_KIND])
    }

    /// Invite, membership and archive events of a room, plus a fetch of the
    /// creation event when the room is not known yet. Everything after the
    /// settled membership state is fetched so late-stamped events still count.
    pub fn membership_queries(&self, room_id: &str) -> Vec<RoomQuery> {
        let mut queries = Vec::new();
        let since = match self.rooms.get(room_id) {
            Some(state) => state.membership.fetch_since(),
            None => {
                queries.push(RoomQuery::new().ids([room_id]).kinds([ROOM_CREATION_KIND]));
                None
            }
        };
        queries.push(
            RoomQuery::new()
                .kinds([
                    ROOM_INVITE_KIND,
                    ROOM_INVITE_RESPONSE_KIND,
                    ROOM_LEAVE_KIND,
                    ROOM_ARCHIVE_KIND,
                ])
                .events([room_id])
                .since(since),
        );
        queries
    }

    /// New messages since the feed cursor.
    pub fn message_query(&self, room_id: &str) -> RoomQuery {
        RoomQuery::new()
            .kinds([ROOM_MESSAGE_KIND])
            .events([room_id])
            .since(self.rooms.get(room_id).and_then(|state| state.feed.since()))
    }

    /// The newest `limit` messages of a room, regardless of the feed cursor.
    pub fn history_query(&self, room_id: &str, limit: usize) -> RoomQuery {
        RoomQuery::new()
            .kinds([ROOM_MESSAGE_KIND])
            .events([room_id])
            .limit(limit)
    }

    /// Key distributions addressed to us, for one room or all rooms.
    pub fn key_query(&self, room_id: Option<&str>) -> RoomQuery {
        let query = RoomQuery::new()
            .kinds([ROOM_KEY_KIND])
            .pubkeys([self.public_key()]);
        match room_id {
            Some(room_id) => query.events([room_id]),
            None => query,
        }
    }

    pub fn dm_query(&self, since: Option<u64>) -> RoomQuery {
        RoomQuery::new()
            .kinds([ENCRYPTED_DM_KIND, GIFT_WRAP_KIND])
            .pubkeys([self.public_key()])
            .since(since)
    }

    // === Persistence ===

    /// Settles membership history outside the skew window, then checkpoints
    /// every room's membership and fetch cursor.
    pub fn persist(&mut self) -> Result<()> {
        for (room_id, state) in self.rooms.iter_mut() {
            state.membership.compact();
            self.cache
                .put_membership_snapshot(&state.membership.snapshot())?;
            if let Some(since) = state.feed.since() {
                self.cache.put_cursor(room_id, since)?;
            }
            if state.archived {
                self.cache.put_archived(room_id)?;
            }
        }
        Ok(())
    }

    /// Drops all local state and wipes the cache (logout).
    pub fn clear(&mut self) -> Result<()> {
        self.cache.clear()?;
        self.rooms.clear();
        self.received_invites.clear();
        self.sent_invites.clear();
        self.responses.clear();
        self.pending.clear();
        self.seen.clear();
        Ok(())
    }
}

fn may_distribute_keys(rooms: &HashMap<String, RoomState>, envelope: &KeyEnvelope) -> bool {
    rooms.get(&envelope.room_id).is_some_and(|state| {
        state
            .membership
            .role_of(&envelope.sender)
            .is_some_and(|role| role.can_manage())
    })
}

/// Holds an event until its room's creation event arrives. A dropped event is
/// also forgotten as seen, so a later fetch can deliver it again.
fn buffer_event(
    pending: &mut HashMap<String, Vec<Event>>,
    seen: &mut SeenEvents,
    room_id: String,
    event: Event,
) {
    let queue = pending.entry(room_id).or_default();
    if queue.iter().any(|held| held.id == event.id) {
        return;
    }
    if queue.len() >= MAX_PENDING_PER_ROOM {
        let dropped = queue.remove(0);
        seen.remove(&dropped.id.to_hex());
    }
    queue.push(event);
}
