use nostr::{Event, PublicKey};
use std::sync::Arc;

use crate::membership::MembershipSnapshot;
use crate::utils::first_tag_value;
use crate::{
    is_kind, Error, Result, RoomKey, StorageAdapter, ENCRYPTED_DM_KIND, GIFT_WRAP_KIND,
    ROOM_CREATION_KIND,
};

const ROOMS_PREFIX: &str = "v1/rooms/";
const ROOM_KEYS_PREFIX: &str = "v1/room-keys/";
const DM_PREFIX: &str = "v1/dm/";
const MEMBERSHIP_PREFIX: &str = "v1/membership/";
const CURSOR_PREFIX: &str = "v1/cursor/";
const ARCHIVED_PREFIX: &str = "v1/archived/";

/// Peer bucket for gift-wrapped DMs, whose outer author is a throwaway key.
const WRAPPED_PEER: &str = "wrapped";

/// Local persistent cache: room creation events, decrypted room keys, DM
/// ciphertext, membership snapshots and fetch cursors. DM plaintext is never
/// written here.
#[derive(Clone)]
pub struct LocalCache {
    storage: Arc<dyn StorageAdapter>,
}

impl LocalCache {
    pub fn new(storage: Arc<dyn StorageAdapter>) -> Self {
        Self { storage }
    }

    fn room_key_key(room_id: &str, version: u32) -> String {
        format!("{ROOM_KEYS_PREFIX}{room_id}/{version}")
    }

    // === Room creation events ===

    pub fn put_room_creation(&self, event: &Event) -> Result<()> {
        if !is_kind(event, ROOM_CREATION_KIND) {
            return Err(Error::InvalidEvent("Not a room creation event".to_string()));
        }
        self.storage.put(
            &format!("{ROOMS_PREFIX}{}", event.id.to_hex()),
            serde_json::to_string(event)?,
        )
    }

    pub fn room_creations(&self) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        for key in self.storage.list(ROOMS_PREFIX)? {
            let Some(raw) = self.storage.get(&key)? else {
                continue;
            };
            match serde_json::from_str::<Event>(&raw) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!(key = %key, error = %e, "dropping unreadable cached room"),
            }
        }
        Ok(events)
    }

    // === Room keys ===

    pub fn put_room_key(&self, key: &RoomKey) -> Result<()> {
        self.storage.put(
            &Self::room_key_key(&key.room_id, key.version),
            serde_json::to_string(key)?,
        )
    }

    pub fn get_room_key(&self, room_id: &str, version: u32) -> Result<Option<RoomKey>> {
        let Some(raw) = self.storage.get(&Self::room_key_key(room_id, version))? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn room_key_versions(&self, room_id: &str) -> Result<Vec<u32>> {
        let prefix = format!("{ROOM_KEYS_PREFIX}{room_id}/");
        let mut versions: Vec<u32> = self
            .storage
            .list(&prefix)?
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix).and_then(|v| v.parse().ok()))
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    pub fn latest_room_key(&self, room_id: &str) -> Result<Option<RoomKey>> {
        match self.room_key_versions(room_id)?.last() {
            Some(version) => self.get_room_key(room_id, *version),
            None => Ok(None),
        }
    }

    // === DM ciphertext ===

    /// Stores an encrypted DM event as-is. Returns false for events that are not
    /// encrypted DMs.
    pub fn put_dm_event(&self, me: &PublicKey, event: &Event) -> Result<bool> {
        let peer = if is_kind(event, GIFT_WRAP_KIND) {
            WRAPPED_PEER.to_string()
        } else if is_kind(event, ENCRYPTED_DM_KIND) {
            if event.pubkey == *me {
                first_tag_value(event, "p").ok_or_else(|| {
                    Error::InvalidEvent("Outgoing DM without recipient".to_string())
                })?
            } else {
                event.pubkey.to_hex()
            }
        } else {
            return Ok(false);
        };

        let key = format!("{DM_PREFIX}{peer}/{}", event.id.to_hex());
        self.storage.put(&key, serde_json::to_string(event)?)?;
        Ok(true)
    }

    /// Cached DM events with `peer` (hex pubkey, or `wrapped`), oldest first.
    pub fn dm_events(&self, peer: &str) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        for key in self.storage.list(&format!("{DM_PREFIX}{peer}/"))? {
            let Some(raw) = self.storage.get(&key)? else {
                continue;
            };
            match serde_json::from_str::<Event>(&raw) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!(key = %key, error = %e, "dropping unreadable cached DM"),
            }
        }
        events.sort_by_key(|e| (e.created_at, e.id));
        Ok(events)
    }

    pub fn dm_count(&self) -> Result<usize> {
        Ok(self.storage.list(DM_PREFIX)?.len())
    }

    // === Membership snapshots ===

    pub fn put_membership_snapshot(&self, snapshot: &MembershipSnapshot) -> Result<()> {
        self.storage.put(
            &format!("{MEMBERSHIP_PREFIX}{}", snapshot.room_id),
            serde_json::to_string(snapshot)?,
        )
    }

    pub fn get_membership_snapshot(&self, room_id: &str) -> Result<Option<MembershipSnapshot>> {
        let Some(raw) = self.storage.get(&format!("{MEMBERSHIP_PREFIX}{room_id}"))? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    // === Fetch cursors ===

    pub fn put_cursor(&self, stream: &str, since: u64) -> Result<()> {
        self.storage
            .put(&format!("{CURSOR_PREFIX}{stream}"), since.to_string())
    }

    pub fn get_cursor(&self, stream: &str) -> Result<Option<u64>> {
        Ok(self
            .storage
            .get(&format!("{CURSOR_PREFIX}{stream}"))?
            .and_then(|v| v.parse().ok()))
    }

    // === Archived rooms ===

    pub fn put_archived(&self, room_id: &str) -> Result<()> {
        self.storage
            .put(&format!("{ARCHIVED_PREFIX}{room_id}"), "true".to_string())
    }

    pub fn is_archived(&self, room_id: &str) -> Result<bool> {
        Ok(self
            .storage
            .get(&format!("{ARCHIVED_PREFIX}{room_id}"))?
            .is_some())
    }

    /// Wipes everything this cache owns (logout).
    pub fn clear(&self) -> Result<()> {
        for prefix in [
            ROOMS_PREFIX,
            ROOM_KEYS_PREFIX,
            DM_PREFIX,
            MEMBERSHIP_PREFIX,
            CURSOR_PREFIX,
            ARCHIVED_PREFIX,
        ] {
            for key in self.storage.list(prefix)? {
                self.storage.del(&key)?;
            }
        }
        Ok(())
    }
}
