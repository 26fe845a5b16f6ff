use base64::Engine;
use nostr::nips::nip44::{self, Version};
use nostr::{Event, EventBuilder, Keys, Kind, PublicKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cache::LocalCache;
use crate::utils::{
    key_version_of, key_version_tag, make_tag, marked_tag_value, pubkey_from_hex, room_reference,
    root_tag, serde_bytes_array, sign, EventCursor,
};
use crate::{
    is_kind, Error, Result, RECEIVER_MARKER, ROOM_KEY_KIND, SENDER_MARKER,
};

/// Symmetric key shared by the members of a room for one key version.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomKey {
    pub room_id: String,
    pub version: u32,
    #[serde(with = "serde_bytes_array")]
    key: [u8; 32],
}

impl fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomKey")
            .field("room_id", &self.room_id)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl RoomKey {
    pub fn new(room_id: impl Into<String>, version: u32, key: [u8; 32]) -> Self {
        Self {
            room_id: room_id.into(),
            version,
            key,
        }
    }

    pub fn generate(room_id: impl Into<String>, version: u32) -> Self {
        Self::new(room_id, version, rand::random::<[u8; 32]>())
    }

    pub fn from_hex(room_id: impl Into<String>, version: u32, key_hex: &str) -> Result<Self> {
        let bytes = hex::decode(key_hex)?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidEvent("Room key must be 32 bytes".to_string()))?;
        Ok(Self::new(room_id, version, key))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.key)
    }

    /// Encrypts with the room key used directly as a NIP-44 v2 conversation key.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let conversation_key = nip44::v2::ConversationKey::new(self.key);
        let encrypted = nip44::v2::encrypt_to_bytes(&conversation_key, plaintext.as_bytes())?;
        Ok(base64::engine::general_purpose::STANDARD.encode(encrypted))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let conversation_key = nip44::v2::ConversationKey::new(self.key);
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(ciphertext)
            .map_err(|e| Error::Decryption(format!("Base64 decode error: {}", e)))?;
        let plaintext = nip44::v2::decrypt_to_bytes(&conversation_key, &bytes)?;
        String::from_utf8(plaintext)
            .map_err(|e| Error::Decryption(format!("UTF-8 decode error: {}", e)))
    }
}

/// Plaintext carried inside a key distribution or an invite.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct KeyPayload {
    pub room_id: String,
    pub key_version: u32,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_name: Option<String>,
}

impl KeyPayload {
    pub(crate) fn for_key(key: &RoomKey, room_name: Option<String>) -> Self {
        Self {
            room_id: key.room_id.clone(),
            key_version: key.version,
            key: key.to_hex(),
            room_name,
        }
    }

    pub(crate) fn into_key(self) -> Result<RoomKey> {
        RoomKey::from_hex(self.room_id, self.key_version, &self.key)
    }
}

/// Encrypts a payload pairwise with the NIP-44 v2 conversation key of `sender` and `receiver`.
pub(crate) fn seal_pairwise(sender: &Keys, receiver: &PublicKey, payload: &KeyPayload) -> Result<String> {
    let plaintext = serde_json::to_string(payload)?;
    nip44::encrypt(sender.secret_key(), receiver, plaintext, Version::V2)
        .map_err(|e| Error::Encryption(e.to_string()))
}

pub(crate) fn open_pairwise(receiver: &Keys, sender: &PublicKey, content: &str) -> Result<KeyPayload> {
    let plaintext = nip44::decrypt(receiver.secret_key(), sender, content)
        .map_err(|e| Error::Decryption(e.to_string()))?;
    Ok(serde_json::from_str(&plaintext)?)
}

/// Public envelope of a key distribution event; readable without decrypting.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyEnvelope {
    pub id: String,
    pub room_id: String,
    pub version: u32,
    pub sender: PublicKey,
    pub receiver: PublicKey,
    pub created_at: u64,
}

pub fn build_key_distribution(
    sender: &Keys,
    receiver: &PublicKey,
    key: &RoomKey,
    created_at: Timestamp,
) -> Result<Event> {
    let content = seal_pairwise(sender, receiver, &KeyPayload::for_key(key, None))?;
    let tags = vec![
        root_tag(&key.room_id)?,
        make_tag(&["p", &receiver.to_hex(), "", RECEIVER_MARKER])?,
        make_tag(&["p", &sender.public_key().to_hex(), "", SENDER_MARKER])?,
        key_version_tag(key.version)?,
    ];
    sign(
        EventBuilder::new(Kind::from(ROOM_KEY_KIND), content)
            .tags(tags)
            .custom_created_at(created_at),
        sender,
    )
}

pub fn parse_key_envelope(event: &Event) -> Result<KeyEnvelope> {
    if !is_kind(event, ROOM_KEY_KIND) {
        return Err(Error::InvalidEvent(format!(
            "Expected kind {}, got {}",
            ROOM_KEY_KIND,
            event.kind.as_u16()
        )));
    }
    let room_id = room_reference(event)
        .ok_or_else(|| Error::InvalidEvent("Key event without room reference".to_string()))?;
    let receiver = marked_tag_value(event, "p", RECEIVER_MARKER)
        .ok_or_else(|| Error::InvalidEvent("Key event without receiver".to_string()))?;
    let receiver = pubkey_from_hex(&receiver)?;
    let sender = match marked_tag_value(event, "p", SENDER_MARKER) {
        Some(hex) => pubkey_from_hex(&hex)?,
        None => event.pubkey,
    };
    let version = key_version_of(event)
        .ok_or_else(|| Error::InvalidEvent("Key event without key_version".to_string()))?;

    Ok(KeyEnvelope {
        id: event.id.to_hex(),
        room_id,
        version,
        sender,
        receiver,
        created_at: event.created_at.as_u64(),
    })
}

/// Decrypts a key distribution addressed to `me`.
pub fn open_key_distribution(me: &Keys, event: &Event) -> Result<RoomKey> {
    let envelope = parse_key_envelope(event)?;
    if envelope.receiver != me.public_key() {
        return Err(Error::NotAuthorized(
            "Key distribution is addressed to another receiver".to_string(),
        ));
    }
    let key = open_pairwise(me, &envelope.sender, &event.content)?.into_key()?;
    if key.room_id != envelope.room_id || key.version != envelope.version {
        return Err(Error::InvalidEvent(
            "Key payload does not match its envelope".to_string(),
        ));
    }
    Ok(key)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyScanReport {
    /// Keys decrypted and written to the cache, as (room id, version).
    pub cached: Vec<(String, u32)>,
    pub cache_hits: usize,
    pub not_receiver: usize,
    pub unauthorized: usize,
    pub failed: usize,
}

impl KeyScanReport {
    pub fn merge(&mut self, other: KeyScanReport) {
        self.cached.extend(other.cached);
        self.cache_hits += other.cache_hits;
        self.not_receiver += other.not_receiver;
        self.unauthorized += other.unauthorized;
        self.failed += other.failed;
    }
}

/// Scans key distribution events and caches every key addressed to `me`.
///
/// Events for other receivers are skipped without decryption. A failure on one
/// event is logged and the scan moves on. `authorized` decides whether the
/// envelope's sender may distribute keys for its room.
pub fn receive_keys<'a, I, F>(
    me: &Keys,
    events: I,
    cache: &LocalCache,
    force: bool,
    authorized: F,
) -> KeyScanReport
where
    I: IntoIterator<Item = &'a Event>,
    F: Fn(&KeyEnvelope) -> bool,
{
    let my_pubkey = me.public_key();
    let mut report = KeyScanReport::default();

    let mut candidates: Vec<&Event> = events
        .into_iter()
        .filter(|e| is_kind(e, ROOM_KEY_KIND))
        .collect();
    // Later distributions overwrite earlier ones on a forced refresh.
    candidates.sort_by_key(|e| EventCursor::of(e));

    for event in candidates {
        let envelope = match parse_key_envelope(event) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(event_id = %event.id, error = %e, "skipping malformed key event");
                report.failed += 1;
                continue;
            }
        };

        if envelope.receiver != my_pubkey {
            report.not_receiver += 1;
            continue;
        }

        if !authorized(&envelope) {
            tracing::debug!(
                room_id = %envelope.room_id,
                sender = %envelope.sender,
                "ignoring key from sender without manage rights"
            );
            report.unauthorized += 1;
            continue;
        }

        if !force {
            match cache.get_room_key(&envelope.room_id, envelope.version) {
                Ok(Some(_)) => {
                    report.cache_hits += 1;
                    continue;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "key cache read failed"),
            }
        }

        let key = match open_key_distribution(me, event) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(
                    event_id = %envelope.id,
                    room_id = %envelope.room_id,
                    version = envelope.version,
                    error = %e,
                    "failed to decrypt room key"
                );
                report.failed += 1;
                continue;
            }
        };

        match cache.put_room_key(&key) {
            Ok(()) => report.cached.push((key.room_id.clone(), key.version)),
            Err(e) => {
                tracing::warn!(room_id = %key.room_id, error = %e, "failed to cache room key");
                report.failed += 1;
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryStorage;
    use std::sync::Arc;

    fn cache() -> LocalCache {
        LocalCache::new(Arc::new(InMemoryStorage::new()))
    }

    #[test]
    fn room_key_encrypt_decrypt() {
        let key = RoomKey::generate("room", 1);
        let ciphertext = key.encrypt("secret").unwrap();
        assert_ne!(ciphertext, "secret");
        assert_eq!(key.decrypt(&ciphertext).unwrap(), "secret");
    }

    #[test]
    fn room_key_wrong_key_fails() {
        let key = RoomKey::generate("room", 1);
        let other = RoomKey::generate("room", 1);
        let ciphertext = key.encrypt("secret").unwrap();
        assert!(other.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn room_key_debug_hides_material() {
        let key = RoomKey::new("room", 1, [7u8; 32]);
        let debug = format!("{:?}", key);
        assert!(!debug.contains(&hex::encode([7u8; 32])));
    }

    #[test]
    fn distribution_roundtrip_for_receiver() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let key = RoomKey::generate("room-1", 2);

        let event =
            build_key_distribution(&alice, &bob.public_key(), &key, Timestamp::from(100)).unwrap();
        let envelope = parse_key_envelope(&event).unwrap();
        assert_eq!(envelope.receiver, bob.public_key());
        assert_eq!(envelope.sender, alice.public_key());
        assert_eq!(envelope.version, 2);

        let opened = open_key_distribution(&bob, &event).unwrap();
        assert_eq!(opened, key);
    }

    #[test]
    fn distribution_rejects_other_receiver() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let eve = Keys::generate();
        let key = RoomKey::generate("room-1", 1);

        let event =
            build_key_distribution(&alice, &bob.public_key(), &key, Timestamp::from(100)).unwrap();
        assert!(matches!(
            open_key_distribution(&eve, &event),
            Err(Error::NotAuthorized(_))
        ));
    }

    #[test]
    fn receive_skips_events_for_other_receivers() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let carol = Keys::generate();
        let key = RoomKey::generate("room-1", 1);
        let to_bob =
            build_key_distribution(&alice, &bob.public_key(), &key, Timestamp::from(1)).unwrap();

        let cache = cache();
        let report = receive_keys(&carol, [&to_bob], &cache, false, |_| true);
        assert_eq!(report.not_receiver, 1);
        assert!(report.cached.is_empty());
        assert!(cache.get_room_key("room-1", 1).unwrap().is_none());
    }

    #[test]
    fn receive_continues_after_bad_event() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let key = RoomKey::generate("room-1", 1);

        // Claims to be from alice but encrypted by someone else: decryption fails.
        let mallory = Keys::generate();
        let mut forged_tags = vec![
            root_tag("room-1").unwrap(),
            make_tag(&["p", &bob.public_key().to_hex(), "", RECEIVER_MARKER]).unwrap(),
            make_tag(&["p", &alice.public_key().to_hex(), "", SENDER_MARKER]).unwrap(),
        ];
        forged_tags.push(key_version_tag(1).unwrap());
        let forged_content =
            seal_pairwise(&mallory, &bob.public_key(), &KeyPayload::for_key(&key, None)).unwrap();
        let forged = sign(
            EventBuilder::new(Kind::from(ROOM_KEY_KIND), forged_content)
                .tags(forged_tags)
                .custom_created_at(Timestamp::from(1)),
            &mallory,
        )
        .unwrap();

        let good =
            build_key_distribution(&alice, &bob.public_key(), &key, Timestamp::from(2)).unwrap();

        let cache = cache();
        let report = receive_keys(&bob, [&forged, &good], &cache, false, |_| true);
        assert_eq!(report.failed, 1);
        assert_eq!(report.cached, vec![("room-1".to_string(), 1)]);
        assert_eq!(cache.get_room_key("room-1", 1).unwrap(), Some(key));
    }

    #[test]
    fn receive_uses_cache_unless_forced() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let old = RoomKey::generate("room-1", 1);
        let redistributed = RoomKey::generate("room-1", 1);
        let event =
            build_key_distribution(&alice, &bob.public_key(), &redistributed, Timestamp::from(5))
                .unwrap();

        let cache = cache();
        cache.put_room_key(&old).unwrap();

        let report = receive_keys(&bob, [&event], &cache, false, |_| true);
        assert_eq!(report.cache_hits, 1);
        assert_eq!(cache.get_room_key("room-1", 1).unwrap(), Some(old));

        let report = receive_keys(&bob, [&event], &cache, true, |_| true);
        assert_eq!(report.cached.len(), 1);
        assert_eq!(cache.get_room_key("room-1", 1).unwrap(), Some(redistributed));
    }

    #[test]
    fn receive_respects_authorization() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let key = RoomKey::generate("room-1", 1);
        let event =
            build_key_distribution(&alice, &bob.public_key(), &key, Timestamp::from(1)).unwrap();

        let cache = cache();
        let report = receive_keys(&bob, [&event], &cache, false, |_| false);
        assert_eq!(report.unauthorized, 1);
        assert!(cache.get_room_key("room-1", 1).unwrap().is_none());
    }
}
