use crate::{Error, Result, KEY_VERSION_TAG, ROOT_MARKER};
use nostr::{Event, EventBuilder, Keys, PublicKey, Tag};
use serde::{Deserialize, Serialize};

pub fn pubkey_from_hex(hex_str: &str) -> Result<PublicKey> {
    let bytes = hex::decode(hex_str)?;
    if bytes.len() != 32 {
        return Err(Error::InvalidEvent("Invalid pubkey length".to_string()));
    }
    PublicKey::from_slice(&bytes).map_err(|e| Error::InvalidEvent(e.to_string()))
}

pub fn now_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn is_kind(event: &Event, kind: u16) -> bool {
    event.kind.as_u16() == kind
}

pub(crate) fn make_tag(parts: &[&str]) -> Result<Tag> {
    let parts: Vec<String> = parts.iter().map(|s| s.to_string()).collect();
    Tag::parse(parts.as_slice()).map_err(|e| Error::InvalidEvent(e.to_string()))
}

pub(crate) fn root_tag(room_id: &str) -> Result<Tag> {
    make_tag(&["e", room_id, "", ROOT_MARKER])
}

pub(crate) fn key_version_tag(version: u32) -> Result<Tag> {
    make_tag(&[KEY_VERSION_TAG, &version.to_string()])
}

pub(crate) fn sign(builder: EventBuilder, keys: &Keys) -> Result<Event> {
    builder
        .build(keys.public_key())
        .sign_with_keys(keys)
        .map_err(|e| Error::InvalidEvent(e.to_string()))
}

pub fn first_tag_value(event: &Event, name: &str) -> Option<String> {
    event.tags.iter().find_map(|tag| {
        let parts = tag.as_slice();
        if parts.first().map(|s| s.as_str()) == Some(name) {
            parts.get(1).cloned()
        } else {
            None
        }
    })
}

/// Value of the first `name` tag whose positional marker (index 3) equals `marker`.
pub fn marked_tag_value(event: &Event, name: &str, marker: &str) -> Option<String> {
    event.tags.iter().find_map(|tag| {
        let parts = tag.as_slice();
        let matches = parts.first().map(|s| s.as_str()) == Some(name)
            && parts.get(3).map(|s| s.as_str()) == Some(marker);
        if matches {
            parts.get(1).cloned()
        } else {
            None
        }
    })
}

/// The room an event belongs to: the `root`-marked `e` tag, else the first `e` tag.
pub fn room_reference(event: &Event) -> Option<String> {
    marked_tag_value(event, "e", ROOT_MARKER).or_else(|| first_tag_value(event, "e"))
}

pub fn key_version_of(event: &Event) -> Option<u32> {
    first_tag_value(event, KEY_VERSION_TAG).and_then(|v| v.parse().ok())
}

/// Total order for events: claimed timestamp, then event id as tie-break.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventCursor {
    pub created_at: u64,
    pub id: String,
}

impl EventCursor {
    pub fn new(created_at: u64, id: impl Into<String>) -> Self {
        Self {
            created_at,
            id: id.into(),
        }
    }

    pub fn of(event: &Event) -> Self {
        Self::new(event.created_at.as_u64(), event.id.to_hex())
    }
}

pub(crate) mod serde_bytes_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom("Invalid 32-byte hex"));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(arr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{Kind, Timestamp};

    fn event_with_tags(tags: Vec<Vec<&str>>) -> Event {
        let keys = Keys::generate();
        let tags: Vec<Tag> = tags.iter().map(|t| make_tag(t).unwrap()).collect();
        sign(EventBuilder::new(Kind::from(4463u16), "").tags(tags), &keys).unwrap()
    }

    #[test]
    fn pubkey_from_hex_rejects_short_input() {
        assert!(pubkey_from_hex("abcd").is_err());
        let pk = Keys::generate().public_key();
        assert_eq!(pubkey_from_hex(&pk.to_hex()).unwrap(), pk);
    }

    #[test]
    fn room_reference_prefers_root_marker() {
        let event = event_with_tags(vec![
            vec!["e", "invite-id", "", "reply"],
            vec!["e", "room-id", "", "root"],
        ]);
        assert_eq!(room_reference(&event), Some("room-id".to_string()));
    }

    #[test]
    fn room_reference_falls_back_to_first_e_tag() {
        let event = event_with_tags(vec![vec!["e", "room-id"]]);
        assert_eq!(room_reference(&event), Some("room-id".to_string()));
    }

    #[test]
    fn marked_tag_value_requires_marker_position() {
        let event = event_with_tags(vec![vec!["p", "abc", "receiver"]]);
        assert_eq!(marked_tag_value(&event, "p", "receiver"), None);
    }

    #[test]
    fn key_version_parses_number() {
        let event = event_with_tags(vec![vec!["key_version", "3"]]);
        assert_eq!(key_version_of(&event), Some(3));
        let bad = event_with_tags(vec![vec!["key_version", "three"]]);
        assert_eq!(key_version_of(&bad), None);
    }

    #[test]
    fn cursor_orders_by_time_then_id() {
        let a = EventCursor::new(10, "ff");
        let b = EventCursor::new(11, "00");
        let c = EventCursor::new(10, "aa");
        let mut cursors = vec![b.clone(), a.clone(), c.clone()];
        cursors.sort();
        assert_eq!(cursors, vec![c, a, b]);
    }

    #[test]
    fn sign_sets_author() {
        let keys = Keys::generate();
        let event = sign(
            EventBuilder::new(Kind::from(4460u16), "{}").custom_created_at(Timestamp::from(5)),
            &keys,
        )
        .unwrap();
        assert_eq!(event.pubkey, keys.public_key());
        assert_eq!(event.created_at.as_u64(), 5);
        assert!(event.verify().is_ok());
    }
}
