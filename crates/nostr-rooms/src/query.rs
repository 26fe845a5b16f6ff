use nostr::{Alphabet, Event, EventId, Filter, Kind, PublicKey, SingleLetterTag, Timestamp};

/// Relay query for room events, convertible to a `nostr::Filter` and matchable
/// locally by in-memory transports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomQuery {
    pub ids: Vec<String>,
    pub kinds: Vec<u16>,
    pub authors: Vec<PublicKey>,
    /// Values of `#e` tags.
    pub events: Vec<String>,
    /// Values of `#p` tags.
    pub pubkeys: Vec<PublicKey>,
    pub since: Option<u64>,
    pub limit: Option<usize>,
}

impl RoomQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds.extend(kinds);
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = PublicKey>) -> Self {
        self.authors.extend(authors);
        self
    }

    pub fn events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events.extend(events.into_iter().map(Into::into));
        self
    }

    pub fn pubkeys(mut self, pubkeys: impl IntoIterator<Item = PublicKey>) -> Self {
        self.pubkeys.extend(pubkeys);
        self
    }

    pub fn since(mut self, since: Option<u64>) -> Self {
        self.since = since;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn to_filter(&self) -> Filter {
        let mut filter = Filter::new();
        if !self.ids.is_empty() {
            filter = filter.ids(self.ids.iter().filter_map(|id| EventId::from_hex(id).ok()));
        }
        if !self.kinds.is_empty() {
            filter = filter.kinds(self.kinds.iter().map(|k| Kind::from(*k)));
        }
        if !self.authors.is_empty() {
            filter = filter.authors(self.authors.iter().copied());
        }
        if !self.events.is_empty() {
            filter = filter.custom_tags(SingleLetterTag::lowercase(Alphabet::E), self.events.clone());
        }
        if !self.pubkeys.is_empty() {
            filter = filter.pubkeys(self.pubkeys.iter().copied());
        }
        if let Some(since) = self.since {
            filter = filter.since(Timestamp::from(since));
        }
        if let Some(limit) = self.limit {
            filter = filter.limit(limit);
        }
        filter
    }

    /// Relay-side matching semantics: every non-empty field must match, `since`
    /// is inclusive. `limit` is applied by the caller.
    pub fn matches(&self, event: &Event) -> bool {
        if !self.ids.is_empty() && !self.ids.contains(&event.id.to_hex()) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind.as_u16()) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.contains(&event.pubkey) {
            return false;
        }
        if !self.events.is_empty() && !tag_values(event, "e").any(|v| self.events.contains(&v)) {
            return false;
        }
        if !self.pubkeys.is_empty() {
            let wanted: Vec<String> = self.pubkeys.iter().map(|pk| pk.to_hex()).collect();
            if !tag_values(event, "p").any(|v| wanted.contains(&v)) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at.as_u64() < since {
                return false;
            }
        }
        true
    }
}

fn tag_values<'a>(event: &'a Event, name: &'a str) -> impl Iterator<Item = String> + 'a {
    event.tags.iter().filter_map(move |tag| {
        let parts = tag.as_slice();
        if parts.first().map(|s| s.as_str()) == Some(name) {
            parts.get(1).cloned()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{build_room_message, MessagePayload};
    use crate::{RoomKey, ROOM_INVITE_KIND, ROOM_MESSAGE_KIND};
    use nostr::Keys;

    fn room_message(at: u64) -> (Keys, Event) {
        let keys = Keys::generate();
        let key = RoomKey::generate("aa".repeat(32), 1);
        let event =
            build_room_message(&keys, &key, &MessagePayload::text("x"), Timestamp::from(at)).unwrap();
        (keys, event)
    }

    #[test]
    fn empty_query_matches_everything() {
        let (_, event) = room_message(1);
        assert!(RoomQuery::new().matches(&event));
    }

    #[test]
    fn matches_kind_room_and_since() {
        let (keys, event) = room_message(100);
        let room = "aa".repeat(32);

        let query = RoomQuery::new()
            .kinds([ROOM_MESSAGE_KIND])
            .events([room.clone()])
            .authors([keys.public_key()])
            .since(Some(100));
        assert!(query.matches(&event));

        assert!(!query.clone().since(Some(101)).matches(&event));
        assert!(!RoomQuery::new().kinds([ROOM_INVITE_KIND]).matches(&event));
        assert!(!RoomQuery::new().events(["bb".repeat(32)]).matches(&event));
    }

    #[test]
    fn matches_p_tags_and_ids() {
        let (keys, event) = room_message(1);
        assert!(!RoomQuery::new().pubkeys([keys.public_key()]).matches(&event));
        assert!(RoomQuery::new().ids([event.id.to_hex()]).matches(&event));
        assert!(!RoomQuery::new().ids(["00".repeat(32)]).matches(&event));
    }

    #[test]
    fn filter_carries_fields() {
        let pk = Keys::generate().public_key();
        let filter = RoomQuery::new()
            .kinds([ROOM_MESSAGE_KIND])
            .pubkeys([pk])
            .since(Some(42))
            .limit(10)
            .to_filter();
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json["kinds"], serde_json::json!([ROOM_MESSAGE_KIND]));
        assert_eq!(json["#p"], serde_json::json!([pk.to_hex()]));
        assert_eq!(json["since"], serde_json::json!(42));
        assert_eq!(json["limit"], serde_json::json!(10));
    }
}
