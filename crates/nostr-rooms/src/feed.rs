use std::collections::{BTreeMap, HashMap};

use crate::message::{decrypt_room_message, DisplayMessage, MessageBody, RoomMessage};
use crate::utils::EventCursor;
use crate::RoomKey;

/// Ordered, deduplicated message list of one room.
#[derive(Debug, Clone)]
pub struct RoomFeed {
    room_id: String,
    messages: BTreeMap<EventCursor, DisplayMessage>,
    by_id: HashMap<String, EventCursor>,
    /// Ciphertext of messages that failed to decrypt, kept for retry.
    undecrypted: HashMap<String, RoomMessage>,
    since: Option<u64>,
}

impl RoomFeed {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            messages: BTreeMap::new(),
            by_id: HashMap::new(),
            undecrypted: HashMap::new(),
            since: None,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Timestamp to request the next fetch from: the newest relay-confirmed message.
    pub fn since(&self) -> Option<u64> {
        self.since
    }

    pub fn restore_since(&mut self, since: u64) {
        self.since = Some(self.since.map_or(since, |s| s.max(since)));
    }

    /// Decrypts and merges a fetched message. Returns true when the feed changed.
    pub fn ingest<F>(&mut self, message: &RoomMessage, lookup: F) -> bool
    where
        F: Fn(&str, u32) -> Option<RoomKey>,
    {
        if message.room_id != self.room_id {
            return false;
        }
        self.restore_since(message.created_at);

        if let Some(existing) = self.get(&message.id) {
            if !existing.pending && !existing.decrypt_failed() {
                return false;
            }
        }

        let display = decrypt_room_message(message, lookup);
        if display.decrypt_failed() {
            self.undecrypted.insert(message.id.clone(), message.clone());
        } else {
            self.undecrypted.remove(&message.id);
        }
        self.upsert(display)
    }

    /// Adds a locally sent message before the relay echoes it back.
    pub fn insert_pending(&mut self, mut message: DisplayMessage) -> bool {
        if message.room_id != self.room_id || self.by_id.contains_key(&message.id) {
            return false;
        }
        message.pending = true;
        self.upsert(message)
    }

    fn upsert(&mut self, message: DisplayMessage) -> bool {
        match self.by_id.get(&message.id) {
            Some(cursor) => {
                let Some(existing) = self.messages.get_mut(cursor) else {
                    return false;
                };
                let confirms = existing.pending && !message.pending;
                let upgrades = existing.decrypt_failed() && !message.decrypt_failed();
                if !confirms && !upgrades {
                    return false;
                }
                // A relay copy of our own message keeps the locally decrypted body.
                if confirms && message.decrypt_failed() {
                    existing.pending = false;
                } else {
                    *existing = message;
                }
                true
            }
            None => {
                let cursor = message.cursor();
                self.by_id.insert(message.id.clone(), cursor.clone());
                self.messages.insert(cursor, message);
                true
            }
        }
    }

    /// Re-attempts decryption of failed messages, e.g. after new keys arrived.
    /// Returns the number of messages that now decrypt.
    pub fn retry_failed<F>(&mut self, lookup: F) -> usize
    where
        F: Fn(&str, u32) -> Option<RoomKey>,
    {
        let pending: Vec<RoomMessage> = self.undecrypted.values().cloned().collect();
        let mut recovered = 0;
        for message in pending {
            let display = decrypt_room_message(&message, &lookup);
            if let MessageBody::Decrypted(_) = display.body {
                self.undecrypted.remove(&message.id);
                if self.upsert(display) {
                    recovered += 1;
                }
            }
        }
        recovered
    }

    pub fn get(&self, id: &str) -> Option<&DisplayMessage> {
        self.by_id.get(id).and_then(|cursor| self.messages.get(cursor))
    }

    /// Messages in display order, oldest first.
    pub fn messages(&self) -> impl Iterator<Item = &DisplayMessage> {
        self.messages.values()
    }

    /// The newest `limit` messages, oldest first.
    pub fn latest(&self, limit: usize) -> Vec<&DisplayMessage> {
        let skip = self.messages.len().saturating_sub(limit);
        self.messages.values().skip(skip).collect()
    }

    pub fn undecrypted_count(&self) -> usize {
        self.undecrypted.len()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{build_room_message, MessagePayload};
    use nostr::{Keys, Timestamp};

    fn message(keys: &Keys, key: &RoomKey, text: &str, at: u64) -> RoomMessage {
        let event =
            build_room_message(keys, key, &MessagePayload::text(text), Timestamp::from(at)).unwrap();
        RoomMessage::from_event(&event).unwrap()
    }

    fn with(key: &RoomKey) -> impl Fn(&str, u32) -> Option<RoomKey> + '_ {
        move |_, version| (version == key.version).then(|| key.clone())
    }

    fn none(_: &str, _: u32) -> Option<RoomKey> {
        None
    }

    fn texts(feed: &RoomFeed) -> Vec<String> {
        feed.messages().map(|m| m.text().to_string()).collect()
    }

    #[test]
    fn display_order_and_dedup() {
        let alice = Keys::generate();
        let key = RoomKey::generate("room", 1);
        let mut feed = RoomFeed::new("room");
        let second = message(&alice, &key, "second", 20);
        let first = message(&alice, &key, "first", 10);

        assert!(feed.ingest(&second, with(&key)));
        assert!(feed.ingest(&first, with(&key)));
        assert!(!feed.ingest(&first, with(&key)));

        assert_eq!(texts(&feed), vec!["first", "second"]);
        assert_eq!(feed.since(), Some(20));
    }

    #[test]
    fn same_timestamp_orders_by_id() {
        let alice = Keys::generate();
        let key = RoomKey::generate("room", 1);
        let mut feed = RoomFeed::new("room");
        let a = message(&alice, &key, "a", 10);
        let b = message(&alice, &key, "b", 10);
        feed.ingest(&a, with(&key));
        feed.ingest(&b, with(&key));

        let ids: Vec<&str> = feed.messages().map(|m| m.id.as_str()).collect();
        let mut expected = vec![a.id.as_str(), b.id.as_str()];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[test]
    fn pending_copy_is_confirmed_by_relay_copy() {
        let alice = Keys::generate();
        let key = RoomKey::generate("room", 1);
        let mut feed = RoomFeed::new("room");
        let sent = message(&alice, &key, "hello", 10);

        let local = decrypt_room_message(&sent, with(&key));
        assert!(feed.insert_pending(local));
        assert!(feed.get(&sent.id).unwrap().pending);
        assert_eq!(feed.since(), None);

        assert!(feed.ingest(&sent, with(&key)));
        assert_eq!(feed.len(), 1);
        assert!(!feed.get(&sent.id).unwrap().pending);
        assert_eq!(feed.since(), Some(10));
    }

    #[test]
    fn failed_message_recovers_when_key_arrives() {
        let alice = Keys::generate();
        let key = RoomKey::generate("room", 1);
        let mut feed = RoomFeed::new("room");
        let msg = message(&alice, &key, "later", 10);

        assert!(feed.ingest(&msg, none));
        assert!(feed.get(&msg.id).unwrap().decrypt_failed());
        assert_eq!(feed.undecrypted_count(), 1);

        assert_eq!(feed.retry_failed(with(&key)), 1);
        assert_eq!(texts(&feed), vec!["later"]);
        assert_eq!(feed.undecrypted_count(), 0);
    }

    #[test]
    fn other_rooms_are_ignored() {
        let alice = Keys::generate();
        let key = RoomKey::generate("elsewhere", 1);
        let mut feed = RoomFeed::new("room");
        assert!(!feed.ingest(&message(&alice, &key, "x", 1), with(&key)));
        assert!(feed.is_empty());
    }

    #[test]
    fn latest_returns_tail() {
        let alice = Keys::generate();
        let key = RoomKey::generate("room", 1);
        let mut feed = RoomFeed::new("room");
        for (i, text) in ["a", "b", "c"].iter().enumerate() {
            feed.ingest(&message(&alice, &key, text, i as u64), with(&key));
        }
        let tail = feed.latest(2);
        let tail: Vec<&str> = tail.iter().map(|m| m.text()).collect();
        assert_eq!(tail, vec!["b", "c"]);
        assert_eq!(feed.latest(10).len(), 3);
    }
}
