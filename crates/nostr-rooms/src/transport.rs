use nostr::Event;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{Error, Result, RoomQuery};

/// Where room events are fetched from and published to.
pub trait RelayTransport: Send + Sync {
    fn fetch(&self, query: RoomQuery) -> impl Future<Output = Result<Vec<Event>>> + Send;

    fn publish(&self, event: Event) -> impl Future<Output = Result<()>> + Send;
}

pub async fn fetch_with_timeout<T: RelayTransport>(
    transport: &T,
    query: RoomQuery,
    timeout: Duration,
) -> Result<Vec<Event>> {
    tokio::time::timeout(timeout, transport.fetch(query))
        .await
        .map_err(|_| Error::Timeout(timeout))?
}

pub async fn publish_with_timeout<T: RelayTransport>(
    transport: &T,
    event: Event,
    timeout: Duration,
) -> Result<()> {
    tokio::time::timeout(timeout, transport.publish(event))
        .await
        .map_err(|_| Error::Timeout(timeout))?
}

/// In-process relay. Stores verified events and answers queries with relay
/// semantics (newest first, then `limit`). Clones share the same store.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    events: Arc<Mutex<Vec<Event>>>,
    fetches: Arc<AtomicUsize>,
    offline: Arc<AtomicBool>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Event>>> {
        self.events
            .lock()
            .map_err(|_| Error::Relay("Memory relay lock poisoned".to_string()))
    }

    /// Number of fetch calls served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// While offline every call fails with `Error::Relay`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.lock().map(|events| events.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn query(&self, query: &RoomQuery) -> Result<Vec<Event>> {
        let events = self.lock()?;
        let mut matched: Vec<Event> = events.iter().filter(|e| query.matches(e)).cloned().collect();
        matched.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    pub fn insert(&self, event: Event) -> Result<bool> {
        event
            .verify()
            .map_err(|e| Error::Relay(format!("Rejected event {}: {e}", event.id)))?;
        let mut events = self.lock()?;
        if events.iter().any(|e| e.id == event.id) {
            return Ok(false);
        }
        events.push(event);
        Ok(true)
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Relay("Memory relay is offline".to_string()));
        }
        Ok(())
    }
}

impl RelayTransport for MemoryRelay {
    async fn fetch(&self, query: RoomQuery) -> Result<Vec<Event>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        self.query(&query)
    }

    async fn publish(&self, event: Event) -> Result<()> {
        self.check_online()?;
        self.insert(event).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::sign;
    use nostr::{EventBuilder, Keys, Kind, Timestamp};

    fn note(keys: &Keys, at: u64) -> Event {
        sign(
            EventBuilder::new(Kind::from(4463u16), format!("n{at}"))
                .custom_created_at(Timestamp::from(at)),
            keys,
        )
        .unwrap()
    }

    struct SlowRelay;

    impl RelayTransport for SlowRelay {
        async fn fetch(&self, _query: RoomQuery) -> Result<Vec<Event>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }

        async fn publish(&self, _event: Event) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn memory_relay_dedups_and_limits() {
        let relay = MemoryRelay::new();
        let keys = Keys::generate();
        let old = note(&keys, 1);
        let new = note(&keys, 2);

        relay.publish(old.clone()).await.unwrap();
        relay.publish(old.clone()).await.unwrap();
        relay.publish(new.clone()).await.unwrap();
        assert_eq!(relay.len(), 2);

        let latest = relay.fetch(RoomQuery::new().limit(1)).await.unwrap();
        assert_eq!(latest, vec![new]);
        assert_eq!(relay.fetch_count(), 1);
    }

    #[tokio::test]
    async fn memory_relay_rejects_tampered_events() {
        let relay = MemoryRelay::new();
        let mut event = note(&Keys::generate(), 1);
        event.content = "tampered".to_string();
        assert!(relay.publish(event).await.is_err());
        assert!(relay.is_empty());
    }

    #[tokio::test]
    async fn offline_relay_errors() {
        let relay = MemoryRelay::new();
        relay.set_offline(true);
        assert!(matches!(
            relay.fetch(RoomQuery::new()).await,
            Err(Error::Relay(_))
        ));
        relay.set_offline(false);
        assert!(relay.fetch(RoomQuery::new()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_times_out() {
        let timeout = Duration::from_secs(10);
        let result = fetch_with_timeout(&SlowRelay, RoomQuery::new(), timeout).await;
        assert!(matches!(result, Err(Error::Timeout(t)) if t == timeout));

        let event = note(&Keys::generate(), 1);
        let result = publish_with_timeout(&SlowRelay, event, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
