//! Relay-facing driver around [`RoomClient`].
//!
//! Every relay call is raced against the configured timeout. The client lock
//! is only taken to build queries and to ingest results, never across a relay
//! call.

use nostr::{Event, PublicKey};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::client::{IngestReport, RoomClient};
use crate::group_key::KeyScanReport;
use crate::message::MessagePayload;
use crate::poller::{spawn_poll, PollConfig, PollHandle};
use crate::room::RoomMetadata;
use crate::transport::{fetch_with_timeout, publish_with_timeout, RelayTransport};
use crate::{Result, RoomQuery};

const DM_CURSOR: &str = "dm";

#[derive(Debug, Clone)]
pub enum SyncUpdate {
    Inbox(IngestReport),
    Room { room_id: String, report: IngestReport },
}

pub struct RoomSync<T> {
    client: Arc<Mutex<RoomClient>>,
    transport: Arc<T>,
    config: PollConfig,
    inbox_since: Arc<Mutex<Option<u64>>>,
}

impl<T> Clone for RoomSync<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            transport: self.transport.clone(),
            config: self.config,
            inbox_since: self.inbox_since.clone(),
        }
    }
}

impl<T: RelayTransport + 'static> RoomSync<T> {
    pub fn new(client: RoomClient, transport: T, config: PollConfig) -> Self {
        Self {
            client: Arc::new(Mutex::new(client)),
            transport: Arc::new(transport),
            config,
            inbox_since: Arc::new(Mutex::new(None)),
        }
    }

    pub fn client(&self) -> Arc<Mutex<RoomClient>> {
        self.client.clone()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> PollConfig {
        self.config
    }

    pub async fn fetch(&self, query: RoomQuery) -> Result<Vec<Event>> {
        fetch_with_timeout(self.transport.as_ref(), query, self.config.fetch_timeout).await
    }

    async fn fetch_all(&self, queries: Vec<RoomQuery>) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        for query in queries {
            events.extend(self.fetch(query).await?);
        }
        Ok(events)
    }

    pub async fn publish_all(&self, events: Vec<Event>) -> Result<()> {
        for event in events {
            publish_with_timeout(self.transport.as_ref(), event, self.config.publish_timeout)
                .await?;
        }
        Ok(())
    }

    async fn ingest(&self, events: &[Event]) -> IngestReport {
        self.client.lock().await.ingest(events)
    }

    // === Polling ===

    /// Fetches room creations, invites, invite responses and keys tagged to us,
    /// then the creation events of rooms we were invited to.
    pub async fn poll_inbox(&self) -> Result<IngestReport> {
        let since = *self.inbox_since.lock().await;
        let query = self.client.lock().await.inbox_query(since);
        let events = self.fetch(query).await?;

        if let Some(newest) = events.iter().map(|e| e.created_at.as_u64()).max() {
            let mut cursor = self.inbox_since.lock().await;
            *cursor = Some(cursor.map_or(newest, |c| c.max(newest)));
        }
        let mut report = self.ingest(&events).await;

        // Invites wait for their room's creation event before they are checked.
        let query = {
            let client = self.client.lock().await;
            let invited = client.invited_rooms();
            (!invited.is_empty()).then(|| client.creation_query(&invited))
        };
        if let Some(query) = query {
            let creations = self.fetch(query).await?;
            report.merge(self.ingest(&creations).await);
        }
        Ok(report)
    }

    /// Fetches what changed in one room since the last poll, including our key
    /// distributions for it.
    pub async fn poll_room(&self, room_id: &str) -> Result<IngestReport> {
        let queries = {
            let client = self.client.lock().await;
            let mut queries = client.room_queries(room_id);
            queries.push(client.key_query(Some(room_id)));
            queries
        };
        let events = self.fetch_all(queries).await?;
        Ok(self.ingest(&events).await)
    }

    /// Loads the newest `limit` messages together with the room's state.
    pub async fn load_history(&self, room_id: &str, limit: usize) -> Result<IngestReport> {
        let queries = {
            let client = self.client.lock().await;
            let mut queries = client.membership_queries(room_id);
            queries.push(client.key_query(Some(room_id)));
            queries.push(client.history_query(room_id, limit));
            queries
        };
        let events = self.fetch_all(queries).await?;
        Ok(self.ingest(&events).await)
    }

    pub async fn refresh_keys(&self, room_id: Option<&str>, force: bool) -> Result<KeyScanReport> {
        let query = self.client.lock().await.key_query(room_id);
        let events = self.fetch(query).await?;
        Ok(self.client.lock().await.refresh_keys(&events, force))
    }

    /// Caches encrypted DMs addressed to us. Returns the number of new events.
    pub async fn sync_dms(&self) -> Result<usize> {
        let query = {
            let client = self.client.lock().await;
            let since = client.cache().get_cursor(DM_CURSOR)?;
            client.dm_query(since)
        };
        let events = self.fetch(query).await?;

        let mut client = self.client.lock().await;
        let report = client.ingest(&events);
        if let Some(newest) = events.iter().map(|e| e.created_at.as_u64()).max() {
            client.cache().put_cursor(DM_CURSOR, newest)?;
        }
        Ok(report.dms)
    }

    /// Polls the inbox every interval until the handle is stopped. Non-empty
    /// reports are sent to `updates`.
    pub fn watch_inbox(&self, updates: mpsc::UnboundedSender<SyncUpdate>) -> PollHandle {
        let sync = self.clone();
        spawn_poll("inbox", self.config.interval, move || {
            let sync = sync.clone();
            let updates = updates.clone();
            async move {
                let report = sync.poll_inbox().await?;
                if !report.is_empty() {
                    let _ = updates.send(SyncUpdate::Inbox(report));
                }
                Ok(())
            }
        })
    }

    pub fn watch_room(
        &self,
        room_id: impl Into<String>,
        updates: mpsc::UnboundedSender<SyncUpdate>,
    ) -> PollHandle {
        let room_id = room_id.into();
        let sync = self.clone();
        spawn_poll(format!("room:{room_id}"), self.config.interval, move || {
            let sync = sync.clone();
            let updates = updates.clone();
            let room_id = room_id.clone();
            async move {
                let report = sync.poll_room(&room_id).await?;
                if !report.is_empty() {
                    let _ = updates.send(SyncUpdate::Room { room_id, report });
                }
                Ok(())
            }
        })
    }

    // === Actions ===

    pub async fn create_room(
        &self,
        metadata: RoomMetadata,
        admins: &[PublicKey],
        members: &[PublicKey],
    ) -> Result<String> {
        let (room_id, events) = self
            .client
            .lock()
            .await
            .create_room(metadata, admins, members)?;
        self.publish_all(events).await?;
        Ok(room_id)
    }

    pub async fn invite(&self, room_id: &str, invitee: &PublicKey) -> Result<Event> {
        let event = self.client.lock().await.invite(room_id, invitee)?;
        self.publish_all(vec![event.clone()]).await?;
        Ok(event)
    }

    pub async fn accept_invite(&self, invite_id: &str) -> Result<Event> {
        let event = self.client.lock().await.accept_invite(invite_id)?;
        self.publish_all(vec![event.clone()]).await?;
        Ok(event)
    }

    pub async fn reject_invite(&self, invite_id: &str) -> Result<Event> {
        let event = self.client.lock().await.reject_invite(invite_id)?;
        self.publish_all(vec![event.clone()]).await?;
        Ok(event)
    }

    pub async fn leave_room(&self, room_id: &str) -> Result<Event> {
        let event = self.client.lock().await.leave_room(room_id)?;
        self.publish_all(vec![event.clone()]).await?;
        Ok(event)
    }

    pub async fn remove_member(&self, room_id: &str, target: &PublicKey) -> Result<Event> {
        let event = self.client.lock().await.remove_member(room_id, target)?;
        self.publish_all(vec![event.clone()]).await?;
        Ok(event)
    }

    pub async fn archive_room(&self, room_id: &str) -> Result<Event> {
        let event = self.client.lock().await.archive_room(room_id)?;
        self.publish_all(vec![event.clone()]).await?;
        Ok(event)
    }

    /// Returns the new key version.
    pub async fn rotate_key(&self, room_id: &str) -> Result<u32> {
        let events = self.client.lock().await.rotate_key(room_id)?;
        let version = events
            .first()
            .and_then(crate::utils::key_version_of)
            .unwrap_or_default();
        self.publish_all(events).await?;
        Ok(version)
    }

    /// Publishes a message. The pending copy stays in the feed when publishing
    /// fails.
    pub async fn send_message(&self, room_id: &str, payload: MessagePayload) -> Result<Event> {
        let event = self.client.lock().await.send_message(room_id, payload)?;
        self.publish_all(vec![event.clone()]).await?;
        Ok(event)
    }

    pub async fn persist(&self) -> Result<()> {
        self.client.lock().await.persist()
    }
}
