use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nostr::{Event, Keys, PublicKey};
use nostr_rooms::{
    build_leave, Clock, FileStorageAdapter, MemoryRelay, MessagePayload, PollConfig,
    RelayTransport, Role, RoomClient, RoomClientOptions, RoomMetadata, RoomQuery, RoomSync,
    StorageAdapter,
};
use tempfile::TempDir;

fn clock_from(start: u64) -> Clock {
    let tick = AtomicU64::new(start);
    Arc::new(move || tick.fetch_add(1, Ordering::SeqCst))
}

fn client_with(keys: &Keys, storage: Option<Arc<dyn StorageAdapter>>, clock: &Clock) -> RoomClient {
    RoomClient::new(RoomClientOptions {
        keys: keys.clone(),
        storage,
        clock: Some(clock.clone()),
    })
    .unwrap()
}

fn member_keys(client: &RoomClient, room_id: &str) -> Vec<(PublicKey, Role)> {
    client
        .members(room_id)
        .unwrap()
        .into_iter()
        .map(|m| (m.pubkey, m.role))
        .collect()
}

/// Builds a room with a few joins and leaves and returns (owner, room id, every event).
fn busy_room(clock: &Clock) -> (Keys, String, Vec<Event>) {
    let owner = Keys::generate();
    let admin = Keys::generate();
    let guests: Vec<Keys> = (0..3).map(|_| Keys::generate()).collect();

    let mut owner_client = client_with(&owner, None, clock);
    let (room_id, mut events) = owner_client
        .create_room(RoomMetadata::new("busy"), &[admin.public_key()], &[])
        .unwrap();

    for guest in &guests {
        let invite = owner_client.invite(&room_id, &guest.public_key()).unwrap();
        let mut guest_client = client_with(guest, None, clock);
        guest_client.ingest(&[events[0].clone(), invite.clone()]);
        let accept = guest_client.accept_invite(&invite.id.to_hex()).unwrap();
        events.push(invite);
        events.push(accept);
    }

    let ts = nostr::Timestamp::from((clock)());
    events.push(build_leave(&guests[0], &room_id, &guests[0].public_key(), None, ts).unwrap());
    let ts = nostr::Timestamp::from((clock)());
    events.push(build_leave(&admin, &room_id, &guests[1].public_key(), Some("spam"), ts).unwrap());
    (owner, room_id, events)
}

#[test]
fn snapshot_restore_matches_full_replay() {
    let clock = clock_from(1_700_000_000);
    let (owner, room_id, events) = busy_room(&clock);
    let (early, late) = events.split_at(events.len() - 3);

    let dir = TempDir::new().unwrap();
    let storage: Arc<dyn StorageAdapter> =
        Arc::new(FileStorageAdapter::new(dir.path().to_path_buf()).unwrap());

    {
        let mut client = client_with(&owner, Some(storage.clone()), &clock);
        client.ingest(early);
        client.persist().unwrap();
    }

    let mut restored = client_with(&owner, Some(storage), &clock);
    // Replaying events the snapshot already covers must not change anything.
    restored.ingest(early);
    restored.ingest(late);

    let mut replayed = client_with(&owner, None, &clock);
    replayed.ingest(&events);

    assert_eq!(member_keys(&restored, &room_id), member_keys(&replayed, &room_id));
    assert_eq!(member_keys(&replayed, &room_id).len(), 3);
}

#[test]
fn arrival_order_does_not_change_membership() {
    let clock = clock_from(1_700_000_000);
    let (owner, room_id, events) = busy_room(&clock);

    let mut in_order = client_with(&owner, None, &clock);
    in_order.ingest(&events);

    let mut one_by_one_reversed = client_with(&owner, None, &clock);
    for event in events.iter().rev() {
        one_by_one_reversed.ingest(std::slice::from_ref(event));
    }

    let expected = member_keys(&in_order, &room_id);
    assert_eq!(member_keys(&one_by_one_reversed, &room_id), expected);
    assert_eq!(one_by_one_reversed.pending_count(), 0);
}

#[tokio::test]
async fn file_storage_survives_restart() {
    let dir = TempDir::new().unwrap();
    let keys = Keys::generate();
    let relay = MemoryRelay::new();
    let clock = clock_from(1_700_000_000);
    let storage = || -> Arc<dyn StorageAdapter> {
        Arc::new(FileStorageAdapter::new(dir.path().to_path_buf()).unwrap())
    };

    let room_id = {
        let sync = RoomSync::new(
            client_with(&keys, Some(storage()), &clock),
            relay.clone(),
            PollConfig::default(),
        );
        let room_id = sync
            .create_room(RoomMetadata::new("kept"), &[], &[])
            .await
            .unwrap();
        sync.send_message(&room_id, MessagePayload::text("persisted"))
            .await
            .unwrap();
        sync.poll_room(&room_id).await.unwrap();
        sync.persist().await.unwrap();
        room_id
    };

    let sync = RoomSync::new(
        client_with(&keys, Some(storage()), &clock),
        relay.clone(),
        PollConfig::default(),
    );
    {
        let client = sync.client();
        let client = client.lock().await;
        let room = client.room(&room_id).unwrap();
        assert_eq!(room.name, "kept");
        assert_eq!(member_keys(&client, &room_id), vec![(keys.public_key(), Role::Owner)]);
        assert!(client.cache().latest_room_key(&room_id).unwrap().is_some());
    }

    sync.load_history(&room_id, 20).await.unwrap();
    let client = sync.client();
    let client = client.lock().await;
    let messages = client.messages(&room_id).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].text(), "persisted");
}

#[tokio::test(start_paused = true)]
async fn stopped_watcher_stops_fetching() {
    let relay = MemoryRelay::new();
    let keys = Keys::generate();
    let clock = clock_from(1_700_000_000);
    let sync = RoomSync::new(
        client_with(&keys, None, &clock),
        relay.clone(),
        PollConfig {
            interval: Duration::from_secs(10),
            ..PollConfig::default()
        },
    );

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let handle = sync.watch_inbox(tx);
    tokio::time::sleep(Duration::from_secs(35)).await;
    let fetched = relay.fetch_count();
    assert_eq!(fetched, 4);

    handle.stop().await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(relay.fetch_count(), fetched);
}

#[tokio::test]
async fn strangers_find_rooms_only_by_id() {
    let relay = MemoryRelay::new();
    let clock = clock_from(1_700_000_000);
    let owner = Keys::generate();
    let mut client = client_with(&owner, None, &clock);
    let (room_id, events) = client.create_room(RoomMetadata::new("q"), &[], &[]).unwrap();
    for event in events {
        relay.publish(event).await.unwrap();
    }

    let stranger = client_with(&Keys::generate(), None, &clock);
    let inbox = relay
        .fetch(stranger.inbox_query(None))
        .await
        .unwrap();
    assert!(inbox.is_empty());

    let creation = relay
        .fetch(RoomQuery::new().ids([room_id.clone()]))
        .await
        .unwrap();
    assert_eq!(creation.len(), 1);
}
