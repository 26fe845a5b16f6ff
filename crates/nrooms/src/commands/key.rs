use anyhow::Result;
use nostr_rooms::{RelayTransport, RoomSync};
use serde::Serialize;

use super::room;
use crate::output::Output;

#[derive(Serialize)]
struct CachedKey {
    room_id: String,
    version: u32,
}

#[derive(Serialize)]
struct KeyRefresh {
    cached: Vec<CachedKey>,
    cache_hits: usize,
    skipped: usize,
    failed: usize,
}

#[derive(Serialize)]
struct KeyRotation {
    room_id: String,
    version: u32,
}

/// Re-fetches key distributions addressed to us. With `force`, keys already
/// cached are decrypted and written again.
pub async fn refresh<T: RelayTransport + 'static>(
    sync: &RoomSync<T>,
    room_id: Option<&str>,
    force: bool,
    output: &Output,
) -> Result<()> {
    if let Some(room_id) = room_id {
        room::refresh(sync, room_id).await?;
    }
    let report = sync.refresh_keys(room_id, force).await?;
    sync.persist().await?;

    output.success(
        "key.refresh",
        KeyRefresh {
            cached: report
                .cached
                .into_iter()
                .map(|(room_id, version)| CachedKey { room_id, version })
                .collect(),
            cache_hits: report.cache_hits,
            skipped: report.not_receiver + report.unauthorized,
            failed: report.failed,
        },
    );
    Ok(())
}

pub async fn rotate<T: RelayTransport + 'static>(
    sync: &RoomSync<T>,
    room_id: &str,
    output: &Output,
) -> Result<()> {
    room::refresh(sync, room_id).await?;
    let version = sync.rotate_key(room_id).await?;
    sync.persist().await?;
    output.success(
        "key.rotate",
        KeyRotation {
            room_id: room_id.to_string(),
            version,
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::TestUser;
    use nostr_rooms::MemoryRelay;

    #[tokio::test]
    async fn test_rotate_then_member_refreshes() {
        let relay = MemoryRelay::new();
        let alice = TestUser::new();
        let bob = TestUser::new();
        let output = Output::new(true);

        let sync = alice.sync(&relay);
        room::create(&sync, "r", None, &[], &[bob.keys.public_key().to_hex()], &output)
            .await
            .unwrap();
        let room_id = sync.client().lock().await.room_ids()[0].clone();
        rotate(&sync, &room_id, &output).await.unwrap();

        let bob_sync = bob.sync(&relay);
        refresh(&bob_sync, Some(&room_id), false, &output)
            .await
            .unwrap();
        let client = bob_sync.client();
        let versions = client.lock().await.cache().room_key_versions(&room_id).unwrap();
        assert_eq!(versions, vec![1, 2]);

        // Forcing a refresh rewrites keys that are already cached.
        let report = bob_sync.refresh_keys(Some(&room_id), true).await.unwrap();
        assert_eq!(report.cached.len(), 2);
        assert_eq!(report.cache_hits, 0);
    }
}
