use anyhow::Result;
use nostr_rooms::{RelayTransport, RoomSync};
use serde::Serialize;

use crate::output::Output;

#[derive(Serialize)]
struct DmSync {
    new_events: usize,
    cached_total: usize,
}

/// Fetches encrypted DMs addressed to us and caches their ciphertext.
pub async fn sync_dms<T: RelayTransport + 'static>(sync: &RoomSync<T>, output: &Output) -> Result<()> {
    let new_events = sync.sync_dms().await?;
    let client = sync.client();
    let cached_total = client.lock().await.cache().dm_count()?;
    output.success(
        "dm.sync",
        DmSync {
            new_events,
            cached_total,
        },
    );
    Ok(())
}
