pub mod dm;
pub mod identity;
pub mod invite;
pub mod key;
pub mod message;
pub mod room;

use anyhow::{Context, Result};
use nostr::PublicKey;
use nostr_rooms::{
    FileStorageAdapter, LocalCache, RelayTransport, RoomClient, RoomClientOptions, RoomSync,
    StorageAdapter,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::nostr_client::SdkRelay;

pub(crate) fn cache_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("cache")
}

fn open_storage(data_dir: &Path) -> Result<Arc<dyn StorageAdapter>> {
    let storage = FileStorageAdapter::new(cache_dir(data_dir)).context("Failed to open cache")?;
    Ok(Arc::new(storage))
}

pub(crate) fn open_cache(data_dir: &Path) -> Result<LocalCache> {
    Ok(LocalCache::new(open_storage(data_dir)?))
}

/// Room client over the on-disk cache for the configured identity.
pub(crate) fn open_client(config: &Config, data_dir: &Path) -> Result<RoomClient> {
    let mut options = RoomClientOptions::new(config.keys()?);
    options.storage = Some(open_storage(data_dir)?);
    Ok(RoomClient::new(options)?)
}

pub(crate) fn room_sync<T: RelayTransport + 'static>(
    config: &Config,
    data_dir: &Path,
    transport: T,
) -> Result<RoomSync<T>> {
    Ok(RoomSync::new(
        open_client(config, data_dir)?,
        transport,
        config.poll_config(),
    ))
}

pub(crate) async fn connect(config: &Config, data_dir: &Path) -> Result<RoomSync<SdkRelay>> {
    let relay = SdkRelay::connect(config).await?;
    room_sync(config, data_dir, relay)
}

/// Accepts hex, npub or nostr: URIs.
pub(crate) fn parse_pubkey(value: &str) -> Result<PublicKey> {
    PublicKey::parse(value.trim()).with_context(|| format!("Invalid public key: {value}"))
}
