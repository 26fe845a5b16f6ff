use anyhow::{Context, Result};
use nostr::Event;
use nostr_rooms::{Error as RoomError, RelayTransport, RoomQuery};
use nostr_sdk::Client;
use std::time::Duration;

use crate::config::Config;

/// [`RelayTransport`] over a connected nostr-sdk client.
pub struct SdkRelay {
    client: Client,
    fetch_timeout: Duration,
}

impl SdkRelay {
    pub async fn connect(config: &Config) -> Result<Self> {
        let client = Client::default();
        for relay in config.resolved_relays() {
            client
                .add_relay(relay.as_str())
                .await
                .with_context(|| format!("add relay {relay}"))?;
        }
        client.connect().await;
        Ok(Self {
            client,
            fetch_timeout: config.poll_config().fetch_timeout,
        })
    }

    pub async fn shutdown(&self) {
        self.client.shutdown().await;
    }
}

impl RelayTransport for SdkRelay {
    async fn fetch(&self, query: RoomQuery) -> nostr_rooms::Result<Vec<Event>> {
        let events = self
            .client
            .fetch_events(query.to_filter(), self.fetch_timeout)
            .await
            .map_err(|e| RoomError::Relay(e.to_string()))?;
        Ok(events.into_iter().collect())
    }

    async fn publish(&self, event: Event) -> nostr_rooms::Result<()> {
        match self.client.send_event(&event).await {
            Ok(output) if output.success.is_empty() && !should_ignore_publish_errors() => {
                let reasons: Vec<String> = output.failed.values().cloned().collect();
                Err(RoomError::Relay(format!(
                    "No relay accepted event {}: {reasons:?}",
                    event.id
                )))
            }
            Ok(_) => Ok(()),
            Err(_) if should_ignore_publish_errors() => Ok(()),
            Err(e) => Err(RoomError::Relay(e.to_string())),
        }
    }
}

pub(crate) fn should_ignore_publish_errors() -> bool {
    for key in ["NROOMS_IGNORE_PUBLISH_ERRORS", "NOSTR_IGNORE_PUBLISH_ERRORS"] {
        if let Ok(val) = std::env::var(key) {
            let val = val.trim().to_lowercase();
            return matches!(val.as_str(), "1" | "true" | "yes" | "on");
        }
    }
    false
}
