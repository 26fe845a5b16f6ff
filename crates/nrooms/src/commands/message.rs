use anyhow::Result;
use nostr::PublicKey;
use nostr_rooms::{
    DisplayMessage, IngestReport, MessagePayload, MessageType, PollRegistry, RelayTransport,
    RoomSync, SyncUpdate,
};
use serde::Serialize;
use std::future::Future;
use tokio::sync::mpsc;

use super::room;
use crate::output::Output;

#[derive(Serialize)]
struct MessageInfo {
    id: String,
    room_id: String,
    sender_pubkey: String,
    content: String,
    #[serde(rename = "type")]
    message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    key_version: Option<u32>,
    timestamp: u64,
    is_outgoing: bool,
    decrypt_failed: bool,
    pending: bool,
}

impl MessageInfo {
    fn new(message: &DisplayMessage, me: &PublicKey) -> Self {
        MessageInfo {
            id: message.id.clone(),
            room_id: message.room_id.clone(),
            sender_pubkey: message.sender.to_hex(),
            content: message.text().to_string(),
            message_type: message.message_type(),
            key_version: message.key_version,
            timestamp: message.created_at,
            is_outgoing: message.sender == *me,
            decrypt_failed: message.decrypt_failed(),
            pending: message.pending,
        }
    }
}

#[derive(Serialize)]
struct MessageList {
    room_id: String,
    messages: Vec<MessageInfo>,
}

#[derive(Serialize)]
struct RoomEvent {
    room_id: String,
}

#[derive(Serialize)]
struct InviteEvent {
    invite_id: String,
}

#[derive(Serialize)]
struct Listening {
    rooms: Vec<String>,
}

pub async fn send<T: RelayTransport + 'static>(
    sync: &RoomSync<T>,
    room_id: &str,
    text: &str,
    output: &Output,
) -> Result<()> {
    room::refresh(sync, room_id).await?;
    let event = sync
        .send_message(room_id, MessagePayload::text(text))
        .await?;
    sync.persist().await?;

    let client = sync.client();
    let client = client.lock().await;
    let me = client.public_key();
    let sent = client
        .feed(room_id)
        .and_then(|feed| feed.get(&event.id.to_hex()))
        .map(|message| MessageInfo::new(message, &me));
    output.success("send", sent);
    Ok(())
}

/// Loads the newest `limit` messages from relays and prints them oldest first.
pub async fn read<T: RelayTransport + 'static>(
    sync: &RoomSync<T>,
    room_id: &str,
    limit: usize,
    output: &Output,
) -> Result<()> {
    sync.load_history(room_id, limit).await?;
    sync.persist().await?;

    let client = sync.client();
    let client = client.lock().await;
    let me = client.public_key();
    let messages: Vec<MessageInfo> = client
        .feed(room_id)
        .map(|feed| {
            feed.latest(limit)
                .into_iter()
                .map(|message| MessageInfo::new(message, &me))
                .collect()
        })
        .unwrap_or_default();

    output.success(
        "read",
        MessageList {
            room_id: room_id.to_string(),
            messages,
        },
    );
    Ok(())
}

/// Polls the inbox and rooms until Ctrl-C, printing new invites and messages.
pub async fn listen<T: RelayTransport + 'static>(
    sync: &RoomSync<T>,
    room_id: Option<&str>,
    output: &Output,
) -> Result<()> {
    listen_until(sync, room_id, output, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

pub(crate) async fn listen_until<T, S>(
    sync: &RoomSync<T>,
    room_id: Option<&str>,
    output: &Output,
    shutdown: S,
) -> Result<()>
where
    T: RelayTransport + 'static,
    S: Future<Output = ()>,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut registry = PollRegistry::new();

    let rooms = match room_id {
        Some(room_id) => vec![room_id.to_string()],
        None => sync.client().lock().await.room_ids(),
    };
    registry.insert(sync.watch_inbox(tx.clone())).await;
    for room in &rooms {
        registry.insert(sync.watch_room(room.clone(), tx.clone())).await;
    }
    output.event("listening", Listening { rooms });

    let me = sync.client().lock().await.public_key();
    tokio::pin!(shutdown);

    loop {
        let update = tokio::select! {
            _ = &mut shutdown => break,
            update = rx.recv() => match update {
                Some(update) => update,
                None => break,
            },
        };

        let report = match update {
            SyncUpdate::Inbox(report) => {
                for room in &report.new_rooms {
                    output.event("room", RoomEvent { room_id: room.clone() });
                    if room_id.is_none() {
                        registry.insert(sync.watch_room(room.clone(), tx.clone())).await;
                    }
                }
                for invite_id in &report.invites {
                    output.event(
                        "invite",
                        InviteEvent {
                            invite_id: invite_id.clone(),
                        },
                    );
                }
                report
            }
            SyncUpdate::Room { report, .. } => report,
        };
        print_report(&report, &me, output);

        if let Err(e) = sync.persist().await {
            tracing::warn!(error = %e, "failed to persist room state");
        }
    }

    registry.stop_all().await;
    sync.persist().await?;
    Ok(())
}

fn print_report(report: &IngestReport, me: &PublicKey, output: &Output) {
    for room in &report.archived {
        output.event("archived", RoomEvent { room_id: room.clone() });
    }
    for message in &report.messages {
        if message.sender == *me {
            continue;
        }
        output.event("message", MessageInfo::new(message, me));
    }
}
