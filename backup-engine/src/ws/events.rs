use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::services::versioning::LinkReport;
use crate::state::AppState;

const BROADCAST_CAPACITY: usize = 256;
const MAX_QUEUE_PER_BACKUP: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    BackupCompleted {
        backup_id: String,
        job_id: String,
        host_id: String,
        host_name: String,
        source_path: String,
        size: String,
        artifact: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        links: Option<LinkReport>,
        occurred_at: DateTime<Utc>,
    },
    BackupFailed {
        backup_id: String,
        job_id: String,
        host_id: String,
        host_name: String,
        source_path: String,
        error_message: String,
        occurred_at: DateTime<Utc>,
    },
    WorkerStatsUpdated {
        active: usize,
        queued: usize,
        capacity: usize,
    },
}

impl EngineEvent {
    pub fn backup_id(&self) -> Option<&str> {
        match self {
            EngineEvent::BackupCompleted { backup_id, .. }
            | EngineEvent::BackupFailed { backup_id, .. } => Some(backup_id),
            EngineEvent::WorkerStatsUpdated { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
struct QueuedEvent {
    event: EngineEvent,
    timestamp: i64,
}

/// Single outbound event stream, with a short per-backup history for late subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    queue: Arc<DashMap<String, VecDeque<QueuedEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            queue: Arc::new(DashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Never blocks; events published with no subscriber are only kept in the replay queue.
    pub fn publish(&self, event: EngineEvent) {
        if let Some(backup_id) = event.backup_id() {
            let mut entry = self.queue.entry(backup_id.to_string()).or_default();
            entry.push_back(QueuedEvent {
                event: event.clone(),
                timestamp: Utc::now().timestamp_millis(),
            });
            if entry.len() > MAX_QUEUE_PER_BACKUP {
                entry.pop_front();
            }
        }
        let _ = self.tx.send(event);
    }

    pub fn replay(&self, backup_id: &str, since: i64) -> Vec<EngineEvent> {
        self.queue
            .get(backup_id)
            .map(|q| {
                q.iter()
                    .filter(|m| m.timestamp > since)
                    .map(|m| m.event.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn forget(&self, backup_id: &str) {
        self.queue.remove(backup_id);
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    ReplayRequest {
        backup_id: String,
        #[serde(default)]
        since: i64,
    },
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.events.subscribe();
    let (replay_tx, mut replay_rx) = mpsc::unbounded_channel::<EngineEvent>();

    let send_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                recv = rx.recv() => match recv {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(event) = replay_rx.recv() => event,
            };
            let Ok(text) = serde_json::to_string(&event) else { continue };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Replays go to the requesting client only.
    let events = state.events.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let Message::Text(text) = msg else { continue };
            match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::ReplayRequest { backup_id, since }) => {
                    for event in events.replay(&backup_id, since) {
                        if replay_tx.send(event).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => tracing::debug!(error = %e, "Ignoring client message"),
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(backup_id: &str, n: usize) -> EngineEvent {
        EngineEvent::BackupFailed {
            backup_id: backup_id.into(),
            job_id: format!("job-{n}"),
            host_id: "h".into(),
            host_name: "web".into(),
            source_path: "/data".into(),
            error_message: "boom".into(),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn test_event_wire_shape() {
        let v = serde_json::to_value(failed("b1", 0)).unwrap();
        assert_eq!(v["type"], "backup_failed");
        assert_eq!(v["backup_id"], "b1");
        assert_eq!(v["error_message"], "boom");

        let stats = EngineEvent::WorkerStatsUpdated {
            active: 1,
            queued: 2,
            capacity: 4,
        };
        let v = serde_json::to_value(stats).unwrap();
        assert_eq!(v["type"], "worker_stats_updated");
        assert_eq!(v["queued"], 2);
        assert!(v.get("backup_id").is_none());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_and_replay_is_bounded() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for n in 0..(MAX_QUEUE_PER_BACKUP + 5) {
            bus.publish(failed("b1", n));
        }
        bus.publish(EngineEvent::WorkerStatsUpdated {
            active: 0,
            queued: 0,
            capacity: 4,
        });

        assert_eq!(rx.recv().await.unwrap().backup_id(), Some("b1"));
        let replay = bus.replay("b1", 0);
        assert_eq!(replay.len(), MAX_QUEUE_PER_BACKUP);
        match &replay[0] {
            EngineEvent::BackupFailed { job_id, .. } => assert_eq!(job_id, "job-5"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(bus.replay("other", 0).is_empty());

        bus.forget("b1");
        assert!(bus.replay("b1", 0).is_empty());
    }

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"replay_request","backup_id":"b1","since":5}"#).unwrap();
        let ClientMessage::ReplayRequest { backup_id, since } = msg;
        assert_eq!(backup_id, "b1");
        assert_eq!(since, 5);
    }
}
