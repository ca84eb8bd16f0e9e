use std::collections::HashMap;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::services::presentation::PresentationEvent;

pub type OverlayClientId = Uuid;

/// Frames queued per display before it is considered stalled and dropped.
pub const OVERLAY_QUEUE_CAPACITY: usize = 64;

/// Fan-out of presentation events to connected overlay displays.
///
/// Each display registers a bounded channel; the socket task owns the
/// receiving half and forwards frames to the browser. A display whose queue
/// fills up is dropped, which closes its socket. Nothing is buffered for
/// displays that connect later.
#[derive(Debug, Default)]
pub struct OverlayBroadcaster {
    clients: RwLock<HashMap<OverlayClientId, mpsc::Sender<String>>>,
}

impl OverlayBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self) -> (OverlayClientId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OVERLAY_QUEUE_CAPACITY);
        let id = Uuid::new_v4();
        let count = {
            let mut clients = self.clients.write().await;
            clients.insert(id, tx);
            clients.len()
        };
        tracing::info!("Overlay client {} connected ({} open)", id, count);
        (id, rx)
    }

    pub async fn unregister(&self, id: OverlayClientId) {
        let mut clients = self.clients.write().await;
        if clients.remove(&id).is_some() {
            tracing::info!("Overlay client {} disconnected ({} open)", id, clients.len());
        }
    }

    /// Deliver `event` to every open display. Returns whether at least one received it.
    pub async fn broadcast(&self, event: &PresentationEvent) -> bool {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Failed to serialize presentation event: {}", e);
                return false;
            }
        };

        let mut delivered = 0usize;
        let mut dead = Vec::new();
        {
            let clients = self.clients.read().await;
            for (id, tx) in clients.iter() {
                match tx.try_send(payload.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!("Overlay client {} is not keeping up, dropping it", id);
                        dead.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        tracing::warn!("Overlay client {} is gone, skipping", id);
                        dead.push(*id);
                    }
                }
            }
        }

        if !dead.is_empty() {
            let mut clients = self.clients.write().await;
            for id in dead {
                clients.remove(&id);
            }
        }

        tracing::debug!("Broadcast presentation event to {} overlay client(s)", delivered);
        delivered > 0
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }
}
