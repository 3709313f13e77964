use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{LedgerEvent, RoomKey};

#[allow(dead_code)]
const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for per-room reservation events. The (external) route layer
/// subscribes here to push live availability updates to clients.
pub struct NotifyHub {
    channels: DashMap<RoomKey, broadcast::Sender<LedgerEvent>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a room. Creates the channel if needed.
    pub fn subscribe(&self, room: &RoomKey) -> broadcast::Receiver<LedgerEvent> {
        let sender = self
            .channels
            .entry(room.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, room: &RoomKey, event: &LedgerEvent) {
        if let Some(sender) = self.channels.get(room) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (e.g. when the room is deleted).
    pub fn remove(&self, room: &RoomKey) {
        self.channels.remove(room);
    }
}
