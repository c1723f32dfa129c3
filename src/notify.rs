use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, RoomDay};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for booking changes, one channel per (room, date).
/// Embedders subscribe to watch a day's schedule change as commits and
/// cancellations land.
pub struct NotifyHub {
    channels: DashMap<RoomDay, broadcast::Sender<Event>>,
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

    /// Subscribe to changes for one room/day. Creates the channel if needed.
    pub fn subscribe(&self, key: RoomDay) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a change notification. No-op if nobody is listening.
    pub fn send(&self, key: &RoomDay, event: &Event) {
        if let Some(sender) = self.channels.get(key) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a channel once a day is no longer interesting.
    pub fn remove(&self, key: &RoomDay) {
        self.channels.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DateKey;
    use ulid::Ulid;

    fn key() -> RoomDay {
        RoomDay {
            room_id: "tspi-east".into(),
            date: DateKey::parse("2024-06-03").unwrap(),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let k = key();
        let mut rx = hub.subscribe(k.clone());

        let event = Event::BookingCancelled {
            id: Ulid::new(),
            room_id: k.room_id.clone(),
            date: k.date.clone(),
        };
        hub.send(&k, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let k = key();
        hub.send(
            &k,
            &Event::BookingCancelled {
                id: Ulid::new(),
                room_id: k.room_id.clone(),
                date: k.date.clone(),
            },
        );
    }

    #[tokio::test]
    async fn removed_channel_stops_delivery() {
        let hub = NotifyHub::new();
        let k = key();
        let mut rx = hub.subscribe(k.clone());
        hub.remove(&k);
        hub.send(
            &k,
            &Event::BookingCancelled {
                id: Ulid::new(),
                room_id: k.room_id.clone(),
                date: k.date.clone(),
            },
        );
        // Sender dropped with the channel, so the receiver sees Closed.
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }
}
