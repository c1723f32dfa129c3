use ulid::Ulid;

use crate::model::*;

use super::{Engine, SharedDaySchedule};

impl Engine {
    /// True iff a stored booking other than `exclude` overlaps `slot` in the
    /// given room/day. Unknown rooms and empty days are conflict-free.
    pub async fn has_conflict(
        &self,
        room_id: &str,
        date: &DateKey,
        slot: &TimeRange,
        exclude: Option<Ulid>,
    ) -> bool {
        let key = RoomDay {
            room_id: room_id.to_string(),
            date: date.clone(),
        };
        let Some(day) = self.day(&key) else {
            return false;
        };
        let guard = day.read().await;
        guard.overlapping(slot).any(|b| exclude != Some(b.id))
    }

    /// All bookings matching the optional filters. Unordered by contract;
    /// callers sort if they need an order.
    pub async fn list_bookings(
        &self,
        room_id: Option<&str>,
        date: Option<&DateKey>,
    ) -> Vec<Booking> {
        // Both filters pin one partition: a plain map lookup.
        if let (Some(room_id), Some(date)) = (room_id, date) {
            let key = RoomDay {
                room_id: room_id.to_string(),
                date: date.clone(),
            };
            let Some(day) = self.day(&key) else {
                return Vec::new();
            };
            return day.read().await.bookings.clone();
        }

        // Collect matching partitions first so no map shard guard is held
        // across an await.
        let days: Vec<SharedDaySchedule> = self
            .days
            .iter()
            .filter(|e| {
                room_id.is_none_or(|r| e.key().room_id == r)
                    && date.is_none_or(|d| e.key().date == *d)
            })
            .map(|e| e.value().clone())
            .collect();

        let mut out = Vec::new();
        for day in days {
            out.extend(day.read().await.bookings.iter().cloned());
        }
        out
    }
}
