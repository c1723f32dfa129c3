use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_self_conflict, check_slot_free, now_ms, validate_request};
use super::{Engine, EngineError, SharedDaySchedule, WalCommand};

impl Engine {
    /// All-or-nothing commit of one batch of candidate slots for one room/day.
    ///
    /// The partition write lock is held across validation, the WAL append,
    /// and the in-memory apply, so two racing commits on the same (room,
    /// date) serialize and at most one can win a contested slot. The batch
    /// travels as a single WAL record; on any failure nothing is persisted.
    pub async fn commit_bookings(
        &self,
        room_id: &str,
        date: DateKey,
        requester: Requester,
        meeting_title: String,
        notes: Option<String>,
        slots: Vec<TimeRange>,
    ) -> Result<Vec<Booking>, EngineError> {
        if slots.is_empty() {
            return Err(EngineError::EmptyRequest);
        }
        if slots.len() > MAX_SLOTS_PER_REQUEST {
            return Err(EngineError::LimitExceeded("too many slots in one request"));
        }
        validate_request(room_id, &requester, &meeting_title, notes.as_deref())?;
        check_no_self_conflict(&slots)?;

        let day = self.day_or_create(room_id, &date);
        let mut guard = day.write().await;
        if guard.bookings.len() + slots.len() > MAX_BOOKINGS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many bookings on this day"));
        }
        for slot in &slots {
            check_slot_free(&guard, slot, None)?;
        }

        let created_at = now_ms();
        let bookings: Vec<Booking> = slots
            .into_iter()
            .map(|slot| Booking {
                id: Ulid::new(),
                room_id: room_id.to_string(),
                date: date.clone(),
                slot,
                requester: requester.clone(),
                meeting_title: meeting_title.clone(),
                notes: notes.clone(),
                created_at,
            })
            .collect();

        let event = Event::BookingsCommitted {
            bookings: bookings.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(bookings)
    }

    /// Permanent removal. A missing id is `NotFound`, including the second
    /// of two cancels; the end state is identical either way.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<(), EngineError> {
        let key = self
            .booking_days
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let day = self.day(&key).ok_or(EngineError::NotFound(id))?;
        let mut guard = day.write().await;
        // The index lookup raced another cancel if the booking is gone now.
        if !guard.bookings.iter().any(|b| b.id == id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::BookingCancelled {
            id,
            room_id: key.room_id.clone(),
            date: key.date.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Rewrite the WAL with one record per live (room, date); the churn
    /// from cancelled bookings drops out.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let days: Vec<SharedDaySchedule> =
            self.days.iter().map(|e| e.value().clone()).collect();

        let mut events = Vec::new();
        for day in days {
            let guard = day.read().await;
            if !guard.bookings.is_empty() {
                events.push(Event::BookingsCommitted {
                    bookings: guard.bookings.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
