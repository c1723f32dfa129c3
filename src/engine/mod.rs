mod conflict;
mod error;
mod mutations;
mod queries;

pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedDaySchedule = Arc<RwLock<DaySchedule>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush the current batch first, then handle the
                            // non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The booking store and conflict resolver.
///
/// Every (room, date) partition lives behind its own `RwLock`; commit and
/// cancel hold the partition write lock across check + WAL append + apply,
/// which is what makes racing commits on one partition serialize.
pub struct Engine {
    pub(super) days: DashMap<RoomDay, SharedDaySchedule>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → owning (room, date).
    pub(super) booking_days: DashMap<Ulid, RoomDay>,
}

/// Apply an event directly to a DaySchedule (no locking — caller holds the lock).
fn apply_to_day(day: &mut DaySchedule, event: &Event, index: &DashMap<Ulid, RoomDay>) {
    match event {
        Event::BookingsCommitted { bookings } => {
            for booking in bookings {
                index.insert(booking.id, booking.room_day());
                day.insert_booking(booking.clone());
            }
        }
        Event::BookingCancelled { id, .. } => {
            day.remove_booking(*id);
            index.remove(id);
        }
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            days: DashMap::new(),
            wal_tx,
            notify,
            booking_days: DashMap::new(),
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never use blocking_write here because this may
        // run inside an async context (e.g. lazy tenant creation).
        for event in &events {
            match event {
                Event::BookingsCommitted { bookings } => {
                    let Some(first) = bookings.first() else { continue };
                    let day = engine.day_or_create(&first.room_id, &first.date);
                    let mut guard = day.try_write().expect("replay: uncontended write");
                    apply_to_day(&mut guard, event, &engine.booking_days);
                }
                Event::BookingCancelled { room_id, date, .. } => {
                    let key = RoomDay {
                        room_id: room_id.clone(),
                        date: date.clone(),
                    };
                    if let Some(day) = engine.day(&key) {
                        let mut guard = day.try_write().expect("replay: uncontended write");
                        apply_to_day(&mut guard, event, &engine.booking_days);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write an event to the WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn day(&self, key: &RoomDay) -> Option<SharedDaySchedule> {
        self.days.get(key).map(|e| e.value().clone())
    }

    /// Partitions spring into existence on first use. Room ids are opaque
    /// here; catalog validation belongs to the caller.
    pub(super) fn day_or_create(&self, room_id: &str, date: &DateKey) -> SharedDaySchedule {
        let key = RoomDay {
            room_id: room_id.to_string(),
            date: date.clone(),
        };
        self.days
            .entry(key)
            .or_insert_with(|| {
                Arc::new(RwLock::new(DaySchedule::new(
                    room_id.to_string(),
                    date.clone(),
                )))
            })
            .clone()
    }

    /// WAL-append + apply + notify in one call. Memory is only touched after
    /// the WAL accepted the event, so a failed append changes nothing.
    pub(super) async fn persist_and_apply(
        &self,
        day: &mut DaySchedule,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_day(day, event, &self.booking_days);
        let key = RoomDay {
            room_id: day.room_id.clone(),
            date: day.date.clone(),
        };
        self.notify.send(&key, event);
        Ok(())
    }
}
