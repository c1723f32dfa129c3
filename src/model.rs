use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only clock-derived time type.
pub type Ms = i64;

/// Zero-padded 24-hour wall-clock time, `"HH:MM"`.
///
/// Ordering is plain string ordering, which agrees with time ordering only
/// because the format is fixed-width and zero-padded. Construction is the
/// sole way in, so a stored value is always well-formed and the ordering
/// invariant cannot be broken by malformed input.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WallTime(String);

impl WallTime {
    pub fn parse(s: &str) -> Result<Self, SlotError> {
        let b = s.as_bytes();
        let shaped = b.len() == 5
            && b[2] == b':'
            && b[0].is_ascii_digit()
            && b[1].is_ascii_digit()
            && b[3].is_ascii_digit()
            && b[4].is_ascii_digit();
        if !shaped {
            return Err(SlotError::BadTime(s.to_string()));
        }
        let hh = (b[0] - b'0') * 10 + (b[1] - b'0');
        let mm = (b[3] - b'0') * 10 + (b[4] - b'0');
        if hh > 23 || mm > 59 {
            return Err(SlotError::BadTime(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for WallTime {
    type Error = SlotError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<WallTime> for String {
    fn from(t: WallTime) -> String {
        t.0
    }
}

impl fmt::Display for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Calendar-day key, `"YYYY-MM-DD"`. Same fixed-width string-ordering
/// rationale as [`WallTime`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DateKey(String);

impl DateKey {
    pub fn parse(s: &str) -> Result<Self, SlotError> {
        let b = s.as_bytes();
        let shaped = b.len() == 10
            && b[4] == b'-'
            && b[7] == b'-'
            && [0, 1, 2, 3, 5, 6, 8, 9].iter().all(|&i| b[i].is_ascii_digit());
        if !shaped {
            return Err(SlotError::BadDate(s.to_string()));
        }
        let month = (b[5] - b'0') * 10 + (b[6] - b'0');
        let day = (b[8] - b'0') * 10 + (b[9] - b'0');
        if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
            return Err(SlotError::BadDate(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DateKey {
    type Error = SlotError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<DateKey> for String {
    fn from(d: DateKey) -> String {
        d.0
    }
}

impl fmt::Display for DateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Half-open wall-clock range `[start, end)` on one implicit calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    start: WallTime,
    end: WallTime,
}

impl TimeRange {
    /// Rejects inverted and zero-length ranges. A built range is always valid.
    pub fn new(start: WallTime, end: WallTime) -> Result<Self, SlotError> {
        if start >= end {
            return Err(SlotError::Inverted {
                start: start.0,
                end: end.0,
            });
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, SlotError> {
        Self::new(WallTime::parse(start)?, WallTime::parse(end)?)
    }

    pub fn start(&self) -> &WallTime {
        &self.start
    }

    pub fn end(&self) -> &WallTime {
        &self.end
    }

    /// Half-open overlap: ranges that share only a boundary do not overlap,
    /// so a meeting ending at 10:00 never conflicts with one starting at 10:00.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Validation failures at model construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotError {
    BadTime(String),
    BadDate(String),
    Inverted { start: String, end: String },
}

impl fmt::Display for SlotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotError::BadTime(s) => write!(f, "not a zero-padded HH:MM time: {s:?}"),
            SlotError::BadDate(s) => write!(f, "not a YYYY-MM-DD date: {s:?}"),
            SlotError::Inverted { start, end } => {
                write!(f, "range start {start} is not before end {end}")
            }
        }
    }
}

impl std::error::Error for SlotError {}

/// Who booked the slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub name: String,
    pub email: String,
    pub department: String,
}

/// A confirmed booking. `id` and `created_at` are assigned at commit and
/// never change; everything else is what the requester submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub room_id: String,
    pub date: DateKey,
    pub slot: TimeRange,
    pub requester: Requester,
    pub meeting_title: String,
    pub notes: Option<String>,
    pub created_at: Ms,
}

impl Booking {
    pub fn room_day(&self) -> RoomDay {
        RoomDay {
            room_id: self.room_id.clone(),
            date: self.date.clone(),
        }
    }
}

/// Partition key. Two bookings can only conflict when they share both the
/// room and the calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomDay {
    pub room_id: String,
    pub date: DateKey,
}

/// All bookings for one (room, date), sorted by slot start.
#[derive(Debug, Clone)]
pub struct DaySchedule {
    pub room_id: String,
    pub date: DateKey,
    pub bookings: Vec<Booking>,
}

impl DaySchedule {
    pub fn new(room_id: String, date: DateKey) -> Self {
        Self {
            room_id,
            date,
            bookings: Vec::new(),
        }
    }

    /// Insert maintaining sort order by slot start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.slot.start() <= booking.slot.start());
        self.bookings.insert(pos, booking);
    }

    /// Remove a booking by id.
    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    /// Bookings whose slot overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &TimeRange) -> impl Iterator<Item = &Booking> {
        let right = self
            .bookings
            .partition_point(|b| b.slot.start() < query.end());
        self.bookings[..right]
            .iter()
            .filter(move |b| b.slot.end() > query.start())
    }
}

/// The WAL record format. A whole commit batch travels as ONE record, so a
/// replayed log can never surface part of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingsCommitted {
        bookings: Vec<Booking>,
    },
    BookingCancelled {
        id: Ulid,
        room_id: String,
        date: DateKey,
    },
}
