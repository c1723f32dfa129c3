use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Reject a candidate that overlaps anything already on the schedule.
/// `exclude` skips one stored booking, for reschedule-style checks.
pub(crate) fn check_slot_free(
    day: &DaySchedule,
    slot: &TimeRange,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    for existing in day.overlapping(slot) {
        if exclude == Some(existing.id) {
            continue;
        }
        return Err(EngineError::SlotOccupied {
            requested: slot.clone(),
            existing: existing.id,
        });
    }
    Ok(())
}

/// A single request must itself describe a mutually exclusive set of ranges.
/// Touching candidates (one ends where the next starts) are allowed.
pub(crate) fn check_no_self_conflict(slots: &[TimeRange]) -> Result<(), EngineError> {
    for i in 0..slots.len() {
        for j in (i + 1)..slots.len() {
            if slots[i].overlaps(&slots[j]) {
                return Err(EngineError::SelfConflict {
                    first: slots[i].clone(),
                    second: slots[j].clone(),
                });
            }
        }
    }
    Ok(())
}

/// Field-size checks shared by the commit path.
pub(crate) fn validate_request(
    room_id: &str,
    requester: &Requester,
    meeting_title: &str,
    notes: Option<&str>,
) -> Result<(), EngineError> {
    if room_id.is_empty() || room_id.len() > MAX_ROOM_ID_LEN {
        return Err(EngineError::LimitExceeded("room id empty or too long"));
    }
    if requester.name.len() > MAX_REQUESTER_FIELD_LEN
        || requester.email.len() > MAX_REQUESTER_FIELD_LEN
        || requester.department.len() > MAX_REQUESTER_FIELD_LEN
    {
        return Err(EngineError::LimitExceeded("requester field too long"));
    }
    if meeting_title.len() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("meeting title too long"));
    }
    if let Some(n) = notes
        && n.len() > MAX_NOTES_LEN
    {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    Ok(())
}
