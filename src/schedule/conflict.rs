use crate::limits::*;
use crate::model::*;

use super::{ScheduleError, ValidationError};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

/// Turn a raw `[start, end)` pair into a span the stores accept.
pub(crate) fn validate_range(start: Ms, end: Ms) -> Result<Span, ScheduleError> {
    let span = Span::checked(start, end).ok_or(ValidationError::EmptyRange)?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(ScheduleError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(ScheduleError::LimitExceeded("span too wide"));
    }
    Ok(span)
}

pub(crate) fn validate_participant(id: &str) -> Result<(), ScheduleError> {
    if id.trim().is_empty() {
        return Err(ValidationError::BadId("empty participant id".into()).into());
    }
    if id.len() > MAX_ID_LEN {
        return Err(ScheduleError::LimitExceeded("participant id too long"));
    }
    Ok(())
}

/// Any existing availability window of the instructor overlapping `span`.
pub(crate) fn check_no_slot_overlap(
    slots: &Timeline<AvailabilitySlot>,
    span: Span,
) -> Result<(), ScheduleError> {
    match slots.overlapping(span).next() {
        Some(existing) => Err(ScheduleError::Conflict(existing.id)),
        None => Ok(()),
    }
}

/// Approved bookings hold their time exclusively; pending ones do not.
/// `ignore` skips the booking being re-checked on approval.
pub(crate) fn check_no_approved_overlap(
    bookings: &Timeline<Booking>,
    span: Span,
    ignore: Option<ulid::Ulid>,
) -> Result<(), ScheduleError> {
    let clash = bookings
        .overlapping(span)
        .find(|b| b.status == BookingStatus::Approved && Some(b.id) != ignore);
    match clash {
        Some(existing) => Err(ScheduleError::Conflict(existing.id)),
        None => Ok(()),
    }
}
