use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::AvailabilityStore;
use super::conflict::{check_no_approved_overlap, validate_participant};
use super::{ScheduleError, ValidationError};

/// A booking request before the store assigns id, status and creation time.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub student_id: String,
    pub instructor_id: String,
    pub span: Span,
    pub created_by: CreatedBy,
}

/// Result of a mutation that may settle competing requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingChange {
    pub booking: Booking,
    /// Status before an update; absent on creation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<BookingStatus>,
    /// Pending requests overlapping `booking` once it is approved. They stay
    /// pending but can no longer be approved.
    pub contested: Vec<Booking>,
}

/// Booking requests and appointments. Owns the `bookings` collection.
///
/// Rejected bookings are kept for audit but skipped by every query unless
/// the caller asks for them.
pub struct BookingStore {
    by_instructor: DashMap<String, Timeline<Booking>>,
    /// Reverse lookup: booking id → instructor id
    booking_to_instructor: DashMap<Ulid, String>,
    by_student: DashMap<String, Vec<Ulid>>,
}

impl Default for BookingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BookingStore {
    pub fn new() -> Self {
        Self {
            by_instructor: DashMap::new(),
            booking_to_instructor: DashMap::new(),
            by_student: DashMap::new(),
        }
    }

    /// Rebuild from a persisted snapshot. Repeated ids and approved bookings
    /// that would double-book an instructor are dropped with a warning.
    pub fn restore(bookings: Vec<Booking>) -> Self {
        let store = Self::new();
        for booking in bookings {
            if Span::checked(booking.start, booking.end).is_none() {
                warn!("dropping persisted booking {} with empty range", booking.id);
                continue;
            }
            if store.booking_to_instructor.contains_key(&booking.id) {
                warn!("dropping repeated persisted booking {}", booking.id);
                continue;
            }
            let mut timeline = store
                .by_instructor
                .entry(booking.instructor_id.clone())
                .or_default();
            if booking.status == BookingStatus::Approved {
                if let Err(e) = check_no_approved_overlap(&timeline, booking.span(), None) {
                    warn!("dropping persisted booking {}: {e}", booking.id);
                    continue;
                }
            }
            store.index(&booking);
            timeline.insert(booking);
        }
        store
    }

    fn index(&self, booking: &Booking) {
        self.booking_to_instructor
            .insert(booking.id, booking.instructor_id.clone());
        self.by_student
            .entry(booking.student_id.clone())
            .or_default()
            .push(booking.id);
    }

    pub fn len(&self) -> usize {
        self.booking_to_instructor.len()
    }

    pub fn is_empty(&self) -> bool {
        self.booking_to_instructor.is_empty()
    }

    /// Place a booking inside one of the instructor's availability windows.
    ///
    /// Student requests start `pending` and may share time with other pending
    /// requests. Instructor placements start `approved` and report the pending
    /// requests they overlap as contested.
    pub fn create(
        &self,
        availability: &AvailabilityStore,
        new: NewBooking,
        now: Ms,
    ) -> Result<BookingChange, ScheduleError> {
        validate_participant(&new.student_id)?;
        validate_participant(&new.instructor_id)?;
        if availability
            .slot_containing(&new.instructor_id, new.span)
            .is_none()
        {
            return Err(ValidationError::OutsideAvailability.into());
        }

        // only instructors with a containing window get a timeline
        let mut timeline = self
            .by_instructor
            .entry(new.instructor_id.clone())
            .or_default();
        if timeline.iter().filter(|b| b.is_active()).count() >= MAX_BOOKINGS_PER_INSTRUCTOR {
            return Err(ScheduleError::LimitExceeded("too many active bookings for instructor"));
        }
        check_no_approved_overlap(&timeline, new.span, None)?;

        let booking = Booking {
            id: Ulid::new(),
            student_id: new.student_id,
            instructor_id: new.instructor_id,
            start: new.span.start,
            end: new.span.end,
            status: new.created_by.initial_status(),
            created_by: new.created_by,
            created_at: now,
        };
        let contested = if booking.status == BookingStatus::Approved {
            pending_overlaps(&timeline, &booking)
        } else {
            Vec::new()
        };
        self.index(&booking);
        timeline.insert(booking.clone());
        Ok(BookingChange {
            booking,
            previous: None,
            contested,
        })
    }

    /// Move a booking along `pending → approved | rejected`, `approved → rejected`.
    ///
    /// Approval re-checks the time against other approved bookings, since it may
    /// have been taken after the request was made.
    pub fn update_status(
        &self,
        id: Ulid,
        to: BookingStatus,
    ) -> Result<BookingChange, ScheduleError> {
        let instructor_id = self
            .booking_to_instructor
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(ScheduleError::NotFound(id))?;
        let mut timeline = self
            .by_instructor
            .get_mut(&instructor_id)
            .ok_or(ScheduleError::NotFound(id))?;
        let current = timeline.get(id).cloned().ok_or(ScheduleError::NotFound(id))?;

        if !current.status.can_transition_to(to) {
            return Err(ScheduleError::InvalidTransition {
                from: current.status,
                to,
            });
        }
        let contested = if to == BookingStatus::Approved {
            check_no_approved_overlap(&timeline, current.span(), Some(id))?;
            pending_overlaps(&timeline, &current)
        } else {
            Vec::new()
        };

        let booking = match timeline.get_mut(id) {
            Some(b) => {
                b.status = to;
                b.clone()
            }
            None => return Err(ScheduleError::NotFound(id)),
        };
        debug!("booking {id}: {} -> {to}", current.status);
        Ok(BookingChange {
            booking,
            previous: Some(current.status),
            contested,
        })
    }

    pub fn get(&self, id: Ulid) -> Option<Booking> {
        let instructor_id = self.booking_to_instructor.get(&id)?.value().clone();
        self.by_instructor
            .get(&instructor_id)
            .and_then(|timeline| timeline.get(id).cloned())
    }

    /// Ordered by `(start, id)`.
    pub fn list_for_student(&self, student_id: &str, include_rejected: bool) -> Vec<Booking> {
        let ids = self
            .by_student
            .get(student_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out: Vec<Booking> = ids
            .into_iter()
            .filter_map(|id| self.get(id))
            .filter(|b| include_rejected || b.is_active())
            .collect();
        out.sort_by_key(|b| (b.start, b.id));
        out
    }

    /// Ordered by `start`, then insertion order.
    pub fn list_for_instructor(&self, instructor_id: &str, include_rejected: bool) -> Vec<Booking> {
        self.by_instructor
            .get(instructor_id)
            .map(|timeline| {
                timeline
                    .iter()
                    .filter(|b| include_rejected || b.is_active())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The booking covering `instant`; approved wins when pending requests share the time.
    pub fn booking_at(
        &self,
        instructor_id: &str,
        instant: Ms,
        include_rejected: bool,
    ) -> Option<Booking> {
        let timeline = self.by_instructor.get(instructor_id)?;
        preferred(
            timeline
                .covering(instant)
                .filter(|b| include_rejected || b.is_active()),
        )
        .cloned()
    }

    /// Every booking including rejected ones, ordered by `(start, id)`.
    pub fn snapshot(&self) -> Vec<Booking> {
        let mut all: Vec<Booking> = self
            .by_instructor
            .iter()
            .flat_map(|e| e.value().iter().cloned().collect::<Vec<_>>())
            .collect();
        all.sort_by_key(|b| (b.start, b.id));
        all
    }
}

fn pending_overlaps(timeline: &Timeline<Booking>, winner: &Booking) -> Vec<Booking> {
    let contested: Vec<Booking> = timeline
        .overlapping(winner.span())
        .filter(|b| b.id != winner.id && b.status == BookingStatus::Pending)
        .cloned()
        .collect();
    if !contested.is_empty() {
        metrics::counter!(crate::observability::BOOKINGS_CONTESTED_TOTAL)
            .increment(contested.len() as u64);
    }
    contested
}
