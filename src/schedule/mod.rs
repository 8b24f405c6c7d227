mod availability;
mod bookings;
mod conflict;
mod error;
#[cfg(test)]
mod tests;

pub use availability::AvailabilityStore;
pub use bookings::{BookingChange, BookingStore, NewBooking};
pub use error::{ScheduleError, ValidationError};

pub(crate) use conflict::{now_ms, validate_participant};

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};
use ulid::Ulid;

use crate::calendar::{self, ViewAs, WeekGrid, WeekView};
use crate::color::ColorAssigner;
use crate::model::*;
use crate::persist::{self, KvStore, PersistHandle, PersistOptions, AVAILABILITY_KEY, BOOKINGS_KEY};

use conflict::validate_range;

/// The scheduling service: one per process, shared behind an `Arc`.
///
/// Mutations are synchronous. They update memory first and then hand a
/// snapshot of the changed collection to the background writer, so a read
/// right after a mutation always sees it whether or not the write has landed.
/// A failed write is logged and retried; it never undoes the mutation.
pub struct Scheduler {
    availability: AvailabilityStore,
    bookings: BookingStore,
    persist: PersistHandle,
    /// Serializes mutations so snapshots reach the writer in commit order.
    write_gate: Mutex<()>,
}

impl Scheduler {
    /// Empty schedule. Must be called inside a tokio runtime.
    pub fn new(kv: Arc<dyn KvStore>, options: PersistOptions) -> Self {
        Self::from_parts(AvailabilityStore::new(), BookingStore::new(), kv, options)
    }

    /// Restore both collections from `kv`, then keep writing back to it.
    pub async fn load(kv: Arc<dyn KvStore>, options: PersistOptions) -> io::Result<Self> {
        let slots: Vec<AvailabilitySlot> =
            persist::load_collection(kv.as_ref(), AVAILABILITY_KEY).await?;
        let bookings: Vec<Booking> = persist::load_collection(kv.as_ref(), BOOKINGS_KEY).await?;
        info!(
            "loaded {} availability slots, {} bookings",
            slots.len(),
            bookings.len()
        );
        Ok(Self::from_parts(
            AvailabilityStore::restore(slots),
            BookingStore::restore(bookings),
            kv,
            options,
        ))
    }

    fn from_parts(
        availability: AvailabilityStore,
        bookings: BookingStore,
        kv: Arc<dyn KvStore>,
        options: PersistOptions,
    ) -> Self {
        Self {
            availability,
            bookings,
            persist: PersistHandle::spawn(kv, options),
            write_gate: Mutex::new(()),
        }
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        self.write_gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn availability(&self) -> &AvailabilityStore {
        &self.availability
    }

    pub fn bookings(&self) -> &BookingStore {
        &self.bookings
    }

    // ── Availability ─────────────────────────────────────────

    pub fn add_availability(
        &self,
        instructor_id: &str,
        start: Ms,
        end: Ms,
    ) -> Result<AvailabilitySlot, ScheduleError> {
        let span = validate_range(start, end)?;
        let _gate = self.gate();
        let slot = self.availability.add(instructor_id, span)?;
        debug!("availability {} added for {instructor_id}", slot.id);
        self.persist
            .save(AVAILABILITY_KEY, &self.availability.snapshot());
        Ok(slot)
    }

    /// Bookings inside the removed window are left as they are.
    pub fn remove_availability(&self, slot_id: Ulid) -> Result<AvailabilitySlot, ScheduleError> {
        let _gate = self.gate();
        let slot = self.availability.remove(slot_id)?;
        debug!("availability {slot_id} removed");
        self.persist
            .save(AVAILABILITY_KEY, &self.availability.snapshot());
        Ok(slot)
    }

    pub fn list_availability(&self, instructor_id: &str) -> Vec<AvailabilitySlot> {
        self.availability.list_for_instructor(instructor_id)
    }

    pub fn slot_at(&self, instructor_id: &str, instant: Ms) -> Option<AvailabilitySlot> {
        self.availability.slot_at(instructor_id, instant)
    }

    // ── Bookings ─────────────────────────────────────────────

    pub fn create_booking(
        &self,
        student_id: &str,
        instructor_id: &str,
        start: Ms,
        end: Ms,
        created_by: CreatedBy,
    ) -> Result<BookingChange, ScheduleError> {
        let span = validate_range(start, end)?;
        let new = NewBooking {
            student_id: student_id.to_string(),
            instructor_id: instructor_id.to_string(),
            span,
            created_by,
        };
        let _gate = self.gate();
        let change = self.bookings.create(&self.availability, new, now_ms())?;
        debug!(
            "booking {} created by {:?} as {}",
            change.booking.id, created_by, change.booking.status
        );
        self.persist.save(BOOKINGS_KEY, &self.bookings.snapshot());
        Ok(change)
    }

    pub fn update_status(
        &self,
        booking_id: Ulid,
        status: BookingStatus,
    ) -> Result<BookingChange, ScheduleError> {
        let _gate = self.gate();
        let change = self.bookings.update_status(booking_id, status)?;
        if !change.contested.is_empty() {
            info!(
                "approving {booking_id} contested {} overlapping requests",
                change.contested.len()
            );
        }
        self.persist.save(BOOKINGS_KEY, &self.bookings.snapshot());
        Ok(change)
    }

    /// Deleting a booking is rejecting it; the record stays for audit.
    pub fn cancel_booking(&self, booking_id: Ulid) -> Result<Booking, ScheduleError> {
        self.update_status(booking_id, BookingStatus::Rejected)
            .map(|change| change.booking)
    }

    pub fn list_for_student(&self, student_id: &str, include_rejected: bool) -> Vec<Booking> {
        self.bookings.list_for_student(student_id, include_rejected)
    }

    pub fn list_for_instructor(&self, instructor_id: &str, include_rejected: bool) -> Vec<Booking> {
        self.bookings.list_for_instructor(instructor_id, include_rejected)
    }

    pub fn booking_at(
        &self,
        instructor_id: &str,
        instant: Ms,
        include_rejected: bool,
    ) -> Option<Booking> {
        self.bookings.booking_at(instructor_id, instant, include_rejected)
    }

    // ── Calendar ─────────────────────────────────────────────

    /// Resolve the visible week from the current state of both stores.
    pub fn resolve_week(
        &self,
        grid: &WeekGrid,
        view: &ViewAs,
        now: Ms,
        colors: &ColorAssigner,
    ) -> WeekView {
        let slots = view
            .instructor()
            .map(|id| self.availability.list_for_instructor(id))
            .unwrap_or_default();
        let bookings = match view {
            ViewAs::Instructor { instructor_id }
            | ViewAs::InstructorForStudent { instructor_id, .. } => {
                self.bookings.list_for_instructor(instructor_id, false)
            }
            ViewAs::Student {
                student_id,
                instructor_id,
            } => {
                let mut own = self.bookings.list_for_student(student_id, false);
                if let Some(instructor_id) = instructor_id {
                    own.extend(self.bookings.list_for_instructor(instructor_id, false));
                }
                own
            }
        };
        calendar::resolve_week(grid, view, &slots, &bookings, now, colors)
    }

    // ── Persistence ──────────────────────────────────────────

    /// Wait for every change made so far to be written.
    pub async fn flush(&self) -> io::Result<()> {
        self.persist.flush().await
    }
}
