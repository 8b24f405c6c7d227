use dashmap::DashMap;
use tracing::warn;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_slot_overlap, validate_participant};
use super::ScheduleError;

/// Instructor-declared open windows. Owns the `availability` collection.
pub struct AvailabilityStore {
    by_instructor: DashMap<String, Timeline<AvailabilitySlot>>,
    /// Reverse lookup: slot id → instructor id
    slot_to_instructor: DashMap<Ulid, String>,
}

impl Default for AvailabilityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AvailabilityStore {
    pub fn new() -> Self {
        Self {
            by_instructor: DashMap::new(),
            slot_to_instructor: DashMap::new(),
        }
    }

    /// Rebuild from a persisted snapshot. Slots that would break the
    /// no-overlap invariant are dropped with a warning.
    pub fn restore(slots: Vec<AvailabilitySlot>) -> Self {
        let store = Self::new();
        for slot in slots {
            if Span::checked(slot.start, slot.end).is_none() {
                warn!("dropping persisted availability {} with empty range", slot.id);
                continue;
            }
            let mut timeline = store
                .by_instructor
                .entry(slot.instructor_id.clone())
                .or_default();
            if let Err(e) = check_no_slot_overlap(&timeline, slot.span()) {
                warn!("dropping persisted availability {}: {e}", slot.id);
                continue;
            }
            store.slot_to_instructor.insert(slot.id, slot.instructor_id.clone());
            timeline.insert(slot);
        }
        store
    }

    pub fn len(&self) -> usize {
        self.slot_to_instructor.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slot_to_instructor.is_empty()
    }

    pub fn add(&self, instructor_id: &str, span: Span) -> Result<AvailabilitySlot, ScheduleError> {
        validate_participant(instructor_id)?;
        let mut timeline = self
            .by_instructor
            .entry(instructor_id.to_string())
            .or_default();
        if timeline.len() >= MAX_SLOTS_PER_INSTRUCTOR {
            return Err(ScheduleError::LimitExceeded("too many availability slots"));
        }
        check_no_slot_overlap(&timeline, span)?;

        let slot = AvailabilitySlot {
            id: Ulid::new(),
            instructor_id: instructor_id.to_string(),
            start: span.start,
            end: span.end,
        };
        self.slot_to_instructor.insert(slot.id, instructor_id.to_string());
        timeline.insert(slot.clone());
        Ok(slot)
    }

    pub fn remove(&self, id: Ulid) -> Result<AvailabilitySlot, ScheduleError> {
        let instructor_id = self
            .slot_to_instructor
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(ScheduleError::NotFound(id))?;
        let removed = self
            .by_instructor
            .get_mut(&instructor_id)
            .and_then(|mut timeline| timeline.remove(id))
            .ok_or(ScheduleError::NotFound(id))?;
        self.slot_to_instructor.remove(&id);
        Ok(removed)
    }

    pub fn get(&self, id: Ulid) -> Option<AvailabilitySlot> {
        let instructor_id = self.slot_to_instructor.get(&id)?.value().clone();
        self.by_instructor
            .get(&instructor_id)
            .and_then(|timeline| timeline.get(id).cloned())
    }

    /// Ordered by `start` ascending.
    pub fn list_for_instructor(&self, instructor_id: &str) -> Vec<AvailabilitySlot> {
        self.by_instructor
            .get(instructor_id)
            .map(|timeline| timeline.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// At most one slot can match given the no-overlap invariant.
    pub fn slot_at(&self, instructor_id: &str, instant: Ms) -> Option<AvailabilitySlot> {
        let timeline = self.by_instructor.get(instructor_id)?;
        timeline.covering(instant).next().cloned()
    }

    /// The window that fully contains `span`, if any.
    pub fn slot_containing(&self, instructor_id: &str, span: Span) -> Option<AvailabilitySlot> {
        let timeline = self.by_instructor.get(instructor_id)?;
        timeline
            .overlapping(span)
            .find(|slot| slot.span().contains_span(&span))
            .cloned()
    }

    /// Every slot, ordered by `(start, id)`; the persisted form of the collection.
    pub fn snapshot(&self) -> Vec<AvailabilitySlot> {
        let mut all: Vec<AvailabilitySlot> = self
            .by_instructor
            .iter()
            .flat_map(|e| e.value().iter().cloned().collect::<Vec<_>>())
            .collect();
        all.sort_by_key(|s| (s.start, s.id));
        all
    }
}
