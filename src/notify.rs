use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::{AvailabilitySlot, Booking, BookingStatus};

const CHANNEL_CAPACITY: usize = 256;

/// Something a participant may want to hear about after a committed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ScheduleEvent {
    AvailabilityAdded {
        slot: AvailabilitySlot,
    },
    AvailabilityRemoved {
        slot: AvailabilitySlot,
    },
    BookingCreated {
        booking: Booking,
        contested: Vec<Booking>,
    },
    BookingStatusChanged {
        booking: Booking,
        previous: BookingStatus,
        contested: Vec<Booking>,
    },
}

impl ScheduleEvent {
    /// User ids the event is delivered to, without duplicates.
    pub fn recipients(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = match self {
            ScheduleEvent::AvailabilityAdded { slot } | ScheduleEvent::AvailabilityRemoved { slot } => {
                vec![slot.instructor_id.as_str()]
            }
            ScheduleEvent::BookingCreated { booking, contested }
            | ScheduleEvent::BookingStatusChanged {
                booking, contested, ..
            } => {
                let mut ids = vec![booking.instructor_id.as_str(), booking.student_id.as_str()];
                ids.extend(contested.iter().map(|b| b.student_id.as_str()));
                ids
            }
        };
        let mut seen = std::collections::HashSet::new();
        ids.retain(|id| seen.insert(*id));
        ids
    }
}

/// Broadcast hub for schedule events per user.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<ScheduleEvent>>,
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

    /// Subscribe to events for a user. Creates the channel if needed.
    pub fn subscribe(&self, user_id: &str) -> broadcast::Receiver<ScheduleEvent> {
        let sender = self
            .channels
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Deliver to every recipient with a listener. Returns how many channels received it.
    pub fn publish(&self, event: &ScheduleEvent) -> usize {
        event
            .recipients()
            .into_iter()
            .filter(|id| {
                self.channels
                    .get(*id)
                    .is_some_and(|sender| sender.send(event.clone()).is_ok())
            })
            .count()
    }

    /// Drop a user's channel once nobody listens on it.
    pub fn release(&self, user_id: &str) {
        self.channels
            .remove_if(user_id, |_, sender| sender.receiver_count() == 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
