use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::warn;
use ulid::Ulid;

use crate::calendar::{ViewAs, WeekGrid, WeekView};
use crate::color::{Color, ColorAssigner, RosterEntry};
use crate::model::*;
use crate::notify::{NotifyHub, ScheduleEvent};
use crate::schedule::{
    now_ms, validate_participant, BookingChange, ScheduleError, Scheduler, ValidationError,
};

const DEFAULT_START_HOUR: u32 = 6;
const DEFAULT_END_HOUR: u32 = 20;

/// A request decoded from one JSON line.
///
/// Timestamps and ids stay textual here; `execute` parses them so that a bad
/// value is reported as a validation error naming the value.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Command {
    AddAvailability {
        instructor_id: String,
        start: String,
        end: String,
    },
    RemoveAvailability {
        slot_id: String,
    },
    CreateBooking {
        student_id: String,
        instructor_id: String,
        start: String,
        end: String,
        created_by: CreatedBy,
    },
    SetBookingStatus {
        booking_id: String,
        status: BookingStatus,
    },
    ListAvailability {
        instructor_id: String,
    },
    ListBookings {
        #[serde(default)]
        student_id: Option<String>,
        #[serde(default)]
        instructor_id: Option<String>,
        #[serde(default)]
        include_rejected: bool,
    },
    SlotAt {
        instructor_id: String,
        at: String,
    },
    BookingAt {
        instructor_id: String,
        at: String,
        #[serde(default)]
        include_rejected: bool,
    },
    ResolveWeek {
        view: ViewAs,
        /// Any day of the week to show; the grid starts on its Monday.
        week_of: NaiveDate,
        #[serde(default = "default_start_hour")]
        start_hour: u32,
        #[serde(default = "default_end_hour")]
        end_hour: u32,
        /// Overrides the clock for `isPast`.
        #[serde(default)]
        now: Option<String>,
        #[serde(default)]
        roster: Option<Vec<RosterEntry>>,
    },
    ColorFor {
        student_id: String,
        #[serde(default)]
        roster: Option<Vec<RosterEntry>>,
    },
    Subscribe {
        user_id: String,
    },
    Flush,
}

fn default_start_hour() -> u32 {
    DEFAULT_START_HOUR
}

fn default_end_hour() -> u32 {
    DEFAULT_END_HOUR
}

/// Decode one request line.
pub fn parse(line: &str) -> Result<Command, ScheduleError> {
    serde_json::from_str(line).map_err(|e| ValidationError::Malformed(e.to_string()).into())
}

fn parse_time(s: &str) -> Result<Ms, ScheduleError> {
    parse_iso(s).ok_or_else(|| ValidationError::BadTimestamp(s.to_string()).into())
}

fn parse_id(s: &str) -> Result<Ulid, ScheduleError> {
    Ulid::from_string(s).map_err(|_| ValidationError::BadId(s.to_string()).into())
}

fn colors(roster: Option<Vec<RosterEntry>>) -> ColorAssigner {
    roster.map_or_else(ColorAssigner::stable, |entries| {
        ColorAssigner::from_roster(&entries)
    })
}

/// Successful result of a command, serialized as the response `data`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum Reply {
    Slot(AvailabilitySlot),
    Slots(Vec<AvailabilitySlot>),
    MaybeSlot(Option<AvailabilitySlot>),
    Change(BookingChange),
    Bookings(Vec<Booking>),
    MaybeBooking(Option<Booking>),
    Week(WeekView),
    Color { student_id: String, color: Color },
    Subscribed { user_id: String },
    Flushed { persisted: bool },
}

/// Run a command against the scheduler and publish what changed.
///
/// Events go out only after the mutation succeeded. `Subscribe` only checks
/// the user id; the connection owns the receiver.
pub async fn execute(
    scheduler: &Scheduler,
    hub: &NotifyHub,
    cmd: Command,
) -> Result<Reply, ScheduleError> {
    match cmd {
        Command::AddAvailability {
            instructor_id,
            start,
            end,
        } => {
            let slot =
                scheduler.add_availability(&instructor_id, parse_time(&start)?, parse_time(&end)?)?;
            hub.publish(&ScheduleEvent::AvailabilityAdded { slot: slot.clone() });
            Ok(Reply::Slot(slot))
        }
        Command::RemoveAvailability { slot_id } => {
            let slot = scheduler.remove_availability(parse_id(&slot_id)?)?;
            hub.publish(&ScheduleEvent::AvailabilityRemoved { slot: slot.clone() });
            Ok(Reply::Slot(slot))
        }
        Command::CreateBooking {
            student_id,
            instructor_id,
            start,
            end,
            created_by,
        } => {
            let change = scheduler.create_booking(
                &student_id,
                &instructor_id,
                parse_time(&start)?,
                parse_time(&end)?,
                created_by,
            )?;
            hub.publish(&ScheduleEvent::BookingCreated {
                booking: change.booking.clone(),
                contested: change.contested.clone(),
            });
            Ok(Reply::Change(change))
        }
        Command::SetBookingStatus { booking_id, status } => {
            let change = scheduler.update_status(parse_id(&booking_id)?, status)?;
            if let Some(previous) = change.previous {
                hub.publish(&ScheduleEvent::BookingStatusChanged {
                    booking: change.booking.clone(),
                    previous,
                    contested: change.contested.clone(),
                });
            }
            Ok(Reply::Change(change))
        }
        Command::ListAvailability { instructor_id } => {
            Ok(Reply::Slots(scheduler.list_availability(&instructor_id)))
        }
        Command::ListBookings {
            student_id,
            instructor_id,
            include_rejected,
        } => match (student_id, instructor_id) {
            (Some(student), Some(instructor)) => Ok(Reply::Bookings(
                scheduler
                    .list_for_student(&student, include_rejected)
                    .into_iter()
                    .filter(|b| b.instructor_id == instructor)
                    .collect(),
            )),
            (Some(student), None) => Ok(Reply::Bookings(
                scheduler.list_for_student(&student, include_rejected),
            )),
            (None, Some(instructor)) => Ok(Reply::Bookings(
                scheduler.list_for_instructor(&instructor, include_rejected),
            )),
            (None, None) => Err(ValidationError::Malformed(
                "list_bookings needs studentId or instructorId".into(),
            )
            .into()),
        },
        Command::SlotAt { instructor_id, at } => Ok(Reply::MaybeSlot(
            scheduler.slot_at(&instructor_id, parse_time(&at)?),
        )),
        Command::BookingAt {
            instructor_id,
            at,
            include_rejected,
        } => Ok(Reply::MaybeBooking(scheduler.booking_at(
            &instructor_id,
            parse_time(&at)?,
            include_rejected,
        ))),
        Command::ResolveWeek {
            view,
            week_of,
            start_hour,
            end_hour,
            now,
            roster,
        } => {
            let grid = WeekGrid::week_of(week_of, start_hour, end_hour)?;
            let now = match now {
                Some(s) => parse_time(&s)?,
                None => now_ms(),
            };
            Ok(Reply::Week(scheduler.resolve_week(
                &grid,
                &view,
                now,
                &colors(roster),
            )))
        }
        Command::ColorFor { student_id, roster } => {
            let color = colors(roster).color_for(&student_id);
            Ok(Reply::Color { student_id, color })
        }
        Command::Subscribe { user_id } => {
            validate_participant(&user_id)?;
            Ok(Reply::Subscribed { user_id })
        }
        Command::Flush => match scheduler.flush().await {
            Ok(()) => Ok(Reply::Flushed { persisted: true }),
            Err(e) => {
                warn!("flush requested but persistence failed: {e}");
                Ok(Reply::Flushed { persisted: false })
            }
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
}

/// One response line: `{"ok":true,"data":…}` or `{"ok":false,"error":…}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Reply>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl From<Result<Reply, ScheduleError>> for Response {
    fn from(result: Result<Reply, ScheduleError>) -> Self {
        match result {
            Ok(reply) => Self {
                ok: true,
                data: Some(reply),
                error: None,
            },
            Err(e) => Self {
                ok: false,
                data: None,
                error: Some(ErrorBody {
                    kind: e.kind(),
                    message: e.to_string(),
                }),
            },
        }
    }
}

/// A pushed notification line.
#[derive(Debug, Serialize)]
pub struct EventLine<'a> {
    pub event: &'a ScheduleEvent,
}
