use ulid::Ulid;

use crate::model::BookingStatus;

/// Why an input was refused before touching any state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// `start >= end`.
    EmptyRange,
    /// The booking is not inside any availability window of its instructor.
    OutsideAvailability,
    BadTimestamp(String),
    BadId(String),
    /// The request could not be decoded.
    Malformed(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::EmptyRange => write!(f, "start must be before end"),
            ValidationError::OutsideAvailability => {
                write!(f, "range is not inside an availability window")
            }
            ValidationError::BadTimestamp(s) => write!(f, "invalid timestamp: {s}"),
            ValidationError::BadId(s) => write!(f, "invalid id: {s}"),
            ValidationError::Malformed(s) => write!(f, "malformed request: {s}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    Validation(ValidationError),
    /// Carries the id of the slot or booking already holding the time.
    Conflict(Ulid),
    NotFound(Ulid),
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    LimitExceeded(&'static str),
}

impl ScheduleError {
    /// Stable label for wire responses and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleError::Validation(_) => "validation",
            ScheduleError::Conflict(_) => "conflict",
            ScheduleError::NotFound(_) => "not_found",
            ScheduleError::InvalidTransition { .. } => "invalid_transition",
            ScheduleError::LimitExceeded(_) => "limit_exceeded",
        }
    }
}

impl From<ValidationError> for ScheduleError {
    fn from(e: ValidationError) -> Self {
        ScheduleError::Validation(e)
    }
}

impl std::fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleError::Validation(e) => write!(f, "validation failed: {e}"),
            ScheduleError::Conflict(id) => write!(f, "conflict with: {id}"),
            ScheduleError::NotFound(id) => write!(f, "not found: {id}"),
            ScheduleError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition: {from} -> {to}")
            }
            ScheduleError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for ScheduleError {}
