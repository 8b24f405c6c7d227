use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. Every instant in the schedule is one.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` for inverted or zero-length ranges.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// True if any part of the cell `[cell_start, cell_end)` lies inside `self`.
    /// Ranges need not be aligned to the cell grid.
    pub fn covers(&self, cell_start: Ms, cell_end: Ms) -> bool {
        self.start < cell_end && cell_start < self.end
    }
}

/// Lifecycle of a booking. `Rejected` is terminal and treated as absent by queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Approved,
    Rejected,
}

impl BookingStatus {
    pub fn can_transition_to(self, to: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, to),
            (Pending, Approved) | (Pending, Rejected) | (Approved, Rejected)
        )
    }

    pub fn is_active(self) -> bool {
        !matches!(self, BookingStatus::Rejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Approved => "approved",
            BookingStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who initiated a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreatedBy {
    Instructor,
    Student,
}

impl CreatedBy {
    /// Instructors place appointments directly; students request them.
    pub fn initial_status(self) -> BookingStatus {
        match self {
            CreatedBy::Instructor => BookingStatus::Approved,
            CreatedBy::Student => BookingStatus::Pending,
        }
    }
}

/// An instructor-declared open window during which students may book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilitySlot {
    pub id: Ulid,
    pub instructor_id: String,
    #[serde(with = "rfc3339")]
    pub start: Ms,
    #[serde(with = "rfc3339")]
    pub end: Ms,
}

impl AvailabilitySlot {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: Ulid,
    pub student_id: String,
    pub instructor_id: String,
    #[serde(with = "rfc3339")]
    pub start: Ms,
    #[serde(with = "rfc3339")]
    pub end: Ms,
    pub status: BookingStatus,
    pub created_by: CreatedBy,
    #[serde(with = "rfc3339")]
    pub created_at: Ms,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Anything placed on an instructor's timeline.
pub trait Timed {
    fn id(&self) -> Ulid;
    fn span(&self) -> Span;
}

impl Timed for AvailabilitySlot {
    fn id(&self) -> Ulid {
        self.id
    }

    fn span(&self) -> Span {
        AvailabilitySlot::span(self)
    }
}

impl Timed for Booking {
    fn id(&self) -> Ulid {
        self.id
    }

    fn span(&self) -> Span {
        Booking::span(self)
    }
}

impl<T: Timed> Timed for &T {
    fn id(&self) -> Ulid {
        Timed::id(*self)
    }

    fn span(&self) -> Span {
        Timed::span(*self)
    }
}

/// Records of one instructor, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct Timeline<T> {
    entries: Vec<T>,
}

impl<T> Default for Timeline<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T: Timed> Timeline<T> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    /// Insert maintaining sort order; equal starts keep insertion order.
    pub fn insert(&mut self, entry: T) {
        let start = entry.span().start;
        let pos = self.entries.partition_point(|e| e.span().start <= start);
        self.entries.insert(pos, entry);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<T> {
        let pos = self.entries.iter().position(|e| e.id() == id)?;
        Some(self.entries.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&T> {
        self.entries.iter().find(|e| e.id() == id)
    }

    /// Callers must not move the entry's start.
    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut T> {
        self.entries.iter_mut().find(|e| e.id() == id)
    }

    /// Entries whose span overlaps the query window.
    /// Uses binary search to skip entries starting at or after `query.end`.
    pub fn overlapping(&self, query: Span) -> impl Iterator<Item = &T> {
        overlapping(&self.entries, query)
    }

    pub fn covering(&self, t: Ms) -> impl Iterator<Item = &T> {
        self.overlapping(Span::new(t, t + 1))
    }
}

/// `sorted` must be ordered by `span().start`.
pub fn overlapping<T: Timed>(sorted: &[T], query: Span) -> impl Iterator<Item = &T> {
    // Everything at index >= right_bound starts at or after query.end → can't overlap.
    let right_bound = sorted.partition_point(|e| e.span().start < query.end);
    sorted[..right_bound]
        .iter()
        .filter(move |e| e.span().end > query.start)
}

/// The booking that represents a contested instant: approved before pending,
/// then earliest start, then lowest id.
pub fn preferred<'a, I>(bookings: I) -> Option<&'a Booking>
where
    I: IntoIterator<Item = &'a Booking>,
{
    bookings
        .into_iter()
        .min_by_key(|b| (b.status != BookingStatus::Approved, b.start, b.id))
}

// ── Timestamp text form ──────────────────────────────────────────

/// Format unix milliseconds as an RFC 3339 UTC string, e.g. `2024-01-08T09:00:00Z`.
pub fn format_iso(ms: Ms) -> String {
    match chrono::DateTime::from_timestamp_millis(ms) {
        Some(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true),
        None => ms.to_string(),
    }
}

/// Parse an ISO-8601 instant. Accepts full RFC 3339 (`2024-01-08T09:00:00+01:00`)
/// and the short UTC forms `2024-01-08T09:00Z` / `2024-01-08T09:00:00.5Z`.
pub fn parse_iso(s: &str) -> Option<Ms> {
    let s = s.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    let naive = s.strip_suffix('Z').or_else(|| s.strip_suffix('z'))?;
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(naive, fmt).ok())
        .map(|dt| dt.and_utc().timestamp_millis())
}

/// Serde adapter storing `Ms` as an RFC 3339 string.
pub mod rfc3339 {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{format_iso, parse_iso, Ms};

    pub fn serialize<S: Serializer>(ms: &Ms, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_iso(*ms))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Ms, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_iso(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {s}")))
    }
}
