use std::ops::Range;

use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::color::{Color, ColorAssigner};
use crate::limits::*;
use crate::model::*;
use crate::schedule::ScheduleError;

// ── Grid ──────────────────────────────────────────────────────────

/// A block of whole days cut into one-hour cells between `start_hour` and `end_hour`.
/// Days begin at UTC midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekGrid {
    #[serde(with = "crate::model::rfc3339")]
    pub week_start: Ms,
    pub days: u32,
    pub start_hour: u32,
    pub end_hour: u32,
}

impl WeekGrid {
    /// Seven days starting at `first_day`.
    pub fn new(first_day: NaiveDate, start_hour: u32, end_hour: u32) -> Result<Self, ScheduleError> {
        if start_hour >= end_hour || end_hour > MAX_GRID_HOUR {
            return Err(ScheduleError::LimitExceeded("grid hours out of range"));
        }
        let week_start = first_day
            .and_hms_opt(0, 0, 0)
            .ok_or(ScheduleError::LimitExceeded("grid start out of range"))?
            .and_utc()
            .timestamp_millis();
        Ok(Self {
            week_start,
            days: MAX_GRID_DAYS,
            start_hour,
            end_hour,
        })
    }

    /// The Monday-based week containing `date`.
    pub fn week_of(date: NaiveDate, start_hour: u32, end_hour: u32) -> Result<Self, ScheduleError> {
        let back = Days::new(u64::from(date.weekday().num_days_from_monday()));
        let monday = date
            .checked_sub_days(back)
            .ok_or(ScheduleError::LimitExceeded("grid start out of range"))?;
        Self::new(monday, start_hour, end_hour)
    }

    pub fn hours(&self) -> Range<u32> {
        self.start_hour..self.end_hour
    }

    pub fn cell_span(&self, day: u32, hour: u32) -> Span {
        let start = self.week_start + Ms::from(day) * DAY_MS + Ms::from(hour) * HOUR_MS;
        Span::new(start, start + HOUR_MS)
    }

    /// From the first cell's start to the last cell's end.
    pub fn visible(&self) -> Span {
        let first = self.cell_span(0, self.start_hour);
        let last = self.cell_span(self.days - 1, self.end_hour - 1);
        Span::new(first.start, last.end)
    }

    pub fn cell_count(&self) -> usize {
        (self.days * (self.end_hour - self.start_hour)) as usize
    }
}

fn floor_hour(t: Ms) -> Ms {
    t.div_euclid(HOUR_MS) * HOUR_MS
}

// ── View context ─────────────────────────────────────────────────

/// Whose calendar is being drawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "as", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ViewAs {
    /// An instructor's own calendar: their windows and every live booking.
    Instructor { instructor_id: String },
    /// A student's calendar: their own bookings, plus the windows of the
    /// instructor they book with.
    Student {
        student_id: String,
        #[serde(default)]
        instructor_id: Option<String>,
    },
    /// An instructor looking at one student's bookings with them.
    InstructorForStudent {
        instructor_id: String,
        student_id: String,
    },
}

impl ViewAs {
    /// Whose availability windows are drawn.
    pub fn instructor(&self) -> Option<&str> {
        match self {
            ViewAs::Instructor { instructor_id } | ViewAs::InstructorForStudent { instructor_id, .. } => {
                Some(instructor_id.as_str())
            }
            ViewAs::Student { instructor_id, .. } => instructor_id.as_deref(),
        }
    }

    fn shows(&self, b: &Booking) -> bool {
        match self {
            ViewAs::Instructor { instructor_id } => b.instructor_id == *instructor_id,
            ViewAs::Student { student_id, .. } => b.student_id == *student_id,
            ViewAs::InstructorForStudent {
                instructor_id,
                student_id,
            } => b.instructor_id == *instructor_id && b.student_id == *student_id,
        }
    }

    /// Another student's appointment: hidden, but its time is not offered either.
    fn masks(&self, b: &Booking) -> bool {
        b.status == BookingStatus::Approved
            && self.instructor() == Some(b.instructor_id.as_str())
            && !self.shows(b)
    }
}

// ── Output ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum CellContent {
    Empty,
    Availability {
        slot: AvailabilitySlot,
        is_first: bool,
        is_last: bool,
    },
    Booking {
        booking: Booking,
        is_first: bool,
        is_last: bool,
        color: Color,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    pub day: u32,
    pub hour: u32,
    #[serde(with = "crate::model::rfc3339")]
    pub start: Ms,
    /// The cell has already begun; not offered for interaction.
    pub is_past: bool,
    pub content: CellContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WeekView {
    pub grid: WeekGrid,
    /// Day-major: all hours of day 0, then day 1, ...
    pub cells: Vec<Cell>,
}

impl WeekView {
    pub fn cell(&self, day: u32, hour: u32) -> Option<&Cell> {
        if day >= self.grid.days || !self.grid.hours().contains(&hour) {
            return None;
        }
        let per_day = self.grid.end_hour - self.grid.start_hour;
        self.cells
            .get((day * per_day + hour - self.grid.start_hour) as usize)
    }
}

// ── Resolution ───────────────────────────────────────────────────

/// Resolve every cell of `grid` to the booking or availability window covering it.
///
/// Bookings take precedence over availability. Among overlapping bookings the
/// approved one wins, then the earliest. Rejected bookings are ignored.
/// A cell is covered when any part of it lies inside the range, so sub-hour
/// ranges still mark their hour.
///
/// Pure: reads the given snapshots only, so equal inputs give equal output.
pub fn resolve_week(
    grid: &WeekGrid,
    view: &ViewAs,
    availability: &[AvailabilitySlot],
    bookings: &[Booking],
    now: Ms,
    colors: &ColorAssigner,
) -> WeekView {
    let window = grid.visible();

    let mut slots: Vec<&AvailabilitySlot> = match view.instructor() {
        Some(instructor_id) => availability
            .iter()
            .filter(|s| s.instructor_id == instructor_id && s.span().overlaps(&window))
            .collect(),
        None => Vec::new(),
    };
    slots.sort_by_key(|s| (s.start, s.id));

    let mut shown: Vec<&Booking> = Vec::new();
    let mut masking: Vec<&Booking> = Vec::new();
    for b in bookings
        .iter()
        .filter(|b| b.is_active() && b.span().overlaps(&window))
    {
        if view.shows(b) {
            shown.push(b);
        } else if view.masks(b) {
            masking.push(b);
        }
    }
    shown.sort_by_key(|b| (b.start, b.id));
    shown.dedup_by_key(|b| b.id);
    masking.sort_by_key(|b| (b.start, b.id));

    let mut cells = Vec::with_capacity(grid.cell_count());
    for day in 0..grid.days {
        for hour in grid.hours() {
            let cell = grid.cell_span(day, hour);
            let content = resolve_cell(cell, &slots, &shown, &masking, colors);
            cells.push(Cell {
                day,
                hour,
                start: cell.start,
                is_past: cell.start < now,
                content,
            });
        }
    }
    WeekView { grid: *grid, cells }
}

fn resolve_cell(
    cell: Span,
    slots: &[&AvailabilitySlot],
    shown: &[&Booking],
    masking: &[&Booking],
    colors: &ColorAssigner,
) -> CellContent {
    if let Some(b) = preferred(overlapping(shown, cell).copied()) {
        return CellContent::Booking {
            booking: b.clone(),
            is_first: floor_hour(b.start) == cell.start,
            is_last: floor_hour(b.end) == cell.start,
            color: colors.color_for(&b.student_id),
        };
    }
    if overlapping(masking, cell).next().is_some() {
        return CellContent::Empty;
    }
    match overlapping(slots, cell).next() {
        Some(slot) => CellContent::Availability {
            slot: (*slot).clone(),
            is_first: floor_hour(slot.start) == cell.start,
            is_last: floor_hour(slot.end) == cell.start,
        },
        None => CellContent::Empty,
    }
}
