use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type inside the engine.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

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

    /// `None` for empty or inverted bounds.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Strict on both sides: touching endpoints do not overlap.
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

    /// Intersection with `bounds`, `None` when nothing is left.
    pub fn clip(&self, bounds: &Span) -> Option<Span> {
        Span::try_new(self.start.max(bounds.start), self.end.min(bounds.end))
    }

    /// Same start, end pushed out by `buffer`.
    pub fn extend_end(&self, buffer: Ms) -> Span {
        Span {
            start: self.start,
            end: self.end + buffer.max(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Canceled,
    Done,
}

impl AppointmentStatus {
    /// Only pending and confirmed appointments occupy the calendar.
    pub fn is_busy(self) -> bool {
        matches!(self, AppointmentStatus::Pending | AppointmentStatus::Confirmed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "PENDING",
            AppointmentStatus::Confirmed => "CONFIRMED",
            AppointmentStatus::Canceled => "CANCELED",
            AppointmentStatus::Done => "DONE",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(AppointmentStatus::Pending),
            "CONFIRMED" => Ok(AppointmentStatus::Confirmed),
            "CANCELED" | "CANCELLED" => Ok(AppointmentStatus::Canceled),
            "DONE" => Ok(AppointmentStatus::Done),
            other => Err(format!("unknown appointment status: {other}")),
        }
    }
}

/// What an interval on a staff timeline represents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalKind {
    Appointment {
        service_id: Ulid,
        customer_id: Ulid,
        status: AppointmentStatus,
    },
    /// Checkout hold; invisible once `expires_at <= now`.
    Reservation { session_id: String, expires_at: Ms },
    /// One-off exception, kept in the wall-clock form it was entered in.
    TimeOff {
        date: NaiveDate,
        start_min: u16,
        end_min: u16,
        reason: Option<String>,
    },
}

/// Appointments, reservations and time-off are all just intervals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub id: Ulid,
    pub span: Span,
    pub kind: IntervalKind,
}

impl Interval {
    /// Whether this interval makes its staff member unavailable at `now`.
    pub fn is_busy(&self, now: Ms) -> bool {
        match &self.kind {
            IntervalKind::Appointment { status, .. } => status.is_busy(),
            IntervalKind::Reservation { expires_at, .. } => *expires_at > now,
            IntervalKind::TimeOff { .. } => true,
        }
    }

    /// Appointments and reservations get the rest buffer; time-off does not.
    pub fn is_allocation(&self) -> bool {
        matches!(
            self.kind,
            IntervalKind::Appointment { .. } | IntervalKind::Reservation { .. }
        )
    }

    pub fn session_id(&self) -> Option<&str> {
        match &self.kind {
            IntervalKind::Reservation { session_id, .. } => Some(session_id),
            _ => None,
        }
    }
}

/// Intervals kept sorted by `span.start`.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    intervals: Vec<Interval>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interval> {
        self.intervals.iter()
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .partition_point(|i| i.span.start <= interval.span.start);
        self.intervals.insert(pos, interval);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Interval> {
        self.intervals.iter().find(|i| i.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Interval> {
        self.intervals.iter_mut().find(|i| i.id == id)
    }

    /// Drop reservations that expired at or before `cutoff` and hand them back.
    pub fn purge_reservations(&mut self, cutoff: Ms) -> Vec<Interval> {
        let (purged, kept): (Vec<Interval>, Vec<Interval>) = std::mem::take(&mut self.intervals)
            .into_iter()
            .partition(|i| matches!(i.kind, IntervalKind::Reservation { expires_at, .. } if expires_at <= cutoff));
        self.intervals = kept;
        purged
    }

    /// Intervals whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }
}

/// One recurring row of the weekly schedule. `weekday`: 0 = Sunday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    pub weekday: u8,
    pub start_min: u16,
    pub end_min: u16,
    pub closed: bool,
}

impl WorkingHours {
    pub fn is_open(&self) -> bool {
        !self.closed && self.start_min < self.end_min
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub duration_min: u32,
    pub active: bool,
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: Ulid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StaffState {
    pub id: Ulid,
    pub name: Option<String>,
    pub services: BTreeSet<Ulid>,
    pub working_hours: [Option<WorkingHours>; 7],
    pub timeline: Timeline,
}

impl StaffState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            services: BTreeSet::new(),
            working_hours: [None; 7],
            timeline: Timeline::new(),
        }
    }

    pub fn hours_for(&self, weekday: u8) -> Option<&WorkingHours> {
        self.working_hours
            .get(weekday as usize)
            .and_then(|row| row.as_ref())
    }

    pub fn is_qualified_for(&self, service_ids: &[Ulid]) -> bool {
        service_ids.iter().all(|s| self.services.contains(s))
    }

    /// True while any pending or confirmed appointment remains.
    pub fn has_busy_appointments(&self) -> bool {
        self.timeline.iter().any(|i| {
            matches!(&i.kind, IntervalKind::Appointment { status, .. } if status.is_busy())
        })
    }
}

/// One event per committed operation. This is the WAL record format.
/// One user-level operation is exactly one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceUpserted {
        service: Service,
    },
    StaffCreated {
        id: Ulid,
        name: Option<String>,
    },
    StaffRemoved {
        id: Ulid,
    },
    StaffServiceAssigned {
        staff_id: Ulid,
        service_id: Ulid,
    },
    StaffServiceUnassigned {
        staff_id: Ulid,
        service_id: Ulid,
    },
    WorkingHoursSet {
        staff_id: Ulid,
        hours: WorkingHours,
    },
    /// `staff_id = None` is organisation-wide.
    TimeOffAdded {
        id: Ulid,
        staff_id: Option<Ulid>,
        date: NaiveDate,
        start_min: u16,
        end_min: u16,
        reason: Option<String>,
    },
    TimeOffRemoved {
        id: Ulid,
        staff_id: Option<Ulid>,
    },
    CustomerRegistered {
        customer: Customer,
    },
    /// Upsert keyed by session. Reservations on `staff_id` expired at or
    /// before `purge_before` are dropped in the same step; `moved_from` names
    /// the staff member the session's previous reservation lived on.
    ReservationPlaced {
        id: Ulid,
        staff_id: Ulid,
        span: Span,
        session_id: String,
        expires_at: Ms,
        purge_before: Ms,
        moved_from: Option<Ulid>,
    },
    ReservationReleased {
        id: Ulid,
        staff_id: Ulid,
    },
    AppointmentBooked {
        id: Ulid,
        staff_id: Ulid,
        service_id: Ulid,
        span: Span,
        customer_id: Ulid,
        new_customer: Option<Customer>,
        consumed_reservation: Option<Ulid>,
    },
    AppointmentStatusChanged {
        id: Ulid,
        staff_id: Ulid,
        status: AppointmentStatus,
    },
    AppointmentDeleted {
        id: Ulid,
        staff_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub services: Vec<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentInfo {
    pub id: Ulid,
    pub staff_id: Ulid,
    pub service_id: Ulid,
    pub customer_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub status: AppointmentStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationInfo {
    pub id: Ulid,
    pub staff_id: Ulid,
    pub session_id: String,
    pub start: Ms,
    pub end: Ms,
    pub expires_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeOffInfo {
    pub id: Ulid,
    pub staff_id: Option<Ulid>,
    pub date: NaiveDate,
    pub start_min: u16,
    pub end_min: u16,
    pub reason: Option<String>,
}

/// Answer of a day availability read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayAvailability {
    /// Ordered bookable `[start, start + duration)` slots.
    Slots(Vec<Span>),
    /// The staff member cannot perform every requested service.
    SplitRequired,
}

impl DayAvailability {
    pub fn slots(&self) -> &[Span] {
        match self {
            DayAvailability::Slots(slots) => slots,
            DayAvailability::SplitRequired => &[],
        }
    }
}
