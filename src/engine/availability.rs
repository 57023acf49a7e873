use chrono::NaiveDate;

use crate::clock::OrgZone;
use crate::model::*;

use super::algebra::{normalize, subtract_intervals, union};
use super::slots::SlotGrid;

// ── Day availability (pure, no locking, no I/O) ───────────────────

/// Everything needed to compute one day's slots for one staff member.
#[derive(Debug, Clone, Copy)]
pub struct DayQuery {
    pub day: Span,
    /// `None` when the staff member does not work that weekday.
    pub working: Option<Span>,
    pub grid: SlotGrid,
    pub rest_buffer: Ms,
}

/// The working window for `date`, or `None` for a missing or closed row.
pub fn working_window(zone: &OrgZone, staff: &StaffState, date: NaiveDate) -> Option<Span> {
    let row = staff.hours_for(OrgZone::weekday(date))?;
    if !row.is_open() {
        return None;
    }
    Span::try_new(
        zone.wall_to_ms(date, u32::from(row.start_min)),
        zone.wall_to_ms(date, u32::from(row.end_min)),
    )
}

/// Busy windows on `timeline` that touch `day`, as plain spans.
///
/// Appointments and live reservations are extended by `rest_buffer`;
/// canceled/done appointments and expired reservations are skipped.
pub fn busy_windows(timeline: &Timeline, day: &Span, now: Ms, rest_buffer: Ms) -> Vec<Span> {
    // Reach back far enough to catch a buffer spilling over the day start.
    let search = Span::new(day.start - rest_buffer.max(0), day.end);
    timeline
        .overlapping(&search)
        .filter(|i| i.is_busy(now))
        .map(|i| {
            if i.is_allocation() {
                i.span.extend_end(rest_buffer)
            } else {
                i.span
            }
        })
        .collect()
}

/// Working window minus every busy span, inside `day`.
pub fn free_windows(working: &Span, day: &Span, busy: &[Span]) -> Vec<Span> {
    let allowed = normalize(std::slice::from_ref(working), day);
    let blocked = union(&normalize(busy, day));
    subtract_intervals(&allowed, &blocked)
}

/// Bookable slots for one staff member on one day.
///
/// `inherited_blocking` carries organisation-wide time-off, already as spans.
pub fn day_slots(staff: &StaffState, query: &DayQuery, inherited_blocking: &[Span], now: Ms) -> Vec<Span> {
    let Some(working) = query.working else {
        return Vec::new();
    };
    let mut busy = busy_windows(&staff.timeline, &query.day, now, query.rest_buffer);
    busy.extend_from_slice(inherited_blocking);
    let free = free_windows(&working, &query.day, &busy);
    query.grid.slots(&free)
}
