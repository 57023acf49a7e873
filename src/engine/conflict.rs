use chrono::NaiveDate;
use ulid::Ulid;

use crate::clock::OrgZone;
use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.end <= span.start {
        return Err(EngineError::invalid(format!(
            "interval end {} must be after start {}",
            span.end, span.start
        )));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("interval too long"));
    }
    Ok(())
}

/// The whole local day of `date` must fall inside the storable timestamp range.
pub(crate) fn validate_date(zone: &OrgZone, date: NaiveDate) -> Result<(), EngineError> {
    if !zone.day_in_range(date, MIN_VALID_TIMESTAMP_MS, MAX_VALID_TIMESTAMP_MS) {
        return Err(EngineError::invalid(format!("date {date} is outside the supported range")));
    }
    Ok(())
}

/// A commit or reservation may not start sooner than `now + lead_time`.
pub(crate) fn validate_lead_time(span: &Span, now: Ms, lead_time: Ms) -> Result<(), EngineError> {
    let earliest = now + lead_time.max(0);
    if span.start < earliest {
        return Err(EngineError::invalid(format!(
            "start {} is before the earliest bookable instant {earliest}",
            span.start
        )));
    }
    Ok(())
}

pub(crate) fn validate_duration_min(duration_min: i64) -> Result<u32, EngineError> {
    if duration_min <= 0 {
        return Err(EngineError::invalid(format!("duration must be positive, got {duration_min}")));
    }
    u32::try_from(duration_min)
        .ok()
        .filter(|d| *d <= MAX_DURATION_MIN)
        .ok_or(EngineError::LimitExceeded("duration longer than a day"))
}

fn validate_minutes(start_min: u16, end_min: u16) -> Result<(), EngineError> {
    if start_min > 1440 || end_min > 1440 {
        return Err(EngineError::invalid("minutes must be within [0, 1440]"));
    }
    Ok(())
}

pub(crate) fn validate_hours(row: &WorkingHours) -> Result<(), EngineError> {
    if row.weekday > 6 {
        return Err(EngineError::invalid(format!("weekday {} not in 0..=6", row.weekday)));
    }
    validate_minutes(row.start_min, row.end_min)?;
    if !row.closed && row.start_min > row.end_min {
        return Err(EngineError::invalid("working hours start after they end"));
    }
    Ok(())
}

pub(crate) fn validate_time_off(start_min: u16, end_min: u16) -> Result<(), EngineError> {
    validate_minutes(start_min, end_min)?;
    if start_min >= end_min {
        return Err(EngineError::invalid("time-off must end after it starts"));
    }
    Ok(())
}

pub(crate) fn validate_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::invalid(format!("{what} must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

/// First interval that makes `candidate` unbookable, if any.
///
/// Busy appointments always count. Live reservations count unless they belong
/// to `own_session`. Existing allocations are extended by `rest_buffer` before
/// the strict overlap test; time-off is not considered here.
pub(crate) fn find_conflict(
    staff: &StaffState,
    candidate: &Span,
    now: Ms,
    rest_buffer: Ms,
    own_session: Option<&str>,
) -> Option<Ulid> {
    let search = Span::new(candidate.start - rest_buffer.max(0), candidate.end);
    staff
        .timeline
        .overlapping(&search)
        .filter(|i| i.is_allocation() && i.is_busy(now))
        .filter(|i| match (i.session_id(), own_session) {
            (Some(theirs), Some(ours)) => theirs != ours,
            _ => true,
        })
        .find(|i| i.span.extend_end(rest_buffer).overlaps(candidate))
        .map(|i| i.id)
}

pub(crate) fn check_no_conflict(
    staff: &StaffState,
    candidate: &Span,
    now: Ms,
    rest_buffer: Ms,
    own_session: Option<&str>,
) -> Result<(), EngineError> {
    match find_conflict(staff, candidate, now, rest_buffer, own_session) {
        Some(id) => Err(EngineError::SlotTaken(id)),
        None => Ok(()),
    }
}
