use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{DayQuery, day_slots, working_window};
use super::conflict::{validate_date, validate_duration_min};
use super::slots::SlotGrid;
use super::{Engine, EngineError, SharedStaffState};

/// What an availability read asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Demand {
    /// A bare duration in minutes.
    Minutes(i64),
    /// One or more services performed back to back; durations add up.
    Services(Vec<Ulid>),
}

/// Answer of a month availability read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonthAvailability {
    /// Slot count for every date of the month, past dates included as `0`.
    Counts(BTreeMap<NaiveDate, usize>),
    SplitRequired,
}

/// Demand resolved against the catalog.
struct Resolved {
    duration: Ms,
    services: Vec<Ulid>,
}

/// Every date of `year`-`month`, or a validation error for a bad month.
pub(crate) fn month_dates(year: i32, month: u32) -> Result<Vec<NaiveDate>, EngineError> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| EngineError::invalid(format!("invalid month {year}-{month:02}")))?;
    Ok(first.iter_days().take_while(|d| d.month() == month).collect())
}

impl Engine {
    pub fn get_staff(&self, id: &Ulid) -> Option<SharedStaffState> {
        self.staff.get(id).map(|e| e.value().clone())
    }

    pub fn get_service(&self, id: &Ulid) -> Option<Service> {
        self.services.get(id).map(|e| e.value().clone())
    }

    pub fn get_customer(&self, id: &Ulid) -> Option<Customer> {
        self.customers.get(id)
    }

    pub fn staff_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.index.entity_to_staff.get(entity_id).map(|e| *e.value())
    }

    pub fn reservation_for_session(&self, session_id: &str) -> Option<Ulid> {
        self.index.sessions.get(session_id).map(|e| *e.value())
    }

    /// Summed duration of `service_ids`. Rejects unknown or inactive services.
    pub fn services_duration(&self, service_ids: &[Ulid]) -> Result<Ms, EngineError> {
        if service_ids.is_empty() {
            return Err(EngineError::invalid("at least one service is required"));
        }
        if service_ids.len() > MAX_SERVICES_PER_QUERY {
            return Err(EngineError::LimitExceeded("too many services in one request"));
        }
        let mut total_min: i64 = 0;
        for id in service_ids {
            let service = self.get_service(id).ok_or_else(|| EngineError::not_found("service", id))?;
            if !service.active {
                return Err(EngineError::invalid(format!("service {id} is not active")));
            }
            total_min += i64::from(service.duration_min);
        }
        Ok(Ms::from(validate_duration_min(total_min)?) * MINUTE_MS)
    }

    fn resolve_demand(&self, demand: &Demand) -> Result<Resolved, EngineError> {
        match demand {
            Demand::Minutes(min) => Ok(Resolved {
                duration: Ms::from(validate_duration_min(*min)?) * MINUTE_MS,
                services: Vec::new(),
            }),
            Demand::Services(ids) => Ok(Resolved {
                duration: self.services_duration(ids)?,
                services: ids.clone(),
            }),
        }
    }

    /// Spans of organisation-wide time-off touching `range`.
    ///
    /// Taken before any staff lock, matching the order compaction locks in.
    async fn org_blocking(&self, range: &Span) -> Vec<Span> {
        let org = self.org_time_off.read().await;
        org.overlapping(range).map(|i| i.span).collect()
    }

    /// Slots for one already-locked staff member on `date`.
    ///
    /// `today_trim` is added to `now` for the lead-time cut-off when `date` is today.
    fn slots_on(
        &self,
        staff: &StaffState,
        org_blocking: &[Span],
        duration: Ms,
        date: NaiveDate,
        now: Ms,
        today_trim: Ms,
    ) -> Vec<Span> {
        let zone = &self.policy.zone;
        let today = zone.date_of(now);
        if date < today {
            return Vec::new();
        }
        let day = zone.day_span(date);
        let query = DayQuery {
            day,
            working: working_window(zone, staff, date),
            grid: SlotGrid {
                origin: day.start,
                duration,
                step: self.policy.slot_step.unwrap_or(duration),
                earliest: (date == today).then_some(now + today_trim.max(0)),
            },
            rest_buffer: self.policy.rest_buffer,
        };
        day_slots(staff, &query, org_blocking, now)
    }

    /// Bookable slots on `date` for `demand`.
    ///
    /// An unknown staff member reads as a closed calendar; a staff member not
    /// qualified for every requested service yields [`DayAvailability::SplitRequired`].
    pub async fn availability_for_day(
        &self,
        staff_id: Ulid,
        demand: &Demand,
        date: NaiveDate,
    ) -> Result<DayAvailability, EngineError> {
        let resolved = self.resolve_demand(demand)?;
        validate_date(&self.policy.zone, date)?;
        let day = self.policy.zone.day_span(date);
        let org = self.org_blocking(&day).await;
        let Some(rs) = self.get_staff(&staff_id) else {
            return Ok(DayAvailability::Slots(Vec::new()));
        };
        let guard = rs.read().await;
        if !guard.is_qualified_for(&resolved.services) {
            return Ok(DayAvailability::SplitRequired);
        }
        let now = self.now();
        let slots = self.slots_on(&guard, &org, resolved.duration, date, now, self.policy.lead_time);
        Ok(DayAvailability::Slots(slots))
    }

    /// Slot counts for every date of a month. Each day is computed independently;
    /// today uses the larger of the lead time and the today buffer.
    pub async fn availability_for_month(
        &self,
        staff_id: Ulid,
        demand: &Demand,
        year: i32,
        month: u32,
    ) -> Result<MonthAvailability, EngineError> {
        let resolved = self.resolve_demand(demand)?;
        let dates = month_dates(year, month)?;
        let mut counts: BTreeMap<NaiveDate, usize> = dates.iter().map(|d| (*d, 0)).collect();
        let (Some(first), Some(last)) = (dates.first(), dates.last()) else {
            return Ok(MonthAvailability::Counts(counts));
        };

        let zone = &self.policy.zone;
        validate_date(zone, *first)?;
        validate_date(zone, *last)?;
        let range = Span::new(zone.day_span(*first).start, zone.day_span(*last).end);
        let org = self.org_blocking(&range).await;
        let Some(rs) = self.get_staff(&staff_id) else {
            return Ok(MonthAvailability::Counts(counts));
        };
        let guard = rs.read().await;
        if !guard.is_qualified_for(&resolved.services) {
            return Ok(MonthAvailability::SplitRequired);
        }

        let now = self.now();
        let today = zone.date_of(now);
        let today_trim = self.policy.lead_time.max(self.policy.today_buffer);
        for date in dates.iter().filter(|d| **d >= today) {
            let n = self.slots_on(&guard, &org, resolved.duration, *date, now, today_trim).len();
            counts.insert(*date, n);
        }
        Ok(MonthAvailability::Counts(counts))
    }

    /// Day slots for a plain duration in minutes.
    pub async fn free_slots_for_day(
        &self,
        staff_id: Ulid,
        duration_min: i64,
        date: NaiveDate,
    ) -> Result<Vec<Span>, EngineError> {
        let answer = self
            .availability_for_day(staff_id, &Demand::Minutes(duration_min), date)
            .await?;
        Ok(answer.slots().to_vec())
    }

    /// Month slot counts for a plain duration in minutes.
    pub async fn free_slot_counts_for_month(
        &self,
        staff_id: Ulid,
        duration_min: i64,
        year: i32,
        month: u32,
    ) -> Result<BTreeMap<NaiveDate, usize>, EngineError> {
        match self
            .availability_for_month(staff_id, &Demand::Minutes(duration_min), year, month)
            .await?
        {
            MonthAvailability::Counts(counts) => Ok(counts),
            MonthAvailability::SplitRequired => Ok(BTreeMap::new()),
        }
    }

    // ── Listings ─────────────────────────────────────────────────

    pub fn list_services(&self) -> Vec<Service> {
        let mut out: Vec<Service> = self.services.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub async fn list_staff(&self) -> Vec<StaffInfo> {
        let handles: Vec<SharedStaffState> = self.staff.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(handles.len());
        for rs in handles {
            let guard = rs.read().await;
            out.push(StaffInfo {
                id: guard.id,
                name: guard.name.clone(),
                services: guard.services.iter().copied().collect(),
            });
        }
        out.sort_by_key(|s| s.id);
        out
    }

    pub async fn working_hours(&self, staff_id: Ulid) -> Result<Vec<WorkingHours>, EngineError> {
        let rs = self
            .get_staff(&staff_id)
            .ok_or_else(|| EngineError::not_found("staff", staff_id))?;
        let guard = rs.read().await;
        Ok(guard.working_hours.iter().flatten().copied().collect())
    }

    /// Appointments of one staff member in start order, optionally only those overlapping `within`.
    pub async fn list_appointments(
        &self,
        staff_id: Ulid,
        within: Option<Span>,
    ) -> Result<Vec<AppointmentInfo>, EngineError> {
        let rs = self
            .get_staff(&staff_id)
            .ok_or_else(|| EngineError::not_found("staff", staff_id))?;
        let guard = rs.read().await;
        let out = guard
            .timeline
            .iter()
            .filter(|i| within.is_none_or(|w| i.span.overlaps(&w)))
            .filter_map(|i| match &i.kind {
                IntervalKind::Appointment { service_id, customer_id, status } => Some(AppointmentInfo {
                    id: i.id,
                    staff_id,
                    service_id: *service_id,
                    customer_id: *customer_id,
                    start: i.span.start,
                    end: i.span.end,
                    status: *status,
                }),
                _ => None,
            })
            .collect();
        Ok(out)
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<AppointmentInfo, EngineError> {
        let staff_id = self
            .staff_for_entity(&id)
            .ok_or_else(|| EngineError::not_found("appointment", id))?;
        self.list_appointments(staff_id, None)
            .await?
            .into_iter()
            .find(|a| a.id == id)
            .ok_or_else(|| EngineError::not_found("appointment", id))
    }

    /// Live reservations only; expired ones are invisible even before the reaper runs.
    pub async fn list_reservations(&self, staff_id: Ulid) -> Result<Vec<ReservationInfo>, EngineError> {
        let rs = self
            .get_staff(&staff_id)
            .ok_or_else(|| EngineError::not_found("staff", staff_id))?;
        let guard = rs.read().await;
        let now = self.now();
        let out = guard
            .timeline
            .iter()
            .filter(|i| i.is_busy(now))
            .filter_map(|i| match &i.kind {
                IntervalKind::Reservation { session_id, expires_at } => Some(ReservationInfo {
                    id: i.id,
                    staff_id,
                    session_id: session_id.clone(),
                    start: i.span.start,
                    end: i.span.end,
                    expires_at: *expires_at,
                }),
                _ => None,
            })
            .collect();
        Ok(out)
    }

    /// Time-off of one staff member, or organisation-wide time-off for `None`.
    pub async fn list_time_off(&self, staff_id: Option<Ulid>) -> Result<Vec<TimeOffInfo>, EngineError> {
        fn info(staff_id: Option<Ulid>, i: &Interval) -> Option<TimeOffInfo> {
            match &i.kind {
                IntervalKind::TimeOff { date, start_min, end_min, reason } => Some(TimeOffInfo {
                    id: i.id,
                    staff_id,
                    date: *date,
                    start_min: *start_min,
                    end_min: *end_min,
                    reason: reason.clone(),
                }),
                _ => None,
            }
        }
        match staff_id {
            None => {
                let org = self.org_time_off.read().await;
                Ok(org.iter().filter_map(|i| info(None, i)).collect())
            }
            Some(id) => {
                let rs = self.get_staff(&id).ok_or_else(|| EngineError::not_found("staff", id))?;
                let guard = rs.read().await;
                Ok(guard.timeline.iter().filter_map(|i| info(Some(id), i)).collect())
            }
        }
    }
}
