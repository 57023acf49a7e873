mod algebra;
mod availability;
mod conflict;
mod customers;
mod error;
mod mutations;
mod queries;
mod slots;

pub use algebra::{merge_overlapping, normalize, subtract_intervals, union};
pub use availability::{DayQuery, busy_windows, day_slots, free_windows, working_window};
pub use customers::{CustomerBook, CustomerDetails, normalize_email, normalize_phone};
pub use error::EngineError;
pub use mutations::BookingRequest;
pub use queries::{Demand, MonthAvailability};
pub use slots::{SlotGrid, conflicts_with};

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::clock::{Clock, OrgZone};
use crate::config::Policy;
use crate::model::*;
use crate::observability::LOCK_WAIT_SECONDS;
use crate::wal::{Wal, WalHandle};

pub type SharedStaffState = Arc<RwLock<StaffState>>;

/// Reverse lookups kept in step with the staff timelines.
#[derive(Debug, Default)]
pub(super) struct Indexes {
    /// Interval id → owning staff id. Organisation-wide time-off is not listed.
    entity_to_staff: DashMap<Ulid, Ulid>,
    /// Session id → its reservation id. At most one per session.
    sessions: DashMap<String, Ulid>,
}

impl Indexes {
    /// Reserve `id` for `staff_id` ahead of its WAL append.
    ///
    /// The up-front duplicate check runs before any staff lock, so two writers
    /// on different staff members can both pass it; only one wins here.
    fn claim(&self, id: Ulid, staff_id: Ulid) -> Result<(), EngineError> {
        match self.entity_to_staff.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(staff_id);
                Ok(())
            }
        }
    }

    /// Undo a [`Indexes::claim`] whose event was never written.
    fn unclaim(&self, id: Ulid, staff_id: Ulid) {
        self.entity_to_staff.remove_if(&id, |_, owner| *owner == staff_id);
    }

    fn remember(&self, staff_id: Ulid, interval: &Interval) {
        self.entity_to_staff.insert(interval.id, staff_id);
        if let Some(session) = interval.session_id() {
            self.sessions.insert(session.to_string(), interval.id);
        }
    }

    fn forget(&self, interval: &Interval) {
        self.entity_to_staff.remove(&interval.id);
        if let Some(session) = interval.session_id() {
            self.sessions.remove_if(session, |_, id| *id == interval.id);
        }
    }
}

pub(super) fn time_off_interval(
    zone: &OrgZone,
    id: Ulid,
    date: NaiveDate,
    start_min: u16,
    end_min: u16,
    reason: Option<String>,
) -> Interval {
    let start = zone.wall_to_ms(date, u32::from(start_min));
    let end = zone.wall_to_ms(date, u32::from(end_min));
    Interval {
        id,
        // Both ends can land on the same instant inside a DST gap.
        span: Span { start, end: end.max(start) },
        kind: IntervalKind::TimeOff { date, start_min, end_min, reason },
    }
}

/// Apply an event to one staff member's state. Caller holds the write lock.
fn apply_to_staff(rs: &mut StaffState, event: &Event, index: &Indexes, zone: &OrgZone) {
    match event {
        Event::StaffServiceAssigned { service_id, .. } => {
            rs.services.insert(*service_id);
        }
        Event::StaffServiceUnassigned { service_id, .. } => {
            rs.services.remove(service_id);
        }
        Event::WorkingHoursSet { hours, .. } => {
            if let Some(row) = rs.working_hours.get_mut(usize::from(hours.weekday)) {
                *row = Some(*hours);
            }
        }
        Event::TimeOffAdded { id, date, start_min, end_min, reason, .. } => {
            let interval = time_off_interval(zone, *id, *date, *start_min, *end_min, reason.clone());
            index.remember(rs.id, &interval);
            rs.timeline.insert(interval);
        }
        Event::TimeOffRemoved { id, .. }
        | Event::ReservationReleased { id, .. }
        | Event::AppointmentDeleted { id, .. } => {
            if let Some(gone) = rs.timeline.remove(*id) {
                index.forget(&gone);
            }
        }
        Event::ReservationPlaced { id, staff_id, span, session_id, expires_at, purge_before, .. } => {
            if let Some(old) = rs.timeline.remove(*id) {
                index.forget(&old);
            }
            // The session moved away from this staff member.
            if rs.id != *staff_id {
                return;
            }
            for stale in rs.timeline.purge_reservations(*purge_before) {
                index.forget(&stale);
            }
            let interval = Interval {
                id: *id,
                span: *span,
                kind: IntervalKind::Reservation {
                    session_id: session_id.clone(),
                    expires_at: *expires_at,
                },
            };
            index.remember(rs.id, &interval);
            rs.timeline.insert(interval);
        }
        Event::AppointmentBooked {
            id,
            service_id,
            span,
            customer_id,
            consumed_reservation,
            ..
        } => {
            if let Some(hold) = consumed_reservation
                && let Some(gone) = rs.timeline.remove(*hold)
            {
                index.forget(&gone);
            }
            let interval = Interval {
                id: *id,
                span: *span,
                kind: IntervalKind::Appointment {
                    service_id: *service_id,
                    customer_id: *customer_id,
                    status: AppointmentStatus::Pending,
                },
            };
            index.remember(rs.id, &interval);
            rs.timeline.insert(interval);
        }
        Event::AppointmentStatusChanged { id, status, .. } => {
            if let Some(interval) = rs.timeline.get_mut(*id)
                && let IntervalKind::Appointment { status: current, .. } = &mut interval.kind
            {
                *current = *status;
            }
        }
        // Catalog-level events never reach a single staff member.
        Event::ServiceUpserted { .. }
        | Event::StaffCreated { .. }
        | Event::StaffRemoved { .. }
        | Event::CustomerRegistered { .. } => {}
    }
}

/// Organisation-wide time-off lives on its own timeline.
fn apply_to_org(timeline: &mut Timeline, event: &Event, zone: &OrgZone) {
    match event {
        Event::TimeOffAdded { id, date, start_min, end_min, reason, staff_id: None } => {
            timeline.insert(time_off_interval(zone, *id, *date, *start_min, *end_min, reason.clone()));
        }
        Event::TimeOffRemoved { id, staff_id: None } => {
            timeline.remove(*id);
        }
        _ => {}
    }
}

/// Staff members whose state an event touches, in lock order.
fn touched_staff(event: &Event) -> [Option<Ulid>; 2] {
    match event {
        Event::StaffServiceAssigned { staff_id, .. }
        | Event::StaffServiceUnassigned { staff_id, .. }
        | Event::WorkingHoursSet { staff_id, .. }
        | Event::ReservationReleased { staff_id, .. }
        | Event::AppointmentBooked { staff_id, .. }
        | Event::AppointmentStatusChanged { staff_id, .. }
        | Event::AppointmentDeleted { staff_id, .. } => [Some(*staff_id), None],
        Event::TimeOffAdded { staff_id, .. } | Event::TimeOffRemoved { staff_id, .. } => [*staff_id, None],
        Event::ReservationPlaced { staff_id, moved_from, .. } => {
            let mut pair = [Some(*staff_id), moved_from.filter(|from| from != staff_id)];
            pair.sort();
            pair
        }
        Event::ServiceUpserted { .. }
        | Event::StaffCreated { .. }
        | Event::StaffRemoved { .. }
        | Event::CustomerRegistered { .. } => [None, None],
    }
}

pub struct Engine {
    pub(super) staff: DashMap<Ulid, SharedStaffState>,
    pub(super) services: DashMap<Ulid, Service>,
    pub(super) customers: CustomerBook,
    pub(super) org_time_off: RwLock<Timeline>,
    pub(super) index: Indexes,
    /// Serialises catalog writes (services, staff create/remove) and compaction.
    pub(super) catalog_lock: Mutex<()>,
    /// Held while a booking registers a new customer. Always taken after the staff lock.
    pub(super) customer_lock: Mutex<()>,
    pub(super) wal: WalHandle,
    pub(super) policy: Policy,
    pub(super) clock: Arc<dyn Clock>,
}

impl Engine {
    /// Replay `wal_path` and start the WAL writer. Needs a Tokio runtime.
    pub fn new(wal_path: &Path, policy: Policy, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let (wal, events) = Wal::recover(wal_path)?;
        info!(path = %wal.path().display(), events = events.len(), "replaying WAL");

        let engine = Self {
            staff: DashMap::new(),
            services: DashMap::new(),
            customers: CustomerBook::default(),
            org_time_off: RwLock::new(Timeline::new()),
            index: Indexes::default(),
            catalog_lock: Mutex::new(()),
            customer_lock: Mutex::new(()),
            wal: WalHandle::spawn(wal),
            policy,
            clock,
        };
        for event in &events {
            engine.replay(event);
        }
        Ok(engine)
    }

    /// Nothing else holds a lock during replay, so every `try_*` succeeds.
    fn replay(&self, event: &Event) {
        self.apply_catalog(event);
        match event {
            Event::StaffCreated { id, name } => {
                let rs = StaffState::new(*id, name.clone());
                self.staff.insert(*id, Arc::new(RwLock::new(rs)));
            }
            Event::StaffRemoved { id } => {
                if let Some((_, rs)) = self.staff.remove(id)
                    && let Ok(guard) = rs.try_read()
                {
                    guard.timeline.iter().for_each(|i| self.index.forget(i));
                }
            }
            Event::TimeOffAdded { staff_id: None, .. } | Event::TimeOffRemoved { staff_id: None, .. } => {
                if let Ok(mut org) = self.org_time_off.try_write() {
                    apply_to_org(&mut org, event, &self.policy.zone);
                }
            }
            other => {
                for staff_id in touched_staff(other).into_iter().flatten() {
                    match self.get_staff(&staff_id).map(|rs| rs.try_write_owned()) {
                        Some(Ok(mut guard)) => {
                            apply_to_staff(&mut guard, other, &self.index, &self.policy.zone)
                        }
                        _ => debug!(%staff_id, "replay: event for removed staff skipped"),
                    }
                }
            }
        }
    }

    /// Records that live outside any staff timeline.
    fn apply_catalog(&self, event: &Event) {
        match event {
            Event::ServiceUpserted { service } => {
                self.services.insert(service.id, service.clone());
            }
            Event::CustomerRegistered { customer }
            | Event::AppointmentBooked { new_customer: Some(customer), .. } => {
                self.customers.insert(customer.clone());
            }
            _ => {}
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Durably append one event through the group-commit writer.
    pub(super) async fn persist(&self, event: &Event) -> Result<(), EngineError> {
        self.wal.append(event.clone()).await.map_err(|e| {
            warn!(error = %e, "WAL append failed");
            EngineError::Store(e.to_string())
        })
    }

    /// WAL-append, then apply to the locked staff member (and catalog side effects).
    pub(super) async fn persist_and_apply(&self, rs: &mut StaffState, event: &Event) -> Result<(), EngineError> {
        self.persist(event).await?;
        self.apply_catalog(event);
        apply_to_staff(rs, event, &self.index, &self.policy.zone);
        Ok(())
    }

    /// [`Engine::persist_and_apply`] for an event introducing entity `id`, which
    /// is claimed in the id index first and released again if the append fails.
    pub(super) async fn persist_new_entity(
        &self,
        rs: &mut StaffState,
        id: Ulid,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.index.claim(id, rs.id)?;
        let result = self.persist_and_apply(rs, event).await;
        if result.is_err() {
            self.index.unclaim(id, rs.id);
        }
        result
    }

    /// Apply an already persisted event to a second locked staff member.
    pub(super) fn apply_also(&self, rs: &mut StaffState, event: &Event) {
        apply_to_staff(rs, event, &self.index, &self.policy.zone);
    }

    pub(super) fn apply_org(&self, timeline: &mut Timeline, event: &Event) {
        apply_to_org(timeline, event, &self.policy.zone);
    }

    pub(super) fn forget_all(&self, rs: &StaffState) {
        rs.timeline.iter().for_each(|i| self.index.forget(i));
    }

    /// Exclusive access to one staff member, bounded by the configured lock timeout.
    ///
    /// Re-checks existence after acquiring: the staff member may have been
    /// removed while this call was queued.
    pub(super) async fn lock_staff(&self, staff_id: Ulid) -> Result<OwnedRwLockWriteGuard<StaffState>, EngineError> {
        let rs = self
            .get_staff(&staff_id)
            .ok_or_else(|| EngineError::not_found("staff", staff_id))?;
        let started = Instant::now();
        let guard = tokio::time::timeout(self.policy.lock_timeout, rs.write_owned())
            .await
            .map_err(|_| {
                warn!(%staff_id, "staff lock wait timed out");
                EngineError::LockTimeout(staff_id)
            })?;
        metrics::histogram!(LOCK_WAIT_SECONDS).record(started.elapsed().as_secs_f64());
        if !self.staff.contains_key(&staff_id) {
            return Err(EngineError::not_found("staff", staff_id));
        }
        Ok(guard)
    }

    /// Owning staff id and write lock for an appointment, reservation or time-off id.
    pub(super) async fn lock_owner(&self, entity_id: Ulid) -> Result<OwnedRwLockWriteGuard<StaffState>, EngineError> {
        let staff_id = self
            .staff_for_entity(&entity_id)
            .ok_or_else(|| EngineError::not_found("interval", entity_id))?;
        let guard = self.lock_staff(staff_id).await?;
        if guard.timeline.get(entity_id).is_none() {
            return Err(EngineError::not_found("interval", entity_id));
        }
        Ok(guard)
    }
}

#[cfg(test)]
mod index_tests {
    use super::*;

    #[test]
    fn touched_staff_orders_moves() {
        let (a, b) = (Ulid::from_parts(1, 0), Ulid::from_parts(2, 0));
        let event = Event::ReservationPlaced {
            id: Ulid::new(),
            staff_id: b,
            span: Span::new(0, 1),
            session_id: "s".into(),
            expires_at: 10,
            purge_before: 0,
            moved_from: Some(a),
        };
        assert_eq!(touched_staff(&event), [Some(a), Some(b)]);
    }

    #[test]
    fn forgetting_a_stale_reservation_keeps_newer_session_mapping() {
        let index = Indexes::default();
        let staff = Ulid::new();
        let older = Interval {
            id: Ulid::new(),
            span: Span::new(0, 10),
            kind: IntervalKind::Reservation { session_id: "s".into(), expires_at: 5 },
        };
        let newer = Interval { id: Ulid::new(), ..older.clone() };
        index.remember(staff, &older);
        index.remember(staff, &newer);
        index.forget(&older);
        assert_eq!(index.sessions.get("s").map(|e| *e), Some(newer.id));
        assert!(index.entity_to_staff.get(&older.id).is_none());
    }
}
