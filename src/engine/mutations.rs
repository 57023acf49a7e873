use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{
    BOOKINGS_TOTAL, RESERVATIONS_REAPED_TOTAL, RESERVATIONS_TOTAL, outcome_label,
};

use super::conflict::{
    check_no_conflict, validate_date, validate_hours, validate_lead_time, validate_name,
    validate_span, validate_time_off,
};
use super::customers::CustomerDetails;
use super::{Engine, EngineError};

type StaffWriteGuard = OwnedRwLockWriteGuard<StaffState>;

/// Input of the booking transaction.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub id: Ulid,
    pub staff_id: Ulid,
    pub service_id: Ulid,
    pub span: Span,
    pub customer: CustomerDetails,
    /// Checkout session whose reservation this booking completes, if any.
    pub session_id: Option<String>,
}

fn check_timeline_room(rs: &StaffState) -> Result<(), EngineError> {
    if rs.timeline.len() >= MAX_INTERVALS_PER_STAFF {
        return Err(EngineError::LimitExceeded("too many intervals on staff"));
    }
    Ok(())
}

fn validate_session(session_id: &str) -> Result<(), EngineError> {
    if session_id.trim().is_empty() {
        return Err(EngineError::invalid("session id must not be empty"));
    }
    if session_id.len() > MAX_SESSION_ID_LEN {
        return Err(EngineError::LimitExceeded("session id too long"));
    }
    Ok(())
}

impl Engine {
    // ── Catalog ──────────────────────────────────────────────────

    pub async fn upsert_service(&self, service: Service) -> Result<(), EngineError> {
        validate_name(&service.name, "service name")?;
        if service.duration_min == 0 {
            return Err(EngineError::invalid("service duration must be positive"));
        }
        if service.duration_min > MAX_DURATION_MIN {
            return Err(EngineError::LimitExceeded("service longer than a day"));
        }
        let _catalog = self.catalog_lock.lock().await;
        if !self.services.contains_key(&service.id) && self.services.len() >= MAX_SERVICES {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        let event = Event::ServiceUpserted { service };
        self.persist(&event).await?;
        self.apply_catalog(&event);
        Ok(())
    }

    // ── Roster ───────────────────────────────────────────────────

    pub async fn create_staff(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        if let Some(n) = &name {
            validate_name(n, "staff name")?;
        }
        let _catalog = self.catalog_lock.lock().await;
        if self.staff.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.staff.len() >= MAX_STAFF {
            return Err(EngineError::LimitExceeded("too many staff"));
        }
        let event = Event::StaffCreated { id, name: name.clone() };
        self.persist(&event).await?;
        self.staff.insert(id, Arc::new(RwLock::new(StaffState::new(id, name))));
        info!(staff_id = %id, "staff created");
        Ok(())
    }

    /// Refused while the staff member still has a pending or confirmed appointment.
    pub async fn remove_staff(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let guard = self.lock_staff(id).await?;
        if guard.has_busy_appointments() {
            return Err(EngineError::invalid(format!("staff {id} still has active appointments")));
        }
        let event = Event::StaffRemoved { id };
        self.persist(&event).await?;
        self.staff.remove(&id);
        self.forget_all(&guard);
        info!(staff_id = %id, "staff removed");
        Ok(())
    }

    /// Returns `false` when the service was already assigned.
    pub async fn assign_service(&self, staff_id: Ulid, service_id: Ulid) -> Result<bool, EngineError> {
        if !self.services.contains_key(&service_id) {
            return Err(EngineError::not_found("service", service_id));
        }
        let mut guard = self.lock_staff(staff_id).await?;
        if guard.services.contains(&service_id) {
            return Ok(false);
        }
        let event = Event::StaffServiceAssigned { staff_id, service_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Returns `false` when the service was not assigned.
    pub async fn unassign_service(&self, staff_id: Ulid, service_id: Ulid) -> Result<bool, EngineError> {
        let mut guard = self.lock_staff(staff_id).await?;
        if !guard.services.contains(&service_id) {
            return Ok(false);
        }
        let event = Event::StaffServiceUnassigned { staff_id, service_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Replace the row for `hours.weekday`.
    pub async fn set_working_hours(&self, staff_id: Ulid, hours: WorkingHours) -> Result<(), EngineError> {
        validate_hours(&hours)?;
        let mut guard = self.lock_staff(staff_id).await?;
        let event = Event::WorkingHoursSet { staff_id, hours };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Time-off ─────────────────────────────────────────────────

    /// `staff_id = None` blocks every staff member.
    pub async fn add_time_off(
        &self,
        id: Ulid,
        staff_id: Option<Ulid>,
        date: NaiveDate,
        start_min: u16,
        end_min: u16,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        validate_time_off(start_min, end_min)?;
        validate_date(&self.policy.zone, date)?;
        if reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
            return Err(EngineError::LimitExceeded("time-off reason too long"));
        }
        if self.staff_for_entity(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = Event::TimeOffAdded { id, staff_id, date, start_min, end_min, reason };
        match staff_id {
            Some(staff_id) => {
                let mut guard = self.lock_staff(staff_id).await?;
                check_timeline_room(&guard)?;
                self.persist_new_entity(&mut guard, id, &event).await
            }
            None => {
                let mut org = self.org_time_off.write().await;
                if org.get(id).is_some() {
                    return Err(EngineError::AlreadyExists(id));
                }
                if org.len() >= MAX_INTERVALS_PER_STAFF {
                    return Err(EngineError::LimitExceeded("too many organisation time-off entries"));
                }
                self.persist(&event).await?;
                self.apply_org(&mut org, &event);
                Ok(())
            }
        }
    }

    pub async fn remove_time_off(&self, id: Ulid) -> Result<(), EngineError> {
        if self.staff_for_entity(&id).is_some() {
            let mut guard = self.lock_owner(id).await?;
            if !matches!(guard.timeline.get(id).map(|i| &i.kind), Some(IntervalKind::TimeOff { .. })) {
                return Err(EngineError::not_found("time-off", id));
            }
            let event = Event::TimeOffRemoved { id, staff_id: Some(guard.id) };
            return self.persist_and_apply(&mut guard, &event).await;
        }
        let mut org = self.org_time_off.write().await;
        if org.get(id).is_none() {
            return Err(EngineError::not_found("time-off", id));
        }
        let event = Event::TimeOffRemoved { id, staff_id: None };
        self.persist(&event).await?;
        self.apply_org(&mut org, &event);
        Ok(())
    }

    // ── Temporary reservations ───────────────────────────────────

    /// Place or renew the single hold of `session_id`.
    ///
    /// Expired reservations on the staff member are purged in the same event.
    /// Lapsed holds on other staff are left to lazy expiry and the reaper, since
    /// purging them would need their locks too. A live reservation of another session, or a busy appointment, overlapping
    /// `span` fails with `SlotTaken`. If the session currently holds a slot with
    /// a different staff member, the hold moves and both staff are locked in id order.
    pub async fn reserve(&self, staff_id: Ulid, span: Span, session_id: &str) -> Result<ReservationInfo, EngineError> {
        let result = self.reserve_inner(staff_id, span, session_id).await;
        let outcome: &'static str = match &result {
            Ok((_, label)) => *label,
            Err(_) => outcome_label(&result, "placed"),
        };
        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
        match &result {
            Ok((info, label)) => {
                debug!(%staff_id, session_id, reservation_id = %info.id, outcome = *label, "reservation placed")
            }
            Err(e) => debug!(%staff_id, session_id, error = %e, "reservation refused"),
        }
        result.map(|(info, _)| info)
    }

    async fn reserve_inner(
        &self,
        staff_id: Ulid,
        span: Span,
        session_id: &str,
    ) -> Result<(ReservationInfo, &'static str), EngineError> {
        validate_span(&span)?;
        validate_session(session_id)?;
        validate_lead_time(&span, self.now(), self.policy.lead_time)?;

        let (previous, moved_from, mut guard, mut other) = self.lock_for_session(staff_id, session_id).await?;
        check_timeline_room(&guard)?;

        let now = self.now();
        check_no_conflict(&guard, &span, now, self.policy.rest_buffer, Some(session_id))?;

        let id = previous.unwrap_or_else(Ulid::new);
        let expires_at = now + self.policy.reservation_ttl;
        let event = Event::ReservationPlaced {
            id,
            staff_id,
            span,
            session_id: session_id.to_string(),
            expires_at,
            purge_before: now,
            moved_from,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        if let Some(from) = other.as_mut() {
            self.apply_also(from, &event);
        }

        let label = match (previous, moved_from) {
            (None, _) => "placed",
            (Some(_), None) => "renewed",
            (Some(_), Some(_)) => "moved",
        };
        let info = ReservationInfo {
            id,
            staff_id,
            session_id: session_id.to_string(),
            start: span.start,
            end: span.end,
            expires_at,
        };
        Ok((info, label))
    }

    /// Lock `staff_id`, plus the staff member currently holding the session's
    /// reservation when that is someone else. Locks are taken in id order and
    /// the session mapping is re-read once they are held.
    async fn lock_for_session(
        &self,
        staff_id: Ulid,
        session_id: &str,
    ) -> Result<(Option<Ulid>, Option<Ulid>, StaffWriteGuard, Option<StaffWriteGuard>), EngineError> {
        for _ in 0..3 {
            let previous = self.reservation_for_session(session_id);
            let moved_from = previous
                .and_then(|rid| self.staff_for_entity(&rid))
                .filter(|owner| *owner != staff_id);
            let (guard, other) = match moved_from {
                None => (self.lock_staff(staff_id).await?, None),
                Some(from) if from < staff_id => {
                    let first = self.lock_staff(from).await?;
                    (self.lock_staff(staff_id).await?, Some(first))
                }
                Some(from) => {
                    let target = self.lock_staff(staff_id).await?;
                    (target, Some(self.lock_staff(from).await?))
                }
            };
            if self.reservation_for_session(session_id) == previous {
                return Ok((previous, moved_from, guard, other));
            }
            debug!(session_id, "session moved while locking, retrying");
        }
        Err(EngineError::LockTimeout(staff_id))
    }

    /// Abandon the session's hold. Returns the released reservation id.
    pub async fn release_reservation(&self, session_id: &str) -> Result<Ulid, EngineError> {
        let id = self
            .reservation_for_session(session_id)
            .ok_or_else(|| EngineError::not_found("reservation for session", session_id))?;
        let mut guard = self.lock_owner(id).await?;
        let event = Event::ReservationReleased { id, staff_id: guard.id };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!(session_id, reservation_id = %id, "reservation released");
        Ok(id)
    }

    /// `(reservation_id, staff_id)` of every reservation expired at `now`.
    /// Staff members currently being written are skipped until the next sweep.
    pub fn collect_expired_reservations(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.staff.iter() {
            if let Ok(guard) = entry.value().try_read() {
                expired.extend(
                    guard
                        .timeline
                        .iter()
                        .filter(|i| matches!(i.kind, IntervalKind::Reservation { expires_at, .. } if expires_at <= now))
                        .map(|i| (i.id, guard.id)),
                );
            }
        }
        expired
    }

    /// Release reservation `id` if it is still expired at `now`.
    ///
    /// A renewal keeps the reservation id, so the expiry is re-checked under the lock.
    pub async fn reap_reservation(&self, id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let mut guard = self.lock_owner(id).await?;
        let still_expired = matches!(
            guard.timeline.get(id).map(|i| &i.kind),
            Some(IntervalKind::Reservation { expires_at, .. }) if *expires_at <= now
        );
        if !still_expired {
            return Ok(false);
        }
        let event = Event::ReservationReleased { id, staff_id: guard.id };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(RESERVATIONS_REAPED_TOTAL).increment(1);
        Ok(true)
    }

    // ── Booking transaction ──────────────────────────────────────

    /// Validate, lock the staff member, re-check overlap, then commit a PENDING
    /// appointment and any new customer as one event, or fail with `SlotTaken`.
    ///
    /// Not idempotent: after a timeout, look the appointment up before retrying.
    pub async fn book_appointment(&self, req: BookingRequest) -> Result<AppointmentInfo, EngineError> {
        let staff_id = req.staff_id;
        let result = self.book_inner(req).await;
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome_label(&result, "booked")).increment(1);
        match &result {
            Ok(a) => info!(%staff_id, appointment_id = %a.id, start = a.start, end = a.end, "appointment booked"),
            Err(e @ EngineError::SlotTaken(_)) => debug!(%staff_id, error = %e, "booking lost the race"),
            Err(e) => debug!(%staff_id, error = %e, "booking rejected"),
        }
        result
    }

    async fn book_inner(&self, req: BookingRequest) -> Result<AppointmentInfo, EngineError> {
        // 1. validate
        validate_span(&req.span)?;
        validate_lead_time(&req.span, self.now(), self.policy.lead_time)?;
        if let Some(session) = &req.session_id {
            validate_session(session)?;
        }
        let service = self
            .get_service(&req.service_id)
            .ok_or_else(|| EngineError::not_found("service", req.service_id))?;
        if !service.active {
            return Err(EngineError::invalid(format!("service {} is not active", service.id)));
        }
        if self.staff_for_entity(&req.id).is_some() {
            return Err(EngineError::AlreadyExists(req.id));
        }

        // 2. lock
        let mut guard = self.lock_staff(req.staff_id).await?;
        if !guard.is_qualified_for(&[req.service_id]) {
            return Err(EngineError::invalid(format!(
                "staff {} does not offer service {}",
                req.staff_id, req.service_id
            )));
        }
        check_timeline_room(&guard)?;

        // 3. re-check overlap under the lock
        let now = self.now();
        let session = req.session_id.as_deref();
        check_no_conflict(&guard, &req.span, now, self.policy.rest_buffer, session)?;

        // 4. commit
        let mut resolved = self.customers.resolve(&req.customer)?;
        let mut _registering = None;
        if resolved.1.is_some() {
            _registering = Some(self.customer_lock.lock().await);
            // Another staff member's booking may have registered this contact meanwhile.
            resolved = self.customers.resolve(&req.customer)?;
        }
        let (customer_id, new_customer) = resolved;
        let consumed_reservation = session
            .and_then(|s| self.reservation_for_session(s))
            .filter(|rid| guard.timeline.get(*rid).is_some());
        let event = Event::AppointmentBooked {
            id: req.id,
            staff_id: req.staff_id,
            service_id: req.service_id,
            span: req.span,
            customer_id,
            new_customer,
            consumed_reservation,
        };
        self.persist_new_entity(&mut guard, req.id, &event).await?;

        Ok(AppointmentInfo {
            id: req.id,
            staff_id: req.staff_id,
            service_id: req.service_id,
            customer_id,
            start: req.span.start,
            end: req.span.end,
            status: AppointmentStatus::Pending,
        })
    }

    /// Any transition is allowed. Moving back to a busy status re-checks overlap.
    pub async fn set_appointment_status(
        &self,
        id: Ulid,
        status: AppointmentStatus,
    ) -> Result<AppointmentInfo, EngineError> {
        let mut guard = self.lock_owner(id).await?;
        let Some(Interval {
            span,
            kind: IntervalKind::Appointment { service_id, customer_id, status: current },
            ..
        }) = guard.timeline.get(id).cloned()
        else {
            return Err(EngineError::not_found("appointment", id));
        };
        if status.is_busy() && !current.is_busy() {
            check_no_conflict(&guard, &span, self.now(), self.policy.rest_buffer, None)?;
        }
        let staff_id = guard.id;
        let event = Event::AppointmentStatusChanged { id, staff_id, status };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(%staff_id, appointment_id = %id, from = %current, to = %status, "appointment status changed");
        Ok(AppointmentInfo {
            id,
            staff_id,
            service_id,
            customer_id,
            start: span.start,
            end: span.end,
            status,
        })
    }

    /// Hard delete. Cancelling is [`Engine::set_appointment_status`] with `Canceled`.
    pub async fn delete_appointment(&self, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.lock_owner(id).await?;
        if !matches!(guard.timeline.get(id).map(|i| &i.kind), Some(IntervalKind::Appointment { .. })) {
            return Err(EngineError::not_found("appointment", id));
        }
        let event = Event::AppointmentDeleted { id, staff_id: guard.id };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(staff_id = %guard.id, appointment_id = %id, "appointment deleted");
        Ok(())
    }

    // ── WAL maintenance ──────────────────────────────────────────

    /// Rewrite the WAL as the minimal event list for the current state.
    ///
    /// Holds the catalog lock and read locks on every staff member (in id
    /// order) until the new log is in place, so no write slips in between
    /// the snapshot and the swap. Expired reservations are left out.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let org = self.org_time_off.read().await;

        let mut handles: Vec<(Ulid, Arc<RwLock<StaffState>>)> =
            self.staff.iter().map(|e| (*e.key(), e.value().clone())).collect();
        handles.sort_by_key(|(id, _)| *id);
        let mut guards: Vec<OwnedRwLockReadGuard<StaffState>> = Vec::with_capacity(handles.len());
        for (_, rs) in handles {
            guards.push(rs.read_owned().await);
        }

        let now = self.now();
        let mut events: Vec<Event> = self
            .list_services()
            .into_iter()
            .map(|service| Event::ServiceUpserted { service })
            .collect();
        events.extend(self.customers.all().into_iter().map(|customer| Event::CustomerRegistered { customer }));
        events.extend(org.iter().filter_map(|i| time_off_event(i, None)));
        for rs in &guards {
            snapshot_staff(rs, now, &mut events);
        }

        let count = events.len();
        self.wal
            .compact(events)
            .await
            .map_err(|e| EngineError::Store(e.to_string()))?;
        info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }
}

fn time_off_event(i: &Interval, staff_id: Option<Ulid>) -> Option<Event> {
    match &i.kind {
        IntervalKind::TimeOff { date, start_min, end_min, reason } => Some(Event::TimeOffAdded {
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

/// Events that recreate one staff member from scratch.
fn snapshot_staff(rs: &StaffState, now: Ms, events: &mut Vec<Event>) {
    let staff_id = rs.id;
    events.push(Event::StaffCreated { id: staff_id, name: rs.name.clone() });
    events.extend(
        rs.services
            .iter()
            .map(|&service_id| Event::StaffServiceAssigned { staff_id, service_id }),
    );
    events.extend(
        rs.working_hours
            .iter()
            .flatten()
            .map(|&hours| Event::WorkingHoursSet { staff_id, hours }),
    );
    for interval in rs.timeline.iter() {
        match &interval.kind {
            IntervalKind::TimeOff { .. } => events.extend(time_off_event(interval, Some(staff_id))),
            IntervalKind::Reservation { session_id, expires_at } if *expires_at > now => {
                events.push(Event::ReservationPlaced {
                    id: interval.id,
                    staff_id,
                    span: interval.span,
                    session_id: session_id.clone(),
                    expires_at: *expires_at,
                    purge_before: now,
                    moved_from: None,
                });
            }
            IntervalKind::Reservation { .. } => {}
            IntervalKind::Appointment { service_id, customer_id, status } => {
                events.push(Event::AppointmentBooked {
                    id: interval.id,
                    staff_id,
                    service_id: *service_id,
                    span: interval.span,
                    customer_id: *customer_id,
                    new_customer: None,
                    consumed_reservation: None,
                });
                if *status != AppointmentStatus::Pending {
                    events.push(Event::AppointmentStatusChanged {
                        id: interval.id,
                        staff_id,
                        status: *status,
                    });
                }
            }
        }
    }
}
