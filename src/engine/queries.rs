use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{availability, pooled_availability};
use super::conflict::{self, query_window};
use super::{Engine, EngineError};

impl Engine {
    pub async fn list_vehicles(&self, include_retired: bool) -> Vec<VehicleInfo> {
        let mut out = Vec::new();
        for vs in self.vehicle_handles() {
            let guard = vs.read().await;
            if include_retired || !guard.is_retired() {
                out.push(guard.info());
            }
        }
        out.sort_by_key(|v| v.id);
        out
    }

    pub async fn vehicle_info(&self, id: Ulid) -> Result<VehicleInfo, EngineError> {
        let vs = self.get_vehicle(&id).ok_or(EngineError::NotFound(id))?;
        let guard = vs.read().await;
        Ok(guard.info())
    }

    pub fn list_customers(&self, include_deleted: bool) -> Vec<Customer> {
        let mut out: Vec<Customer> = self
            .customers
            .iter()
            .filter(|c| include_deleted || c.deleted_at.is_none())
            .map(|c| c.value().clone())
            .collect();
        out.sort_by_key(|c| c.id);
        out
    }

    pub fn get_customer(&self, id: Ulid) -> Result<Customer, EngineError> {
        self.customers
            .get(&id)
            .map(|c| c.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    /// Reservations ordered by start. Placeholders are included unless the
    /// filter names a vehicle.
    pub async fn list_reservations(&self, filter: ReservationFilter) -> Vec<Reservation> {
        let keep = |r: &Reservation| {
            (filter.include_deleted || r.deleted_at.is_none())
                && filter.customer_id.is_none_or(|c| r.customer_id == Some(c))
        };

        let handles: Vec<_> = match filter.vehicle_id {
            Some(vid) => self.get_vehicle(&vid).into_iter().collect(),
            None => self.vehicle_handles(),
        };
        let mut out = Vec::new();
        for vs in handles {
            let guard = vs.read().await;
            out.extend(guard.reservations.iter().filter(|&r| keep(r)).cloned());
        }
        if filter.vehicle_id.is_none() {
            out.extend(
                self.placeholders
                    .iter()
                    .filter(|r| keep(r.value()))
                    .map(|r| r.value().clone()),
            );
        }
        out.sort_by_key(|r| (r.span.start, r.id));
        out
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        if let Some(vid) = self.get_vehicle_for_reservation(&id)
            && let Some(vs) = self.get_vehicle(&vid)
        {
            let guard = vs.read().await;
            if let Some(r) = guard.reservation(&id) {
                return Ok(r.clone());
            }
        }
        self.placeholders
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    /// Open TBD spares: active replacements with no vehicle yet.
    pub fn list_placeholders(&self) -> Vec<Reservation> {
        let mut out: Vec<Reservation> = self
            .placeholders
            .iter()
            .filter(|r| r.is_active())
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|r| (r.span.start, r.id));
        out
    }

    /// Vehicles that could take replacement `reservation_id`: not retired, not
    /// under a manual status, not the vehicle in maintenance, and free for the
    /// replacement's whole period.
    pub async fn spare_candidates(&self, reservation_id: Ulid) -> Result<Vec<VehicleInfo>, EngineError> {
        let r = self.get_reservation(reservation_id).await?;
        if r.kind != ReservationType::Replacement {
            return Err(EngineError::InvalidStatus("not a replacement reservation"));
        }
        let blocked = r.covers.and_then(|block| self.get_vehicle_for_reservation(&block));

        let mut out = Vec::new();
        for vs in self.vehicle_handles() {
            let guard = vs.read().await;
            if guard.is_retired()
                || guard.status.is_manual()
                || Some(guard.id) == blocked
                || Some(guard.id) == r.vehicle_id
            {
                continue;
            }
            if conflict::find_conflicts(&guard, &r.span, r.kind, Some(r.id))
                .next()
                .is_none()
            {
                out.push(guard.info());
            }
        }
        out.sort_by(|a, b| a.details.license_plate.cmp(&b.details.license_plate));
        Ok(out)
    }

    /// Active reservations on the vehicle that a new reservation of `kind`
    /// over `[start, end)` would collide with. `end: None` is open-ended.
    pub async fn find_conflicts(
        &self,
        vehicle_id: Ulid,
        start: Ms,
        end: Option<Ms>,
        kind: ReservationType,
    ) -> Result<Vec<Reservation>, EngineError> {
        let span = conflict::reservation_span(Some(start), end)?;
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let guard = vs.read().await;
        Ok(conflict::find_conflicts(&guard, &span, kind, None)
            .cloned()
            .collect())
    }

    pub async fn compute_availability(
        &self,
        vehicle_id: Ulid,
        query_start: Ms,
        query_end: Ms,
        kind: ReservationType,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let query = query_window(query_start, query_end)?;
        let vs = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let guard = vs.read().await;

        let mut free = availability(&guard, &query, kind);
        if let Some(min_dur) = min_duration_ms {
            free.retain(|span| span.duration_ms() >= min_dur);
        }
        Ok(free)
    }

    /// Time ranges in which at least `min_available` vehicles are free at once.
    pub async fn fleet_availability(
        &self,
        query_start: Ms,
        query_end: Ms,
        min_available: usize,
        kind: ReservationType,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let query = query_window(query_start, query_end)?;
        if min_available == 0 {
            return Ok(Vec::new());
        }

        let mut per_vehicle = Vec::new();
        for vs in self.vehicle_handles() {
            let guard = vs.read().await;
            if guard.is_retired() {
                continue;
            }
            per_vehicle.push(availability(&guard, &query, kind));
        }

        let mut pooled = pooled_availability(&per_vehicle, min_available);
        if let Some(min_dur) = min_duration_ms {
            pooled.retain(|span| span.duration_ms() >= min_dur);
        }
        Ok(pooled)
    }

    /// Vehicles free for the entire window.
    pub async fn available_vehicles(
        &self,
        query_start: Ms,
        query_end: Ms,
        kind: ReservationType,
    ) -> Result<Vec<VehicleInfo>, EngineError> {
        let query = query_window(query_start, query_end)?;
        let mut out = Vec::new();
        for vs in self.vehicle_handles() {
            let guard = vs.read().await;
            if availability(&guard, &query, kind) == [query] {
                out.push(guard.info());
            }
        }
        out.sort_by(|a, b| a.details.license_plate.cmp(&b.details.license_plate));
        Ok(out)
    }

    /// Every non-deleted, non-cancelled reservation overlapping the window.
    /// Open placeholders appear under plate `TBD` when no vehicle is named.
    pub async fn calendar(
        &self,
        query_start: Ms,
        query_end: Ms,
        vehicle_id: Option<Ulid>,
    ) -> Result<Vec<CalendarEntry>, EngineError> {
        let query = query_window(query_start, query_end)?;
        let shown = |r: &Reservation| {
            r.deleted_at.is_none() && r.status != ReservationStatus::Cancelled
        };

        let handles = match vehicle_id {
            Some(vid) => vec![self.get_vehicle(&vid).ok_or(EngineError::NotFound(vid))?],
            None => self.vehicle_handles(),
        };
        let mut out = Vec::new();
        for vs in handles {
            let guard = vs.read().await;
            out.extend(
                guard
                    .overlapping(&query)
                    .filter(|&r| shown(r))
                    .map(|r| CalendarEntry {
                        reservation: r.clone(),
                        license_plate: guard.details.license_plate.clone(),
                    }),
            );
        }
        if vehicle_id.is_none() {
            out.extend(
                self.placeholders
                    .iter()
                    .filter(|r| shown(r.value()) && r.span.overlaps(&query))
                    .map(|r| CalendarEntry {
                        reservation: r.value().clone(),
                        license_plate: "TBD".to_string(),
                    }),
            );
        }
        out.sort_by(|a, b| {
            a.reservation
                .span
                .start
                .cmp(&b.reservation.span.start)
                .then_with(|| a.license_plate.cmp(&b.license_plate))
        });
        Ok(out)
    }

    /// APK and warranty dates of non-retired vehicles falling before
    /// `now + horizon_days`. Expired warranties are reported for one horizon
    /// after the fact; overdue APKs until the date is updated.
    pub async fn reminders(&self, now: Ms, horizon_days: u32) -> Result<Vec<Reminder>, EngineError> {
        if horizon_days > MAX_REMINDER_HORIZON_DAYS {
            return Err(EngineError::LimitExceeded("reminder horizon too long"));
        }
        let horizon = horizon_days as Ms * DAY_MS;
        let until = now.saturating_add(horizon);

        let mut out = Vec::new();
        for vs in self.vehicle_handles() {
            let guard = vs.read().await;
            if guard.is_retired() {
                continue;
            }
            let reminder = |kind, due| Reminder {
                vehicle_id: guard.id,
                license_plate: guard.details.license_plate.clone(),
                kind,
                due,
            };
            if let Some(apk) = guard.details.apk_date {
                if apk < now {
                    out.push(reminder(ReminderKind::ApkOverdue, apk));
                } else if apk < until {
                    out.push(reminder(ReminderKind::ApkDue, apk));
                }
            }
            if let Some(warranty) = guard.details.warranty_end {
                if warranty < now && warranty >= now.saturating_sub(horizon) {
                    out.push(reminder(ReminderKind::WarrantyExpired, warranty));
                } else if warranty >= now && warranty < until {
                    out.push(reminder(ReminderKind::WarrantyExpiring, warranty));
                }
            }
        }
        out.sort_by(|a, b| a.due.cmp(&b.due).then_with(|| a.license_plate.cmp(&b.license_plate)));
        Ok(out)
    }

    pub fn list_expenses(&self, vehicle_id: Option<Ulid>) -> Vec<Expense> {
        let mut out: Vec<Expense> = self
            .expenses
            .iter()
            .filter(|e| vehicle_id.is_none_or(|v| e.vehicle_id == v))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|e| (e.incurred_at, e.id));
        out
    }
}
