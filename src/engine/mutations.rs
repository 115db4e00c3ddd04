use std::collections::{HashMap, HashSet};

use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, MutexGuard, OwnedRwLockWriteGuard};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, check_rentable, derive_status, now_ms, reservation_span};
use super::{plate_key, Engine, EngineError, WalCommand};

fn check_len(value: Option<&str>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

fn check_timestamp(value: Option<Ms>) -> Result<(), EngineError> {
    match value {
        Some(t) if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) => {
            Err(EngineError::LimitExceeded("timestamp out of range"))
        }
        _ => Ok(()),
    }
}

fn validate_vehicle_details(d: &VehicleDetails) -> Result<(), EngineError> {
    if plate_key(&d.license_plate).is_empty() {
        return Err(EngineError::MissingField("license_plate"));
    }
    check_len(Some(&d.license_plate), MAX_PLATE_LEN, "license plate too long")?;
    check_len(d.brand.as_deref(), MAX_NAME_LEN, "brand too long")?;
    check_len(d.model.as_deref(), MAX_NAME_LEN, "model too long")?;
    check_timestamp(d.apk_date)?;
    check_timestamp(d.warranty_end)
}

fn validate_customer_details(d: &CustomerDetails) -> Result<(), EngineError> {
    if d.name.trim().is_empty() {
        return Err(EngineError::MissingField("name"));
    }
    check_len(Some(&d.name), MAX_NAME_LEN, "customer name too long")?;
    check_len(d.email.as_deref(), MAX_NAME_LEN, "email too long")?;
    check_len(d.phone.as_deref(), MAX_NAME_LEN, "phone too long")
}

/// Apply defaults and field-level validation to a requested reservation.
/// Store lookups (customer, vehicle, contract, conflicts) happen later.
fn build_reservation(new: NewReservation) -> Result<Reservation, EngineError> {
    check_len(new.contract_number.as_deref(), MAX_CONTRACT_LEN, "contract number too long")?;
    check_len(new.notes.as_deref(), MAX_NOTES_LEN, "notes too long")?;
    check_len(new.maintenance_kind.as_deref(), MAX_NAME_LEN, "maintenance kind too long")?;
    if new
        .duration_days
        .is_some_and(|d| d == 0 || d > MAX_MAINTENANCE_DAYS)
    {
        return Err(EngineError::LimitExceeded("maintenance duration out of range"));
    }

    let is_block = new.kind == ReservationType::MaintenanceBlock;
    let end = match (new.end, new.start, new.duration_days) {
        (Some(end), _, _) => Some(end),
        (None, Some(start), Some(days)) if is_block => {
            Some(start.saturating_add(days as Ms * DAY_MS))
        }
        (None, _, _) if is_block => return Err(EngineError::MissingDates),
        (None, _, _) => None,
    };
    let span = reservation_span(new.start, end)?;

    let status = new.status.unwrap_or(ReservationStatus::Booked);
    if !status.is_active() {
        return Err(EngineError::InvalidStatus(
            "new reservations must be pending, booked or picked_up",
        ));
    }
    if is_block && status == ReservationStatus::PickedUp {
        return Err(EngineError::InvalidStatus("maintenance blocks cannot be picked up"));
    }
    if new.kind.is_rental() && new.customer_id.is_none() {
        return Err(EngineError::MissingField("customer_id"));
    }
    if new.vehicle_id.is_none() {
        if new.kind != ReservationType::Replacement {
            return Err(EngineError::MissingField("vehicle_id"));
        }
        if status == ReservationStatus::PickedUp {
            return Err(EngineError::SpareUnassigned(new.id));
        }
    }

    let maintenance = is_block.then(|| MaintenanceDetails {
        duration_days: new.duration_days,
        progress: MaintenanceProgress::Scheduled,
        kind: new.maintenance_kind,
    });

    Ok(Reservation {
        id: new.id,
        vehicle_id: new.vehicle_id,
        customer_id: new.customer_id,
        span,
        kind: new.kind,
        status,
        contract_number: new.contract_number.filter(|c| !c.trim().is_empty()),
        notes: new.notes,
        maintenance,
        covers: None,
        deleted_at: None,
    })
}

/// Active standard rentals a maintenance block leaves without a car, as
/// `(customer, uncovered period)`.
fn rentals_needing_spares(vs: &VehicleState, block: &Span) -> Vec<(Option<Ulid>, Span)> {
    vs.overlapping(block)
        .filter(|r| r.is_active() && r.kind == ReservationType::Standard)
        .filter_map(|r| r.span.intersection(block).map(|s| (r.customer_id, s)))
        .collect()
}

/// The other direction: active maintenance blocks that a standard rental
/// over `rental` runs into, as `(block, blocked period)`. `skip` leaves out
/// blocks the rental already has a spare for.
fn blocks_needing_spares(
    vs: &VehicleState,
    rental: &Span,
    skip: impl Fn(&Reservation) -> bool,
) -> Vec<(Ulid, Span)> {
    vs.overlapping(rental)
        .filter(|b| b.is_active() && b.kind == ReservationType::MaintenanceBlock && !skip(b))
        .filter_map(|b| b.span.intersection(rental).map(|s| (b.id, s)))
        .collect()
}

fn check_placeholder_room(engine: &Engine, needed: usize) -> Result<(), EngineError> {
    if needed > 0 && engine.placeholders.len() + needed > MAX_PLACEHOLDERS_PER_TENANT {
        return Err(EngineError::LimitExceeded("too many placeholder reservations"));
    }
    Ok(())
}

/// Write access to wherever a reservation lives.
pub(super) enum ReservationGuard<'a> {
    Vehicle(OwnedRwLockWriteGuard<VehicleState>),
    Pool(MutexGuard<'a, ()>),
}

impl Engine {
    // ── Vehicles ─────────────────────────────────────────────

    pub async fn register_vehicle(&self, id: Ulid, details: VehicleDetails) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        validate_vehicle_details(&details)?;
        if self.state.len() >= MAX_VEHICLES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many vehicles"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let key = plate_key(&details.license_plate);
        self.claim_plate(&key, id, &details.license_plate)?;
        let event = Event::VehicleRegistered { id, details: details.clone() };
        if let Err(e) = self.wal_append(&event).await {
            self.plates.remove_if(&key, |_, owner| *owner == id);
            return Err(e);
        }
        self.register_in_memory(id, details);
        self.notify.send(&event);
        Ok(())
    }

    fn claim_plate(&self, key: &str, id: Ulid, plate: &str) -> Result<(), EngineError> {
        let taken = match self.plates.entry(key.to_string()) {
            Entry::Occupied(e) => *e.get() != id,
            Entry::Vacant(v) => {
                v.insert(id);
                false
            }
        };
        if taken {
            return Err(EngineError::DuplicatePlate(plate.to_string()));
        }
        Ok(())
    }

    pub async fn update_vehicle(&self, id: Ulid, patch: VehiclePatch) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.vehicle_write(&id).await?;
        if guard.is_retired() {
            return Err(EngineError::VehicleRetired(id));
        }

        if patch.has_details() {
            let details = patch.apply(&guard.details);
            validate_vehicle_details(&details)?;
            if details != guard.details {
                let new_key = plate_key(&details.license_plate);
                let plate_changed = new_key != plate_key(&guard.details.license_plate);
                if plate_changed {
                    self.claim_plate(&new_key, id, &details.license_plate)?;
                }
                let event = Event::VehicleUpdated { id, details };
                if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
                    if plate_changed {
                        self.plates.remove_if(&new_key, |_, owner| *owner == id);
                    }
                    return Err(e);
                }
            }
        }

        match patch.status {
            Some(status) => self.apply_manual_status(&mut guard, status).await,
            None => Ok(()),
        }
    }

    pub async fn set_vehicle_status(&self, id: Ulid, status: VehicleStatus) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.vehicle_write(&id).await?;
        if guard.is_retired() {
            return Err(EngineError::VehicleRetired(id));
        }
        self.apply_manual_status(&mut guard, status).await
    }

    /// `needs_fixing`/`not_for_rental` stick until cleared; `available` clears
    /// them and re-derives from the reservations.
    async fn apply_manual_status(
        &self,
        vs: &mut VehicleState,
        status: VehicleStatus,
    ) -> Result<(), EngineError> {
        if matches!(status, VehicleStatus::Rented | VehicleStatus::Scheduled) {
            return Err(EngineError::InvalidStatus(
                "rented and scheduled are derived from reservations",
            ));
        }
        self.sync_from(vs, status, now_ms()).await.map(|_| ())
    }

    pub async fn retire_vehicle(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.vehicle_write(&id).await?;
        if guard.is_retired() {
            return Err(EngineError::VehicleRetired(id));
        }
        if guard.active().next().is_some() {
            return Err(EngineError::HasActiveReservations(id));
        }
        let event = Event::VehicleRetired { id, at: now_ms() };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!("vehicle {} ({}) retired", id, guard.details.license_plate);
        Ok(())
    }

    // ── Customers ────────────────────────────────────────────

    pub async fn create_customer(&self, id: Ulid, details: CustomerDetails) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        validate_customer_details(&details)?;
        if self.customers.len() >= MAX_CUSTOMERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many customers"));
        }
        if self.customers.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.persist_record(&Event::CustomerCreated { id, details }).await
    }

    pub async fn update_customer(&self, id: Ulid, patch: CustomerPatch) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let current = self
            .customers
            .get(&id)
            .filter(|c| c.deleted_at.is_none())
            .map(|c| c.details.clone())
            .ok_or(EngineError::NotFound(id))?;
        let details = patch.apply(&current);
        validate_customer_details(&details)?;
        if details == current {
            return Ok(());
        }
        self.persist_record(&Event::CustomerUpdated { id, details }).await
    }

    pub async fn delete_customer(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        if !self.customer_exists(&id) {
            return Err(EngineError::NotFound(id));
        }
        if self.customer_has_active_reservations(id).await {
            return Err(EngineError::HasActiveReservations(id));
        }
        self.persist_record(&Event::CustomerDeleted { id, at: now_ms() }).await
    }

    pub(super) fn customer_exists(&self, id: &Ulid) -> bool {
        self.customers
            .get(id)
            .is_some_and(|c| c.deleted_at.is_none())
    }

    async fn customer_has_active_reservations(&self, id: Ulid) -> bool {
        if self
            .placeholders
            .iter()
            .any(|r| r.is_active() && r.customer_id == Some(id))
        {
            return true;
        }
        for vs in self.vehicle_handles() {
            let guard = vs.read().await;
            if guard.active().any(|r| r.customer_id == Some(id)) {
                return true;
            }
        }
        false
    }

    // ── Reservations ─────────────────────────────────────────

    /// Create one reservation. Returns the ids of placeholder spares created
    /// for rentals a new maintenance block overlaps.
    pub async fn create_reservation(&self, new: NewReservation) -> Result<Vec<Ulid>, EngineError> {
        let _gate = self.commit_gate.read().await;
        let reservation = build_reservation(new)?;
        if let Some(cid) = reservation.customer_id
            && !self.customer_exists(&cid)
        {
            return Err(EngineError::NotFound(cid));
        }
        if let Some(vid) = reservation.vehicle_id
            && !self.state.contains_key(&vid)
        {
            return Err(EngineError::NotFound(vid));
        }
        if self.reservation_exists(&reservation.id) {
            return Err(EngineError::AlreadyExists(reservation.id));
        }

        let claims = self.claim_contracts(std::slice::from_ref(&reservation))?;
        let result = match reservation.vehicle_id {
            Some(_) => self.commit_reservations(vec![reservation]).await,
            None => self.commit_placeholder(reservation).await.map(|()| Vec::new()),
        };
        if result.is_err() {
            self.release_uncommitted(&claims);
        }
        result
    }

    /// Atomically create many reservations, possibly on different vehicles.
    /// All-or-nothing against validation: rows are checked against the store
    /// and each other first. A WAL write failure mid-commit leaves the rows
    /// already written committed.
    pub async fn batch_create_reservations(
        &self,
        batch: Vec<NewReservation>,
    ) -> Result<Vec<Ulid>, EngineError> {
        let _gate = self.commit_gate.read().await;
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        if batch.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }

        let mut reservations = Vec::with_capacity(batch.len());
        let mut seen = HashSet::new();
        for new in batch {
            let r = build_reservation(new)?;
            if r.vehicle_id.is_none() {
                return Err(EngineError::MissingField("vehicle_id"));
            }
            if let Some(cid) = r.customer_id
                && !self.customer_exists(&cid)
            {
                return Err(EngineError::NotFound(cid));
            }
            if !seen.insert(r.id) || self.reservation_exists(&r.id) {
                return Err(EngineError::AlreadyExists(r.id));
            }
            reservations.push(r);
        }

        let claims = self.claim_contracts(&reservations)?;
        let result = self.commit_reservations(reservations).await;
        if result.is_err() {
            self.release_uncommitted(&claims);
        }
        result
    }

    fn reservation_exists(&self, id: &Ulid) -> bool {
        self.reservation_to_vehicle.contains_key(id) || self.placeholders.contains_key(id)
    }

    /// Reserve every contract number in `batch`, or none of them.
    fn claim_contracts(&self, batch: &[Reservation]) -> Result<Vec<(String, Ulid)>, EngineError> {
        let mut claimed: Vec<(String, Ulid)> = Vec::new();
        for r in batch {
            let Some(contract) = &r.contract_number else { continue };
            let taken = match self.contracts.entry(contract.clone()) {
                Entry::Occupied(_) => true,
                Entry::Vacant(v) => {
                    v.insert(r.id);
                    false
                }
            };
            if taken {
                for (c, id) in &claimed {
                    self.release_contract(c, *id);
                }
                return Err(EngineError::DuplicateContract(contract.clone()));
            }
            claimed.push((contract.clone(), r.id));
        }
        Ok(claimed)
    }

    fn release_uncommitted(&self, claims: &[(String, Ulid)]) {
        for (contract, id) in claims {
            if !self.reservation_exists(id) {
                self.release_contract(contract, *id);
            }
        }
    }

    /// Lock the vehicles of `batch` in id order, validate, then commit.
    async fn commit_reservations(&self, batch: Vec<Reservation>) -> Result<Vec<Ulid>, EngineError> {
        let mut vehicle_ids: Vec<Ulid> = batch.iter().filter_map(|r| r.vehicle_id).collect();
        vehicle_ids.sort();
        vehicle_ids.dedup();

        let mut guards = Vec::with_capacity(vehicle_ids.len());
        let mut slot = HashMap::new();
        for vid in &vehicle_ids {
            let guard = self.vehicle_write(vid).await?;
            slot.insert(*vid, guards.len());
            guards.push(guard);
        }

        let new_blocks: HashSet<Ulid> = batch
            .iter()
            .filter(|r| r.kind == ReservationType::MaintenanceBlock)
            .map(|r| r.id)
            .collect();

        // Phase 1: validate against current state + intra-batch.
        let mut targets = Vec::with_capacity(batch.len());
        let mut rentals_on_blocks = false;
        {
            let mut per_vehicle: HashMap<Ulid, Vec<&Reservation>> = HashMap::new();
            for r in &batch {
                let vid = r.vehicle_id.ok_or(EngineError::MissingField("vehicle_id"))?;
                let guard = &guards[slot[&vid]];
                check_rentable(guard, r.kind)?;
                check_no_conflict(guard, &r.span, r.kind, None)?;

                let siblings = per_vehicle.entry(vid).or_default();
                if let Some(other) = siblings
                    .iter()
                    .find(|o| o.span.overlaps(&r.span) && o.kind.conflicts_with(r.kind))
                {
                    metrics::counter!(crate::observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
                    return Err(EngineError::Conflict(other.id));
                }
                siblings.push(r);
                if r.kind == ReservationType::Standard
                    && !blocks_needing_spares(guard, &r.span, |_| false).is_empty()
                {
                    rentals_on_blocks = true;
                }
                if guard.reservations.len() + siblings.len() > MAX_RESERVATIONS_PER_VEHICLE {
                    return Err(EngineError::LimitExceeded("too many reservations on vehicle"));
                }
                targets.push(slot[&vid]);
            }
        }
        if !new_blocks.is_empty() || rentals_on_blocks {
            check_placeholder_room(self, 1)?;
        }

        // Phase 2: all validated, commit. A WAL write failure here keeps
        // the rows already appended.
        let mut blocks = Vec::new();
        let mut rentals = Vec::new();
        for (reservation, idx) in batch.into_iter().zip(targets) {
            match reservation.kind {
                ReservationType::MaintenanceBlock => blocks.push((idx, reservation.id, reservation.span)),
                ReservationType::Standard => rentals.push((idx, reservation.clone())),
                ReservationType::Replacement => {}
            }
            let event = Event::ReservationCreated { reservation };
            self.persist_and_apply(&mut guards[idx], &event).await?;
        }

        let mut spares = Vec::new();
        for (idx, block_id, span) in blocks {
            spares.extend(self.create_spares_for_block(&guards[idx], block_id, span).await?);
        }
        // Blocks from this batch already covered these rentals above.
        for (idx, rental) in rentals {
            spares.extend(
                self.create_spares_for_rental(&guards[idx], &rental, |b| new_blocks.contains(&b.id))
                    .await?,
            );
        }

        let now = now_ms();
        for guard in guards.iter_mut() {
            self.sync_locked(guard, now).await?;
        }
        Ok(spares)
    }

    async fn commit_placeholder(&self, reservation: Reservation) -> Result<(), EngineError> {
        let _pool = self.pool_lock.lock().await;
        if self.placeholders.len() >= MAX_PLACEHOLDERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many placeholder reservations"));
        }
        self.persist_record(&Event::ReservationCreated { reservation }).await
    }

    /// One pending placeholder replacement per active standard rental the
    /// block overlaps. Caller holds the blocked vehicle's lock.
    async fn create_spares_for_block(
        &self,
        vs: &VehicleState,
        block_id: Ulid,
        block: Span,
    ) -> Result<Vec<Ulid>, EngineError> {
        let needed = rentals_needing_spares(vs, &block)
            .into_iter()
            .map(|(customer_id, span)| (block_id, customer_id, span))
            .collect();
        self.open_spares(vs, needed).await
    }

    /// Placeholders for a standard rental that lands on days the vehicle is
    /// already blocked for maintenance. Caller holds the vehicle's lock.
    async fn create_spares_for_rental(
        &self,
        vs: &VehicleState,
        rental: &Reservation,
        skip: impl Fn(&Reservation) -> bool,
    ) -> Result<Vec<Ulid>, EngineError> {
        if rental.kind != ReservationType::Standard || !rental.is_active() {
            return Ok(Vec::new());
        }
        let needed = blocks_needing_spares(vs, &rental.span, skip)
            .into_iter()
            .map(|(block_id, span)| (block_id, rental.customer_id, span))
            .collect();
        self.open_spares(vs, needed).await
    }

    /// Persist one pending replacement per `(block, customer, period)`.
    async fn open_spares(
        &self,
        vs: &VehicleState,
        needed: Vec<(Ulid, Option<Ulid>, Span)>,
    ) -> Result<Vec<Ulid>, EngineError> {
        if needed.is_empty() {
            return Ok(Vec::new());
        }

        let _pool = self.pool_lock.lock().await;
        let mut ids = Vec::with_capacity(needed.len());
        for (block_id, customer_id, span) in needed {
            let placeholder = Reservation {
                id: Ulid::new(),
                vehicle_id: None,
                customer_id,
                span,
                kind: ReservationType::Replacement,
                status: ReservationStatus::Pending,
                contract_number: None,
                notes: Some(format!(
                    "spare while {} is in maintenance",
                    vs.details.license_plate
                )),
                maintenance: None,
                covers: Some(block_id),
                deleted_at: None,
            };
            ids.push(placeholder.id);
            self.persist_record(&Event::ReservationCreated { reservation: placeholder })
                .await?;
        }
        tracing::info!(
            "{} needs {} spare vehicle(s) during maintenance",
            vs.details.license_plate,
            ids.len()
        );
        Ok(ids)
    }

    /// Lookup reservation → vehicle, acquire its write lock. Placeholders
    /// resolve to the pool lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        id: &Ulid,
    ) -> Result<ReservationGuard<'_>, EngineError> {
        loop {
            if let Some(vehicle_id) = self.get_vehicle_for_reservation(id) {
                let guard = self.vehicle_write(&vehicle_id).await?;
                if guard.reservation(id).is_some() {
                    return Ok(ReservationGuard::Vehicle(guard));
                }
                // Moved to another vehicle while we waited for the lock.
                if self.get_vehicle_for_reservation(id) == Some(vehicle_id) {
                    return Err(EngineError::NotFound(*id));
                }
                continue;
            }
            let pool = self.pool_lock.lock().await;
            if self.placeholders.contains_key(id) {
                return Ok(ReservationGuard::Pool(pool));
            }
            if self.get_vehicle_for_reservation(id).is_none() {
                return Err(EngineError::NotFound(*id));
            }
        }
    }

    /// Current, non-deleted copy of a reservation under its guard.
    fn guarded_reservation(&self, guard: &ReservationGuard<'_>, id: &Ulid) -> Result<Reservation, EngineError> {
        let found = match guard {
            ReservationGuard::Vehicle(vs) => vs.reservation(id).cloned(),
            ReservationGuard::Pool(_) => self.placeholders.get(id).map(|r| r.value().clone()),
        };
        found
            .filter(|r| r.deleted_at.is_none())
            .ok_or(EngineError::NotFound(*id))
    }

    async fn persist_guarded(
        &self,
        guard: &mut ReservationGuard<'_>,
        event: &Event,
    ) -> Result<(), EngineError> {
        match guard {
            ReservationGuard::Vehicle(vs) => self.persist_and_apply(vs, event).await,
            ReservationGuard::Pool(_) => self.persist_record(event).await,
        }
    }

    async fn sync_guarded(&self, guard: &mut ReservationGuard<'_>) -> Result<(), EngineError> {
        if let ReservationGuard::Vehicle(vs) = guard {
            self.sync_locked(vs, now_ms()).await?;
        }
        Ok(())
    }

    /// Move a reservation to a new period. `end: Some(None)` makes it open-ended.
    pub async fn reschedule_reservation(
        &self,
        id: Ulid,
        start: Option<Ms>,
        end: Option<Option<Ms>>,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_reservation_write(&id).await?;
        let r = self.guarded_reservation(&guard, &id)?;

        let start = start.unwrap_or(r.span.start);
        let end = end.unwrap_or(r.span.end_opt());
        if r.kind == ReservationType::MaintenanceBlock && end.is_none() {
            return Err(EngineError::MissingDates);
        }
        let span = reservation_span(Some(start), end)?;
        if span == r.span {
            return Ok(());
        }
        if let ReservationGuard::Vehicle(vs) = &guard
            && r.is_active()
        {
            check_no_conflict(vs, &span, r.kind, Some(id))?;
            if r.kind == ReservationType::Standard {
                let newly_blocked = blocks_needing_spares(vs, &span, |b| r.span.overlaps(&b.span));
                check_placeholder_room(self, newly_blocked.len())?;
            }
        }

        let event = Event::ReservationRescheduled { id, vehicle_id: r.vehicle_id, span };
        self.persist_guarded(&mut guard, &event).await?;
        if let ReservationGuard::Vehicle(vs) = &guard {
            let moved = Reservation { span, ..r.clone() };
            self.create_spares_for_rental(vs, &moved, |b| r.span.overlaps(&b.span))
                .await?;
        }
        self.sync_guarded(&mut guard).await
    }

    pub async fn set_reservation_status(
        &self,
        id: Ulid,
        status: ReservationStatus,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        if let Some(block_id) = self.change_status(id, status).await? {
            self.cancel_linked_spares(block_id).await?;
        }
        Ok(())
    }

    /// Returns the block id when a maintenance block was cancelled and its
    /// spares must be released. The guard is dropped before that happens.
    async fn change_status(
        &self,
        id: Ulid,
        status: ReservationStatus,
    ) -> Result<Option<Ulid>, EngineError> {
        let mut guard = self.resolve_reservation_write(&id).await?;
        let r = self.guarded_reservation(&guard, &id)?;
        if r.status == status {
            return Ok(None);
        }
        if !ReservationStatus::can_transition(r.kind, r.status, status) {
            return Err(EngineError::InvalidTransition { from: r.status, to: status });
        }
        if r.vehicle_id.is_none() && status == ReservationStatus::PickedUp {
            return Err(EngineError::SpareUnassigned(id));
        }

        let event = Event::ReservationStatusChanged { id, vehicle_id: r.vehicle_id, status };
        self.persist_guarded(&mut guard, &event).await?;

        if status == ReservationStatus::Completed
            && let (Some(vehicle_id), Some(details)) = (r.vehicle_id, &r.maintenance)
            && details.progress != MaintenanceProgress::Done
        {
            let event = Event::MaintenanceProgressed {
                id,
                vehicle_id,
                progress: MaintenanceProgress::Done,
            };
            self.persist_guarded(&mut guard, &event).await?;
        }
        self.sync_guarded(&mut guard).await?;

        let cascade = r.kind == ReservationType::MaintenanceBlock
            && status == ReservationStatus::Cancelled;
        Ok(cascade.then_some(id))
    }

    /// Cancel the replacements standing in for `block_id` that nobody has
    /// picked up yet.
    async fn cancel_linked_spares(&self, block_id: Ulid) -> Result<(), EngineError> {
        let linked_to_block =
            |r: &Reservation| r.covers == Some(block_id) && r.is_active() && r.status != ReservationStatus::PickedUp;

        let mut linked: Vec<Ulid> = self
            .placeholders
            .iter()
            .filter(|r| linked_to_block(r.value()))
            .map(|r| r.id)
            .collect();
        for vs in self.vehicle_handles() {
            let guard = vs.read().await;
            linked.extend(guard.reservations.iter().filter(|&r| linked_to_block(r)).map(|r| r.id));
        }

        for id in &linked {
            self.change_status(*id, ReservationStatus::Cancelled).await?;
        }
        if !linked.is_empty() {
            tracing::info!("cancelled {} spare reservation(s) of block {block_id}", linked.len());
        }
        Ok(())
    }

    /// Update the progress of a maintenance block. `done` also completes it.
    pub async fn set_maintenance_progress(
        &self,
        id: Ulid,
        progress: MaintenanceProgress,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_reservation_write(&id).await?;
        let r = self.guarded_reservation(&guard, &id)?;
        let Some(details) = &r.maintenance else {
            return Err(EngineError::InvalidStatus("not a maintenance block"));
        };
        if details.progress == progress {
            return Ok(());
        }
        if !r.is_active() {
            return Err(EngineError::InvalidStatus("maintenance block is closed"));
        }
        let vehicle_id = r.vehicle_id.ok_or(EngineError::MissingField("vehicle_id"))?;

        let event = Event::MaintenanceProgressed { id, vehicle_id, progress };
        self.persist_guarded(&mut guard, &event).await?;
        if progress == MaintenanceProgress::Done {
            let event = Event::ReservationStatusChanged {
                id,
                vehicle_id: Some(vehicle_id),
                status: ReservationStatus::Completed,
            };
            self.persist_guarded(&mut guard, &event).await?;
        }
        self.sync_guarded(&mut guard).await
    }

    /// Move a reservation to `vehicle_id`. For a placeholder this resolves the
    /// TBD spare.
    pub async fn assign_vehicle(&self, id: Ulid, vehicle_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let target = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;

        match self.get_vehicle_for_reservation(&id) {
            Some(from) if from == vehicle_id => {
                let guard = target.read().await;
                match guard.reservation(&id) {
                    Some(r) if r.deleted_at.is_none() => Ok(()),
                    _ => Err(EngineError::NotFound(id)),
                }
            }
            Some(from) => {
                let source = self.get_vehicle(&from).ok_or(EngineError::NotFound(from))?;
                // Acquire write locks in sorted order to prevent deadlocks.
                let (mut source, mut target) = if from < vehicle_id {
                    let s = source.write_owned().await;
                    let t = target.write_owned().await;
                    (s, t)
                } else {
                    let t = target.write_owned().await;
                    let s = source.write_owned().await;
                    (s, t)
                };
                let r = source
                    .reservation(&id)
                    .filter(|r| r.deleted_at.is_none())
                    .cloned()
                    .ok_or(EngineError::NotFound(id))?;
                check_assignable(&target, &r)?;
                if r.kind == ReservationType::Standard && r.is_active() {
                    let blocked = blocks_needing_spares(&target, &r.span, |_| false);
                    check_placeholder_room(self, blocked.len())?;
                }

                let event = Event::ReservationReassigned { id, from: Some(from), to: vehicle_id };
                self.wal_append(&event).await?;
                self.apply_reassign(id, Some(&mut *source), &mut target);
                self.notify.send(&event);
                self.create_spares_for_rental(&target, &r, |_| false).await?;

                let now = now_ms();
                self.sync_locked(&mut source, now).await?;
                self.sync_locked(&mut target, now).await?;
                Ok(())
            }
            None => {
                let mut target = target.write_owned().await;
                let _pool = self.pool_lock.lock().await;
                let r = self
                    .placeholders
                    .get(&id)
                    .map(|r| r.value().clone())
                    .filter(|r| r.deleted_at.is_none())
                    .ok_or(EngineError::NotFound(id))?;
                check_assignable(&target, &r)?;

                let event = Event::ReservationReassigned { id, from: None, to: vehicle_id };
                self.wal_append(&event).await?;
                self.apply_reassign(id, None, &mut target);
                self.notify.send(&event);
                tracing::debug!("placeholder {id} resolved to {}", target.details.license_plate);

                self.sync_locked(&mut target, now_ms()).await?;
                Ok(())
            }
        }
    }

    /// Soft delete. The reservation stops blocking but stays in history.
    pub async fn delete_reservation(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let release_spares = {
            let mut guard = self.resolve_reservation_write(&id).await?;
            let r = self.guarded_reservation(&guard, &id)?;
            let event = Event::ReservationDeleted { id, vehicle_id: r.vehicle_id, at: now_ms() };
            self.persist_guarded(&mut guard, &event).await?;
            self.sync_guarded(&mut guard).await?;
            r.kind == ReservationType::MaintenanceBlock && r.is_active()
        };
        if release_spares {
            self.cancel_linked_spares(id).await?;
        }
        Ok(())
    }

    /// Apply an UPDATE on a reservation: period first, then vehicle, then
    /// maintenance progress, then status. Each step commits on its own, so a
    /// later failure leaves the earlier steps applied.
    pub async fn update_reservation(&self, id: Ulid, patch: ReservationPatch) -> Result<(), EngineError> {
        if patch.start.is_some() || patch.end.is_some() {
            self.reschedule_reservation(id, patch.start, patch.end).await?;
        }
        if let Some(vehicle_id) = patch.vehicle_id {
            self.assign_vehicle(id, vehicle_id).await?;
        }
        if let Some(progress) = patch.maintenance_status {
            self.set_maintenance_progress(id, progress).await?;
        }
        if let Some(status) = patch.status {
            self.set_reservation_status(id, status).await?;
        }
        Ok(())
    }

    // ── Expenses ─────────────────────────────────────────────

    pub async fn record_expense(&self, expense: Expense) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        if expense.category.trim().is_empty() {
            return Err(EngineError::MissingField("category"));
        }
        check_len(Some(&expense.category), MAX_NAME_LEN, "category too long")?;
        check_len(expense.description.as_deref(), MAX_NOTES_LEN, "description too long")?;
        check_timestamp(Some(expense.incurred_at))?;
        if self.expenses.len() >= MAX_EXPENSES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many expenses"));
        }
        if !self.state.contains_key(&expense.vehicle_id) {
            return Err(EngineError::NotFound(expense.vehicle_id));
        }
        if self.expenses.contains_key(&expense.id) {
            return Err(EngineError::AlreadyExists(expense.id));
        }
        self.persist_record(&Event::ExpenseRecorded { expense }).await
    }

    pub async fn remove_expense(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let vehicle_id = self
            .expenses
            .get(&id)
            .map(|e| e.vehicle_id)
            .ok_or(EngineError::NotFound(id))?;
        self.persist_record(&Event::ExpenseRemoved { id, vehicle_id }).await
    }

    // ── Status synchronization ───────────────────────────────

    /// Derive the status starting from `base` and persist it if it changed.
    async fn sync_from(
        &self,
        vs: &mut VehicleState,
        base: VehicleStatus,
        now: Ms,
    ) -> Result<bool, EngineError> {
        let (status, maintenance_state) = derive_status(vs, base, now);
        if status == vs.status && maintenance_state == vs.maintenance_state {
            return Ok(false);
        }
        let from = vs.status;
        let event = Event::VehicleStatusChanged { id: vs.id, status, maintenance_state };
        self.persist_and_apply(vs, &event).await?;
        metrics::counter!(
            crate::observability::VEHICLE_STATUS_TRANSITIONS_TOTAL,
            "status" => status.as_str()
        )
        .increment(1);
        tracing::debug!(
            "vehicle {} status {} -> {}, maintenance {}",
            vs.details.license_plate,
            from.as_str(),
            status.as_str(),
            maintenance_state.as_str()
        );
        Ok(true)
    }

    pub(super) async fn sync_locked(&self, vs: &mut VehicleState, now: Ms) -> Result<bool, EngineError> {
        let current = vs.status;
        self.sync_from(vs, current, now).await
    }

    /// Recompute every vehicle's status. Returns how many changed.
    pub async fn sync_all(&self, now: Ms) -> usize {
        let _gate = self.commit_gate.read().await;
        let mut changed = 0;
        for vs in self.vehicle_handles() {
            let mut guard = vs.write().await;
            if guard.is_retired() {
                continue;
            }
            match self.sync_locked(&mut guard, now).await {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("status sync failed for {}: {e}", guard.details.license_plate),
            }
        }
        changed
    }

    // ── Snapshots & compaction ───────────────────────────────

    /// The minimal event list that recreates the current state.
    pub async fn snapshot_events(&self) -> Vec<Event> {
        let _gate = self.commit_gate.write().await;
        self.collect_snapshot().await
    }

    async fn collect_snapshot(&self) -> Vec<Event> {
        let mut events = Vec::new();

        let mut customers: Vec<Customer> = self.customers.iter().map(|c| c.value().clone()).collect();
        customers.sort_by_key(|c| c.id);
        for c in customers {
            events.push(Event::CustomerCreated { id: c.id, details: c.details });
            if let Some(at) = c.deleted_at {
                events.push(Event::CustomerDeleted { id: c.id, at });
            }
        }

        let mut vehicles: Vec<(Ulid, _)> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        vehicles.sort_by_key(|(id, _)| *id);
        for (id, vs) in vehicles {
            let guard = vs.read().await;
            events.push(Event::VehicleRegistered { id, details: guard.details.clone() });
            for r in &guard.reservations {
                events.push(Event::ReservationCreated { reservation: r.clone() });
            }
            events.push(Event::VehicleStatusChanged {
                id,
                status: guard.status,
                maintenance_state: guard.maintenance_state,
            });
            if let Some(at) = guard.retired_at {
                events.push(Event::VehicleRetired { id, at });
            }
        }

        let mut placeholders: Vec<Reservation> = self.placeholders.iter().map(|r| r.value().clone()).collect();
        placeholders.sort_by_key(|r| r.id);
        events.extend(
            placeholders
                .into_iter()
                .map(|reservation| Event::ReservationCreated { reservation }),
        );

        let mut expenses: Vec<Expense> = self.expenses.iter().map(|e| e.value().clone()).collect();
        expenses.sort_by_key(|e| e.id);
        events.extend(expenses.into_iter().map(|expense| Event::ExpenseRecorded { expense }));

        events
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let events = self.collect_snapshot().await;

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Whether `r` may move onto `target`.
fn check_assignable(target: &VehicleState, r: &Reservation) -> Result<(), EngineError> {
    check_rentable(target, r.kind)?;
    if target.reservations.len() >= MAX_RESERVATIONS_PER_VEHICLE {
        return Err(EngineError::LimitExceeded("too many reservations on vehicle"));
    }
    if r.is_active() {
        check_no_conflict(target, &r.span, r.kind, Some(r.id))?;
    }
    Ok(())
}
