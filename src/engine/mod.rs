mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{availability, merge_overlapping, pooled_availability, subtract_intervals};
pub use conflict::now_ms;
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedVehicleState = Arc<RwLock<VehicleState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut pending = None;

                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => batch.push((event, response)),
                        other => {
                            pending = Some(other);
                            break;
                        }
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = pending {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("WAL writer stopped: {}", wal.path().display());
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = wal.compact(&events);
            match &result {
                Ok(()) => tracing::info!("compacted {} to {} events", wal.path().display(), events.len()),
                Err(e) => tracing::error!("compaction of {} failed: {e}", wal.path().display()),
            }
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// Normalized form of a license plate used for uniqueness checks.
pub(crate) fn plate_key(plate: &str) -> String {
    plate
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

pub struct Engine {
    pub state: DashMap<Ulid, SharedVehicleState>,
    pub(super) customers: DashMap<Ulid, Customer>,
    /// Replacement reservations still waiting for a spare vehicle.
    pub(super) placeholders: DashMap<Ulid, Reservation>,
    pub(super) expenses: DashMap<Ulid, Expense>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: reservation id → vehicle id (assigned reservations only).
    pub(super) reservation_to_vehicle: DashMap<Ulid, Ulid>,
    /// Contract number → reservation id, for non-deleted reservations.
    pub(super) contracts: DashMap<String, Ulid>,
    /// Normalized license plate → vehicle id, for non-retired vehicles.
    pub(super) plates: DashMap<String, Ulid>,
    /// Public mutations hold this shared, before any vehicle lock. Compaction
    /// and snapshots hold it exclusively so no append lands between the
    /// snapshot and the WAL swap.
    pub(super) commit_gate: RwLock<()>,
    /// Serializes changes to the placeholder pool. Taken after vehicle locks.
    pub(super) pool_lock: Mutex<()>,
}

/// Apply a vehicle-scoped event to its state. Caller holds the write lock.
fn apply_to_vehicle(vs: &mut VehicleState, event: &Event) {
    match event {
        Event::VehicleUpdated { details, .. } => vs.details = details.clone(),
        Event::VehicleStatusChanged { status, maintenance_state, .. } => {
            vs.status = *status;
            vs.maintenance_state = *maintenance_state;
        }
        Event::VehicleRetired { at, .. } => vs.retired_at = Some(*at),
        Event::ReservationCreated { reservation } => vs.insert_reservation(reservation.clone()),
        Event::ReservationRescheduled { id, span, .. } => {
            vs.reschedule(*id, *span);
        }
        Event::ReservationStatusChanged { id, status, .. } => {
            if let Some(r) = vs.reservation_mut(id) {
                r.status = *status;
            }
        }
        Event::MaintenanceProgressed { id, progress, .. } => {
            if let Some(details) = vs.reservation_mut(id).and_then(|r| r.maintenance.as_mut()) {
                details.progress = *progress;
            }
        }
        Event::ReservationDeleted { id, at, .. } => {
            if let Some(r) = vs.reservation_mut(id) {
                r.deleted_at = Some(*at);
            }
        }
        // Registration, reassignment and the non-vehicle records go through the engine.
        Event::VehicleRegistered { .. }
        | Event::ReservationReassigned { .. }
        | Event::CustomerCreated { .. }
        | Event::CustomerUpdated { .. }
        | Event::CustomerDeleted { .. }
        | Event::ExpenseRecorded { .. }
        | Event::ExpenseRemoved { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            customers: DashMap::new(),
            placeholders: DashMap::new(),
            expenses: DashMap::new(),
            wal_tx,
            notify,
            reservation_to_vehicle: DashMap::new(),
            contracts: DashMap::new(),
            plates: DashMap::new(),
            commit_gate: RwLock::new(()),
            pool_lock: Mutex::new(()),
        };

        // We're the sole owner of every Arc during replay, so try_write always
        // succeeds. Never block here: this may run inside an async context.
        for event in &events {
            engine.replay_event(event)?;
        }
        if !events.is_empty() {
            tracing::info!(
                "replayed {} events: {} vehicles, {} customers",
                events.len(),
                engine.state.len(),
                engine.customers.len()
            );
        }

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) -> io::Result<()> {
        let contended = || io::Error::other("replay: vehicle state contended");
        match event {
            Event::VehicleRegistered { id, details } => {
                self.register_in_memory(*id, details.clone());
            }
            Event::ReservationReassigned { id, from, to } => {
                let Some(target) = self.get_vehicle(to) else { return Ok(()) };
                let mut target = target.try_write().map_err(|_| contended())?;
                match from.and_then(|f| self.get_vehicle(&f)) {
                    Some(source) => {
                        let mut source = source.try_write().map_err(|_| contended())?;
                        self.apply_reassign(*id, Some(&mut *source), &mut target);
                    }
                    None => self.apply_reassign(*id, None, &mut target),
                }
            }
            other => match self.event_vehicle(other) {
                Some(vehicle_id) => {
                    if let Some(vs) = self.get_vehicle(&vehicle_id) {
                        let mut guard = vs.try_write().map_err(|_| contended())?;
                        self.apply_locked(&mut guard, other);
                    }
                }
                None => self.apply_unlocked(other),
            },
        }
        Ok(())
    }

    /// The vehicle whose lock an event needs, if any.
    fn event_vehicle(&self, event: &Event) -> Option<Ulid> {
        match event {
            Event::VehicleUpdated { id, .. }
            | Event::VehicleStatusChanged { id, .. }
            | Event::VehicleRetired { id, .. } => Some(*id),
            Event::ReservationCreated { reservation } => reservation.vehicle_id,
            Event::ReservationRescheduled { vehicle_id, .. }
            | Event::ReservationStatusChanged { vehicle_id, .. }
            | Event::ReservationDeleted { vehicle_id, .. } => *vehicle_id,
            Event::MaintenanceProgressed { vehicle_id, .. } => Some(*vehicle_id),
            _ => None,
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_vehicle(&self, id: &Ulid) -> Option<SharedVehicleState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_vehicle_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_vehicle.get(reservation_id).map(|e| *e.value())
    }

    /// Snapshot of all vehicle handles, so no DashMap guard is held across an await.
    pub(super) fn vehicle_handles(&self) -> Vec<SharedVehicleState> {
        self.state.iter().map(|e| e.value().clone()).collect()
    }

    fn register_in_memory(&self, id: Ulid, details: VehicleDetails) {
        // A retired vehicle replayed later must not steal a live vehicle's plate.
        self.plates.entry(plate_key(&details.license_plate)).or_insert(id);
        let vs = VehicleState::new(id, details);
        self.state.insert(id, Arc::new(RwLock::new(vs)));
    }

    fn index_reservation(&self, r: &Reservation) {
        if let Some(vehicle_id) = r.vehicle_id {
            self.reservation_to_vehicle.insert(r.id, vehicle_id);
        }
        if r.deleted_at.is_none()
            && let Some(contract) = &r.contract_number
        {
            self.contracts.insert(contract.clone(), r.id);
        }
    }

    pub(super) fn release_contract(&self, contract: &str, reservation_id: Ulid) {
        self.contracts.remove_if(contract, |_, owner| *owner == reservation_id);
    }

    /// Apply a vehicle-scoped event and keep the indexes in step.
    pub(super) fn apply_locked(&self, vs: &mut VehicleState, event: &Event) {
        match event {
            Event::ReservationCreated { reservation } => self.index_reservation(reservation),
            Event::ReservationDeleted { id, .. } => {
                if let Some(contract) = vs.reservation(id).and_then(|r| r.contract_number.clone()) {
                    self.release_contract(&contract, *id);
                }
            }
            Event::VehicleUpdated { id, details } => {
                let old = plate_key(&vs.details.license_plate);
                self.plates.remove_if(&old, |_, owner| owner == id);
                self.plates.insert(plate_key(&details.license_plate), *id);
            }
            Event::VehicleRetired { id, .. } => {
                let key = plate_key(&vs.details.license_plate);
                self.plates.remove_if(&key, |_, owner| owner == id);
            }
            _ => {}
        }
        apply_to_vehicle(vs, event);
    }

    /// Apply an event that touches no vehicle lock: customers, expenses and
    /// unassigned placeholders.
    pub(super) fn apply_unlocked(&self, event: &Event) {
        match event {
            Event::CustomerCreated { id, details } => {
                self.customers.insert(
                    *id,
                    Customer {
                        id: *id,
                        details: details.clone(),
                        deleted_at: None,
                    },
                );
            }
            Event::CustomerUpdated { id, details } => {
                if let Some(mut c) = self.customers.get_mut(id) {
                    c.details = details.clone();
                }
            }
            Event::CustomerDeleted { id, at } => {
                if let Some(mut c) = self.customers.get_mut(id) {
                    c.deleted_at = Some(*at);
                }
            }
            Event::ExpenseRecorded { expense } => {
                self.expenses.insert(expense.id, expense.clone());
            }
            Event::ExpenseRemoved { id, .. } => {
                self.expenses.remove(id);
            }
            Event::ReservationCreated { reservation } => {
                self.index_reservation(reservation);
                self.placeholders.insert(reservation.id, reservation.clone());
            }
            Event::ReservationRescheduled { id, span, .. } => {
                if let Some(mut r) = self.placeholders.get_mut(id) {
                    r.span = *span;
                }
            }
            Event::ReservationStatusChanged { id, status, .. } => {
                if let Some(mut r) = self.placeholders.get_mut(id) {
                    r.status = *status;
                }
            }
            Event::ReservationDeleted { id, at, .. } => {
                let contract = self.placeholders.get_mut(id).and_then(|mut r| {
                    r.deleted_at = Some(*at);
                    r.contract_number.clone()
                });
                if let Some(contract) = contract {
                    self.release_contract(&contract, *id);
                }
            }
            _ => {}
        }
    }

    /// Move a reservation onto `target`. `source: None` takes it from the
    /// placeholder pool.
    pub(super) fn apply_reassign(
        &self,
        id: Ulid,
        source: Option<&mut VehicleState>,
        target: &mut VehicleState,
    ) {
        let taken = match source {
            Some(vs) => vs.remove_reservation(id),
            None => self.placeholders.remove(&id).map(|(_, r)| r),
        };
        if let Some(mut r) = taken {
            r.vehicle_id = Some(target.id);
            self.reservation_to_vehicle.insert(id, target.id);
            target.insert_reservation(r);
        }
    }

    /// WAL-append + apply + notify for a vehicle-scoped event.
    pub(super) async fn persist_and_apply(
        &self,
        vs: &mut VehicleState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_locked(vs, event);
        self.notify.send(event);
        Ok(())
    }

    /// WAL-append + apply + notify for an event outside any vehicle lock.
    pub(super) async fn persist_record(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_unlocked(event);
        self.notify.send(event);
        Ok(())
    }

    /// Lookup vehicle, acquire write lock.
    pub(super) async fn vehicle_write(
        &self,
        vehicle_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<VehicleState>, EngineError> {
        let vs = self
            .get_vehicle(vehicle_id)
            .ok_or(EngineError::NotFound(*vehicle_id))?;
        Ok(vs.write_owned().await)
    }
}
