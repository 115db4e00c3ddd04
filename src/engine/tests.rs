use tokio_test::{assert_err, assert_ok};

use super::conflict::now_ms;
use super::*;
use crate::limits::{MAX_QUERY_WINDOW_MS, MAX_REMINDER_HORIZON_DAYS};

const D: Ms = DAY_MS;
const H: Ms = 3_600_000;
/// 2030-01-01T00:00:00Z
const T0: Ms = 1_893_456_000_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("fleetdesk_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap()
}

fn details(plate: &str) -> VehicleDetails {
    VehicleDetails {
        license_plate: plate.into(),
        brand: Some("Volkswagen".into()),
        model: Some("Polo".into()),
        apk_date: None,
        warranty_end: None,
    }
}

async fn add_vehicle(engine: &Engine, plate: &str) -> Ulid {
    let id = Ulid::new();
    engine.register_vehicle(id, details(plate)).await.unwrap();
    id
}

async fn add_customer(engine: &Engine, name: &str) -> Ulid {
    let id = Ulid::new();
    engine
        .create_customer(
            id,
            CustomerDetails {
                name: name.into(),
                email: None,
                phone: None,
            },
        )
        .await
        .unwrap();
    id
}

fn rental(vehicle: Ulid, customer: Ulid, start: Ms, end: Option<Ms>) -> NewReservation {
    NewReservation {
        vehicle_id: Some(vehicle),
        customer_id: Some(customer),
        start: Some(start),
        end,
        ..NewReservation::new(Ulid::new(), ReservationType::Standard)
    }
}

fn maintenance(vehicle: Ulid, start: Ms, end: Ms) -> NewReservation {
    NewReservation {
        vehicle_id: Some(vehicle),
        start: Some(start),
        end: Some(end),
        maintenance_kind: Some("service".into()),
        ..NewReservation::new(Ulid::new(), ReservationType::MaintenanceBlock)
    }
}

fn replacement(vehicle: Option<Ulid>, customer: Ulid, start: Ms, end: Ms) -> NewReservation {
    NewReservation {
        vehicle_id: vehicle,
        customer_id: Some(customer),
        start: Some(start),
        end: Some(end),
        ..NewReservation::new(Ulid::new(), ReservationType::Replacement)
    }
}

async fn status_of(engine: &Engine, vehicle: Ulid) -> (VehicleStatus, MaintenanceState) {
    let info = engine.vehicle_info(vehicle).await.unwrap();
    (info.status, info.maintenance_state)
}

// ── Conflicts ────────────────────────────────────────────

#[tokio::test]
async fn overlapping_standard_rentals_conflict() {
    let engine = new_engine("overlap_standard.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;

    let first = rental(car, alice, T0, Some(T0 + 3 * D));
    let first_id = first.id;
    assert_ok!(engine.create_reservation(first).await);

    let result = engine
        .create_reservation(rental(car, alice, T0 + 2 * D, Some(T0 + 5 * D)))
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(id)) if id == first_id));
}

#[tokio::test]
async fn adjacent_rentals_do_not_conflict() {
    let engine = new_engine("adjacent.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;

    assert_ok!(engine.create_reservation(rental(car, alice, T0, Some(T0 + D))).await);
    assert_ok!(
        engine
            .create_reservation(rental(car, alice, T0 + D, Some(T0 + 2 * D)))
            .await
    );
    assert_ok!(
        engine
            .create_reservation(rental(car, alice, T0 - D, Some(T0)))
            .await
    );
}

#[tokio::test]
async fn open_ended_rental_blocks_everything_after() {
    let engine = new_engine("open_ended.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;

    assert_ok!(engine.create_reservation(rental(car, alice, T0, None)).await);

    let far = T0 + 400 * D;
    let result = engine
        .create_reservation(rental(car, alice, far, Some(far + D)))
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(_))));

    // Before the start is still free.
    assert_ok!(
        engine
            .create_reservation(rental(car, alice, T0 - 2 * D, Some(T0)))
            .await
    );
}

#[tokio::test]
async fn overlapping_maintenance_blocks_conflict() {
    let engine = new_engine("maintenance_overlap.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;

    assert_ok!(engine.create_reservation(maintenance(car, T0, T0 + 2 * D)).await);
    let result = engine
        .create_reservation(maintenance(car, T0 + D, T0 + 3 * D))
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(_))));
}

#[tokio::test]
async fn cancelled_reservation_no_longer_blocks() {
    let engine = new_engine("cancelled_frees.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;

    let first = rental(car, alice, T0, Some(T0 + D));
    let first_id = first.id;
    engine.create_reservation(first).await.unwrap();
    engine
        .set_reservation_status(first_id, ReservationStatus::Cancelled)
        .await
        .unwrap();

    assert_ok!(engine.create_reservation(rental(car, alice, T0, Some(T0 + D))).await);
}

#[tokio::test]
async fn not_for_rental_rejects_rentals_but_accepts_maintenance() {
    let engine = new_engine("not_for_rental.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;
    engine
        .set_vehicle_status(car, VehicleStatus::NotForRental)
        .await
        .unwrap();

    let result = engine
        .create_reservation(rental(car, alice, T0, Some(T0 + D)))
        .await;
    assert!(matches!(result, Err(EngineError::NotRentable(id)) if id == car));
    assert_ok!(engine.create_reservation(maintenance(car, T0, T0 + D)).await);
}

// ── Validation ───────────────────────────────────────────

#[tokio::test]
async fn missing_start_rejected() {
    let engine = new_engine("missing_start.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;

    let mut req = rental(car, alice, T0, Some(T0 + D));
    req.start = None;
    assert!(matches!(
        engine.create_reservation(req).await,
        Err(EngineError::MissingDates)
    ));

    // A maintenance block needs an end or a duration.
    let mut block = maintenance(car, T0, T0 + D);
    block.end = None;
    assert!(matches!(
        engine.create_reservation(block).await,
        Err(EngineError::MissingDates)
    ));
}

#[tokio::test]
async fn maintenance_end_derived_from_duration() {
    let engine = new_engine("maintenance_duration.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;

    let mut block = maintenance(car, T0, T0 + D);
    block.end = None;
    block.duration_days = Some(3);
    let block_id = block.id;
    engine.create_reservation(block).await.unwrap();

    let stored = engine.get_reservation(block_id).await.unwrap();
    assert_eq!(stored.span, Span::new(T0, T0 + 3 * D));
    assert_eq!(stored.customer_id, None);
    let details = stored.maintenance.unwrap();
    assert_eq!(details.duration_days, Some(3));
    assert_eq!(details.progress, MaintenanceProgress::Scheduled);
    assert_eq!(details.kind.as_deref(), Some("service"));
}

#[tokio::test]
async fn end_before_start_rejected() {
    let engine = new_engine("end_before_start.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;

    let result = engine
        .create_reservation(rental(car, alice, T0, Some(T0)))
        .await;
    assert!(matches!(result, Err(EngineError::InvalidSpan(_))));
}

#[tokio::test]
async fn rental_requires_live_customer() {
    let engine = new_engine("requires_customer.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;

    let mut req = rental(car, Ulid::new(), T0, Some(T0 + D));
    let ghost = req.customer_id.unwrap();
    assert!(matches!(
        engine.create_reservation(req.clone()).await,
        Err(EngineError::NotFound(id)) if id == ghost
    ));

    req.customer_id = None;
    assert!(matches!(
        engine.create_reservation(req).await,
        Err(EngineError::MissingField("customer_id"))
    ));
}

#[tokio::test]
async fn duplicate_contract_number_rejected() {
    let engine = new_engine("duplicate_contract.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let van = add_vehicle(&engine, "VN-001-X").await;
    let alice = add_customer(&engine, "Alice").await;

    let mut first = rental(car, alice, T0, Some(T0 + D));
    first.contract_number = Some("C-2030-001".into());
    let first_id = first.id;
    engine.create_reservation(first).await.unwrap();

    let mut second = rental(van, alice, T0, Some(T0 + D));
    second.contract_number = Some("C-2030-001".into());
    assert!(matches!(
        engine.create_reservation(second.clone()).await,
        Err(EngineError::DuplicateContract(ref n)) if n == "C-2030-001"
    ));

    // Deleting the first frees the number.
    engine.delete_reservation(first_id).await.unwrap();
    assert_ok!(engine.create_reservation(second).await);
}

#[tokio::test]
async fn failed_create_releases_contract_number() {
    let engine = new_engine("contract_released.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;
    engine
        .create_reservation(rental(car, alice, T0, Some(T0 + D)))
        .await
        .unwrap();

    let mut clash = rental(car, alice, T0, Some(T0 + D));
    clash.contract_number = Some("C-7".into());
    assert_err!(engine.create_reservation(clash).await);

    let mut later = rental(car, alice, T0 + 2 * D, Some(T0 + 3 * D));
    later.contract_number = Some("C-7".into());
    assert_ok!(engine.create_reservation(later).await);
}

#[tokio::test]
async fn duplicate_license_plate_rejected() {
    let engine = new_engine("duplicate_plate.wal");
    add_vehicle(&engine, "AB-123-C").await;
    let result = engine.register_vehicle(Ulid::new(), details("ab 123 c")).await;
    assert!(matches!(result, Err(EngineError::DuplicatePlate(_))));
}

#[tokio::test]
async fn new_reservation_cannot_start_closed() {
    let engine = new_engine("start_closed.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;

    let mut req = rental(car, alice, T0, Some(T0 + D));
    req.status = Some(ReservationStatus::Completed);
    assert!(matches!(
        engine.create_reservation(req).await,
        Err(EngineError::InvalidStatus(_))
    ));
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn status_transitions_follow_graph() {
    let engine = new_engine("transitions.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;

    let req = rental(car, alice, T0, Some(T0 + D));
    let id = req.id;
    engine.create_reservation(req).await.unwrap();

    assert!(matches!(
        engine.set_reservation_status(id, ReservationStatus::Completed).await,
        Err(EngineError::InvalidTransition {
            from: ReservationStatus::Booked,
            to: ReservationStatus::Completed
        })
    ));
    assert_ok!(engine.set_reservation_status(id, ReservationStatus::PickedUp).await);
    assert_ok!(engine.set_reservation_status(id, ReservationStatus::PickedUp).await);
    assert_err!(engine.set_reservation_status(id, ReservationStatus::Cancelled).await);
    assert_ok!(engine.set_reservation_status(id, ReservationStatus::Returned).await);
    assert_ok!(engine.set_reservation_status(id, ReservationStatus::Completed).await);

    let stored = engine.get_reservation(id).await.unwrap();
    assert_eq!(stored.status, ReservationStatus::Completed);
}

#[tokio::test]
async fn reschedule_ignores_itself_but_not_others() {
    let engine = new_engine("reschedule.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;

    let first = rental(car, alice, T0, Some(T0 + 2 * D));
    let first_id = first.id;
    engine.create_reservation(first).await.unwrap();
    let second = rental(car, alice, T0 + 5 * D, Some(T0 + 6 * D));
    let second_id = second.id;
    engine.create_reservation(second).await.unwrap();

    // Extending within its own period is fine.
    assert_ok!(
        engine
            .reschedule_reservation(first_id, None, Some(Some(T0 + 4 * D)))
            .await
    );
    // Running into the second one is not.
    let result = engine
        .reschedule_reservation(first_id, None, Some(Some(T0 + 5 * D + H)))
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(id)) if id == second_id));

    // Open-ended would swallow the second one too.
    assert_err!(engine.reschedule_reservation(first_id, None, Some(None)).await);

    let stored = engine.get_reservation(first_id).await.unwrap();
    assert_eq!(stored.span, Span::new(T0, T0 + 4 * D));
}

#[tokio::test]
async fn update_reservation_applies_each_field() {
    let engine = new_engine("update_reservation.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let other = add_vehicle(&engine, "VN-001-X").await;
    let alice = add_customer(&engine, "Alice").await;

    let r = rental(car, alice, T0, Some(T0 + D));
    let id = r.id;
    engine.create_reservation(r).await.unwrap();

    let patch = ReservationPatch {
        end: Some(Some(T0 + 3 * D)),
        vehicle_id: Some(other),
        status: Some(ReservationStatus::Booked),
        ..Default::default()
    };
    assert_ok!(engine.update_reservation(id, patch).await);

    let stored = engine.get_reservation(id).await.unwrap();
    assert_eq!(stored.span, Span::new(T0, T0 + 3 * D));
    assert_eq!(stored.vehicle_id, Some(other));
    assert_eq!(stored.status, ReservationStatus::Booked);
    assert_eq!(engine.get_vehicle_for_reservation(&id), Some(other));

    // Progress only applies to maintenance blocks.
    let patch = ReservationPatch {
        maintenance_status: Some(MaintenanceProgress::InProgress),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_reservation(id, patch).await,
        Err(EngineError::InvalidStatus(_))
    ));
}

#[tokio::test]
async fn soft_deleted_reservation_stays_in_history() {
    let engine = new_engine("soft_delete.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;

    let req = rental(car, alice, T0, Some(T0 + D));
    let id = req.id;
    engine.create_reservation(req).await.unwrap();
    engine.delete_reservation(id).await.unwrap();

    let visible = engine.list_reservations(ReservationFilter::default()).await;
    assert!(visible.is_empty());
    let history = engine
        .list_reservations(ReservationFilter {
            include_deleted: true,
            ..Default::default()
        })
        .await;
    assert_eq!(history.len(), 1);
    assert!(history[0].deleted_at.is_some());

    assert!(matches!(
        engine.delete_reservation(id).await,
        Err(EngineError::NotFound(_))
    ));
    assert_ok!(engine.create_reservation(rental(car, alice, T0, Some(T0 + D))).await);
}

#[tokio::test]
async fn batch_insert_is_all_or_nothing() {
    let engine = new_engine("batch_atomic.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let van = add_vehicle(&engine, "VN-001-X").await;
    let alice = add_customer(&engine, "Alice").await;
    engine
        .create_reservation(rental(van, alice, T0 + 10 * D, Some(T0 + 11 * D)))
        .await
        .unwrap();

    let batch = vec![
        rental(car, alice, T0, Some(T0 + D)),
        rental(van, alice, T0 + 10 * D, Some(T0 + 12 * D)),
    ];
    assert!(matches!(
        engine.batch_create_reservations(batch).await,
        Err(EngineError::Conflict(_))
    ));
    let filter = ReservationFilter {
        vehicle_id: Some(car),
        ..Default::default()
    };
    assert!(engine.list_reservations(filter).await.is_empty());

    let batch = vec![
        rental(car, alice, T0, Some(T0 + D)),
        rental(van, alice, T0, Some(T0 + D)),
    ];
    assert_ok!(engine.batch_create_reservations(batch).await);
    assert_eq!(engine.list_reservations(filter).await.len(), 1);
}

#[tokio::test]
async fn batch_rows_conflicting_with_each_other_rejected() {
    let engine = new_engine("batch_intra.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;

    let first = rental(car, alice, T0, Some(T0 + 2 * D));
    let first_id = first.id;
    let batch = vec![first, rental(car, alice, T0 + D, Some(T0 + 3 * D))];
    assert!(matches!(
        engine.batch_create_reservations(batch).await,
        Err(EngineError::Conflict(id)) if id == first_id
    ));

    let mut dup_a = rental(car, alice, T0, Some(T0 + D));
    dup_a.contract_number = Some("C-1".into());
    let mut dup_b = rental(car, alice, T0 + D, Some(T0 + 2 * D));
    dup_b.contract_number = Some("C-1".into());
    assert!(matches!(
        engine.batch_create_reservations(vec![dup_a, dup_b]).await,
        Err(EngineError::DuplicateContract(_))
    ));
    assert!(engine.contracts.is_empty());
}

#[tokio::test]
async fn batch_requires_vehicle_on_every_row() {
    let engine = new_engine("batch_vehicle.wal");
    let alice = add_customer(&engine, "Alice").await;
    let batch = vec![replacement(None, alice, T0, T0 + D)];
    assert!(matches!(
        engine.batch_create_reservations(batch).await,
        Err(EngineError::MissingField("vehicle_id"))
    ));
}

// ── Placeholders & spares ────────────────────────────────

#[tokio::test]
async fn maintenance_over_rental_creates_placeholder() {
    let engine = new_engine("maintenance_placeholder.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;

    engine
        .create_reservation(rental(car, alice, T0, Some(T0 + 10 * D)))
        .await
        .unwrap();
    let block = maintenance(car, T0 + 3 * D, T0 + 5 * D);
    let block_id = block.id;
    let spares = engine.create_reservation(block).await.unwrap();
    assert_eq!(spares.len(), 1);

    let open = engine.list_placeholders();
    assert_eq!(open.len(), 1);
    let p = &open[0];
    assert_eq!(p.id, spares[0]);
    assert_eq!(p.kind, ReservationType::Replacement);
    assert_eq!(p.status, ReservationStatus::Pending);
    assert_eq!(p.vehicle_id, None);
    assert_eq!(p.customer_id, Some(alice));
    assert_eq!(p.covers, Some(block_id));
    assert_eq!(p.span, Span::new(T0 + 3 * D, T0 + 5 * D));
}

#[tokio::test]
async fn maintenance_without_rentals_creates_no_placeholder() {
    let engine = new_engine("maintenance_alone.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let spares = engine
        .create_reservation(maintenance(car, T0, T0 + D))
        .await
        .unwrap();
    assert!(spares.is_empty());
    assert!(engine.list_placeholders().is_empty());
}

#[tokio::test]
async fn assigning_spare_resolves_placeholder() {
    let engine = new_engine("assign_spare.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let busy = add_vehicle(&engine, "BZ-999-Y").await;
    let spare = add_vehicle(&engine, "SP-001-A").await;
    let alice = add_customer(&engine, "Alice").await;
    let bob = add_customer(&engine, "Bob").await;

    engine
        .create_reservation(rental(car, alice, T0, Some(T0 + 10 * D)))
        .await
        .unwrap();
    engine
        .create_reservation(rental(busy, bob, T0, Some(T0 + 10 * D)))
        .await
        .unwrap();
    let spares = engine
        .create_reservation(maintenance(car, T0 + 2 * D, T0 + 4 * D))
        .await
        .unwrap();
    let placeholder = spares[0];

    let candidates = engine.spare_candidates(placeholder).await.unwrap();
    let ids: Vec<Ulid> = candidates.iter().map(|v| v.id).collect();
    assert_eq!(ids, vec![spare]);

    assert!(matches!(
        engine.assign_vehicle(placeholder, busy).await,
        Err(EngineError::Conflict(_))
    ));
    assert_eq!(engine.list_placeholders().len(), 1);

    assert_ok!(engine.assign_vehicle(placeholder, spare).await);
    assert!(engine.list_placeholders().is_empty());
    let resolved = engine.get_reservation(placeholder).await.unwrap();
    assert_eq!(resolved.vehicle_id, Some(spare));
    assert_eq!(engine.get_vehicle_for_reservation(&placeholder), Some(spare));

    // The spare is now taken for that period.
    let result = engine
        .create_reservation(rental(spare, bob, T0 + 3 * D, Some(T0 + 5 * D)))
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(id)) if id == placeholder));
}

#[tokio::test]
async fn placeholder_cannot_be_picked_up() {
    let engine = new_engine("placeholder_pickup.wal");
    let alice = add_customer(&engine, "Alice").await;

    let req = replacement(None, alice, T0, T0 + D);
    let id = req.id;
    engine.create_reservation(req).await.unwrap();
    engine
        .set_reservation_status(id, ReservationStatus::Booked)
        .await
        .unwrap();
    assert!(matches!(
        engine.set_reservation_status(id, ReservationStatus::PickedUp).await,
        Err(EngineError::SpareUnassigned(pid)) if pid == id
    ));
}

#[tokio::test]
async fn cancelling_block_cancels_open_spares() {
    let engine = new_engine("cancel_block.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let spare = add_vehicle(&engine, "SP-001-A").await;
    let alice = add_customer(&engine, "Alice").await;
    let bob = add_customer(&engine, "Bob").await;

    engine
        .create_reservation(rental(car, alice, T0, Some(T0 + 10 * D)))
        .await
        .unwrap();
    engine
        .create_reservation(rental(car, bob, T0 + 10 * D, Some(T0 + 20 * D)))
        .await
        .unwrap();
    let block = maintenance(car, T0 + 8 * D, T0 + 12 * D);
    let block_id = block.id;
    let spares = engine.create_reservation(block).await.unwrap();
    assert_eq!(spares.len(), 2);

    // One spare already has a car assigned.
    engine.assign_vehicle(spares[0], spare).await.unwrap();

    engine
        .set_reservation_status(block_id, ReservationStatus::Cancelled)
        .await
        .unwrap();
    for id in &spares {
        let r = engine.get_reservation(*id).await.unwrap();
        assert_eq!(r.status, ReservationStatus::Cancelled);
    }
    assert!(engine.list_placeholders().is_empty());
}

#[tokio::test]
async fn deleting_block_keeps_picked_up_spares() {
    let engine = new_engine("delete_block.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let spare = add_vehicle(&engine, "SP-001-A").await;
    let alice = add_customer(&engine, "Alice").await;

    engine
        .create_reservation(rental(car, alice, T0, Some(T0 + 10 * D)))
        .await
        .unwrap();
    let block = maintenance(car, T0 + 2 * D, T0 + 4 * D);
    let block_id = block.id;
    let spares = engine.create_reservation(block).await.unwrap();
    engine.assign_vehicle(spares[0], spare).await.unwrap();
    engine
        .set_reservation_status(spares[0], ReservationStatus::PickedUp)
        .await
        .unwrap();

    engine.delete_reservation(block_id).await.unwrap();
    let kept = engine.get_reservation(spares[0]).await.unwrap();
    assert_eq!(kept.status, ReservationStatus::PickedUp);
}

#[tokio::test]
async fn rental_over_existing_block_creates_placeholder() {
    let engine = new_engine("rental_over_block.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;

    let block = maintenance(car, T0 + 3 * D, T0 + 5 * D);
    let block_id = block.id;
    assert!(engine.create_reservation(block).await.unwrap().is_empty());

    let spares = engine
        .create_reservation(rental(car, alice, T0, Some(T0 + 10 * D)))
        .await
        .unwrap();
    assert_eq!(spares.len(), 1);

    let open = engine.list_placeholders();
    assert_eq!(open.len(), 1);
    let p = &open[0];
    assert_eq!(p.id, spares[0]);
    assert_eq!(p.customer_id, Some(alice));
    assert_eq!(p.covers, Some(block_id));
    assert_eq!(p.span, Span::new(T0 + 3 * D, T0 + 5 * D));
}

#[tokio::test]
async fn batch_with_block_and_rental_opens_one_spare() {
    let engine = new_engine("batch_block_rental.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;

    let spares = engine
        .batch_create_reservations(vec![
            maintenance(car, T0 + 3 * D, T0 + 5 * D),
            rental(car, alice, T0, Some(T0 + 10 * D)),
        ])
        .await
        .unwrap();
    assert_eq!(spares.len(), 1);
    assert_eq!(engine.list_placeholders().len(), 1);
}

#[tokio::test]
async fn rescheduling_rental_onto_block_creates_placeholder() {
    let engine = new_engine("reschedule_onto_block.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;

    let block = maintenance(car, T0 + 3 * D, T0 + 5 * D);
    let block_id = block.id;
    engine.create_reservation(block).await.unwrap();
    let req = rental(car, alice, T0, Some(T0 + 2 * D));
    let rental_id = req.id;
    engine.create_reservation(req).await.unwrap();
    assert!(engine.list_placeholders().is_empty());

    engine
        .reschedule_reservation(rental_id, None, Some(Some(T0 + 4 * D)))
        .await
        .unwrap();
    let open = engine.list_placeholders();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].covers, Some(block_id));
    assert_eq!(open[0].span, Span::new(T0 + 3 * D, T0 + 4 * D));

    // Still over the same block: no second spare.
    engine
        .reschedule_reservation(rental_id, None, Some(Some(T0 + 6 * D)))
        .await
        .unwrap();
    assert_eq!(engine.list_placeholders().len(), 1);
}

#[tokio::test]
async fn reassigning_rental_to_blocked_vehicle_creates_placeholder() {
    let engine = new_engine("reassign_onto_block.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let blocked = add_vehicle(&engine, "BL-456-K").await;
    let alice = add_customer(&engine, "Alice").await;

    let block = maintenance(blocked, T0 + D, T0 + 2 * D);
    let block_id = block.id;
    engine.create_reservation(block).await.unwrap();
    let req = rental(car, alice, T0, Some(T0 + 5 * D));
    let rental_id = req.id;
    engine.create_reservation(req).await.unwrap();
    assert!(engine.list_placeholders().is_empty());

    engine.assign_vehicle(rental_id, blocked).await.unwrap();
    assert_eq!(engine.get_vehicle_for_reservation(&rental_id), Some(blocked));
    let open = engine.list_placeholders();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].customer_id, Some(alice));
    assert_eq!(open[0].covers, Some(block_id));
    assert_eq!(open[0].span, Span::new(T0 + D, T0 + 2 * D));
}

#[tokio::test]
async fn maintenance_progress_done_completes_block() {
    let engine = new_engine("maintenance_progress.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let block = maintenance(car, T0, T0 + D);
    let block_id = block.id;
    engine.create_reservation(block).await.unwrap();

    engine
        .set_maintenance_progress(block_id, MaintenanceProgress::InProgress)
        .await
        .unwrap();
    assert_eq!(status_of(&engine, car).await.1, MaintenanceState::InMaintenance);

    engine
        .set_maintenance_progress(block_id, MaintenanceProgress::Done)
        .await
        .unwrap();
    let stored = engine.get_reservation(block_id).await.unwrap();
    assert_eq!(stored.status, ReservationStatus::Completed);
    assert_eq!(stored.maintenance.unwrap().progress, MaintenanceProgress::Done);
    assert_eq!(status_of(&engine, car).await.1, MaintenanceState::Clear);

    assert!(matches!(
        engine
            .set_maintenance_progress(block_id, MaintenanceProgress::InProgress)
            .await,
        Err(EngineError::InvalidStatus(_))
    ));
}

// ── Vehicle status ───────────────────────────────────────

#[tokio::test]
async fn pickup_and_return_drive_vehicle_status() {
    let engine = new_engine("status_pickup_return.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;
    let now = now_ms();

    let req = rental(car, alice, now + D, Some(now + 3 * D));
    let id = req.id;
    engine.create_reservation(req).await.unwrap();
    assert_eq!(status_of(&engine, car).await.0, VehicleStatus::Scheduled);

    engine
        .set_reservation_status(id, ReservationStatus::PickedUp)
        .await
        .unwrap();
    assert_eq!(status_of(&engine, car).await.0, VehicleStatus::Rented);

    engine
        .set_reservation_status(id, ReservationStatus::Returned)
        .await
        .unwrap();
    assert_eq!(status_of(&engine, car).await.0, VehicleStatus::Available);
}

#[tokio::test]
async fn return_keeps_manual_status() {
    let engine = new_engine("status_manual_return.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;
    let now = now_ms();

    let req = NewReservation {
        status: Some(ReservationStatus::PickedUp),
        ..rental(car, alice, now - D, Some(now + D))
    };
    let id = req.id;
    engine.create_reservation(req).await.unwrap();
    assert_eq!(status_of(&engine, car).await.0, VehicleStatus::Rented);

    engine
        .set_vehicle_status(car, VehicleStatus::NeedsFixing)
        .await
        .unwrap();
    engine
        .set_reservation_status(id, ReservationStatus::Returned)
        .await
        .unwrap();
    assert_eq!(status_of(&engine, car).await.0, VehicleStatus::NeedsFixing);

    // Clearing the manual status re-derives from reservations.
    engine
        .set_vehicle_status(car, VehicleStatus::Available)
        .await
        .unwrap();
    assert_eq!(status_of(&engine, car).await.0, VehicleStatus::Available);
}

#[tokio::test]
async fn synchronizer_never_overwrites_manual_status() {
    let engine = new_engine("sync_manual.wal");
    let fixing = add_vehicle(&engine, "FX-001-A").await;
    let parked = add_vehicle(&engine, "NR-002-B").await;
    let normal = add_vehicle(&engine, "OK-003-C").await;
    let alice = add_customer(&engine, "Alice").await;
    let now = now_ms();

    for car in [fixing, normal] {
        engine
            .create_reservation(rental(car, alice, now - H, Some(now + D)))
            .await
            .unwrap();
    }
    engine
        .set_vehicle_status(fixing, VehicleStatus::NeedsFixing)
        .await
        .unwrap();
    engine
        .set_vehicle_status(parked, VehicleStatus::NotForRental)
        .await
        .unwrap();

    engine.sync_all(now + 2 * D).await;
    assert_eq!(status_of(&engine, fixing).await.0, VehicleStatus::NeedsFixing);
    assert_eq!(status_of(&engine, parked).await.0, VehicleStatus::NotForRental);
    // The rental has ended by then.
    assert_eq!(status_of(&engine, normal).await.0, VehicleStatus::Available);
}

#[tokio::test]
async fn synchronizer_picks_up_rentals_starting() {
    let engine = new_engine("sync_start.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;
    let now = now_ms();

    engine
        .create_reservation(rental(car, alice, now + D, Some(now + 2 * D)))
        .await
        .unwrap();
    assert_eq!(status_of(&engine, car).await.0, VehicleStatus::Scheduled);

    assert_eq!(engine.sync_all(now + D + H).await, 1);
    assert_eq!(status_of(&engine, car).await.0, VehicleStatus::Rented);
    assert_eq!(engine.sync_all(now + D + H).await, 0);
}

#[tokio::test]
async fn derived_statuses_cannot_be_set() {
    let engine = new_engine("derived_status.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    assert!(matches!(
        engine.set_vehicle_status(car, VehicleStatus::Rented).await,
        Err(EngineError::InvalidStatus(_))
    ));
    assert!(matches!(
        engine.set_vehicle_status(car, VehicleStatus::Scheduled).await,
        Err(EngineError::InvalidStatus(_))
    ));
}

#[tokio::test]
async fn maintenance_state_tracks_blocks() {
    let engine = new_engine("maintenance_state.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let now = now_ms();

    engine
        .create_reservation(maintenance(car, now + D, now + 2 * D))
        .await
        .unwrap();
    assert_eq!(
        status_of(&engine, car).await,
        (VehicleStatus::Available, MaintenanceState::Scheduled)
    );
    engine.sync_all(now + D + H).await;
    assert_eq!(status_of(&engine, car).await.1, MaintenanceState::InMaintenance);
    engine.sync_all(now + 3 * D).await;
    assert_eq!(status_of(&engine, car).await.1, MaintenanceState::Clear);
}

// ── CRUD ─────────────────────────────────────────────────

#[tokio::test]
async fn retire_blocked_by_active_reservations() {
    let engine = new_engine("retire.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;
    let req = rental(car, alice, T0, Some(T0 + D));
    let id = req.id;
    engine.create_reservation(req).await.unwrap();

    assert!(matches!(
        engine.retire_vehicle(car).await,
        Err(EngineError::HasActiveReservations(v)) if v == car
    ));
    engine
        .set_reservation_status(id, ReservationStatus::Cancelled)
        .await
        .unwrap();
    assert_ok!(engine.retire_vehicle(car).await);

    assert!(engine.list_vehicles(false).await.is_empty());
    assert_eq!(engine.list_vehicles(true).await.len(), 1);
    assert!(matches!(
        engine
            .create_reservation(rental(car, alice, T0 + 5 * D, Some(T0 + 6 * D)))
            .await,
        Err(EngineError::VehicleRetired(_))
    ));
    // The plate can be reused.
    assert_ok!(engine.register_vehicle(Ulid::new(), details("AB-123-C")).await);
}

#[tokio::test]
async fn update_vehicle_fields_and_plate() {
    let engine = new_engine("update_vehicle.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    add_vehicle(&engine, "VN-001-X").await;

    let patch = VehiclePatch {
        model: Some(Some("Golf".into())),
        apk_date: Some(Some(T0)),
        ..Default::default()
    };
    engine.update_vehicle(car, patch).await.unwrap();
    let info = engine.vehicle_info(car).await.unwrap();
    assert_eq!(info.details.model.as_deref(), Some("Golf"));
    assert_eq!(info.details.brand.as_deref(), Some("Volkswagen"));
    assert_eq!(info.details.apk_date, Some(T0));

    let clash = VehiclePatch {
        license_plate: Some("VN-001-X".into()),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_vehicle(car, clash).await,
        Err(EngineError::DuplicatePlate(_))
    ));

    let rename = VehiclePatch {
        license_plate: Some("ZZ-999-Z".into()),
        ..Default::default()
    };
    engine.update_vehicle(car, rename).await.unwrap();
    // Old plate is free again.
    assert_ok!(engine.register_vehicle(Ulid::new(), details("AB-123-C")).await);
}

#[tokio::test]
async fn customer_delete_blocked_by_active_reservations() {
    let engine = new_engine("customer_delete.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;
    let req = rental(car, alice, T0, Some(T0 + D));
    let id = req.id;
    engine.create_reservation(req).await.unwrap();

    assert!(matches!(
        engine.delete_customer(alice).await,
        Err(EngineError::HasActiveReservations(_))
    ));
    engine.delete_reservation(id).await.unwrap();
    assert_ok!(engine.delete_customer(alice).await);
    assert!(engine.list_customers(false).is_empty());
    assert_eq!(engine.list_customers(true).len(), 1);
    assert!(matches!(
        engine.create_reservation(rental(car, alice, T0, Some(T0 + D))).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn customer_update_merges_fields() {
    let engine = new_engine("customer_update.wal");
    let alice = add_customer(&engine, "Alice").await;
    let patch = CustomerPatch {
        email: Some(Some("alice@example.com".into())),
        ..Default::default()
    };
    engine.update_customer(alice, patch).await.unwrap();
    let c = engine.get_customer(alice).unwrap();
    assert_eq!(c.details.name, "Alice");
    assert_eq!(c.details.email.as_deref(), Some("alice@example.com"));

    let blank = CustomerPatch {
        name: Some("  ".into()),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_customer(alice, blank).await,
        Err(EngineError::MissingField("name"))
    ));
}

#[tokio::test]
async fn expenses_recorded_per_vehicle() {
    let engine = new_engine("expenses.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let van = add_vehicle(&engine, "VN-001-X").await;

    let tyres = Expense {
        id: Ulid::new(),
        vehicle_id: car,
        amount_cents: 45_000,
        category: "tyres".into(),
        incurred_at: T0,
        description: None,
    };
    let tyres_id = tyres.id;
    engine.record_expense(tyres).await.unwrap();
    engine
        .record_expense(Expense {
            id: Ulid::new(),
            vehicle_id: van,
            amount_cents: 9_900,
            category: "cleaning".into(),
            incurred_at: T0 + D,
            description: Some("interior".into()),
        })
        .await
        .unwrap();

    assert_eq!(engine.list_expenses(Some(car)).len(), 1);
    assert_eq!(engine.list_expenses(None).len(), 2);
    engine.remove_expense(tyres_id).await.unwrap();
    assert!(engine.list_expenses(Some(car)).is_empty());
    assert!(matches!(
        engine.remove_expense(tyres_id).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn availability_depends_on_reservation_type() {
    let engine = new_engine("availability_type.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;

    engine
        .create_reservation(rental(car, alice, T0 + 2 * D, Some(T0 + 4 * D)))
        .await
        .unwrap();
    engine
        .create_reservation(maintenance(car, T0 + 6 * D, T0 + 7 * D))
        .await
        .unwrap();

    let window = (T0, T0 + 10 * D);
    let for_rental = engine
        .compute_availability(car, window.0, window.1, ReservationType::Standard, None)
        .await
        .unwrap();
    assert_eq!(
        for_rental,
        vec![Span::new(T0, T0 + 2 * D), Span::new(T0 + 4 * D, T0 + 10 * D)]
    );

    let for_spare = engine
        .compute_availability(car, window.0, window.1, ReservationType::Replacement, Some(3 * D))
        .await
        .unwrap();
    assert_eq!(for_spare, vec![Span::new(T0 + 7 * D, T0 + 10 * D)]);

    assert!(matches!(
        engine
            .compute_availability(Ulid::new(), window.0, window.1, ReservationType::Standard, None)
            .await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn fleet_and_vehicle_availability() {
    let engine = new_engine("fleet_availability.wal");
    let a = add_vehicle(&engine, "AA-001-A").await;
    let b = add_vehicle(&engine, "BB-002-B").await;
    let alice = add_customer(&engine, "Alice").await;

    engine
        .create_reservation(rental(a, alice, T0, Some(T0 + 2 * D)))
        .await
        .unwrap();
    engine
        .create_reservation(rental(b, alice, T0 + 3 * D, Some(T0 + 4 * D)))
        .await
        .unwrap();

    let both = engine
        .fleet_availability(T0, T0 + 5 * D, 2, ReservationType::Standard, None)
        .await
        .unwrap();
    assert_eq!(
        both,
        vec![Span::new(T0 + 2 * D, T0 + 3 * D), Span::new(T0 + 4 * D, T0 + 5 * D)]
    );
    let any = engine
        .fleet_availability(T0, T0 + 5 * D, 1, ReservationType::Standard, None)
        .await
        .unwrap();
    assert_eq!(any, vec![Span::new(T0, T0 + 5 * D)]);

    let free = engine
        .available_vehicles(T0, T0 + D, ReservationType::Standard)
        .await
        .unwrap();
    assert_eq!(free.iter().map(|v| v.id).collect::<Vec<_>>(), vec![b]);
}

#[tokio::test]
async fn query_window_is_bounded() {
    let engine = new_engine("query_window.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let result = engine
        .compute_availability(car, T0, T0 + MAX_QUERY_WINDOW_MS + 1, ReservationType::Standard, None)
        .await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
}

#[tokio::test]
async fn query_window_rejects_out_of_range_timestamps() {
    let engine = new_engine("query_window_range.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let kind = ReservationType::Standard;

    let result = engine.compute_availability(car, Ms::MIN, 1, kind, None).await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
    let result = engine.fleet_availability(Ms::MIN, T0, 1, kind, None).await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
    let result = engine.available_vehicles(T0, Ms::MAX, kind).await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
    let result = engine.calendar(Ms::MIN, Ms::MAX, None).await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
}

#[tokio::test]
async fn conflicts_query_lists_blockers() {
    let engine = new_engine("conflicts_query.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;

    let req = rental(car, alice, T0, Some(T0 + 2 * D));
    let rental_id = req.id;
    engine.create_reservation(req).await.unwrap();
    let block = maintenance(car, T0 + D, T0 + 3 * D);
    let block_id = block.id;
    engine.create_reservation(block).await.unwrap();

    let for_rental = engine
        .find_conflicts(car, T0, Some(T0 + 5 * D), ReservationType::Standard)
        .await
        .unwrap();
    assert_eq!(for_rental.iter().map(|r| r.id).collect::<Vec<_>>(), vec![rental_id]);

    let for_spare = engine
        .find_conflicts(car, T0, None, ReservationType::Replacement)
        .await
        .unwrap();
    assert_eq!(for_spare.len(), 2);
    assert!(for_spare.iter().any(|r| r.id == block_id));
}

#[tokio::test]
async fn calendar_shows_live_entries() {
    let engine = new_engine("calendar.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;

    engine
        .create_reservation(rental(car, alice, T0, Some(T0 + 4 * D)))
        .await
        .unwrap();
    let cancelled = rental(car, alice, T0 + 5 * D, Some(T0 + 6 * D));
    let cancelled_id = cancelled.id;
    engine.create_reservation(cancelled).await.unwrap();
    engine
        .set_reservation_status(cancelled_id, ReservationStatus::Cancelled)
        .await
        .unwrap();
    engine
        .create_reservation(maintenance(car, T0 + D, T0 + 2 * D))
        .await
        .unwrap();

    let entries = engine.calendar(T0, T0 + 10 * D, None).await.unwrap();
    let plates: Vec<&str> = entries.iter().map(|e| e.license_plate.as_str()).collect();
    // Rental, maintenance block, and the placeholder it spawned.
    assert_eq!(entries.len(), 3);
    assert!(plates.contains(&"TBD"));
    assert!(entries.iter().all(|e| e.reservation.id != cancelled_id));

    let only_car = engine.calendar(T0, T0 + 10 * D, Some(car)).await.unwrap();
    assert_eq!(only_car.len(), 2);
}

#[tokio::test]
async fn reminders_cover_apk_and_warranty() {
    let engine = new_engine("reminders.wal");
    let now = T0;
    let due = Ulid::new();
    engine
        .register_vehicle(
            due,
            VehicleDetails {
                apk_date: Some(now + 10 * D),
                warranty_end: Some(now + 100 * D),
                ..details("DU-001-E")
            },
        )
        .await
        .unwrap();
    let overdue = Ulid::new();
    engine
        .register_vehicle(
            overdue,
            VehicleDetails {
                apk_date: Some(now - 5 * D),
                warranty_end: Some(now - 2 * D),
                ..details("OV-002-R")
            },
        )
        .await
        .unwrap();
    add_vehicle(&engine, "NO-003-N").await;

    let reminders = engine.reminders(now, 30).await.unwrap();
    let kinds: Vec<(Ulid, ReminderKind)> = reminders.iter().map(|r| (r.vehicle_id, r.kind)).collect();
    assert_eq!(
        kinds,
        vec![
            (overdue, ReminderKind::ApkOverdue),
            (overdue, ReminderKind::WarrantyExpired),
            (due, ReminderKind::ApkDue),
        ]
    );

    let wide = engine.reminders(now, 365).await.unwrap();
    assert!(wide.iter().any(|r| r.kind == ReminderKind::WarrantyExpiring));
    assert_err!(engine.reminders(now, MAX_REMINDER_HORIZON_DAYS + 1).await);
}

// ── Persistence ──────────────────────────────────────────

async fn populate(engine: &Engine) -> (Ulid, Ulid, Ulid) {
    let car = add_vehicle(engine, "AB-123-C").await;
    let spare = add_vehicle(engine, "SP-001-A").await;
    let alice = add_customer(engine, "Alice").await;

    let mut req = rental(car, alice, T0, Some(T0 + 10 * D));
    req.contract_number = Some("C-100".into());
    engine.create_reservation(req).await.unwrap();
    let spares = engine
        .create_reservation(maintenance(car, T0 + D, T0 + 2 * D))
        .await
        .unwrap();
    engine.assign_vehicle(spares[0], spare).await.unwrap();
    engine
        .create_reservation(replacement(None, alice, T0 + 20 * D, T0 + 21 * D))
        .await
        .unwrap();

    let gone = rental(car, alice, T0 + 30 * D, Some(T0 + 31 * D));
    let gone_id = gone.id;
    engine.create_reservation(gone).await.unwrap();
    engine.delete_reservation(gone_id).await.unwrap();

    engine
        .set_vehicle_status(spare, VehicleStatus::NeedsFixing)
        .await
        .unwrap();
    engine
        .record_expense(Expense {
            id: Ulid::new(),
            vehicle_id: car,
            amount_cents: 12_345,
            category: "service".into(),
            incurred_at: T0,
            description: None,
        })
        .await
        .unwrap();
    (car, spare, alice)
}

async fn fingerprint(engine: &Engine) -> (Vec<VehicleInfo>, Vec<Reservation>, Vec<Customer>, Vec<Expense>) {
    let reservations = engine
        .list_reservations(ReservationFilter {
            include_deleted: true,
            ..Default::default()
        })
        .await;
    (
        engine.list_vehicles(true).await,
        reservations,
        engine.list_customers(true),
        engine.list_expenses(None),
    )
}

#[tokio::test]
async fn wal_replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let notify = Arc::new(NotifyHub::new());

    let (before, car, alice) = {
        let engine = Engine::new(path.clone(), notify.clone()).unwrap();
        let (car, _, alice) = populate(&engine).await;
        (fingerprint(&engine).await, car, alice)
    };

    let engine = Engine::new(path, notify).unwrap();
    assert_eq!(fingerprint(&engine).await, before);
    assert_eq!(engine.list_placeholders().len(), 1);

    // Indexes are rebuilt too.
    let mut dup = rental(car, alice, T0 + 50 * D, Some(T0 + 51 * D));
    dup.contract_number = Some("C-100".into());
    assert!(matches!(
        engine.create_reservation(dup).await,
        Err(EngineError::DuplicateContract(_))
    ));
    assert!(matches!(
        engine.register_vehicle(Ulid::new(), details("AB123C")).await,
        Err(EngineError::DuplicatePlate(_))
    ));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact.wal");
    let notify = Arc::new(NotifyHub::new());

    let before = {
        let engine = Engine::new(path.clone(), notify.clone()).unwrap();
        populate(&engine).await;
        let before = fingerprint(&engine).await;
        let appended = engine.wal_appends_since_compact().await;
        assert!(appended > 0);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(fingerprint(&engine).await, before);
        before
    };

    let engine = Engine::new(path, notify).unwrap();
    assert_eq!(fingerprint(&engine).await, before);
}

#[tokio::test]
async fn snapshot_events_rebuild_equal_engine() {
    let source = new_engine("snapshot_source.wal");
    populate(&source).await;
    let events = source.snapshot_events().await;

    let path = test_wal_path("snapshot_restore.wal");
    {
        let mut wal = crate::wal::Wal::open(&path).unwrap();
        for event in &events {
            wal.append(event).unwrap();
        }
    }
    let restored = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(fingerprint(&restored).await, fingerprint(&source).await);
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn vehicle_subscribers_see_reservation_events() {
    let engine = new_engine("notify_vehicle.wal");
    let car = add_vehicle(&engine, "AB-123-C").await;
    let alice = add_customer(&engine, "Alice").await;
    let mut rx = engine.notify.subscribe(car);

    let req = rental(car, alice, T0, Some(T0 + D));
    let id = req.id;
    engine.create_reservation(req).await.unwrap();

    let event = rx.recv().await.unwrap();
    assert!(matches!(event, Event::ReservationCreated { ref reservation } if reservation.id == id));
}
