use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Ms
}

/// Build a reservation period from optional dates. A missing end is an
/// open-ended rental.
pub(crate) fn reservation_span(start: Option<Ms>, end: Option<Ms>) -> Result<Span, EngineError> {
    use crate::limits::*;
    let start = start.ok_or(EngineError::MissingDates)?;
    if start < MIN_VALID_TIMESTAMP_MS || start > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let Some(end) = end else {
        return Ok(Span::open(start));
    };
    if end <= start {
        return Err(EngineError::InvalidSpan(Span { start, end }));
    }
    if end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("reservation too long"));
    }
    Ok(Span::new(start, end))
}

/// Validate a closed query window.
pub(crate) fn query_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&start)
        || !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&end)
    {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end <= start {
        return Err(EngineError::InvalidSpan(Span { start, end }));
    }
    if end - start > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(Span::new(start, end))
}

/// Whether the vehicle accepts a new reservation of `kind` at all.
pub(crate) fn check_rentable(vs: &VehicleState, kind: ReservationType) -> Result<(), EngineError> {
    if vs.is_retired() {
        return Err(EngineError::VehicleRetired(vs.id));
    }
    if kind.is_rental() && vs.status == VehicleStatus::NotForRental {
        return Err(EngineError::NotRentable(vs.id));
    }
    Ok(())
}

/// Active reservations on the vehicle that overlap `span` and may not share
/// it with a reservation of `kind`. `exclude` skips the reservation being moved.
pub(crate) fn find_conflicts<'a>(
    vs: &'a VehicleState,
    span: &'a Span,
    kind: ReservationType,
    exclude: Option<Ulid>,
) -> impl Iterator<Item = &'a Reservation> {
    vs.overlapping(span).filter(move |r| {
        r.is_active() && Some(r.id) != exclude && r.kind.conflicts_with(kind)
    })
}

pub(crate) fn check_no_conflict(
    vs: &VehicleState,
    span: &Span,
    kind: ReservationType,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflicts(vs, span, kind, exclude).next() {
        Some(existing) => {
            metrics::counter!(crate::observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
            Err(EngineError::Conflict(existing.id))
        }
        None => Ok(()),
    }
}

/// Recompute `(status, maintenance_state)` from the vehicle's active
/// reservations at `now`. A manual `current` status is returned unchanged.
pub(crate) fn derive_status(
    vs: &VehicleState,
    current: VehicleStatus,
    now: Ms,
) -> (VehicleStatus, MaintenanceState) {
    let mut rented = false;
    let mut upcoming_rental = false;
    let mut in_maintenance = false;
    let mut upcoming_maintenance = false;

    for r in vs.active() {
        if r.kind.is_rental() {
            if r.status == ReservationStatus::PickedUp || r.span.contains_instant(now) {
                rented = true;
            } else if r.span.start > now {
                upcoming_rental = true;
            }
        } else {
            let started = r
                .maintenance
                .as_ref()
                .is_some_and(|m| m.progress == MaintenanceProgress::InProgress);
            if started || r.span.contains_instant(now) {
                in_maintenance = true;
            } else if r.span.start > now {
                upcoming_maintenance = true;
            }
        }
    }

    let status = if current.is_manual() {
        current
    } else if rented {
        VehicleStatus::Rented
    } else if upcoming_rental {
        VehicleStatus::Scheduled
    } else {
        VehicleStatus::Available
    };
    let maintenance_state = if in_maintenance {
        MaintenanceState::InMaintenance
    } else if upcoming_maintenance {
        MaintenanceState::Scheduled
    } else {
        MaintenanceState::Clear
    };
    (status, maintenance_state)
}
