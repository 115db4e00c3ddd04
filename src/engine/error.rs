use ulid::Ulid;

use crate::model::{ReservationStatus, Span};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    Conflict(Ulid),
    DuplicateContract(String),
    DuplicatePlate(String),
    MissingDates,
    InvalidSpan(Span),
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    InvalidStatus(&'static str),
    NotRentable(Ulid),
    VehicleRetired(Ulid),
    SpareUnassigned(Ulid),
    HasActiveReservations(Ulid),
    MissingField(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => {
                write!(f, "vehicle has conflicting reservation: {id}")
            }
            EngineError::DuplicateContract(n) => {
                write!(f, "contract number already exists: {n}")
            }
            EngineError::DuplicatePlate(p) => {
                write!(f, "license plate already registered: {p}")
            }
            EngineError::MissingDates => write!(f, "reservation needs a start date"),
            EngineError::InvalidSpan(span) => {
                write!(f, "invalid period [{}, {})", span.start, span.end)
            }
            EngineError::InvalidTransition { from, to } => write!(
                f,
                "cannot change reservation status from {} to {}",
                from.as_str(),
                to.as_str()
            ),
            EngineError::InvalidStatus(msg) => write!(f, "invalid status: {msg}"),
            EngineError::NotRentable(id) => write!(f, "vehicle {id} is not for rental"),
            EngineError::VehicleRetired(id) => write!(f, "vehicle {id} is retired"),
            EngineError::SpareUnassigned(id) => {
                write!(f, "reservation {id} has no spare vehicle assigned")
            }
            EngineError::HasActiveReservations(id) => {
                write!(f, "cannot delete {id}: has active reservations")
            }
            EngineError::MissingField(name) => write!(f, "missing field: {name}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
