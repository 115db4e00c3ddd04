use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// End marker of an open-ended rental. Blocks everything after `start`.
pub const OPEN_END: Ms = Ms::MAX;

pub const DAY_MS: Ms = 86_400_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Span with no end date.
    pub fn open(start: Ms) -> Self {
        Self { start, end: OPEN_END }
    }

    /// Build from an optional end; `None` means open-ended.
    pub fn from_parts(start: Ms, end: Option<Ms>) -> Self {
        match end {
            Some(end) => Self::new(start, end),
            None => Self::open(start),
        }
    }

    pub fn is_open_ended(&self) -> bool {
        self.end == OPEN_END
    }

    pub fn end_opt(&self) -> Option<Ms> {
        if self.is_open_ended() { None } else { Some(self.end) }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end.saturating_sub(self.start)
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Overlapping part of two spans, if any.
    pub fn intersection(&self, other: &Span) -> Option<Span> {
        if !self.overlaps(other) {
            return None;
        }
        Some(Span::new(self.start.max(other.start), self.end.min(other.end)))
    }
}

// ── Enumerations ─────────────────────────────────────────────────

/// Availability status of a vehicle. `NeedsFixing` and `NotForRental` are
/// manual: only an explicit status update sets or clears them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VehicleStatus {
    Available,
    Scheduled,
    Rented,
    NeedsFixing,
    NotForRental,
}

impl VehicleStatus {
    pub fn is_manual(self) -> bool {
        matches!(self, VehicleStatus::NeedsFixing | VehicleStatus::NotForRental)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VehicleStatus::Available => "available",
            VehicleStatus::Scheduled => "scheduled",
            VehicleStatus::Rented => "rented",
            VehicleStatus::NeedsFixing => "needs_fixing",
            VehicleStatus::NotForRental => "not_for_rental",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "available" => Some(VehicleStatus::Available),
            "scheduled" => Some(VehicleStatus::Scheduled),
            "rented" => Some(VehicleStatus::Rented),
            "needs_fixing" => Some(VehicleStatus::NeedsFixing),
            "not_for_rental" => Some(VehicleStatus::NotForRental),
            _ => None,
        }
    }
}

/// Derived maintenance situation of a vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaintenanceState {
    Clear,
    Scheduled,
    InMaintenance,
}

impl MaintenanceState {
    pub fn as_str(self) -> &'static str {
        match self {
            MaintenanceState::Clear => "none",
            MaintenanceState::Scheduled => "scheduled",
            MaintenanceState::InMaintenance => "in_maintenance",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationType {
    Standard,
    MaintenanceBlock,
    Replacement,
}

impl ReservationType {
    /// Whether two reservations of these types may not overlap on one vehicle.
    /// A maintenance block never collides with a standard rental: the customer
    /// keeps driving on a spare.
    pub fn conflicts_with(self, other: ReservationType) -> bool {
        use ReservationType::*;
        !matches!(
            (self, other),
            (Standard, MaintenanceBlock) | (MaintenanceBlock, Standard)
        )
    }

    /// Customer-facing rentals, as opposed to maintenance windows.
    pub fn is_rental(self) -> bool {
        matches!(self, ReservationType::Standard | ReservationType::Replacement)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationType::Standard => "standard",
            ReservationType::MaintenanceBlock => "maintenance_block",
            ReservationType::Replacement => "replacement",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Some(ReservationType::Standard),
            "maintenance_block" | "maintenance" => Some(ReservationType::MaintenanceBlock),
            "replacement" => Some(ReservationType::Replacement),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Booked,
    PickedUp,
    Returned,
    Completed,
    Cancelled,
}

impl ReservationStatus {
    /// Active reservations occupy their vehicle.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ReservationStatus::Pending | ReservationStatus::Booked | ReservationStatus::PickedUp
        )
    }

    /// Allowed status transitions for a reservation of type `kind`.
    pub fn can_transition(kind: ReservationType, from: Self, to: Self) -> bool {
        use ReservationStatus::*;
        if from == to {
            return true;
        }
        if kind == ReservationType::MaintenanceBlock {
            return matches!(
                (from, to),
                (Pending, Booked) | (Booked, Pending) | (Pending | Booked, Completed | Cancelled)
            );
        }
        matches!(
            (from, to),
            (Pending, Booked | PickedUp | Cancelled)
                | (Booked, Pending | PickedUp | Cancelled)
                | (PickedUp, Returned)
                | (Returned, Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Booked => "booked",
            ReservationStatus::PickedUp => "picked_up",
            ReservationStatus::Returned => "returned",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(ReservationStatus::Pending),
            "booked" | "confirmed" => Some(ReservationStatus::Booked),
            "picked_up" => Some(ReservationStatus::PickedUp),
            "returned" => Some(ReservationStatus::Returned),
            "completed" => Some(ReservationStatus::Completed),
            "cancelled" | "canceled" => Some(ReservationStatus::Cancelled),
            _ => None,
        }
    }
}

/// Progress of a maintenance block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaintenanceProgress {
    Scheduled,
    InProgress,
    Done,
}

impl MaintenanceProgress {
    pub fn as_str(self) -> &'static str {
        match self {
            MaintenanceProgress::Scheduled => "scheduled",
            MaintenanceProgress::InProgress => "in_progress",
            MaintenanceProgress::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "scheduled" => Some(MaintenanceProgress::Scheduled),
            "in_progress" => Some(MaintenanceProgress::InProgress),
            "done" | "completed" => Some(MaintenanceProgress::Done),
            _ => None,
        }
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceDetails {
    pub duration_days: Option<u32>,
    pub progress: MaintenanceProgress,
    /// Sub-type such as `apk`, `service` or `repair`.
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    /// `None` for a placeholder spare that has no vehicle yet.
    pub vehicle_id: Option<Ulid>,
    /// `None` for maintenance blocks.
    pub customer_id: Option<Ulid>,
    pub span: Span,
    pub kind: ReservationType,
    pub status: ReservationStatus,
    pub contract_number: Option<String>,
    pub notes: Option<String>,
    pub maintenance: Option<MaintenanceDetails>,
    /// Replacements only: the maintenance block this spare stands in for.
    pub covers: Option<Ulid>,
    pub deleted_at: Option<Ms>,
}

impl Reservation {
    /// Not deleted and in a status that occupies the vehicle.
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none() && self.status.is_active()
    }

    pub fn is_placeholder(&self) -> bool {
        self.kind == ReservationType::Replacement && self.vehicle_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleDetails {
    pub license_plate: String,
    pub brand: Option<String>,
    pub model: Option<String>,
    /// Next APK inspection due.
    pub apk_date: Option<Ms>,
    pub warranty_end: Option<Ms>,
}

#[derive(Debug, Clone)]
pub struct VehicleState {
    pub id: Ulid,
    pub details: VehicleDetails,
    pub status: VehicleStatus,
    pub maintenance_state: MaintenanceState,
    pub retired_at: Option<Ms>,
    /// All reservations ever placed on this vehicle, sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl VehicleState {
    pub fn new(id: Ulid, details: VehicleDetails) -> Self {
        Self {
            id,
            details,
            status: VehicleStatus::Available,
            maintenance_state: MaintenanceState::Clear,
            retired_at: None,
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    /// Mutable access for fields that do not affect ordering.
    /// Use [`VehicleState::reschedule`] to move a reservation in time.
    pub fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    pub fn reschedule(&mut self, id: Ulid, span: Span) -> bool {
        match self.remove_reservation(id) {
            Some(mut r) => {
                r.span = span;
                self.insert_reservation(r);
                true
            }
            None => false,
        }
    }

    /// Return only reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    pub fn active(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter().filter(|r| r.is_active())
    }

    pub fn is_retired(&self) -> bool {
        self.retired_at.is_some()
    }

    pub fn info(&self) -> VehicleInfo {
        VehicleInfo {
            id: self.id,
            details: self.details.clone(),
            status: self.status,
            maintenance_state: self.maintenance_state,
            retired_at: self.retired_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerDetails {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Customer {
    pub id: Ulid,
    pub details: CustomerDetails,
    pub deleted_at: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expense {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub amount_cents: i64,
    pub category: String,
    pub incurred_at: Ms,
    pub description: Option<String>,
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    VehicleRegistered {
        id: Ulid,
        details: VehicleDetails,
    },
    VehicleUpdated {
        id: Ulid,
        details: VehicleDetails,
    },
    VehicleStatusChanged {
        id: Ulid,
        status: VehicleStatus,
        maintenance_state: MaintenanceState,
    },
    VehicleRetired {
        id: Ulid,
        at: Ms,
    },
    CustomerCreated {
        id: Ulid,
        details: CustomerDetails,
    },
    CustomerUpdated {
        id: Ulid,
        details: CustomerDetails,
    },
    CustomerDeleted {
        id: Ulid,
        at: Ms,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationRescheduled {
        id: Ulid,
        vehicle_id: Option<Ulid>,
        span: Span,
    },
    ReservationStatusChanged {
        id: Ulid,
        vehicle_id: Option<Ulid>,
        status: ReservationStatus,
    },
    MaintenanceProgressed {
        id: Ulid,
        vehicle_id: Ulid,
        progress: MaintenanceProgress,
    },
    /// Move to another vehicle; `from: None` resolves a placeholder spare.
    ReservationReassigned {
        id: Ulid,
        from: Option<Ulid>,
        to: Ulid,
    },
    ReservationDeleted {
        id: Ulid,
        vehicle_id: Option<Ulid>,
        at: Ms,
    },
    ExpenseRecorded {
        expense: Expense,
    },
    ExpenseRemoved {
        id: Ulid,
        vehicle_id: Ulid,
    },
}

impl Event {
    /// Vehicles whose subscribers should hear about this event.
    pub fn vehicle_ids(&self) -> Vec<Ulid> {
        match self {
            Event::VehicleRegistered { id, .. }
            | Event::VehicleUpdated { id, .. }
            | Event::VehicleStatusChanged { id, .. }
            | Event::VehicleRetired { id, .. } => vec![*id],
            Event::ReservationCreated { reservation } => reservation.vehicle_id.into_iter().collect(),
            Event::ReservationRescheduled { vehicle_id, .. }
            | Event::ReservationStatusChanged { vehicle_id, .. }
            | Event::ReservationDeleted { vehicle_id, .. } => vehicle_id.iter().copied().collect(),
            Event::MaintenanceProgressed { vehicle_id, .. } => vec![*vehicle_id],
            Event::ReservationReassigned { from, to, .. } => {
                from.iter().copied().chain(std::iter::once(*to)).collect()
            }
            Event::ExpenseRecorded { expense } => vec![expense.vehicle_id],
            Event::ExpenseRemoved { vehicle_id, .. } => vec![*vehicle_id],
            Event::CustomerCreated { .. }
            | Event::CustomerUpdated { .. }
            | Event::CustomerDeleted { .. } => Vec::new(),
        }
    }
}

// ── Command input types ──────────────────────────────────────────

/// A reservation as requested by a client, before defaults and validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub id: Ulid,
    pub vehicle_id: Option<Ulid>,
    pub customer_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub kind: ReservationType,
    pub status: Option<ReservationStatus>,
    pub contract_number: Option<String>,
    pub notes: Option<String>,
    pub duration_days: Option<u32>,
    pub maintenance_kind: Option<String>,
}

impl NewReservation {
    pub fn new(id: Ulid, kind: ReservationType) -> Self {
        Self {
            id,
            vehicle_id: None,
            customer_id: None,
            start: None,
            end: None,
            kind,
            status: None,
            contract_number: None,
            notes: None,
            duration_days: None,
            maintenance_kind: None,
        }
    }
}

/// Partial vehicle update. Outer `None` leaves a field untouched; for nullable
/// fields `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VehiclePatch {
    pub license_plate: Option<String>,
    pub brand: Option<Option<String>>,
    pub model: Option<Option<String>>,
    pub apk_date: Option<Option<Ms>>,
    pub warranty_end: Option<Option<Ms>>,
    pub status: Option<VehicleStatus>,
}

impl VehiclePatch {
    pub fn has_details(&self) -> bool {
        self.license_plate.is_some()
            || self.brand.is_some()
            || self.model.is_some()
            || self.apk_date.is_some()
            || self.warranty_end.is_some()
    }

    pub fn apply(&self, details: &VehicleDetails) -> VehicleDetails {
        VehicleDetails {
            license_plate: self
                .license_plate
                .clone()
                .unwrap_or_else(|| details.license_plate.clone()),
            brand: self.brand.clone().unwrap_or_else(|| details.brand.clone()),
            model: self.model.clone().unwrap_or_else(|| details.model.clone()),
            apk_date: self.apk_date.unwrap_or(details.apk_date),
            warranty_end: self.warranty_end.unwrap_or(details.warranty_end),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerPatch {
    pub name: Option<String>,
    pub email: Option<Option<String>>,
    pub phone: Option<Option<String>>,
}

impl CustomerPatch {
    pub fn apply(&self, details: &CustomerDetails) -> CustomerDetails {
        CustomerDetails {
            name: self.name.clone().unwrap_or_else(|| details.name.clone()),
            email: self.email.clone().unwrap_or_else(|| details.email.clone()),
            phone: self.phone.clone().unwrap_or_else(|| details.phone.clone()),
        }
    }
}

/// Changes to an existing reservation. Each set field is one lifecycle step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub start: Option<Ms>,
    /// `Some(None)` makes the reservation open-ended.
    pub end: Option<Option<Ms>>,
    pub status: Option<ReservationStatus>,
    pub vehicle_id: Option<Ulid>,
    pub maintenance_status: Option<MaintenanceProgress>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub vehicle_id: Option<Ulid>,
    pub customer_id: Option<Ulid>,
    pub include_deleted: bool,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleInfo {
    pub id: Ulid,
    pub details: VehicleDetails,
    pub status: VehicleStatus,
    pub maintenance_state: MaintenanceState,
    pub retired_at: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEntry {
    pub reservation: Reservation,
    pub license_plate: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderKind {
    ApkDue,
    ApkOverdue,
    WarrantyExpiring,
    WarrantyExpired,
}

impl ReminderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReminderKind::ApkDue => "apk_due",
            ReminderKind::ApkOverdue => "apk_overdue",
            ReminderKind::WarrantyExpiring => "warranty_expiring",
            ReminderKind::WarrantyExpired => "warranty_expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reminder {
    pub vehicle_id: Ulid,
    pub license_plate: String,
    pub kind: ReminderKind,
    pub due: Ms,
}
