use crate::model::{DAY_MS, Ms};

pub const MAX_VEHICLES_PER_TENANT: usize = 10_000;
pub const MAX_CUSTOMERS_PER_TENANT: usize = 1_000_000;
pub const MAX_RESERVATIONS_PER_VEHICLE: usize = 50_000;
pub const MAX_PLACEHOLDERS_PER_TENANT: usize = 10_000;
pub const MAX_EXPENSES_PER_TENANT: usize = 1_000_000;

pub const MAX_PLATE_LEN: usize = 32;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CONTRACT_LEN: usize = 64;
pub const MAX_NOTES_LEN: usize = 4096;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
/// Longest closed reservation. Open-ended rentals are exempt.
pub const MAX_SPAN_DURATION_MS: Ms = 5 * 366 * DAY_MS;
pub const MAX_MAINTENANCE_DAYS: u32 = 366;

pub const MAX_QUERY_WINDOW_MS: Ms = 2 * 366 * DAY_MS;
pub const MAX_BATCH_SIZE: usize = 1_000;
pub const MAX_REMINDER_HORIZON_DAYS: u32 = 3_660;

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
