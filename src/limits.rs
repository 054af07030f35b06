//! Hard caps protecting the engine from pathological input. None of these
//! should be reachable by a well-behaved client.

use crate::model::Min;

/// Max bookings (including cancelled history) stored for a single date.
pub const MAX_BOOKINGS_PER_DAY: usize = 512;

/// Max length of an owner identity string (email-sized).
pub const MAX_OWNER_LEN: usize = 254;

/// Max length of a cancellation reason.
pub const MAX_REASON_LEN: usize = 256;

/// Widest date window a single availability or listing query may cover.
pub const MAX_QUERY_WINDOW_DAYS: i64 = 366;

/// Bookings outside this year range are rejected outright.
pub const MIN_BOOKING_YEAR: i32 = 2000;
pub const MAX_BOOKING_YEAR: i32 = 2100;

/// Upper bound on the configurable buffer (matches the admin form).
pub const MAX_BUFFER_MINUTES: Min = 240;

pub const MAX_TENANTS: usize = 64;
pub const MAX_TENANT_NAME_LEN: usize = 256;
