//! bookd — a consulting-session booking engine.
//!
//! Turns a mutable business-hours configuration plus a ledger of existing
//! reservations into concrete bookable slots, and turns a slot selection into
//! a confirmed (or payment-pending) booking without letting two clients claim
//! the same time. State is kept in memory behind per-date locks and made
//! durable through a write-ahead log; the whole thing is exposed as a small
//! SQL dialect over the Postgres wire protocol.

pub mod auth;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod payment;
pub mod reaper;
pub mod slots;
pub mod sql;
pub mod tenant;
pub mod tls;
pub mod wal;
pub mod wire;
pub mod workflow;
