use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — absolute instants (creation times, hold deadlines).
pub type Ms = i64;

/// Minutes since local midnight — times-of-day within one business day.
/// All times are local to the single fixed business timezone.
pub type Min = i32;

pub const MINUTES_PER_HOUR: Min = 60;

/// Price of a paid session, per whole hour.
pub const HOURLY_RATE_CENTS: i64 = 7_500;

/// Half-open interval `[start, end)` in minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Min,
    pub end: Min,
}

impl Span {
    pub fn new(start: Min, end: Min) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_min(&self) -> Min {
        self.end - self.start
    }

    /// Whole hours covered; only meaningful for hour-aligned paid spans.
    pub fn duration_hours(&self) -> i64 {
        (self.duration_min() / MINUTES_PER_HOUR) as i64
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Session kind. Free sessions are fixed-length introductions; paid sessions
/// are variable-length and billed hourly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionKind {
    Free,
    Paid,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Free => "free",
            SessionKind::Paid => "paid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(SessionKind::Free),
            "paid" => Some(SessionKind::Paid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    /// Paid hold awaiting payment confirmation.
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "cancelled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }
}

/// A reservation of a half-open time interval on one calendar date.
///
/// Bookings are never physically deleted: cancellation flips `status` and the
/// record stays in the day's history for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub kind: SessionKind,
    /// Opaque client identity from the external identity provider.
    pub owner: String,
    pub status: BookingStatus,
    /// Correlation token binding a payment transaction to this booking.
    /// Present exactly for paid bookings; set once at creation, immutable.
    pub payment_ref: Option<String>,
    /// Provider transaction id recorded when a paid booking is confirmed.
    pub provider_txn_id: Option<String>,
    /// Hold deadline while a paid booking is pending.
    pub expires_at: Option<Ms>,
    pub created_at: Ms,
    pub cancel_reason: Option<String>,
}

impl Booking {
    /// Whether this booking blocks time at instant `now`. Cancelled bookings
    /// and pending holds past their deadline do not.
    pub fn blocks_at(&self, now: Ms) -> bool {
        match self.status {
            BookingStatus::Confirmed => true,
            BookingStatus::Pending => self.expires_at.is_none_or(|e| e > now),
            BookingStatus::Cancelled => false,
        }
    }

    pub fn amount_cents(&self) -> i64 {
        match self.kind {
            SessionKind::Free => 0,
            SessionKind::Paid => self.span.duration_hours() * HOURLY_RATE_CENTS,
        }
    }
}

/// Weekday number as the settings store uses it: 0=Sunday .. 6=Saturday.
pub fn weekday_number(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// Business-hour configuration. Singleton per engine, admin-mutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Weekday numbers (0=Sunday .. 6=Saturday) open for booking. Non-empty.
    pub work_days: Vec<u8>,
    /// First bookable hour, 24h clock.
    pub work_start: u8,
    /// Hour at which bookings must have ended.
    pub work_end: u8,
    /// Mandatory idle minutes between the end of one booking and the start
    /// of the next.
    pub buffer_minutes: Min,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            work_days: vec![1, 2, 3, 4, 5],
            work_start: 9,
            work_end: 17,
            buffer_minutes: 60,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.work_days.is_empty() {
            return Err("work_days must not be empty");
        }
        if self.work_days.iter().any(|d| *d > 6) {
            return Err("work_days entries must be 0..=6");
        }
        if self.work_start >= self.work_end || self.work_end > 24 {
            return Err("work hours must satisfy 0 <= start < end <= 24");
        }
        if self.buffer_minutes < 0 || self.buffer_minutes > crate::limits::MAX_BUFFER_MINUTES {
            return Err("buffer_minutes out of range");
        }
        Ok(())
    }

    pub fn is_work_day(&self, date: NaiveDate) -> bool {
        self.work_days.contains(&weekday_number(date))
    }

    /// Business hours as minutes since midnight.
    pub fn work_span(&self) -> Span {
        Span::new(
            self.work_start as Min * MINUTES_PER_HOUR,
            self.work_end as Min * MINUTES_PER_HOUR,
        )
    }
}

/// All bookings for one calendar date, sorted by `span.start`.
/// The shared mutable unit: one write lock per date serializes conflicting
/// reservations while distinct dates proceed in parallel.
#[derive(Debug, Clone)]
pub struct DayState {
    pub date: NaiveDate,
    pub bookings: Vec<Booking>,
}

impl DayState {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            bookings: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn get(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings that block time at instant `now`.
    pub fn active(&self, now: Ms) -> impl Iterator<Item = &Booking> {
        self.bookings.iter().filter(move |b| b.blocks_at(now))
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
///
/// `BookingCreated` carries the full record (including status), so a compacted
/// WAL can restore any booking's history with a single event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SettingsUpdated {
        settings: Settings,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingConfirmed {
        id: Ulid,
        provider_txn_id: Option<String>,
    },
    BookingCancelled {
        id: Ulid,
        reason: String,
    },
}

// ── Query result types ───────────────────────────────────────────

/// Blocked range on one date, rounded outward to whole hours for the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourBlock {
    pub from: u8,
    pub to: u8,
}

/// One candidate slot with its advisory availability. The authoritative
/// check still happens at reserve time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub start: Min,
    pub end: Min,
    pub amount_cents: i64,
    pub available: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub status: Option<BookingStatus>,
    pub kind: Option<SessionKind>,
}

/// Aggregate reporting counters. Revenue sums confirmed paid bookings only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub total: u64,
    pub free: u64,
    pub paid: u64,
    pub pending: u64,
    pub cancelled: u64,
    pub revenue_cents: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn booking(start: Min, end: Min, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            date: date(2026, 9, 2),
            span: Span::new(start, end),
            kind: SessionKind::Free,
            owner: "client@example.com".into(),
            status,
            payment_ref: None,
            provider_txn_id: None,
            expires_at: None,
            created_at: 0,
            cancel_reason: None,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(600, 660);
        assert_eq!(s.duration_min(), 60);
        assert_eq!(s.duration_hours(), 1);
    }

    #[test]
    fn span_overlap_half_open() {
        let a = Span::new(600, 660);
        let b = Span::new(630, 690);
        let c = Span::new(660, 720);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn weekday_numbering_matches_settings_store() {
        // 2026-09-06 is a Sunday
        assert_eq!(weekday_number(date(2026, 9, 6)), 0);
        assert_eq!(weekday_number(date(2026, 9, 7)), 1); // Monday
        assert_eq!(weekday_number(date(2026, 9, 12)), 6); // Saturday
    }

    #[test]
    fn default_settings_are_weekdays_nine_to_five() {
        let s = Settings::default();
        assert!(s.validate().is_ok());
        assert!(s.is_work_day(date(2026, 9, 2))); // Wednesday
        assert!(!s.is_work_day(date(2026, 9, 6))); // Sunday
        assert_eq!(s.work_span(), Span::new(540, 1020));
    }

    #[test]
    fn settings_validation_rejects_bad_values() {
        let mut s = Settings::default();
        s.work_days.clear();
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.work_days = vec![7];
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.work_start = 17;
        s.work_end = 9;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.buffer_minutes = 100_000;
        assert!(s.validate().is_err());
    }

    #[test]
    fn cancelled_booking_does_not_block() {
        assert!(booking(600, 630, BookingStatus::Confirmed).blocks_at(0));
        assert!(!booking(600, 630, BookingStatus::Cancelled).blocks_at(0));
    }

    #[test]
    fn expired_pending_hold_does_not_block() {
        let mut b = booking(600, 660, BookingStatus::Pending);
        b.expires_at = Some(1_000);
        assert!(b.blocks_at(999));
        assert!(!b.blocks_at(1_000));
        assert!(!b.blocks_at(2_000));
    }

    #[test]
    fn paid_amount_is_hours_times_rate() {
        let mut b = booking(780, 900, BookingStatus::Pending); // 13:00-15:00
        b.kind = SessionKind::Paid;
        assert_eq!(b.amount_cents(), 2 * HOURLY_RATE_CENTS);
        b.kind = SessionKind::Free;
        assert_eq!(b.amount_cents(), 0);
    }

    #[test]
    fn day_insert_keeps_start_order() {
        let mut day = DayState::new(date(2026, 9, 2));
        day.insert(booking(780, 810, BookingStatus::Confirmed));
        day.insert(booking(540, 570, BookingStatus::Confirmed));
        day.insert(booking(660, 690, BookingStatus::Confirmed));
        let starts: Vec<Min> = day.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![540, 660, 780]);
    }

    #[test]
    fn day_active_filters_history() {
        let mut day = DayState::new(date(2026, 9, 2));
        day.insert(booking(540, 570, BookingStatus::Confirmed));
        day.insert(booking(600, 630, BookingStatus::Cancelled));
        let mut expired = booking(660, 720, BookingStatus::Pending);
        expired.expires_at = Some(5);
        day.insert(expired);
        assert_eq!(day.active(10).count(), 1);
        assert_eq!(day.bookings.len(), 3); // history retained
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            booking: booking(600, 630, BookingStatus::Confirmed),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);

        let event = Event::SettingsUpdated {
            settings: Settings::default(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
