//! Candidate slot generation. Pure functions of the settings and the date —
//! no clock access, no ledger access; callers pass `today` in.

use chrono::NaiveDate;

use crate::model::{Min, SessionKind, Settings, Span, MINUTES_PER_HOUR};

/// Fixed length of a free introductory session.
pub const FREE_SESSION_MIN: Min = 30;

/// Minimum length of a paid session (one billable hour).
pub const PAID_SESSION_MIN: Min = 60;

fn bookable(settings: &Settings, date: NaiveDate, today: NaiveDate) -> bool {
    date >= today && settings.is_work_day(date)
}

/// Free-session start candidates: a 30-minute cadence across business hours.
/// The last candidate is the one whose session still ends by `work_end`.
/// Empty when the date is not a work day or lies strictly in the past.
pub fn free_slot_starts(settings: &Settings, date: NaiveDate, today: NaiveDate) -> Vec<Min> {
    if !bookable(settings, date, today) {
        return Vec::new();
    }
    let work = settings.work_span();
    let mut starts = Vec::new();
    let mut t = work.start;
    while t + FREE_SESSION_MIN <= work.end {
        starts.push(t);
        t += FREE_SESSION_MIN;
    }
    starts
}

/// Paid-session start candidates: every whole hour from `work_start` through
/// `work_end - 1`, each representing at least a one-hour booking.
pub fn paid_slot_starts(settings: &Settings, date: NaiveDate, today: NaiveDate) -> Vec<Min> {
    if !bookable(settings, date, today) {
        return Vec::new();
    }
    (settings.work_start..settings.work_end)
        .map(|h| h as Min * MINUTES_PER_HOUR)
        .collect()
}

pub fn slot_starts(
    settings: &Settings,
    date: NaiveDate,
    kind: SessionKind,
    today: NaiveDate,
) -> Vec<Min> {
    match kind {
        SessionKind::Free => free_slot_starts(settings, date, today),
        SessionKind::Paid => paid_slot_starts(settings, date, today),
    }
}

/// Valid end times for a paid session starting at `start`: every later hourly
/// mark up to `work_end`.
pub fn paid_end_candidates(settings: &Settings, start: Min) -> Vec<Min> {
    let work = settings.work_span();
    let mut ends = Vec::new();
    let mut t = start + MINUTES_PER_HOUR;
    while t <= work.end {
        ends.push(t);
        t += MINUTES_PER_HOUR;
    }
    ends
}

/// The span a candidate occupies at its minimum duration. Used by the
/// advisory slot listing; paid sessions may extend further at reserve time.
pub fn minimum_span(kind: SessionKind, start: Min) -> Span {
    match kind {
        SessionKind::Free => Span::new(start, start + FREE_SESSION_MIN),
        SessionKind::Paid => Span::new(start, start + PAID_SESSION_MIN),
    }
}
