use chrono::{Datelike, NaiveDate};

use crate::limits::*;
use crate::model::*;
use crate::slots::FREE_SESSION_MIN;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Current calendar date. The process runs in the business timezone.
pub(crate) fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

/// Everything that can be rejected before touching the ledger: malformed
/// intervals, past dates, off days, out-of-hours or misaligned slots.
pub(crate) fn validate_booking(
    settings: &Settings,
    date: NaiveDate,
    span: &Span,
    kind: SessionKind,
    owner: &str,
    today: NaiveDate,
) -> Result<(), EngineError> {
    if owner.is_empty() {
        return Err(EngineError::Validation("owner identity required"));
    }
    if owner.len() > MAX_OWNER_LEN {
        return Err(EngineError::LimitExceeded("owner identity too long"));
    }
    if date.year() < MIN_BOOKING_YEAR || date.year() > MAX_BOOKING_YEAR {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    if span.start >= span.end {
        return Err(EngineError::Validation("interval is empty"));
    }
    if date < today {
        return Err(EngineError::Validation("cannot book a past date"));
    }
    if !settings.is_work_day(date) {
        return Err(EngineError::Validation("not a work day"));
    }
    let work = settings.work_span();
    if span.start < work.start || span.end > work.end {
        return Err(EngineError::Validation("outside business hours"));
    }
    match kind {
        SessionKind::Free => {
            if span.duration_min() != FREE_SESSION_MIN {
                return Err(EngineError::Validation("free sessions are 30 minutes"));
            }
            if (span.start - work.start) % FREE_SESSION_MIN != 0 {
                return Err(EngineError::Validation(
                    "free sessions start on the half hour",
                ));
            }
        }
        SessionKind::Paid => {
            if span.start % MINUTES_PER_HOUR != 0 || span.end % MINUTES_PER_HOUR != 0 {
                return Err(EngineError::Validation(
                    "paid sessions start and end on the hour",
                ));
            }
        }
    }
    Ok(())
}

/// The authoritative overlap rule: the buffer-expanded interval of any active
/// booking must not overlap the raw requested interval. Half-open comparison,
/// so a gap of exactly `buffer` minutes is legal, and with zero buffer a
/// booking may start exactly where another ends.
pub(crate) fn check_no_conflict(
    day: &DayState,
    span: &Span,
    buffer: Min,
    now: Ms,
) -> Result<(), EngineError> {
    for existing in day.active(now) {
        let effective = Span::new(
            existing.span.start - buffer,
            existing.span.end + buffer,
        );
        if effective.overlaps(span) {
            return Err(EngineError::Conflict {
                blocking: effective,
            });
        }
    }
    Ok(())
}
