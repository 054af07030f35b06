use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;
use crate::slots::{minimum_span, slot_starts};

use super::availability::{blocked_spans, hour_blocks, slot_is_free};
use super::conflict::{now_ms, today};
use super::{Engine, EngineError};

impl Engine {
    /// The active business-hour settings.
    pub async fn settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    /// Blocked hour ranges per date across a window. Dates without active
    /// bookings are simply absent from the map.
    pub async fn availability(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<BTreeMap<NaiveDate, Vec<HourBlock>>, EngineError> {
        if to < from {
            return Err(EngineError::Validation("empty date window"));
        }
        if (to - from).num_days() > MAX_QUERY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let settings = self.settings().await;
        let now = now_ms();

        // Snapshot the day Arcs first; never await while iterating the map.
        let days: Vec<_> = self
            .days
            .iter()
            .filter(|e| *e.key() >= from && *e.key() <= to)
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut out = BTreeMap::new();
        for (date, day) in days {
            let guard = day.read().await;
            let blocked = blocked_spans(&guard, &settings, now);
            if !blocked.is_empty() {
                out.insert(date, hour_blocks(&blocked));
            }
        }
        Ok(out)
    }

    /// Candidate slots for a date with their advisory availability, at the
    /// kind's minimum duration. Used by the UI to disable taken slots before
    /// submission; `try_reserve` remains the authority.
    pub async fn slot_listing(&self, date: NaiveDate, kind: SessionKind) -> Vec<SlotInfo> {
        let settings = self.settings().await;
        let now = now_ms();
        let starts = slot_starts(&settings, date, kind, today());
        if starts.is_empty() {
            return Vec::new();
        }

        // Clone the Arc out before awaiting so no map guard is held across it.
        let day = self.days.get(&date).map(|e| e.value().clone());
        let blocked = match day {
            Some(day) => {
                let guard = day.read().await;
                blocked_spans(&guard, &settings, now)
            }
            None => Vec::new(),
        };

        starts
            .into_iter()
            .map(|start| {
                let span = minimum_span(kind, start);
                SlotInfo {
                    start,
                    end: span.end,
                    amount_cents: match kind {
                        SessionKind::Free => 0,
                        SessionKind::Paid => span.duration_hours() * HOURLY_RATE_CENTS,
                    },
                    available: slot_is_free(&blocked, &span),
                }
            })
            .collect()
    }

    /// Booking history, filtered and ordered by (date, start). Cancelled
    /// records are included unless the filter excludes them.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Result<Vec<Booking>, EngineError> {
        if let (Some(from), Some(to)) = (filter.from, filter.to)
            && (to - from).num_days() > MAX_QUERY_WINDOW_DAYS
        {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }

        let mut days: Vec<_> = self
            .days
            .iter()
            .filter(|e| {
                let d = *e.key();
                filter.from.is_none_or(|f| d >= f) && filter.to.is_none_or(|t| d <= t)
            })
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        days.sort_by_key(|(d, _)| *d);

        let mut out = Vec::new();
        for (_, day) in days {
            let guard = day.read().await;
            for b in &guard.bookings {
                if filter.status.is_none_or(|s| b.status == s)
                    && filter.kind.is_none_or(|k| b.kind == k)
                {
                    out.push(b.clone());
                }
            }
        }
        Ok(out)
    }

    /// Aggregate counters across the whole ledger. Revenue sums confirmed
    /// paid bookings only.
    pub async fn stats(&self) -> Stats {
        let days: Vec<_> = self.days.iter().map(|e| e.value().clone()).collect();
        let mut stats = Stats::default();
        for day in days {
            let guard = day.read().await;
            for b in &guard.bookings {
                stats.total += 1;
                match b.kind {
                    SessionKind::Free => stats.free += 1,
                    SessionKind::Paid => stats.paid += 1,
                }
                match b.status {
                    BookingStatus::Pending => stats.pending += 1,
                    BookingStatus::Cancelled => stats.cancelled += 1,
                    BookingStatus::Confirmed => {
                        if b.kind == SessionKind::Paid {
                            stats.revenue_cents += b.amount_cents();
                        }
                    }
                }
            }
        }
        stats
    }
}
