use chrono::NaiveDate;
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms, today, validate_booking};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Replace the business-hour settings. Validation failures leave the
    /// previous settings untouched.
    pub async fn update_settings(&self, settings: Settings) -> Result<Settings, EngineError> {
        settings.validate().map_err(EngineError::Validation)?;
        let mut guard = self.settings.write().await;
        let event = Event::SettingsUpdated {
            settings: settings.clone(),
        };
        self.wal_append(&event).await?;
        *guard = settings.clone();
        Ok(settings)
    }

    /// The authoritative check-and-insert. Validates the request, then — under
    /// the date's write lock — checks the buffer-expanded overlap rule against
    /// every active booking and inserts the new record: `confirmed` for free
    /// sessions, `pending` with a hold deadline for paid ones.
    ///
    /// Two concurrent calls for overlapping intervals serialize on the lock;
    /// the loser gets `Conflict` immediately rather than waiting for a slot.
    pub async fn try_reserve(
        &self,
        id: Ulid,
        date: NaiveDate,
        span: Span,
        kind: SessionKind,
        owner: String,
        payment_ref: Option<String>,
    ) -> Result<Booking, EngineError> {
        let settings = self.settings().await;
        validate_booking(&settings, date, &span, kind, &owner, today())?;
        if self.booking_to_date.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let now = now_ms();
        let day = self.day_for(date);
        let mut guard = day.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many bookings on this date"));
        }
        if let Err(e) = check_no_conflict(&guard, &span, settings.buffer_minutes, now) {
            metrics::counter!(crate::observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let booking = Booking {
            id,
            date,
            span,
            kind,
            owner,
            status: match kind {
                SessionKind::Free => BookingStatus::Confirmed,
                SessionKind::Paid => BookingStatus::Pending,
            },
            payment_ref,
            provider_txn_id: None,
            expires_at: matches!(kind, SessionKind::Paid).then(|| now + self.hold_ttl_ms),
            created_at: now,
            cancel_reason: None,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "kind" => kind.as_str())
            .increment(1);
        Ok(booking)
    }

    /// Transition a pending booking to confirmed. Idempotent: confirming an
    /// already-confirmed booking returns it unchanged. A pending booking whose
    /// hold deadline already passed is cancelled instead — its slot may have
    /// been rebooked, so late payment must not resurrect it.
    pub async fn confirm_booking(
        &self,
        id: Ulid,
        provider_txn_id: Option<String>,
    ) -> Result<Booking, EngineError> {
        let date = *self
            .booking_to_date
            .get(&id)
            .ok_or(EngineError::NotFound(id))?
            .value();
        let day = self.day_for(date);
        let mut guard = day.write().await;
        let current = guard.get(id).ok_or(EngineError::NotFound(id))?.clone();

        match current.status {
            BookingStatus::Confirmed => Ok(current),
            BookingStatus::Cancelled => Err(EngineError::InvalidTransition { from: "cancelled" }),
            BookingStatus::Pending => {
                if current.expires_at.is_some_and(|e| e <= now_ms()) {
                    let event = Event::BookingCancelled {
                        id,
                        reason: "hold expired".into(),
                    };
                    self.persist_and_apply(&mut guard, &event).await?;
                    return Err(EngineError::HoldExpired(id));
                }
                let event = Event::BookingConfirmed {
                    id,
                    provider_txn_id,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                guard.get(id).cloned().ok_or(EngineError::NotFound(id))
            }
        }
    }

    /// Transition a pending or confirmed booking to cancelled. The record is
    /// kept for reporting; only its status changes. Cancelling an already
    /// cancelled booking is a no-op.
    pub async fn cancel_booking(&self, id: Ulid, reason: &str) -> Result<Booking, EngineError> {
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("cancel reason too long"));
        }
        let date = *self
            .booking_to_date
            .get(&id)
            .ok_or(EngineError::NotFound(id))?
            .value();
        let day = self.day_for(date);
        let mut guard = day.write().await;
        let current = guard.get(id).ok_or(EngineError::NotFound(id))?.clone();

        if current.status == BookingStatus::Cancelled {
            return Ok(current);
        }
        let event = Event::BookingCancelled {
            id,
            reason: reason.to_string(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Ids of pending bookings whose hold deadline has passed. Read-only scan;
    /// the reaper cancels each through the normal path.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<Ulid> {
        let mut expired = Vec::new();
        for entry in self.days.iter() {
            if let Ok(guard) = entry.value().try_read() {
                for b in &guard.bookings {
                    if b.status == BookingStatus::Pending
                        && b.expires_at.is_some_and(|e| e <= now)
                    {
                        expired.push(b.id);
                    }
                }
            }
        }
        expired
    }

    /// On-demand variant of the reaper sweep: cancel every expired hold now.
    /// Returns the ids that were transitioned.
    pub async fn expire_pending(&self, now: Ms) -> Vec<Ulid> {
        let mut reaped = Vec::new();
        for id in self.collect_expired_holds(now) {
            if self.cancel_booking(id, "hold expired").await.is_ok() {
                reaped.push(id);
            }
        }
        reaped
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate
    /// the current state: one settings event plus one `BookingCreated` per
    /// booking (the record carries its current status, so history survives).
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = vec![Event::SettingsUpdated {
            settings: self.settings().await,
        }];

        let day_arcs: Vec<_> = self
            .days
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for day in day_arcs {
            let guard = day.read().await;
            for booking in &guard.bookings {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
