//! The reservation state machine.
//!
//! Free path: slot selected → validated → confirmed, in one `try_reserve`.
//! Paid path: slot selected → pending hold + correlation token → checkout at
//! the provider → callback verifies the token → confirmed; any failure on the
//! way (gateway error, reported payment failure, expired hold) leaves the
//! booking cancelled, never silently pending.

use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::payment::{CheckoutRequest, PaymentGateway};
use crate::slots::FREE_SESSION_MIN;

/// What a client needs to complete a paid reservation.
#[derive(Debug, Clone)]
pub struct PaidReservation {
    pub booking: Booking,
    pub correlation_token: String,
    pub checkout_link: String,
    pub amount_cents: i64,
}

pub struct ReservationWorkflow {
    engine: Arc<Engine>,
    gateway: Arc<dyn PaymentGateway>,
    redirect_url: String,
}

impl ReservationWorkflow {
    pub fn new(engine: Arc<Engine>, gateway: Arc<dyn PaymentGateway>, redirect_url: String) -> Self {
        Self {
            engine,
            gateway,
            redirect_url,
        }
    }

    /// Free sessions confirm immediately; no payment leg.
    pub async fn reserve_free(
        &self,
        id: Ulid,
        date: NaiveDate,
        start: Min,
        owner: String,
    ) -> Result<Booking, EngineError> {
        let span = Span {
            start,
            end: start + FREE_SESSION_MIN,
        };
        self.engine
            .try_reserve(id, date, span, SessionKind::Free, owner, None)
            .await
    }

    /// Paid sessions place a pending hold keyed by a fresh correlation token,
    /// then open checkout at the provider. If the provider call fails the
    /// hold is released before the error is surfaced.
    pub async fn reserve_paid(
        &self,
        id: Ulid,
        date: NaiveDate,
        span: Span,
        owner: String,
    ) -> Result<PaidReservation, EngineError> {
        let token = Ulid::new().to_string();
        let booking = self
            .engine
            .try_reserve(
                id,
                date,
                span,
                SessionKind::Paid,
                owner.clone(),
                Some(token.clone()),
            )
            .await?;
        let amount_cents = booking.amount_cents();

        let request = CheckoutRequest {
            amount_cents,
            owner,
            correlation_token: token.clone(),
            redirect_url: self.redirect_url.clone(),
        };
        let checkout = match self.gateway.initiate(&request).await {
            Ok(c) => c,
            Err(e) => {
                // Release the hold; a failed checkout must not starve the slot.
                self.engine
                    .cancel_booking(id, "payment initiation failed")
                    .await?;
                return Err(EngineError::Gateway(e.to_string()));
            }
        };

        Ok(PaidReservation {
            booking,
            correlation_token: token,
            checkout_link: checkout.link,
            amount_cents,
        })
    }

    /// Payment-provider callback. The server-held token index is the sole
    /// source of truth for recovering the pending booking — client-replayed
    /// payloads are never consulted for amount or slot.
    ///
    /// Idempotent under retried success callbacks: confirming an
    /// already-confirmed booking returns it unchanged.
    pub async fn payment_callback(
        &self,
        token: &str,
        provider_txn_id: &str,
        success: bool,
    ) -> Result<Booking, EngineError> {
        let id = self
            .engine
            .booking_for_token(token)
            .ok_or_else(|| EngineError::UnknownToken(token.to_string()))?;

        if !success {
            self.engine.cancel_booking(id, "payment failed").await?;
            return Err(EngineError::PaymentFailed {
                reference: token.to_string(),
            });
        }
        self.engine
            .confirm_booking(id, Some(provider_txn_id.to_string()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::{Checkout, GatewayError};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bookd_test_workflow");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// A Wednesday far enough in the future for every test run.
    fn wednesday() -> NaiveDate {
        date(2033, 9, 7)
    }

    const HOLD_TTL: Ms = 30 * 60 * 1000;

    /// Records initiate calls; fails on demand.
    struct MockGateway {
        calls: AtomicUsize,
        requests: Mutex<Vec<CheckoutRequest>>,
        fail: bool,
    }

    impl MockGateway {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn initiate(&self, request: &CheckoutRequest) -> Result<Checkout, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().await.push(request.clone());
            if self.fail {
                return Err(GatewayError("provider unreachable".into()));
            }
            Ok(Checkout {
                link: format!("https://pay.test/{}", request.correlation_token),
            })
        }
    }

    fn workflow(name: &str, gateway: Arc<MockGateway>) -> (ReservationWorkflow, Arc<Engine>) {
        let engine = Arc::new(Engine::new(test_wal_path(name), HOLD_TTL).unwrap());
        let wf = ReservationWorkflow::new(
            engine.clone(),
            gateway,
            "http://localhost:3000/payment-complete".into(),
        );
        (wf, engine)
    }

    #[tokio::test]
    async fn free_reservation_confirms_immediately() {
        let (wf, _) = workflow("free_confirms.wal", MockGateway::new(false));
        let booking = wf
            .reserve_free(Ulid::new(), wednesday(), 630, "a@b.c".into())
            .await
            .unwrap();
        assert_eq!(booking.status, BookingStatus::Confirmed);
        assert_eq!(booking.span, Span::new(630, 660));
        assert_eq!(booking.payment_ref, None);
    }

    #[tokio::test]
    async fn paid_reservation_holds_and_returns_checkout() {
        let gateway = MockGateway::new(false);
        let (wf, engine) = workflow("paid_holds.wal", gateway.clone());

        let res = wf
            .reserve_paid(
                Ulid::new(),
                wednesday(),
                Span::new(780, 900),
                "a@b.c".into(),
            )
            .await
            .unwrap();

        assert_eq!(res.booking.status, BookingStatus::Pending);
        assert_eq!(res.amount_cents, 2 * HOURLY_RATE_CENTS);
        assert!(res.checkout_link.contains(&res.correlation_token));
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);

        // The gateway saw the server-computed amount, not anything client-supplied.
        let requests = gateway.requests.lock().await;
        assert_eq!(requests[0].amount_cents, 2 * HOURLY_RATE_CENTS);

        // The token index can recover the booking without client state.
        assert_eq!(
            engine.booking_for_token(&res.correlation_token),
            Some(res.booking.id)
        );
    }

    #[tokio::test]
    async fn gateway_failure_releases_the_hold() {
        let (wf, engine) = workflow("gateway_fail.wal", MockGateway::new(true));
        let id = Ulid::new();
        let err = wf
            .reserve_paid(id, wednesday(), Span::new(780, 840), "a@b.c".into())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Gateway(_)));

        let booking = engine.get_booking(id).await.unwrap();
        assert_eq!(booking.status, BookingStatus::Cancelled);

        // The slot is free again for another client.
        let ok = wf
            .reserve_paid(Ulid::new(), wednesday(), Span::new(780, 840), "x@y.z".into())
            .await;
        assert!(matches!(
            ok,
            Err(EngineError::Gateway(_)) // gateway still failing, but the hold was placed
        ));
    }

    #[tokio::test]
    async fn successful_callback_confirms() {
        let (wf, _) = workflow("callback_ok.wal", MockGateway::new(false));
        let res = wf
            .reserve_paid(
                Ulid::new(),
                wednesday(),
                Span::new(780, 900),
                "a@b.c".into(),
            )
            .await
            .unwrap();

        let confirmed = wf
            .payment_callback(&res.correlation_token, "txn-123", true)
            .await
            .unwrap();
        assert_eq!(confirmed.status, BookingStatus::Confirmed);
        assert_eq!(confirmed.provider_txn_id.as_deref(), Some("txn-123"));
    }

    #[tokio::test]
    async fn duplicate_success_callbacks_are_idempotent() {
        let (wf, _) = workflow("callback_dup.wal", MockGateway::new(false));
        let res = wf
            .reserve_paid(
                Ulid::new(),
                wednesday(),
                Span::new(780, 900),
                "a@b.c".into(),
            )
            .await
            .unwrap();

        let first = wf
            .payment_callback(&res.correlation_token, "txn-1", true)
            .await
            .unwrap();
        let second = wf
            .payment_callback(&res.correlation_token, "txn-1", true)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.status, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let (wf, _) = workflow("callback_unknown.wal", MockGateway::new(false));
        let err = wf
            .payment_callback("no-such-token", "txn-1", true)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownToken(_)));
    }

    #[tokio::test]
    async fn failed_payment_cancels_and_frees_the_slot() {
        let (wf, engine) = workflow("callback_fail.wal", MockGateway::new(false));
        let id = Ulid::new();
        let res = wf
            .reserve_paid(id, wednesday(), Span::new(780, 900), "first@client".into())
            .await
            .unwrap();

        let err = wf
            .payment_callback(&res.correlation_token, "txn-1", false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PaymentFailed { .. }));
        assert_eq!(
            engine.get_booking(id).await.unwrap().status,
            BookingStatus::Cancelled
        );

        // A different client can now take the same interval.
        let retry = wf
            .reserve_paid(
                Ulid::new(),
                wednesday(),
                Span::new(780, 900),
                "second@client".into(),
            )
            .await
            .unwrap();
        assert_eq!(retry.booking.status, BookingStatus::Pending);
    }

    #[tokio::test]
    async fn callback_after_failure_stays_terminal() {
        // A late success callback for a booking cancelled by payment failure
        // must not resurrect it.
        let (wf, _) = workflow("callback_late.wal", MockGateway::new(false));
        let res = wf
            .reserve_paid(
                Ulid::new(),
                wednesday(),
                Span::new(780, 900),
                "a@b.c".into(),
            )
            .await
            .unwrap();

        let _ = wf
            .payment_callback(&res.correlation_token, "txn-1", false)
            .await;
        let err = wf
            .payment_callback(&res.correlation_token, "txn-1", true)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }
}
