mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{blocked_spans, hour_blocks, merge_overlapping, slot_is_free};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedDayState = Arc<RwLock<DayState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

/// The booking ledger: authoritative store of all bookings plus the active
/// business-hour settings, persisted through the WAL.
pub struct Engine {
    /// One lock per calendar date: conflicting reservations serialize per
    /// date while distinct dates proceed fully in parallel.
    pub(super) days: DashMap<NaiveDate, SharedDayState>,
    pub(super) settings: Arc<RwLock<Settings>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: booking id → date holding it.
    pub(super) booking_to_date: DashMap<Ulid, NaiveDate>,
    /// Correlation token → paid booking, rebuilt from the WAL on replay.
    /// The payment callback trusts only this index, never client payloads.
    pub(super) payment_index: DashMap<String, Ulid>,
    /// How long a paid hold stays pending before it may be reaped.
    pub hold_ttl_ms: Ms,
}

/// Apply an event directly to a DayState (no locking — caller holds the lock).
fn apply_to_day(day: &mut DayState, event: &Event) {
    match event {
        Event::BookingCreated { booking } => {
            day.insert(booking.clone());
        }
        Event::BookingConfirmed {
            id,
            provider_txn_id,
        } => {
            if let Some(b) = day.get_mut(*id) {
                b.status = BookingStatus::Confirmed;
                b.provider_txn_id = provider_txn_id.clone();
                b.expires_at = None;
            }
        }
        Event::BookingCancelled { id, reason } => {
            if let Some(b) = day.get_mut(*id) {
                b.status = BookingStatus::Cancelled;
                b.cancel_reason = Some(reason.clone());
                b.expires_at = None;
            }
        }
        // Settings are engine-level, not day-level
        Event::SettingsUpdated { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, hold_ttl_ms: Ms) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            days: DashMap::new(),
            settings: Arc::new(RwLock::new(Settings::default())),
            wal_tx,
            booking_to_date: DashMap::new(),
            payment_index: DashMap::new(),
            hold_ttl_ms,
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context (lazy tenant
        // creation).
        for event in &events {
            match event {
                Event::SettingsUpdated { settings } => {
                    *engine
                        .settings
                        .try_write()
                        .expect("replay: uncontended write") = settings.clone();
                }
                other => engine.replay_apply(other),
            }
        }

        Ok(engine)
    }

    fn replay_apply(&self, event: &Event) {
        let date = match event {
            Event::BookingCreated { booking } => booking.date,
            Event::BookingConfirmed { id, .. } | Event::BookingCancelled { id, .. } => {
                match self.booking_to_date.get(id) {
                    Some(entry) => *entry.value(),
                    None => return, // orphan event after a partial compact; skip
                }
            }
            Event::SettingsUpdated { .. } => unreachable!(),
        };
        self.index_event(event);
        let day = self.day_for(date);
        let mut guard = day.try_write().expect("replay: uncontended write");
        apply_to_day(&mut guard, event);
    }

    /// Maintain the id → date and token → id indexes for an event.
    pub(super) fn index_event(&self, event: &Event) {
        if let Event::BookingCreated { booking } = event {
            self.booking_to_date.insert(booking.id, booking.date);
            if let Some(token) = &booking.payment_ref {
                self.payment_index.insert(token.clone(), booking.id);
            }
        }
    }

    /// Get or lazily create the shared state for a date.
    pub(super) fn day_for(&self, date: NaiveDate) -> SharedDayState {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DayState::new(date))))
            .clone()
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    /// WAL-append + index + apply in one call, in that order: the event is
    /// durable before it becomes visible.
    pub(super) async fn persist_and_apply(
        &self,
        day: &mut DayState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.index_event(event);
        apply_to_day(day, event);
        Ok(())
    }

    pub fn booking_for_token(&self, token: &str) -> Option<Ulid> {
        self.payment_index.get(token).map(|e| *e.value())
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let date = *self.booking_to_date.get(&id)?.value();
        let day = self.days.get(&date)?.value().clone();
        let guard = day.read().await;
        guard.get(id).cloned()
    }
}
