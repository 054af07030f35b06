use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task cancelling paid holds whose deadline passed, so abandoned
/// checkouts stop occupying slots. Conflict checks already ignore expired
/// holds; this sweep makes the cancellation durable and visible in history.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        let expired = engine.collect_expired_holds(now);
        for id in expired {
            match engine.cancel_booking(id, "hold expired").await {
                Ok(_) => {
                    metrics::counter!(crate::observability::HOLDS_REAPED_TOTAL).increment(1);
                    info!("reaped expired hold {id}");
                }
                Err(e) => {
                    // May already have been cancelled — that's fine
                    tracing::debug!("reaper skip {id}: {e}");
                }
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await >= threshold {
            match engine.compact_wal().await {
                Ok(()) => info!("WAL compacted"),
                Err(e) => tracing::warn!("WAL compaction failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::NaiveDate;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bookd_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn reaper_sweep_cancels_expired_holds() {
        // Zero TTL: the hold expires the instant it is placed.
        let engine = Arc::new(Engine::new(test_wal_path("reaper_sweep.wal"), 0).unwrap());

        let date = NaiveDate::from_ymd_opt(2033, 9, 7).unwrap(); // Wednesday
        let id = Ulid::new();
        engine
            .try_reserve(
                id,
                date,
                Span::new(780, 900),
                SessionKind::Paid,
                "a@b.c".into(),
                Some(Ulid::new().to_string()),
            )
            .await
            .unwrap();

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;

        let expired = engine.collect_expired_holds(now);
        assert_eq!(expired, vec![id]);

        let reaped = engine.expire_pending(now).await;
        assert_eq!(reaped, vec![id]);
        assert_eq!(
            engine.get_booking(id).await.unwrap().status,
            BookingStatus::Cancelled
        );

        // Nothing left to reap.
        assert!(engine.collect_expired_holds(now).is_empty());
    }

    #[tokio::test]
    async fn unexpired_holds_are_left_alone() {
        let engine =
            Arc::new(Engine::new(test_wal_path("reaper_fresh.wal"), 30 * 60 * 1000).unwrap());

        let date = NaiveDate::from_ymd_opt(2033, 9, 7).unwrap();
        engine
            .try_reserve(
                Ulid::new(),
                date,
                Span::new(780, 900),
                SessionKind::Paid,
                "a@b.c".into(),
                Some(Ulid::new().to_string()),
            )
            .await
            .unwrap();

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        assert!(engine.collect_expired_holds(now).is_empty());
    }
}
