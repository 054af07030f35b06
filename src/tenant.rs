use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::engine::Engine;
use crate::limits::*;
use crate::model::Ms;
use crate::payment::PaymentGateway;
use crate::reaper;
use crate::workflow::ReservationWorkflow;

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL +
/// reaper + compactor; tenant = database name from the pgwire connection.
/// One consultant practice per tenant — they share nothing.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    hold_ttl_ms: Ms,
    gateway: Arc<dyn PaymentGateway>,
    redirect_url: String,
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        hold_ttl_ms: Ms,
        gateway: Arc<dyn PaymentGateway>,
        redirect_url: String,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            hold_ttl_ms,
            gateway,
            redirect_url,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(wal_path, self.hold_ttl_ms)?);

        // Spawn reaper + compactor for this tenant
        let reaper_engine = engine.clone();
        tokio::spawn(async move {
            reaper::run_reaper(reaper_engine).await;
        });
        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            reaper::run_compactor(compactor_engine, threshold).await;
        });

        self.engines.insert(tenant.to_string(), engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    /// The reservation workflow for a tenant's engine; a thin wrapper, built
    /// per request.
    pub fn workflow(&self, engine: Arc<Engine>) -> ReservationWorkflow {
        ReservationWorkflow::new(engine, self.gateway.clone(), self.redirect_url.clone())
    }
}
