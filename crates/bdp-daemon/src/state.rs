//! Shared daemon state.
//!
//! One [`DaemonContext`] is built at startup and shared behind an `Arc` by
//! the accept loop, every session worker, and the idle sweeper. It owns the
//! four domain stores, the session slot table, and the permission gate.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use bdp_core::DomainFamily;

use crate::config::DaemonConfig;
use crate::policy::{Gate, PolicyDecision, SameUserPolicy};
use crate::slots::SlotTable;
use crate::storage::{schema_for, StorageEngine};

/// Everything a session worker needs, shared behind one `Arc`.
pub struct DaemonContext {
    /// Runtime settings.
    pub config: DaemonConfig,
    /// Bounded session pool.
    pub slots: SlotTable,
    /// Per-request permission gate.
    pub gate: Gate,
    stores: HashMap<DomainFamily, Arc<StorageEngine>>,
}

impl DaemonContext {
    /// Open every domain database under the configured data directory.
    ///
    /// # Errors
    ///
    /// Fails when the data directory cannot be created or any database
    /// refuses to open; the daemon does not start degraded.
    pub fn init(config: DaemonConfig) -> anyhow::Result<Self> {
        Self::init_with_policy(config, Box::new(SameUserPolicy::new()))
    }

    /// As [`DaemonContext::init`] with an explicit access policy.
    pub fn init_with_policy(
        config: DaemonConfig,
        policy: Box<dyn PolicyDecision>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("failed to create data directory {}", config.data_dir.display())
        })?;

        let mut stores = HashMap::new();
        for family in DomainFamily::ALL {
            let schema = schema_for(family);
            let path = config.data_dir.join(schema.db_file);
            let engine = StorageEngine::open(&path, schema)
                .with_context(|| format!("failed to open {family} database"))?;
            stores.insert(family, Arc::new(engine));
        }
        info!(
            data_dir = %config.data_dir.display(),
            max_sessions = config.max_sessions,
            "daemon state initialized"
        );

        let slots = SlotTable::new(config.max_sessions);
        Ok(Self { config, slots, gate: Gate::new(policy), stores })
    }

    /// The storage engine for a domain family.
    #[must_use]
    pub fn store(&self, family: DomainFamily) -> &Arc<StorageEngine> {
        // Every family is opened in `init`; the map is total.
        &self.stores[&family]
    }
}
