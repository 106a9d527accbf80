//! Shared application state passed to every handler and background loop.
//!
//! All members are process-singletons constructed before the dispatcher
//! starts and destroyed after it stops; nothing is reinitialised at runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use bp_domain::config::Config;
use bp_schema::SchemaCache;
use bp_store::{ConfigCache, Db, DbLog};

use crate::bruteforce::Bruteforce;
use crate::cluster::EventEnvelope;
use crate::hub::Hub;
use crate::spooler::mail::MailTransport;

/// Hard cap on concurrent dispatcher handlers. The bound exists to survive
/// DB-statement-cache thrash during schema reload.
pub const DISPATCH_PERMITS: usize = 10;

/// Cluster-local runtime flags.
pub struct ClusterState {
    is_master: AtomicBool,
}

impl ClusterState {
    pub fn new() -> Self {
        Self {
            is_master: AtomicBool::new(false),
        }
    }

    pub fn is_master(&self) -> bool {
        self.is_master.load(Ordering::Relaxed)
    }

    pub fn set_master(&self, state: bool) {
        self.is_master.store(state, Ordering::Relaxed);
    }
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared application state.
///
/// Fields are grouped by concern:
/// - **Core services** — bootstrap config, storage gateway, runtime config,
///   persisted log, schema cache
/// - **Transport** — connection hub, brute-force gate, dispatcher bound
/// - **Cluster** — node identity, master flag, in-process event channel
/// - **Workers** — mail transport seam
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub cfg: Arc<Config>,
    pub db: Db,
    pub runtime: Arc<ConfigCache>,
    pub log: Arc<DbLog>,
    pub schema: Arc<SchemaCache>,

    // ── Transport ─────────────────────────────────────────────────────
    pub hub: Arc<Hub>,
    pub bruteforce: Arc<Bruteforce>,
    /// Dispatcher concurrency bound ([`DISPATCH_PERMITS`] permits).
    pub dispatch_permits: Arc<Semaphore>,

    // ── Cluster ───────────────────────────────────────────────────────
    pub node_id: Uuid,
    pub cluster: Arc<ClusterState>,
    /// In-process cluster event channel; the drain task produces, the
    /// consumer loop maps events to cache refreshes and hub publishes.
    pub events_tx: mpsc::Sender<EventEnvelope>,

    // ── Workers ───────────────────────────────────────────────────────
    pub mailer: Arc<dyn MailTransport>,
}
