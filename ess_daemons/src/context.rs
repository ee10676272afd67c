use ess_catalog::{CatalogDB, HeadClient};
use ess_lib::{unix_timestamp, EssResult, RequestStatus};
use log::{error, warn};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// What every daemon of one process shares: the local catalog, the optional head,
/// and the name this edge registers under.
pub struct DaemonContext {
    pub catalog: Arc<CatalogDB>,
    pub head: Option<Arc<HeadClient>>,
    pub resource_name: String,
    edge_id: Mutex<Option<i64>>,
}

impl DaemonContext {
    pub fn new(catalog: Arc<CatalogDB>, head: Option<Arc<HeadClient>>, resource_name: &str) -> Self {
        Self {
            catalog,
            head,
            resource_name: resource_name.to_string(),
            edge_id: Mutex::new(None),
        }
    }

    /// Id of this edge in the local catalog, `None` until the resource manager
    /// has registered it.
    pub fn local_edge_id(&self) -> EssResult<Option<i64>> {
        match self.edge_id.lock() {
            Ok(guard) => {
                if let Some(edge_id) = *guard {
                    return Ok(Some(edge_id));
                }
            }
            Err(e) => error!("daemon context: edge id lock poisoned: {}", e),
        }

        let edge = match self.catalog.get_edge(&self.resource_name) {
            Ok(edge) => edge,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        match self.edge_id.lock() {
            Ok(mut guard) => *guard = Some(edge.edge_id),
            Err(e) => error!("daemon context: edge id lock poisoned: {}", e),
        }
        Ok(Some(edge.edge_id))
    }
}

/// Hands requests left in a claimed status by a dead owner back to the status its
/// daemon discovers. A claim is stale once untouched for `stale_after`.
pub struct ClaimRecovery {
    daemon: &'static str,
    from: RequestStatus,
    to: RequestStatus,
    stale_after: Duration,
    last_sweep: Mutex<Option<Instant>>,
}

impl ClaimRecovery {
    pub fn new(daemon: &'static str, from: RequestStatus, to: RequestStatus, stale_after_secs: u64) -> Self {
        Self {
            daemon,
            from,
            to,
            stale_after: Duration::from_secs(stale_after_secs),
            last_sweep: Mutex::new(None),
        }
    }

    fn due(&self, force: bool) -> bool {
        let mut last = match self.last_sweep.lock() {
            Ok(guard) => guard,
            Err(e) => {
                warn!("{}: claim recovery lock poisoned: {}", self.daemon, e);
                return false;
            }
        };
        let now = Instant::now();
        if let Some(at) = *last {
            if !force && now.duration_since(at) < self.stale_after.max(Duration::from_secs(1)) {
                return false;
            }
        }
        *last = Some(now);
        true
    }

    /// Requeues stale claims, at most once per `stale_after` unless `force` is set.
    /// `edge_id` limits the sweep to one edge.
    pub fn sweep(&self, ctx: &DaemonContext, edge_id: Option<i64>, force: bool) -> EssResult<usize> {
        if !self.due(force) {
            return Ok(0);
        }
        let before = unix_timestamp().saturating_sub(self.stale_after.as_secs());
        let message = format!("{} claim went stale in {}", self.daemon, self.from);
        ctx.catalog
            .requeue_stale_requests(self.from, self.to, edge_id, before, &message)
    }
}
