// ========== Resource Manager ==========

use crate::config::ResourceManagerConfig;
use crate::context::DaemonContext;
use crate::engine::DaemonTasks;
use async_trait::async_trait;
use ess_lib::{ContentFilter, Edge, EdgeStatus, EssResult, ResourceChecker};
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceTaskKind {
    ResourceCheck,
    CleanEdges,
}

impl ResourceTaskKind {
    fn all() -> [ResourceTaskKind; 2] {
        [ResourceTaskKind::ResourceCheck, ResourceTaskKind::CleanEdges]
    }

    fn as_str(&self) -> &'static str {
        match self {
            ResourceTaskKind::ResourceCheck => "resource_check",
            ResourceTaskKind::CleanEdges => "clean_edges",
        }
    }
}

#[derive(Debug)]
pub struct ResourceTask {
    pub kind: ResourceTaskKind,
    pub outcome: Option<Result<String, String>>,
}

/// Keeps this edge's row fresh (the heartbeat) and flags edges that stopped
/// reporting. Both jobs run once at start and then on their own periods.
pub struct ResourceManager {
    ctx: Arc<DaemonContext>,
    config: ResourceManagerConfig,
    checker: Option<Arc<dyn ResourceChecker>>,
    total_space: u64,
    reserved_space: u64,
    periods: HashMap<ResourceTaskKind, Duration>,
    last_run_at: Mutex<HashMap<ResourceTaskKind, Instant>>,
}

impl ResourceManager {
    pub fn new(
        ctx: Arc<DaemonContext>,
        config: ResourceManagerConfig,
        checker: Option<Arc<dyn ResourceChecker>>,
    ) -> EssResult<Self> {
        let total_space = config.total_space_bytes()?;
        let reserved_space = config.reserved_space_bytes()?;
        let mut periods = HashMap::new();
        periods.insert(
            ResourceTaskKind::ResourceCheck,
            Duration::from_secs(config.resource_check_period),
        );
        periods.insert(
            ResourceTaskKind::CleanEdges,
            Duration::from_secs(config.effective_clean_edges_period()),
        );
        if checker.is_none() {
            warn!("resourcemanager: no resourcechecker plugin, used space is reported as 0");
        }
        Ok(Self {
            ctx,
            config,
            checker,
            total_space,
            reserved_space,
            periods,
            last_run_at: Mutex::new(HashMap::new()),
        })
    }

    fn take_due_kinds(&self, now: Instant) -> Vec<ResourceTaskKind> {
        let mut last_run_at = match self.last_run_at.lock() {
            Ok(guard) => guard,
            Err(e) => {
                error!("resourcemanager: lock poisoned while taking due kinds: {}", e);
                return Vec::new();
            }
        };
        let mut due = Vec::new();
        for kind in ResourceTaskKind::all() {
            let Some(period) = self.periods.get(&kind).copied() else {
                continue;
            };
            if let Some(last) = last_run_at.get(&kind).copied() {
                if now.duration_since(last) < period {
                    continue;
                }
            }
            last_run_at.insert(kind, now);
            due.push(kind);
        }
        due
    }

    async fn used_space(&self) -> u64 {
        let Some(checker) = &self.checker else {
            return 0;
        };
        match checker.used_space().await {
            Ok(used) => used,
            Err(e) => {
                error!("resourcemanager: resource check failed, reporting 0: {}", e);
                0
            }
        }
    }

    fn edge_template(&self) -> Edge {
        Edge {
            edge_name: self.ctx.resource_name.clone(),
            edge_type: self.config.edge_type,
            status: EdgeStatus::Active,
            is_independent: self.config.is_independent,
            continent: self.config.continent.clone(),
            country_name: self.config.country_name.clone(),
            region_code: self.config.region_code.clone(),
            city: self.config.city.clone(),
            longitude: self.config.longitude.clone(),
            latitude: self.config.latitude.clone(),
            total_space: self.total_space,
            reserved_space: self.reserved_space,
            ..Default::default()
        }
    }

    /// Measures usage and upserts this edge locally and, when configured, on the head.
    pub async fn check_resource(&self) -> EssResult<Edge> {
        let catalog = &self.ctx.catalog;
        let mut edge = self.edge_template();
        edge.used_space = self.used_space().await;

        match catalog.get_edge(&edge.edge_name) {
            Ok(existing) => {
                edge.edge_id = existing.edge_id;
                edge.created_at = existing.created_at;
                edge.num_files = catalog.count_contents(&ContentFilter {
                    edge_id: Some(existing.edge_id),
                    ..Default::default()
                })?;
                catalog.update_edge(&edge)?;
            }
            Err(e) if e.is_not_found() => {
                edge.edge_id = catalog.add_edge(&edge)?;
            }
            Err(e) => return Err(e),
        }
        info!(
            "resourcemanager: edge updated: edge_name={}, total={}, used={}, reserved={}, free={}, num_files={}",
            edge.edge_name,
            edge.total_space,
            edge.used_space,
            edge.reserved_space,
            edge.free_space(),
            edge.num_files
        );

        if let Some(head) = &self.ctx.head {
            let mirrored = match head.get_edge(&edge.edge_name).await {
                Ok(_) => head.update_edge(&edge).await,
                Err(e) if e.is_not_found() => head.register_edge(&edge).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = mirrored {
                warn!(
                    "resourcemanager: mirror edge to head failed: edge_name={}, err={}",
                    edge.edge_name, e
                );
            }
        }
        Ok(edge)
    }

    /// Flags edges silent for longer than the clean period as LOSTHEARTBEAT.
    pub fn clean_edges(&self) -> EssResult<usize> {
        let timeout = self
            .periods
            .get(&ResourceTaskKind::CleanEdges)
            .map(|d| d.as_secs())
            .unwrap_or(self.config.clean_edges_period);
        self.ctx.catalog.mark_stale_edges(timeout)
    }

    async fn run_kind(&self, kind: ResourceTaskKind) -> EssResult<String> {
        match kind {
            ResourceTaskKind::ResourceCheck => {
                let edge = self.check_resource().await?;
                Ok(format!("edge_id={}, free={}", edge.edge_id, edge.free_space()))
            }
            ResourceTaskKind::CleanEdges => {
                let marked = self.clean_edges()?;
                Ok(format!("stale={}", marked))
            }
        }
    }
}

#[async_trait]
impl DaemonTasks for ResourceManager {
    type Task = ResourceTask;

    fn name(&self) -> &str {
        "resourcemanager"
    }

    fn task_key(&self, task: &ResourceTask) -> Option<String> {
        Some(task.kind.as_str().to_string())
    }

    async fn discover_tasks(&self, capacity: usize) -> EssResult<Vec<ResourceTask>> {
        if capacity == 0 {
            return Ok(Vec::new());
        }
        Ok(self
            .take_due_kinds(Instant::now())
            .into_iter()
            .take(capacity)
            .map(|kind| ResourceTask {
                kind,
                outcome: None,
            })
            .collect())
    }

    async fn process_task(&self, task: &mut ResourceTask) -> EssResult<()> {
        match self.run_kind(task.kind).await {
            Ok(summary) => {
                task.outcome = Some(Ok(summary));
                Ok(())
            }
            Err(e) => {
                task.outcome = Some(Err(e.to_string()));
                Err(e)
            }
        }
    }

    async fn collect_results(&self, results: Vec<ResourceTask>) -> EssResult<()> {
        for task in results {
            match task.outcome {
                Some(Ok(summary)) => info!(
                    "resourcemanager: {} done: {}",
                    task.kind.as_str(),
                    summary
                ),
                Some(Err(e)) => warn!("resourcemanager: {} failed: {}", task.kind.as_str(), e),
                None => warn!("resourcemanager: {} did not finish", task.kind.as_str()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::StaticUsageChecker;
    use ess_catalog::{CatalogDB, HeadClient};
    use ess_lib::{Content, EdgeType};

    fn context(head: Option<Arc<HeadClient>>) -> Arc<DaemonContext> {
        let catalog = Arc::new(CatalogDB::new_in_memory().expect("catalog"));
        Arc::new(DaemonContext::new(catalog, head, "edge-a"))
    }

    fn config() -> ResourceManagerConfig {
        ResourceManagerConfig {
            total_space: "10K".to_string(),
            reserved_space: "1K".to_string(),
            city: Some("Geneva".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_check_registers_then_updates() {
        let _ = env_logger::builder().is_test(true).try_init();
        let ctx = context(None);
        let manager = ResourceManager::new(
            ctx.clone(),
            config(),
            Some(Arc::new(StaticUsageChecker::new(2048))),
        )
        .expect("manager");

        let edge = manager.check_resource().await.expect("register");
        assert!(edge.edge_id > 0);
        let stored = ctx.catalog.get_edge("edge-a").expect("edge");
        assert_eq!(stored.total_space, 10240);
        assert_eq!(stored.used_space, 2048);
        assert_eq!(stored.reserved_space, 1024);
        assert_eq!(stored.free_space(), 7168);
        assert_eq!(stored.city.as_deref(), Some("Geneva"));
        assert_eq!(stored.edge_type, EdgeType::Edge);

        ctx.catalog
            .add_contents(&[Content {
                coll_id: 1,
                scope: "s".to_string(),
                name: "f".to_string(),
                min_id: 1,
                max_id: 10,
                edge_id: edge.edge_id,
                ..Default::default()
            }])
            .expect("content");
        ctx.catalog
            .set_edge_status("edge-a", EdgeStatus::LostHeartbeat)
            .expect("status");

        let again = manager.check_resource().await.expect("update");
        assert_eq!(again.edge_id, edge.edge_id);
        let stored = ctx.catalog.get_edge("edge-a").expect("edge");
        assert_eq!(stored.num_files, 1);
        assert_eq!(stored.status, EdgeStatus::Active);
    }

    #[tokio::test]
    async fn test_missing_checker_reports_zero_and_mirrors_to_head() {
        let head_db = Arc::new(CatalogDB::new_in_memory().expect("head"));
        let head = Arc::new(HeadClient::new_in_process(head_db.clone()));
        let ctx = context(Some(head));
        let manager = ResourceManager::new(ctx.clone(), config(), None).expect("manager");

        manager.check_resource().await.expect("check");
        assert_eq!(ctx.catalog.get_edge("edge-a").expect("local").used_space, 0);
        let mirrored = head_db.get_edge("edge-a").expect("head edge");
        assert_eq!(mirrored.total_space, 10240);

        manager.check_resource().await.expect("check again");
        assert_eq!(head_db.list_edges(None).expect("list").len(), 1);
    }

    #[tokio::test]
    async fn test_both_kinds_due_at_start_then_on_period() {
        let ctx = context(None);
        let manager = ResourceManager::new(ctx, config(), None).expect("manager");
        let start = Instant::now();

        let due = manager.take_due_kinds(start);
        assert_eq!(
            due,
            vec![ResourceTaskKind::ResourceCheck, ResourceTaskKind::CleanEdges]
        );
        assert!(manager.take_due_kinds(start + Duration::from_secs(10)).is_empty());
        assert_eq!(
            manager.take_due_kinds(start + Duration::from_secs(600)),
            vec![ResourceTaskKind::ResourceCheck]
        );
        assert_eq!(
            manager.take_due_kinds(start + Duration::from_secs(1200)),
            vec![ResourceTaskKind::ResourceCheck, ResourceTaskKind::CleanEdges]
        );
    }

    #[tokio::test]
    async fn test_clean_edges_marks_silent_edges() {
        let ctx = context(None);
        let manager = ResourceManager::new(ctx.clone(), config(), None).expect("manager");
        ctx.catalog
            .add_edge(&Edge::new("edge-old", EdgeType::Edge))
            .expect("edge");
        ctx.catalog
            .mark_edges_stale_before(ess_lib::unix_timestamp() + 10)
            .expect("stale");

        assert_eq!(
            ctx.catalog.get_edge("edge-old").expect("edge").status,
            EdgeStatus::LostHeartbeat
        );
        // A fresh edge survives the sweep.
        ctx.catalog
            .add_edge(&Edge::new("edge-new", EdgeType::Edge))
            .expect("edge");
        assert_eq!(manager.clean_edges().expect("clean"), 0);
        assert!(ctx.catalog.get_edge("edge-new").expect("edge").is_active());
    }
}
