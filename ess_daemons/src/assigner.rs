// ========== Assigner ==========

use crate::config::AssignerConfig;
use crate::context::DaemonContext;
use crate::engine::DaemonTasks;
use async_trait::async_trait;
use ess_catalog::HeadClient;
use ess_lib::{
    Collection, EssError, EssResult, Request, RequestFilter, RequestStatus, RequestUpdate,
};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub enum AssignerTask {
    /// A request the broker placed on this edge.
    Local {
        request: Request,
        outcome: Option<Result<bool, String>>,
    },
    /// A request the head placed on this edge, to be mirrored locally.
    Remote {
        request: Request,
        outcome: Option<Result<i64, String>>,
    },
}

/// Confirms placements on this edge, pulling them from the head when one is configured.
pub struct Assigner {
    ctx: Arc<DaemonContext>,
    config: AssignerConfig,
    last_remote_poll: Mutex<Option<Instant>>,
}

impl Assigner {
    pub fn new(ctx: Arc<DaemonContext>, config: AssignerConfig) -> Self {
        Self {
            ctx,
            config,
            last_remote_poll: Mutex::new(None),
        }
    }

    fn remote_poll_due(&self) -> bool {
        let mut last = match self.last_remote_poll.lock() {
            Ok(guard) => guard,
            Err(e) => {
                warn!("assigner: remote poll lock poisoned: {}", e);
                return false;
            }
        };
        let now = Instant::now();
        if let Some(at) = *last {
            if now.duration_since(at) < Duration::from_secs(self.config.remote_poll_secs) {
                return false;
            }
        }
        *last = Some(now);
        true
    }

    fn promote_local(&self, request: &Request) -> EssResult<bool> {
        self.ctx.catalog.transition_request(
            request.request_id,
            RequestStatus::Assigning,
            &RequestUpdate::status(RequestStatus::Assigned),
        )
    }

    async fn mirror_collection(&self, head: &HeadClient, remote: &Request) -> EssResult<i64> {
        let catalog = &self.ctx.catalog;
        match catalog.get_collection(&remote.scope, &remote.name) {
            Ok(coll) => return Ok(coll.coll_id),
            Err(e) if !e.is_not_found() => return Err(e),
            Err(_) => {}
        }

        let coll = match head.get_collection(&remote.scope, &remote.name).await {
            Ok(coll) => coll,
            Err(e) if e.is_not_found() => {
                let meta = &remote.processing_meta;
                Collection {
                    collection_type: meta.collection_type.unwrap_or_default(),
                    coll_size: meta.size.unwrap_or(0),
                    total_files: meta.total_files.unwrap_or(0),
                    global_status: meta.collection_status.unwrap_or_default(),
                    ..Collection::new(&remote.scope, &remote.name)
                }
            }
            Err(e) => return Err(e),
        };
        match catalog.add_collection(&Collection { coll_id: 0, ..coll }) {
            Ok(coll_id) => Ok(coll_id),
            Err(e) if e.is_duplicate() => {
                Ok(catalog.get_collection(&remote.scope, &remote.name)?.coll_id)
            }
            Err(e) => Err(e),
        }
    }

    /// Creates (or finds) the local shadow of a head request, then reports ASSIGNED
    /// back to the head. Safe to repeat for the same head request.
    pub async fn mirror_remote(&self, head: &HeadClient, remote: &Request) -> EssResult<i64> {
        let edge_id = self.ctx.local_edge_id()?.ok_or_else(|| {
            EssError::NotFound(format!("edge {} is not registered", self.ctx.resource_name))
        })?;
        let coll_id = self.mirror_collection(head, remote).await?;

        let mut meta = remote.processing_meta.clone();
        meta.coll_id = Some(coll_id);
        meta.original_request_id = Some(remote.request_id);
        let local = Request {
            request_id: 0,
            edge_id: Some(edge_id),
            status: RequestStatus::Assigned,
            processing_meta: meta,
            errors: None,
            ..remote.clone()
        };
        let catalog = &self.ctx.catalog;
        let local_id = match catalog.add_request(&local) {
            Ok(request_id) => request_id,
            Err(e) if e.is_duplicate() => {
                catalog.get_request_by_original(remote.request_id)?.request_id
            }
            Err(e) => return Err(e),
        };

        head.update_request(
            remote.request_id,
            &RequestUpdate::status(RequestStatus::Assigned),
        )
        .await?;
        Ok(local_id)
    }
}

#[async_trait]
impl DaemonTasks for Assigner {
    type Task = AssignerTask;

    fn name(&self) -> &str {
        "assigner"
    }

    fn task_key(&self, task: &AssignerTask) -> Option<String> {
        Some(match task {
            AssignerTask::Local { request, .. } => format!("local:{}", request.request_id),
            AssignerTask::Remote { request, .. } => format!("remote:{}", request.request_id),
        })
    }

    async fn discover_tasks(&self, capacity: usize) -> EssResult<Vec<AssignerTask>> {
        let limit = self.config.batch_size.min(capacity);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut tasks = Vec::new();

        if let Some(edge_id) = self.ctx.local_edge_id()? {
            let filter = RequestFilter::by_status(RequestStatus::Assigning)
                .at_edge(edge_id)
                .with_limit(limit);
            tasks.extend(
                self.ctx
                    .catalog
                    .get_requests(&filter)?
                    .into_iter()
                    .map(|request| AssignerTask::Local {
                        request,
                        outcome: None,
                    }),
            );
        } else {
            debug!("assigner: edge {} not registered yet", self.ctx.resource_name);
        }

        let remaining = limit.saturating_sub(tasks.len());
        if let Some(head) = &self.ctx.head {
            if remaining > 0 && self.remote_poll_due() {
                match head
                    .get_requests(&self.ctx.resource_name, RequestStatus::Assigning)
                    .await
                {
                    Ok(requests) => tasks.extend(requests.into_iter().take(remaining).map(
                        |request| AssignerTask::Remote {
                            request,
                            outcome: None,
                        },
                    )),
                    Err(e) => warn!("assigner: poll head failed: {}", e),
                }
            }
        }
        Ok(tasks)
    }

    async fn process_task(&self, task: &mut AssignerTask) -> EssResult<()> {
        match task {
            AssignerTask::Local { request, outcome } => {
                *outcome = Some(self.promote_local(request).map_err(|e| e.to_string()));
            }
            AssignerTask::Remote { request, outcome } => {
                let result = match &self.ctx.head {
                    Some(head) => self.mirror_remote(head, request).await,
                    None => Err(EssError::Internal("no head configured".to_string())),
                };
                *outcome = Some(result.map_err(|e| e.to_string()));
            }
        }
        Ok(())
    }

    async fn collect_results(&self, results: Vec<AssignerTask>) -> EssResult<()> {
        for task in results {
            match task {
                AssignerTask::Local { request, outcome } => match outcome {
                    Some(Ok(true)) => info!(
                        "assigner: request assigned: request_id={}, edge_id={:?}",
                        request.request_id, request.edge_id
                    ),
                    Some(Ok(false)) => debug!(
                        "assigner: request already moved: request_id={}",
                        request.request_id
                    ),
                    Some(Err(e)) => warn!(
                        "assigner: assign failed: request_id={}, err={}",
                        request.request_id, e
                    ),
                    None => warn!(
                        "assigner: assign interrupted: request_id={}",
                        request.request_id
                    ),
                },
                AssignerTask::Remote { request, outcome } => match outcome {
                    Some(Ok(local_id)) => info!(
                        "assigner: head request mirrored: remote_id={}, local_id={}, scope={}, name={}",
                        request.request_id, local_id, request.scope, request.name
                    ),
                    Some(Err(e)) => warn!(
                        "assigner: mirror head request failed: remote_id={}, err={}",
                        request.request_id, e
                    ),
                    None => warn!(
                        "assigner: mirror interrupted: remote_id={}",
                        request.request_id
                    ),
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ess_catalog::CatalogDB;
    use ess_lib::{CollectionStatus, Edge, EdgeType, GranularityType};

    fn local_context(head: Option<Arc<HeadClient>>) -> Arc<DaemonContext> {
        let catalog = Arc::new(CatalogDB::new_in_memory().expect("catalog"));
        catalog
            .add_edge(&Edge::new("edge-a", EdgeType::Edge))
            .expect("edge");
        Arc::new(DaemonContext::new(catalog, head, "edge-a"))
    }

    fn always_poll() -> AssignerConfig {
        AssignerConfig {
            remote_poll_secs: 0,
            ..Default::default()
        }
    }

    async fn run_cycle(assigner: &Assigner) -> usize {
        let mut tasks = assigner.discover_tasks(100).await.expect("discover");
        let count = tasks.len();
        for task in tasks.iter_mut() {
            assigner.process_task(task).await.expect("process");
        }
        assigner.collect_results(tasks).await.expect("collect");
        count
    }

    #[tokio::test]
    async fn test_local_assigning_promoted() {
        let ctx = local_context(None);
        let edge_id = ctx.local_edge_id().expect("edge").expect("registered");
        let mut mine = Request::new_partial("s", "n", 10);
        mine.status = RequestStatus::Assigning;
        mine.edge_id = Some(edge_id);
        let mine = ctx.catalog.add_request(&mine).expect("request");
        let mut other = Request::new_partial("s", "n", 10);
        other.status = RequestStatus::Assigning;
        other.edge_id = Some(edge_id + 100);
        let other = ctx.catalog.add_request(&other).expect("request");

        let assigner = Assigner::new(ctx.clone(), AssignerConfig::default());
        assert_eq!(run_cycle(&assigner).await, 1);
        assert_eq!(
            ctx.catalog.get_request(mine).expect("request").status,
            RequestStatus::Assigned
        );
        assert_eq!(
            ctx.catalog.get_request(other).expect("request").status,
            RequestStatus::Assigning
        );
    }

    #[tokio::test]
    async fn test_head_requests_mirrored_once() {
        let _ = env_logger::builder().is_test(true).try_init();
        let head_db = Arc::new(CatalogDB::new_in_memory().expect("head"));
        let head_edge = head_db
            .add_edge(&Edge::new("edge-a", EdgeType::Edge))
            .expect("edge");
        let coll_id = head_db
            .add_collection(&Collection {
                coll_size: 300,
                total_files: 1,
                global_status: CollectionStatus::Available,
                ..Collection::new("s", "n")
            })
            .expect("collection");
        let mut remote = Request::new("s", "n", GranularityType::File);
        remote.status = RequestStatus::Assigning;
        remote.edge_id = Some(head_edge);
        remote.processing_meta.coll_id = Some(coll_id);
        let remote_id = head_db.add_request(&remote).expect("request");

        let head = Arc::new(HeadClient::new_in_process(head_db.clone()));
        let ctx = local_context(Some(head.clone()));
        let assigner = Assigner::new(ctx.clone(), always_poll());
        run_cycle(&assigner).await;

        let local = ctx
            .catalog
            .get_request_by_original(remote_id)
            .expect("shadow request");
        assert_eq!(local.status, RequestStatus::Assigned);
        assert_eq!(local.edge_id, ctx.local_edge_id().expect("edge"));
        let local_coll = ctx.catalog.get_collection("s", "n").expect("collection");
        assert_eq!(local.processing_meta.coll_id, Some(local_coll.coll_id));
        assert_eq!(local_coll.coll_size, 300);
        assert_eq!(
            head_db.get_request(remote_id).expect("head request").status,
            RequestStatus::Assigned
        );

        // Repeating the mirror finds the same shadow.
        let remote = head_db.get_request(remote_id).expect("head request");
        let again = assigner.mirror_remote(&head, &remote).await.expect("mirror");
        assert_eq!(again, local.request_id);
        assert_eq!(
            ctx.catalog
                .get_requests(&RequestFilter::by_status(RequestStatus::Assigned))
                .expect("requests")
                .len(),
            1
        );
    }
}
