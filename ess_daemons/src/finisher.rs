// ========== Finisher ==========

use crate::config::FinisherConfig;
use crate::context::DaemonContext;
use crate::engine::DaemonTasks;
use crate::messaging::EventQueue;
use async_trait::async_trait;
use ess_lib::{
    ContentFilter, ContentStatistic, ContentStatus, EssEvent, EssResult, Request, RequestFilter,
    RequestStatus, RequestUpdate,
};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;

const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct FinishTask {
    pub request: Request,
    pub edge_id: i64,
    pub complete: Option<bool>,
}

/// True when the grouped counts show a single status, AVAILABLE, over at least one row.
pub fn is_complete(stats: &[ContentStatistic]) -> bool {
    let total: u64 = stats.iter().map(|s| s.count).sum();
    total > 0 && stats.iter().all(|s| s.status == ContentStatus::Available)
}

/// Flips requests to AVAILABLE once every content row they wait on is available here.
pub struct Finisher {
    ctx: Arc<DaemonContext>,
    config: FinisherConfig,
    events: Option<Arc<EventQueue>>,
}

impl Finisher {
    pub fn new(
        ctx: Arc<DaemonContext>,
        config: FinisherConfig,
        events: Option<Arc<EventQueue>>,
    ) -> Self {
        if config.send_messaging && events.is_none() {
            warn!("finisher: send_messaging is set but no messaging plugin is configured");
        }
        if config.sync_to_head && ctx.head.is_none() {
            warn!("finisher: sync_to_head is set but no head_service is configured");
        }
        Self {
            ctx,
            config,
            events,
        }
    }

    fn content_filter(&self, request: &Request, edge_id: i64) -> EssResult<ContentFilter> {
        let coll_id = match request.processing_meta.coll_id {
            Some(coll_id) => coll_id,
            None => {
                self.ctx
                    .catalog
                    .get_collection(&request.scope, &request.name)?
                    .coll_id
            }
        };
        Ok(ContentFilter::for_collection(coll_id, edge_id))
    }

    pub async fn check_request(&self, request: &Request, edge_id: i64) -> EssResult<bool> {
        let catalog = &self.ctx.catalog;
        let filter = self.content_filter(request, edge_id)?;
        let stats = catalog.get_contents_statistics(
            &filter
                .clone()
                .with_type(request.granularity_type.content_type()),
        )?;
        if !is_complete(&stats) {
            debug!(
                "finisher: request not complete: request_id={}, stats={:?}",
                request.request_id,
                stats
                    .iter()
                    .map(|s| format!("{}={}", s.status, s.count))
                    .collect::<Vec<_>>()
            );
            return Ok(false);
        }

        if self.config.sync_to_head {
            if let Some(head) = &self.ctx.head {
                let contents = catalog.get_contents(&filter)?;
                let added = head
                    .add_contents(
                        &request.scope,
                        &request.name,
                        &self.ctx.resource_name,
                        &contents,
                    )
                    .await?;
                info!(
                    "finisher: contents synced to head: request_id={}, rows={}, added={}",
                    request.request_id,
                    contents.len(),
                    added
                );
            }
        }
        Ok(true)
    }

    async fn mark_available(&self, task: &FinishTask) -> EssResult<()> {
        let request = &task.request;
        if !self.ctx.catalog.transition_request(
            request.request_id,
            request.status,
            &RequestUpdate::status(RequestStatus::Available),
        )? {
            debug!(
                "finisher: request already moved: request_id={}",
                request.request_id
            );
            return Ok(());
        }
        info!(
            "finisher: request available: request_id={}, scope={}, name={}, granularity={}",
            request.request_id, request.scope, request.name, request.granularity_type
        );

        if let (Some(original_id), Some(head)) =
            (request.processing_meta.original_request_id, &self.ctx.head)
        {
            if let Err(e) = head
                .update_request(original_id, &RequestUpdate::status(RequestStatus::Available))
                .await
            {
                warn!(
                    "finisher: mirror completion to head failed: request_id={}, remote_id={}, err={}",
                    request.request_id, original_id, e
                );
            }
        }

        if self.config.send_messaging {
            if let Some(events) = &self.events {
                events.publish(EssEvent::request_done(request, &self.ctx.resource_name));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DaemonTasks for Finisher {
    type Task = FinishTask;

    fn name(&self) -> &str {
        "finisher"
    }

    async fn on_stop(&self) {
        if let Some(events) = &self.events {
            events.shutdown(EVENT_DRAIN_TIMEOUT).await;
        }
    }

    fn task_key(&self, task: &FinishTask) -> Option<String> {
        Some(task.request.request_id.to_string())
    }

    async fn discover_tasks(&self, capacity: usize) -> EssResult<Vec<FinishTask>> {
        let limit = self.config.batch_size.min(capacity);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let Some(edge_id) = self.ctx.local_edge_id()? else {
            return Ok(Vec::new());
        };
        let mut filter = RequestFilter::by_status(RequestStatus::Precached)
            .at_edge(edge_id)
            .with_limit(limit);
        filter.statuses.push(RequestStatus::Splitting);
        Ok(self
            .ctx
            .catalog
            .get_requests(&filter)?
            .into_iter()
            .map(|request| FinishTask {
                request,
                edge_id,
                complete: None,
            })
            .collect())
    }

    async fn process_task(&self, task: &mut FinishTask) -> EssResult<()> {
        task.complete = Some(self.check_request(&task.request, task.edge_id).await?);
        Ok(())
    }

    async fn collect_results(&self, results: Vec<FinishTask>) -> EssResult<()> {
        for task in results {
            if task.complete == Some(true) {
                if let Err(e) = self.mark_available(&task).await {
                    error!(
                        "finisher: mark available failed, will retry: request_id={}, err={}",
                        task.request.request_id, e
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ess_catalog::{CatalogDB, HeadClient};
    use ess_lib::{Collection, Content, ContentType, Edge, EdgeType, GranularityType};

    fn stat(status: ContentStatus, count: u64) -> ContentStatistic {
        ContentStatistic {
            edge_id: 1,
            coll_id: 1,
            content_type: ContentType::Partial,
            status,
            count,
        }
    }

    #[test]
    fn test_is_complete() {
        assert!(is_complete(&[stat(ContentStatus::Available, 3)]));
        assert!(!is_complete(&[]));
        assert!(!is_complete(&[stat(ContentStatus::Available, 0)]));
        assert!(!is_complete(&[
            stat(ContentStatus::Available, 2),
            stat(ContentStatus::Splitting, 1),
        ]));
    }

    struct Fixture {
        ctx: Arc<DaemonContext>,
        head_db: Arc<CatalogDB>,
        edge_id: i64,
        coll_id: i64,
    }

    fn fixture() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let head_db = Arc::new(CatalogDB::new_in_memory().expect("head"));
        head_db
            .add_edge(&Edge::new("edge-a", EdgeType::Edge))
            .expect("head edge");
        head_db
            .add_collection(&Collection::new("s", "n"))
            .expect("head collection");
        let catalog = Arc::new(CatalogDB::new_in_memory().expect("catalog"));
        let edge_id = catalog
            .add_edge(&Edge::new("edge-a", EdgeType::Edge))
            .expect("edge");
        let coll_id = catalog
            .add_collection(&Collection::new("s", "n"))
            .expect("collection");
        let head = Arc::new(HeadClient::new_in_process(head_db.clone()));
        Fixture {
            ctx: Arc::new(DaemonContext::new(catalog, Some(head), "edge-a")),
            head_db,
            edge_id,
            coll_id,
        }
    }

    fn add_content(f: &Fixture, content_type: ContentType, min_id: u64, status: ContentStatus) -> i64 {
        f.ctx
            .catalog
            .add_content(&Content {
                coll_id: f.coll_id,
                scope: "s".to_string(),
                name: "f1".to_string(),
                min_id,
                max_id: min_id + 9,
                content_type,
                status,
                edge_id: f.edge_id,
                ..Default::default()
            })
            .expect("content")
    }

    async fn run_cycle(finisher: &Finisher) {
        let mut tasks = finisher.discover_tasks(10).await.expect("discover");
        for task in tasks.iter_mut() {
            finisher.process_task(task).await.expect("process");
        }
        finisher.collect_results(tasks).await.expect("collect");
    }

    #[tokio::test]
    async fn test_partial_request_waits_for_every_range() {
        let f = fixture();
        add_content(&f, ContentType::File, 1, ContentStatus::Available);
        add_content(&f, ContentType::Partial, 1, ContentStatus::Available);
        let pending = add_content(&f, ContentType::Partial, 11, ContentStatus::Splitting);
        let mut request = Request::new_partial("s", "n", 10);
        request.status = RequestStatus::Splitting;
        request.edge_id = Some(f.edge_id);
        request.processing_meta.coll_id = Some(f.coll_id);
        let request_id = f.ctx.catalog.add_request(&request).expect("request");

        let finisher = Finisher::new(f.ctx.clone(), FinisherConfig::default(), None);
        run_cycle(&finisher).await;
        assert_eq!(
            f.ctx.catalog.get_request(request_id).expect("request").status,
            RequestStatus::Splitting
        );

        f.ctx
            .catalog
            .update_contents_by_id(
                &[ess_lib::ContentUpdate::new(pending).status(ContentStatus::Available)],
                Some(ContentStatus::Splitting),
            )
            .expect("update");
        run_cycle(&finisher).await;
        assert_eq!(
            f.ctx.catalog.get_request(request_id).expect("request").status,
            RequestStatus::Available
        );
    }

    #[tokio::test]
    async fn test_file_request_synced_and_mirrored_to_head() {
        let f = fixture();
        add_content(&f, ContentType::File, 1, ContentStatus::Available);
        let mut remote = Request::new("s", "n", GranularityType::File);
        remote.status = RequestStatus::Assigned;
        let remote_id = f.head_db.add_request(&remote).expect("head request");

        let mut request = Request::new("s", "n", GranularityType::File);
        request.status = RequestStatus::Precached;
        request.edge_id = Some(f.edge_id);
        request.processing_meta.coll_id = Some(f.coll_id);
        request.processing_meta.original_request_id = Some(remote_id);
        let request_id = f.ctx.catalog.add_request(&request).expect("request");

        let config = FinisherConfig {
            sync_to_head: true,
            ..Default::default()
        };
        let finisher = Finisher::new(f.ctx.clone(), config, None);
        run_cycle(&finisher).await;

        assert_eq!(
            f.ctx.catalog.get_request(request_id).expect("request").status,
            RequestStatus::Available
        );
        assert_eq!(
            f.head_db.get_request(remote_id).expect("head request").status,
            RequestStatus::Available
        );
        let head_coll = f.head_db.get_collection("s", "n").expect("collection");
        let head_edge = f.head_db.get_edge("edge-a").expect("edge");
        assert_eq!(
            f.head_db
                .count_contents(&ContentFilter::for_collection(head_coll.coll_id, head_edge.edge_id))
                .expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn test_partial_request_without_ranges_is_not_finished() {
        let f = fixture();
        add_content(&f, ContentType::File, 1, ContentStatus::Available);
        let mut request = Request::new_partial("s", "n", 10);
        request.status = RequestStatus::Precached;
        request.edge_id = Some(f.edge_id);
        request.processing_meta.coll_id = Some(f.coll_id);
        let request_id = f.ctx.catalog.add_request(&request).expect("request");

        let finisher = Finisher::new(f.ctx.clone(), FinisherConfig::default(), None);
        run_cycle(&finisher).await;
        assert_eq!(
            f.ctx.catalog.get_request(request_id).expect("request").status,
            RequestStatus::Precached
        );
    }
}
