// ========== Splitter ==========

use crate::config::SplitterConfig;
use crate::context::DaemonContext;
use crate::engine::DaemonTasks;
use async_trait::async_trait;
use ess_lib::{
    unix_timestamp, Content, ContentFilter, ContentStatus, ContentType, ContentUpdate, EssError, EssResult,
    GranularityType, Request, RequestFilter, RequestStatus, RequestUpdate, SplitOutput, Splitter,
};
use log::{debug, error, info, warn};
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug)]
pub enum SplitterTask {
    /// Chunk the FILE rows of a TOSPLITTING request into TOSPLIT PARTIAL rows.
    Prepare {
        request: Request,
        edge_id: i64,
        outcome: Option<Result<usize, String>>,
    },
    /// Hand claimed SPLITTING rows to the splitting plugin.
    Dispatch {
        contents: Vec<Content>,
        outcome: Option<Result<(), String>>,
    },
    /// Record ranges the plugin finished.
    Complete {
        outputs: Vec<SplitOutput>,
        outcome: Option<Result<usize, String>>,
    },
}

/// Drives PARTIAL requests from PRECACHED to SPLITTING and their ranges through the
/// external splitting subsystem.
pub struct SplitterDaemon {
    ctx: Arc<DaemonContext>,
    config: SplitterConfig,
    plugin: Arc<dyn Splitter>,
    completed_status: ContentStatus,
}

fn partial_filter(edge_id: i64) -> ContentFilter {
    ContentFilter {
        edge_id: Some(edge_id),
        content_type: Some(ContentType::Partial),
        ..Default::default()
    }
}

impl SplitterDaemon {
    pub fn new(
        ctx: Arc<DaemonContext>,
        config: SplitterConfig,
        plugin: Arc<dyn Splitter>,
    ) -> EssResult<Self> {
        let completed_status = ContentStatus::from_str(&config.completed_status)?;
        if !ContentStatus::Splitting.can_transition_to(completed_status)
            || completed_status == ContentStatus::ToSplit
        {
            return Err(EssError::InvalidParam(format!(
                "splitter completed_status {} is not a final split state",
                completed_status
            )));
        }
        Ok(Self {
            ctx,
            config,
            plugin,
            completed_status,
        })
    }

    /// Inserts the PARTIAL rows of every FILE row of the request's collection.
    /// Rows that already exist are left alone, so a crashed prepare can be repeated.
    pub fn prepare_request(&self, request: &Request, edge_id: i64) -> EssResult<usize> {
        let catalog = &self.ctx.catalog;
        let level = request.granularity_level.filter(|l| *l > 0).ok_or_else(|| {
            EssError::InvalidParam(format!(
                "request #{} has no positive granularity_level",
                request.request_id
            ))
        })?;
        let coll_id = match request.processing_meta.coll_id {
            Some(coll_id) => coll_id,
            None => catalog.get_collection(&request.scope, &request.name)?.coll_id,
        };
        let files = catalog.get_contents(
            &ContentFilter::for_collection(coll_id, edge_id).with_type(ContentType::File),
        )?;
        if files.is_empty() {
            return Err(EssError::NoRequestedData(format!(
                "no FILE contents for collection #{} at edge #{}",
                coll_id, edge_id
            )));
        }
        let partials = files
            .iter()
            .flat_map(|file| file.split_into_partials(level))
            .collect::<Vec<_>>();
        let inserted = catalog.add_contents(&partials)?;
        info!(
            "splitter: request prepared: request_id={}, files={}, ranges={}, inserted={}",
            request.request_id,
            files.len(),
            partials.len(),
            inserted
        );
        Ok(inserted)
    }

    fn revert_to_split(&self, contents: &[Content]) {
        let updates = contents
            .iter()
            .map(|c| ContentUpdate::new(c.content_id).status(ContentStatus::ToSplit))
            .collect::<Vec<_>>();
        match self
            .ctx
            .catalog
            .update_contents_by_id(&updates, Some(ContentStatus::Splitting))
        {
            Ok(reverted) => info!("splitter: ranges returned to TOSPLIT: count={}", reverted),
            Err(e) => error!("splitter: return ranges to TOSPLIT failed: {}", e),
        }
    }

    /// Records finished ranges. A failed range goes back to TOSPLIT until it has failed
    /// `max_split_failures` times, then becomes UNAVAILABLE.
    pub fn apply_outputs(&self, outputs: &[SplitOutput]) -> EssResult<usize> {
        let now = unix_timestamp();
        let mut updates = Vec::with_capacity(outputs.len());
        for output in outputs {
            let Some(reason) = &output.error else {
                updates.push(
                    ContentUpdate::new(output.content_id)
                        .status(self.completed_status)
                        .location(&output.pfn, output.size)
                        .success(),
                );
                continue;
            };
            let failures = self.ctx.catalog.get_content(output.content_id)?.num_failure + 1;
            let next = if failures >= self.config.max_split_failures.max(1) {
                ContentStatus::Unavailable
            } else {
                ContentStatus::ToSplit
            };
            warn!(
                "splitter: range failed: content_id={}, failures={}, next={}, reason={}",
                output.content_id, failures, next, reason
            );
            updates.push(
                ContentUpdate::new(output.content_id)
                    .status(next)
                    .failure(now),
            );
        }
        self.ctx
            .catalog
            .update_contents_by_id(&updates, Some(ContentStatus::Splitting))
    }

    fn discover_prepare(&self, edge_id: i64, limit: usize) -> EssResult<Vec<SplitterTask>> {
        let catalog = &self.ctx.catalog;
        let precached = RequestFilter::by_status(RequestStatus::Precached)
            .at_edge(edge_id)
            .with_granularity(GranularityType::Partial)
            .with_limit(limit);
        catalog.claim_requests(&precached, RequestStatus::Precached, RequestStatus::ToSplitting)?;

        let to_split = RequestFilter::by_status(RequestStatus::ToSplitting)
            .at_edge(edge_id)
            .with_granularity(GranularityType::Partial)
            .with_limit(limit);
        Ok(catalog
            .get_requests(&to_split)?
            .into_iter()
            .map(|request| SplitterTask::Prepare {
                request,
                edge_id,
                outcome: None,
            })
            .collect())
    }
}

#[async_trait]
impl DaemonTasks for SplitterDaemon {
    type Task = SplitterTask;

    fn name(&self) -> &str {
        "splitter"
    }

    async fn on_start(&self) -> EssResult<()> {
        if let Some(edge_id) = self.ctx.local_edge_id()? {
            let recovered = self.ctx.catalog.claim_contents(
                &partial_filter(edge_id),
                ContentStatus::Splitting,
                ContentStatus::ToSplit,
            )?;
            if !recovered.is_empty() {
                info!(
                    "splitter: unfinished ranges returned to TOSPLIT: count={}",
                    recovered.len()
                );
            }
        }
        self.plugin.start().await
    }

    async fn on_stop(&self) {
        if let Err(e) = self.plugin.stop().await {
            warn!("splitter: plugin stop failed: {}", e);
        }
    }

    fn task_key(&self, task: &SplitterTask) -> Option<String> {
        match task {
            SplitterTask::Prepare { request, .. } => Some(format!("prepare:{}", request.request_id)),
            _ => None,
        }
    }

    async fn discover_tasks(&self, capacity: usize) -> EssResult<Vec<SplitterTask>> {
        let limit = self.config.batch_size.min(capacity);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let Some(edge_id) = self.ctx.local_edge_id()? else {
            return Ok(Vec::new());
        };
        if !self.plugin.is_running() && !self.plugin.has_outputs() {
            return Err(EssError::PluginExecution(
                "splitting plugin is no longer running".to_string(),
            ));
        }

        let mut tasks = self.discover_prepare(edge_id, limit)?;

        if tasks.len() < capacity && self.plugin.need_more_requests() {
            let contents = self.ctx.catalog.claim_contents(
                &partial_filter(edge_id).with_limit(self.config.batch_size.max(1)),
                ContentStatus::ToSplit,
                ContentStatus::Splitting,
            )?;
            if !contents.is_empty() {
                tasks.push(SplitterTask::Dispatch {
                    contents,
                    outcome: None,
                });
            }
        }

        if tasks.len() < capacity && self.plugin.has_outputs() {
            let outputs = self.plugin.get_outputs().await?;
            if !outputs.is_empty() {
                tasks.push(SplitterTask::Complete {
                    outputs,
                    outcome: None,
                });
            }
        }
        Ok(tasks)
    }

    async fn process_task(&self, task: &mut SplitterTask) -> EssResult<()> {
        match task {
            SplitterTask::Prepare {
                request,
                edge_id,
                outcome,
            } => {
                *outcome = Some(
                    self.prepare_request(request, *edge_id)
                        .map_err(|e| e.to_string()),
                );
            }
            SplitterTask::Dispatch { contents, outcome } => {
                let sent = self.plugin.send_requests(contents).await;
                if let Err(e) = &sent {
                    warn!(
                        "splitter: send ranges failed: count={}, err={}",
                        contents.len(),
                        e
                    );
                    self.revert_to_split(contents);
                }
                *outcome = Some(sent.map_err(|e| e.to_string()));
            }
            SplitterTask::Complete { outputs, outcome } => {
                *outcome = Some(self.apply_outputs(outputs).map_err(|e| e.to_string()));
            }
        }
        Ok(())
    }

    async fn collect_results(&self, results: Vec<SplitterTask>) -> EssResult<()> {
        for task in results {
            match task {
                SplitterTask::Prepare {
                    request, outcome, ..
                } => match outcome {
                    Some(Ok(_)) => {
                        if self.ctx.catalog.transition_request(
                            request.request_id,
                            RequestStatus::ToSplitting,
                            &RequestUpdate::status(RequestStatus::Splitting),
                        )? {
                            info!("splitter: request splitting: request_id={}", request.request_id);
                        }
                    }
                    Some(Err(e)) => warn!(
                        "splitter: prepare failed, will retry: request_id={}, err={}",
                        request.request_id, e
                    ),
                    None => warn!(
                        "splitter: prepare interrupted: request_id={}",
                        request.request_id
                    ),
                },
                SplitterTask::Dispatch { contents, outcome } => match outcome {
                    Some(Ok(())) => debug!("splitter: ranges sent: count={}", contents.len()),
                    Some(Err(_)) => {}
                    None => self.revert_to_split(&contents),
                },
                SplitterTask::Complete { outputs, outcome } => match outcome {
                    Some(Ok(changed)) => info!(
                        "splitter: ranges completed: outputs={}, updated={}, status={}",
                        outputs.len(),
                        changed,
                        self.completed_status
                    ),
                    Some(Err(e)) => error!(
                        "splitter: record outputs failed: count={}, err={}",
                        outputs.len(),
                        e
                    ),
                    None => {
                        if let Err(e) = self.apply_outputs(&outputs) {
                            error!("splitter: record outputs failed: {}", e);
                        }
                    }
                },
            }
        }
        Ok(())
    }

    async fn release_tasks(&self, tasks: Vec<SplitterTask>) {
        for task in tasks {
            match task {
                SplitterTask::Dispatch { contents, .. } => self.revert_to_split(&contents),
                SplitterTask::Complete { outputs, .. } => {
                    if let Err(e) = self.apply_outputs(&outputs) {
                        error!("splitter: record outputs on stop failed: {}", e);
                    }
                }
                SplitterTask::Prepare { .. } => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::RangeRefSplitter;
    use ess_catalog::CatalogDB;
    use ess_lib::{Collection, Edge, EdgeType};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct FlakySplitter {
        inner: RangeRefSplitter,
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl Splitter for FlakySplitter {
        async fn start(&self) -> EssResult<()> {
            Ok(())
        }
        async fn stop(&self) -> EssResult<()> {
            Ok(())
        }
        fn need_more_requests(&self) -> bool {
            self.inner.need_more_requests()
        }
        async fn send_requests(&self, contents: &[Content]) -> EssResult<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(EssError::PluginExecution("splitter busy".to_string()));
            }
            self.inner.send_requests(contents).await
        }
        fn has_outputs(&self) -> bool {
            self.inner.has_outputs()
        }
        async fn get_outputs(&self) -> EssResult<Vec<SplitOutput>> {
            self.inner.get_outputs().await
        }
    }

    /// Answers every range with a failure; `running` flips off like a dead child.
    struct RejectingSplitter {
        outputs: Mutex<VecDeque<SplitOutput>>,
        running: AtomicBool,
    }

    impl RejectingSplitter {
        fn new() -> Self {
            Self {
                outputs: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl Splitter for RejectingSplitter {
        async fn start(&self) -> EssResult<()> {
            Ok(())
        }
        async fn stop(&self) -> EssResult<()> {
            Ok(())
        }
        fn need_more_requests(&self) -> bool {
            self.is_running()
        }
        async fn send_requests(&self, contents: &[Content]) -> EssResult<()> {
            let mut outputs = self.outputs.lock().expect("outputs");
            for content in contents {
                outputs.push_back(SplitOutput::failed(content, "corrupt input"));
            }
            Ok(())
        }
        fn has_outputs(&self) -> bool {
            !self.outputs.lock().expect("outputs").is_empty()
        }
        async fn get_outputs(&self) -> EssResult<Vec<SplitOutput>> {
            Ok(self.outputs.lock().expect("outputs").drain(..).collect())
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    struct Fixture {
        ctx: Arc<DaemonContext>,
        edge_id: i64,
        coll_id: i64,
        request_id: i64,
    }

    fn fixture() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let catalog = Arc::new(CatalogDB::new_in_memory().expect("catalog"));
        let edge_id = catalog
            .add_edge(&Edge::new("edge-a", EdgeType::Edge))
            .expect("edge");
        let coll_id = catalog
            .add_collection(&Collection::new("s", "n"))
            .expect("collection");
        catalog
            .add_contents(&[Content {
                coll_id,
                scope: "s".to_string(),
                name: "f1".to_string(),
                min_id: 1,
                max_id: 23,
                status: ContentStatus::Available,
                edge_id,
                pfn_size: 2300,
                pfn: Some("/cache/s/n/f1".to_string()),
                ..Default::default()
            }])
            .expect("file");
        let mut request = Request::new_partial("s", "n", 10);
        request.status = RequestStatus::Precached;
        request.edge_id = Some(edge_id);
        request.processing_meta.coll_id = Some(coll_id);
        let request_id = catalog.add_request(&request).expect("request");
        Fixture {
            ctx: Arc::new(DaemonContext::new(catalog, None, "edge-a")),
            edge_id,
            coll_id,
            request_id,
        }
    }

    async fn run_cycle(daemon: &SplitterDaemon) -> usize {
        let mut tasks = daemon.discover_tasks(100).await.expect("discover");
        let count = tasks.len();
        for task in tasks.iter_mut() {
            daemon.process_task(task).await.expect("process");
        }
        daemon.collect_results(tasks).await.expect("collect");
        count
    }

    fn partial_statuses(f: &Fixture) -> Vec<(u64, u64, ContentStatus)> {
        f.ctx
            .catalog
            .get_contents(
                &ContentFilter::for_collection(f.coll_id, f.edge_id).with_type(ContentType::Partial),
            )
            .expect("partials")
            .into_iter()
            .map(|c| (c.min_id, c.max_id, c.status))
            .collect()
    }

    #[test]
    fn test_completed_status_must_follow_splitting() {
        let f = fixture();
        let config = SplitterConfig {
            completed_status: "TOSPLIT".to_string(),
            ..Default::default()
        };
        assert!(SplitterDaemon::new(f.ctx.clone(), config, Arc::new(RangeRefSplitter::new(10))).is_err());
        let config = SplitterConfig {
            completed_status: "splitted".to_string(),
            ..Default::default()
        };
        assert!(SplitterDaemon::new(f.ctx, config, Arc::new(RangeRefSplitter::new(10))).is_ok());
    }

    #[tokio::test]
    async fn test_prepare_then_split_ranges() {
        let f = fixture();
        let daemon = SplitterDaemon::new(
            f.ctx.clone(),
            SplitterConfig::default(),
            Arc::new(RangeRefSplitter::new(10)),
        )
        .expect("daemon");
        daemon.on_start().await.expect("start");

        run_cycle(&daemon).await;
        let request = f.ctx.catalog.get_request(f.request_id).expect("request");
        assert_eq!(request.status, RequestStatus::Splitting);
        assert_eq!(
            partial_statuses(&f),
            vec![
                (1, 10, ContentStatus::ToSplit),
                (11, 20, ContentStatus::ToSplit),
                (21, 23, ContentStatus::ToSplit),
            ]
        );

        // Dispatch, then completion on the following cycle.
        run_cycle(&daemon).await;
        run_cycle(&daemon).await;
        let partials = f
            .ctx
            .catalog
            .get_contents(
                &ContentFilter::for_collection(f.coll_id, f.edge_id).with_type(ContentType::Partial),
            )
            .expect("partials");
        assert!(partials.iter().all(|c| c.status == ContentStatus::Available));
        let last = partials.iter().find(|c| c.min_id == 21).expect("last");
        assert_eq!(last.pfn.as_deref(), Some("/cache/s/n/f1#21-23"));
        assert_eq!(last.pfn_size, 300);
        assert_eq!(last.num_success, 1);

        // Preparing again inserts nothing new.
        assert_eq!(daemon.prepare_request(&request, f.edge_id).expect("prepare"), 0);
    }

    #[tokio::test]
    async fn test_failed_dispatch_returns_ranges() {
        let f = fixture();
        let daemon = SplitterDaemon::new(
            f.ctx.clone(),
            SplitterConfig::default(),
            Arc::new(FlakySplitter {
                inner: RangeRefSplitter::new(10),
                fail_next: AtomicBool::new(true),
            }),
        )
        .expect("daemon");

        run_cycle(&daemon).await;
        run_cycle(&daemon).await;
        assert!(partial_statuses(&f)
            .iter()
            .all(|(_, _, status)| *status == ContentStatus::ToSplit));

        run_cycle(&daemon).await;
        run_cycle(&daemon).await;
        assert!(partial_statuses(&f)
            .iter()
            .all(|(_, _, status)| *status == ContentStatus::Available));
    }

    fn partial_failures(f: &Fixture) -> Vec<(ContentStatus, u32)> {
        let mut partials = f
            .ctx
            .catalog
            .get_contents(
                &ContentFilter::for_collection(f.coll_id, f.edge_id).with_type(ContentType::Partial),
            )
            .expect("partials");
        partials.sort_by_key(|c| c.min_id);
        partials
            .into_iter()
            .map(|c| (c.status, c.num_failure))
            .collect()
    }

    #[tokio::test]
    async fn test_failed_ranges_retry_then_become_unavailable() {
        let f = fixture();
        let daemon = SplitterDaemon::new(
            f.ctx.clone(),
            SplitterConfig {
                max_split_failures: 2,
                ..Default::default()
            },
            Arc::new(RejectingSplitter::new()),
        )
        .expect("daemon");

        // Prepare, dispatch, then record the failures.
        for _ in 0..3 {
            run_cycle(&daemon).await;
        }
        assert_eq!(
            partial_failures(&f),
            vec![(ContentStatus::ToSplit, 1); 3]
        );
        let failed = f
            .ctx
            .catalog
            .get_contents(
                &ContentFilter::for_collection(f.coll_id, f.edge_id).with_type(ContentType::Partial),
            )
            .expect("partials");
        assert!(failed.iter().all(|c| c.last_failed_at.is_some()));

        run_cycle(&daemon).await;
        run_cycle(&daemon).await;
        assert_eq!(
            partial_failures(&f),
            vec![(ContentStatus::Unavailable, 2); 3]
        );
        // Nothing left to dispatch and the request is not finished.
        assert_eq!(run_cycle(&daemon).await, 0);
        assert_eq!(
            f.ctx.catalog.get_request(f.request_id).expect("request").status,
            RequestStatus::Splitting
        );
    }

    #[tokio::test]
    async fn test_stopped_plugin_is_reported_after_outputs_drain() {
        let f = fixture();
        let plugin = Arc::new(RejectingSplitter::new());
        let daemon = SplitterDaemon::new(f.ctx.clone(), SplitterConfig::default(), plugin.clone())
            .expect("daemon");
        run_cycle(&daemon).await;

        let contents = f
            .ctx
            .catalog
            .claim_contents(&partial_filter(f.edge_id), ContentStatus::ToSplit, ContentStatus::Splitting)
            .expect("claim");
        plugin.send_requests(&contents).await.expect("send");
        plugin.running.store(false, Ordering::SeqCst);

        // Pending failures still land before the plugin is reported gone.
        assert_eq!(run_cycle(&daemon).await, 1);
        assert_eq!(
            partial_failures(&f),
            vec![(ContentStatus::ToSplit, 1); 3]
        );
        let err = daemon.discover_tasks(100).await.expect_err("plugin gone");
        assert!(matches!(err, EssError::PluginExecution(_)));
    }

    #[tokio::test]
    async fn test_start_recovers_splitting_rows_and_release_reverts() {
        let f = fixture();
        let daemon = SplitterDaemon::new(
            f.ctx.clone(),
            SplitterConfig::default(),
            Arc::new(RangeRefSplitter::new(10)),
        )
        .expect("daemon");
        run_cycle(&daemon).await;

        // Claimed but never sent: released on stop.
        let tasks = daemon.discover_tasks(100).await.expect("discover");
        assert_eq!(tasks.len(), 1);
        assert!(partial_statuses(&f)
            .iter()
            .all(|(_, _, status)| *status == ContentStatus::Splitting));
        daemon.release_tasks(tasks).await;
        assert!(partial_statuses(&f)
            .iter()
            .all(|(_, _, status)| *status == ContentStatus::ToSplit));

        // Claimed and lost with the process: recovered at the next start.
        f.ctx
            .catalog
            .claim_contents(&partial_filter(f.edge_id), ContentStatus::ToSplit, ContentStatus::Splitting)
            .expect("claim");
        daemon.on_start().await.expect("start");
        assert!(partial_statuses(&f)
            .iter()
            .all(|(_, _, status)| *status == ContentStatus::ToSplit));
    }
}
