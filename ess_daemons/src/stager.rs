// ========== Stager ==========

use crate::config::StagerConfig;
use crate::context::DaemonContext;
use crate::engine::DaemonTasks;
use crate::messaging::EventQueue;
use async_trait::async_trait;
use ess_lib::{
    unix_timestamp, Content, ContentFilter, ContentStatus, ContentUpdate, EssEvent, EssResult,
    StageOutput, Stager,
};
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct StageTask {
    pub contents: Vec<Content>,
    pub outputs: Option<Vec<StageOutput>>,
    pub error: Option<String>,
}

/// Uploads TOSTAGEDOUT contents and publishes their final location.
pub struct StagerDaemon {
    ctx: Arc<DaemonContext>,
    config: StagerConfig,
    plugin: Arc<dyn Stager>,
    events: Option<Arc<EventQueue>>,
    /// Rows kept in STAGINGOUT after a failed upload, re-sent on the next cycle.
    retry: Mutex<Vec<Content>>,
}

impl StagerDaemon {
    pub fn new(
        ctx: Arc<DaemonContext>,
        config: StagerConfig,
        plugin: Arc<dyn Stager>,
        events: Option<Arc<EventQueue>>,
    ) -> Self {
        if config.send_messaging && events.is_none() {
            warn!("stager: send_messaging is set but no messaging plugin is configured");
        }
        Self {
            ctx,
            config,
            plugin,
            events,
            retry: Mutex::new(Vec::new()),
        }
    }

    fn take_retries(&self, limit: usize) -> Vec<Content> {
        match self.retry.lock() {
            Ok(mut retry) => {
                let n = limit.min(retry.len());
                retry.drain(..n).collect()
            }
            Err(e) => {
                error!("stager: retry lock poisoned: {}", e);
                Vec::new()
            }
        }
    }

    fn push_retries(&self, contents: Vec<Content>) {
        match self.retry.lock() {
            Ok(mut retry) => retry.extend(contents),
            Err(e) => error!("stager: retry lock poisoned: {}", e),
        }
    }

    pub fn pending_retries(&self) -> usize {
        match self.retry.lock() {
            Ok(retry) => retry.len(),
            Err(_) => 0,
        }
    }

    fn return_to_queue(&self, contents: &[Content]) {
        if contents.is_empty() {
            return;
        }
        let updates = contents
            .iter()
            .map(|c| ContentUpdate::new(c.content_id).status(ContentStatus::ToStagedOut))
            .collect::<Vec<_>>();
        match self
            .ctx
            .catalog
            .update_contents_by_id(&updates, Some(ContentStatus::StagingOut))
        {
            Ok(n) => info!("stager: contents returned to TOSTAGEDOUT: count={}", n),
            Err(e) => error!("stager: return contents to TOSTAGEDOUT failed: {}", e),
        }
    }

    fn exhausted(&self, num_failure: u32) -> bool {
        self.config
            .max_stageout_retries
            .map(|max| num_failure > max)
            .unwrap_or(false)
    }

    /// Applies one batch's results: uploaded rows become AVAILABLE, the rest either
    /// wait for another attempt or, past the retry budget, become UNAVAILABLE.
    /// When the catalog update fails the whole batch stays in STAGINGOUT and is
    /// uploaded again.
    fn record_batch(&self, task: StageTask) {
        let now = unix_timestamp();
        let batch = task.contents.clone();
        let outputs = task
            .outputs
            .unwrap_or_default()
            .into_iter()
            .map(|o| (o.content_id, o))
            .collect::<HashMap<_, _>>();

        let mut updates = Vec::with_capacity(task.contents.len());
        let mut staged = Vec::new();
        let mut retries = Vec::new();
        let mut given_up = 0;
        for content in task.contents {
            match outputs.get(&content.content_id) {
                Some(output) => {
                    updates.push(
                        ContentUpdate::new(content.content_id)
                            .status(ContentStatus::Available)
                            .location(&output.pfn, output.size)
                            .success(),
                    );
                    staged.push(Content {
                        status: ContentStatus::Available,
                        pfn: Some(output.pfn.clone()),
                        pfn_size: output.size,
                        ..content
                    });
                }
                None => {
                    let num_failure = content.num_failure + 1;
                    let mut update = ContentUpdate::new(content.content_id).failure(now);
                    if self.exhausted(num_failure) {
                        update = update.status(ContentStatus::Unavailable);
                        given_up += 1;
                        warn!(
                            "stager: giving up on content: content_id={}, failures={}",
                            content.content_id, num_failure
                        );
                    } else {
                        retries.push(Content {
                            num_failure,
                            last_failed_at: Some(now),
                            ..content
                        });
                    }
                    updates.push(update);
                }
            }
        }

        let changed = match self
            .ctx
            .catalog
            .update_contents_by_id(&updates, Some(ContentStatus::StagingOut))
        {
            Ok(changed) => changed,
            Err(e) => {
                error!(
                    "stager: record batch failed, batch kept for retry: count={}, err={}",
                    batch.len(),
                    e
                );
                self.push_retries(batch);
                return;
            }
        };
        info!(
            "stager: batch recorded: staged={}, retry={}, unavailable={}, rows_changed={}{}",
            staged.len(),
            retries.len(),
            given_up,
            changed,
            task.error
                .map(|e| format!(", err={}", e))
                .unwrap_or_default()
        );
        self.push_retries(retries);

        if self.config.send_messaging {
            if let Some(events) = &self.events {
                for content in &staged {
                    events.publish(EssEvent::file_available(content));
                }
            }
        }
    }
}

#[async_trait]
impl DaemonTasks for StagerDaemon {
    type Task = StageTask;

    fn name(&self) -> &str {
        "stager"
    }

    async fn on_start(&self) -> EssResult<()> {
        if !self.config.recover_on_start {
            return Ok(());
        }
        if let Some(edge_id) = self.ctx.local_edge_id()? {
            let recovered = self.ctx.catalog.claim_contents(
                &ContentFilter {
                    edge_id: Some(edge_id),
                    ..Default::default()
                },
                ContentStatus::StagingOut,
                ContentStatus::ToStagedOut,
            )?;
            if !recovered.is_empty() {
                info!(
                    "stager: unfinished uploads returned to TOSTAGEDOUT: count={}",
                    recovered.len()
                );
            }
        }
        Ok(())
    }

    async fn on_stop(&self) {
        let pending = self.take_retries(usize::MAX);
        self.return_to_queue(&pending);
        if let Some(events) = &self.events {
            events.shutdown(EVENT_DRAIN_TIMEOUT).await;
        }
    }

    async fn discover_tasks(&self, capacity: usize) -> EssResult<Vec<StageTask>> {
        let batch_size = self.config.batch_size.max(1);
        if capacity == 0 {
            return Ok(Vec::new());
        }
        let Some(edge_id) = self.ctx.local_edge_id()? else {
            return Ok(Vec::new());
        };

        let mut contents = self.take_retries(batch_size);
        if contents.len() < batch_size {
            let filter = ContentFilter {
                edge_id: Some(edge_id),
                limit: Some(batch_size - contents.len()),
                ..Default::default()
            };
            contents.extend(self.ctx.catalog.claim_contents(
                &filter,
                ContentStatus::ToStagedOut,
                ContentStatus::StagingOut,
            )?);
        }
        if contents.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![StageTask {
            contents,
            outputs: None,
            error: None,
        }])
    }

    async fn process_task(&self, task: &mut StageTask) -> EssResult<()> {
        match self.plugin.upload_batch(&task.contents).await {
            Ok(outputs) => task.outputs = Some(outputs),
            Err(e) => {
                warn!(
                    "stager: upload batch failed: count={}, err={}",
                    task.contents.len(),
                    e
                );
                task.error = Some(e.to_string());
                task.outputs = Some(Vec::new());
            }
        }
        Ok(())
    }

    async fn collect_results(&self, results: Vec<StageTask>) -> EssResult<()> {
        for task in results {
            self.record_batch(task);
        }
        Ok(())
    }

    async fn release_tasks(&self, tasks: Vec<StageTask>) {
        for task in tasks {
            self.return_to_queue(&task.contents);
        }
    }
}
