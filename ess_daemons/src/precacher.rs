// ========== Pre-Cacher ==========

use crate::config::PreCacherConfig;
use crate::context::{ClaimRecovery, DaemonContext};
use crate::engine::DaemonTasks;
use async_trait::async_trait;
use ess_lib::{
    Collection, CollectionReplica, CollectionReplicaStatus, CollectionStatus, Content,
    ContentStatus, ContentType, EssError, EssResult, FileDescriptor, PreCacher, ProcessingMeta,
    Request, RequestFilter, RequestStatus, RequestUpdate,
};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug)]
pub struct PreCacheTask {
    pub request: Request,
    pub edge_id: i64,
    pub claimed: bool,
    pub outcome: Option<Result<ProcessingMeta, String>>,
}

/// Materializes the whole files of ASSIGNED requests at this edge and records them
/// as FILE contents.
pub struct PreCacheDaemon {
    ctx: Arc<DaemonContext>,
    config: PreCacherConfig,
    plugin: Arc<dyn PreCacher>,
    recovery: ClaimRecovery,
}

fn file_content(
    file: &FileDescriptor,
    coll_id: i64,
    edge_id: i64,
    priority: i32,
) -> Content {
    let object_metadata = if file.checksums.is_empty() {
        Value::Null
    } else {
        Value::Object(file.checksums.clone())
    };
    Content {
        coll_id,
        scope: file.scope.clone(),
        name: file.name.clone(),
        min_id: file.min_id,
        max_id: file.max_id,
        content_type: ContentType::File,
        status: file.status,
        priority,
        edge_id,
        pfn_size: file.size,
        pfn: file.pfn.clone(),
        object_metadata,
        ..Default::default()
    }
}

impl PreCacheDaemon {
    pub fn new(ctx: Arc<DaemonContext>, config: PreCacherConfig, plugin: Arc<dyn PreCacher>) -> Self {
        let recovery = ClaimRecovery::new(
            "precacher",
            RequestStatus::Precaching,
            RequestStatus::Assigned,
            config.stale_claim_secs,
        );
        Self {
            ctx,
            config,
            plugin,
            recovery,
        }
    }

    fn request_collection(&self, request: &Request) -> EssResult<Collection> {
        match request.processing_meta.coll_id {
            Some(coll_id) => self.ctx.catalog.get_collection_by_id(coll_id),
            None => self.ctx.catalog.get_collection(&request.scope, &request.name),
        }
    }

    pub async fn pre_cache(&self, request: &Request, edge_id: i64) -> EssResult<ProcessingMeta> {
        let catalog = &self.ctx.catalog;
        let mut coll = self.request_collection(request)?;
        let files = self.plugin.pre_cache(&request.scope, &request.name).await?;
        if files.is_empty() {
            return Err(EssError::NoRequestedData(format!(
                "no files found for {}:{}",
                request.scope, request.name
            )));
        }

        let contents = files
            .iter()
            .map(|file| file_content(file, coll.coll_id, edge_id, request.priority))
            .collect::<Vec<_>>();
        let touched = catalog.upsert_contents(&contents)?;

        let available = files
            .iter()
            .filter(|f| f.status == ContentStatus::Available)
            .count() as u64;
        let complete = available == files.len() as u64;
        let mut replica = CollectionReplica::new(coll.coll_id, edge_id);
        replica.replicated_files = available;
        replica.status = if complete {
            CollectionReplicaStatus::Available
        } else {
            CollectionReplicaStatus::PartlyAvailable
        };
        catalog.upsert_collection_replica(&replica)?;

        coll.global_status = if complete {
            CollectionStatus::Available
        } else {
            CollectionStatus::PartlyAvailable
        };
        coll.total_files = coll.total_files.max(files.len() as u64);
        catalog.update_collection(&coll)?;

        info!(
            "precacher: files cached: request_id={}, coll_id={}, files={}, available={}, rows_touched={}",
            request.request_id,
            coll.coll_id,
            files.len(),
            available,
            touched
        );
        Ok(ProcessingMeta {
            coll_id: Some(coll.coll_id),
            total_files: Some(coll.total_files),
            collection_status: Some(coll.global_status),
            ..request.processing_meta.clone()
        })
    }
}

#[async_trait]
impl DaemonTasks for PreCacheDaemon {
    type Task = PreCacheTask;

    fn name(&self) -> &str {
        "precacher"
    }

    async fn on_start(&self) -> EssResult<()> {
        if let Some(edge_id) = self.ctx.local_edge_id()? {
            self.recovery.sweep(&self.ctx, Some(edge_id), true)?;
        }
        Ok(())
    }

    fn task_key(&self, task: &PreCacheTask) -> Option<String> {
        Some(task.request.request_id.to_string())
    }

    async fn discover_tasks(&self, capacity: usize) -> EssResult<Vec<PreCacheTask>> {
        let limit = self.config.batch_size.min(capacity);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let Some(edge_id) = self.ctx.local_edge_id()? else {
            return Ok(Vec::new());
        };
        if let Err(e) = self.recovery.sweep(&self.ctx, Some(edge_id), false) {
            warn!("precacher: stale claim sweep failed: {}", e);
        }
        let filter = RequestFilter::by_status(RequestStatus::Assigned)
            .at_edge(edge_id)
            .with_limit(limit);
        Ok(self
            .ctx
            .catalog
            .get_requests(&filter)?
            .into_iter()
            .map(|request| PreCacheTask {
                request,
                edge_id,
                claimed: false,
                outcome: None,
            })
            .collect())
    }

    async fn process_task(&self, task: &mut PreCacheTask) -> EssResult<()> {
        let request_id = task.request.request_id;
        if !self.ctx.catalog.transition_request(
            request_id,
            RequestStatus::Assigned,
            &RequestUpdate::status(RequestStatus::Precaching),
        )? {
            debug!("precacher: request already taken: request_id={}", request_id);
            return Ok(());
        }
        task.claimed = true;
        task.outcome = Some(
            self.pre_cache(&task.request, task.edge_id)
                .await
                .map_err(|e| e.to_string()),
        );
        Ok(())
    }

    async fn collect_results(&self, results: Vec<PreCacheTask>) -> EssResult<()> {
        for task in results {
            if !task.claimed {
                continue;
            }
            let request_id = task.request.request_id;
            let update = match &task.outcome {
                Some(Ok(meta)) => {
                    RequestUpdate::status(RequestStatus::Precached)
                        .with_meta(meta.clone())
                        .clear_error()
                }
                Some(Err(e)) => RequestUpdate::status(RequestStatus::Error).with_error(e.clone()),
                None => RequestUpdate::status(RequestStatus::Error)
                    .with_error("pre-cache was interrupted"),
            };
            match self
                .ctx
                .catalog
                .transition_request(request_id, RequestStatus::Precaching, &update)
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        "precacher: request left PRECACHING before its result landed: request_id={}",
                        request_id
                    );
                    continue;
                }
                Err(e) => {
                    error!(
                        "precacher: record result failed, left for recovery: request_id={}, err={}",
                        request_id, e
                    );
                    continue;
                }
            }
            match task.outcome {
                Some(Ok(_)) => info!("precacher: request precached: request_id={}", request_id),
                Some(Err(e)) => warn!(
                    "precacher: request failed: request_id={}, err={}",
                    request_id, e
                ),
                None => warn!("precacher: request interrupted: request_id={}", request_id),
            }
        }
        Ok(())
    }
}
