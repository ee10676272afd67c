// ========== Broker ==========

use crate::config::BrokerConfig;
use crate::context::{ClaimRecovery, DaemonContext};
use crate::engine::DaemonTasks;
use crate::plugins::MaxFreeSpaceBroker;
use async_trait::async_trait;
use ess_lib::{
    Collection, DataFinder, Edge, EdgeStatus, EssError, EssResult, ProcessingMeta, Request,
    RequestBroker, RequestFilter, RequestStatus, RequestUpdate,
};
use log::{debug, error, info, warn};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerOutcome {
    Assigned { edge_id: i64, meta: ProcessingMeta },
    Waiting(String),
    Failed(String),
}

#[derive(Debug)]
pub struct BrokerTask {
    pub request: Request,
    /// Set once this task moved the request into BROKERING.
    pub claimed: bool,
    pub outcome: Option<BrokerOutcome>,
}

/// Edges that can take a collection of `coll_size` bytes: ACTIVE and with strictly
/// more free space than the collection needs. Order is kept.
pub fn select_candidates(edges: &[Edge], coll_size: u64) -> Vec<Edge> {
    edges
        .iter()
        .filter(|edge| edge.status == EdgeStatus::Active && edge.free_space() > coll_size)
        .cloned()
        .collect()
}

/// Places NEW (and previously WAITING) requests on an edge with room for them.
pub struct Broker {
    ctx: Arc<DaemonContext>,
    config: BrokerConfig,
    data_finder: Arc<dyn DataFinder>,
    policy: Arc<dyn RequestBroker>,
    recovery: ClaimRecovery,
}

impl Broker {
    pub fn new(
        ctx: Arc<DaemonContext>,
        config: BrokerConfig,
        data_finder: Arc<dyn DataFinder>,
        policy: Option<Arc<dyn RequestBroker>>,
    ) -> Self {
        let policy = policy.unwrap_or_else(|| {
            info!("broker: no requestbroker plugin, placing by max free space");
            Arc::new(MaxFreeSpaceBroker::default())
        });
        let recovery = ClaimRecovery::new(
            "broker",
            RequestStatus::Brokering,
            RequestStatus::Waiting,
            config.stale_claim_secs,
        );
        Self {
            ctx,
            config,
            data_finder,
            policy,
            recovery,
        }
    }

    /// The cataloged collection, or a new one described by the data finder.
    pub async fn resolve_collection(&self, scope: &str, name: &str) -> EssResult<Collection> {
        let catalog = &self.ctx.catalog;
        match catalog.get_collection(scope, name) {
            Ok(coll) => return Ok(coll),
            Err(e) if !e.is_not_found() => return Err(e),
            Err(_) => {}
        }

        let info = self.data_finder.find_dataset(scope, name).await?;
        let coll = Collection {
            collection_type: info.collection_type,
            coll_size: info.size,
            total_files: info.total_files,
            global_status: info.status,
            ..Collection::new(scope, name)
        };
        match catalog.add_collection(&coll) {
            Ok(coll_id) => {
                info!(
                    "broker: collection cataloged: coll_id={}, scope={}, name={}, size={}, files={}",
                    coll_id, scope, name, coll.coll_size, coll.total_files
                );
                Ok(Collection { coll_id, ..coll })
            }
            Err(e) if e.is_duplicate() => catalog.get_collection(scope, name),
            Err(e) => Err(e),
        }
    }

    async fn broker_request(&self, request: &Request) -> EssResult<(i64, ProcessingMeta)> {
        if request.is_partial() && request.granularity_level.unwrap_or(0) == 0 {
            return Err(EssError::InvalidParam(format!(
                "request #{} is PARTIAL without a positive granularity_level",
                request.request_id
            )));
        }

        let coll = self.resolve_collection(&request.scope, &request.name).await?;
        let edges = self.ctx.catalog.list_edges(Some(EdgeStatus::Active))?;
        let candidates = select_candidates(&edges, coll.coll_size);
        if candidates.is_empty() {
            return Err(EssError::NoSuitableCandidate(format!(
                "no active edge has more than {} bytes free ({} active)",
                coll.coll_size,
                edges.len()
            )));
        }

        let edge = self.policy.choose_edge(request, &coll, &candidates)?;
        let meta = ProcessingMeta {
            coll_id: Some(coll.coll_id),
            collection_type: Some(coll.collection_type),
            size: Some(coll.coll_size),
            total_files: Some(coll.total_files),
            collection_status: Some(coll.global_status),
            ..request.processing_meta.clone()
        };
        debug!(
            "broker: edge chosen: request_id={}, edge={}, free={}, candidates={}",
            request.request_id,
            edge.edge_name,
            edge.free_space(),
            candidates.len()
        );
        Ok((edge.edge_id, meta))
    }
}

#[async_trait]
impl DaemonTasks for Broker {
    type Task = BrokerTask;

    fn name(&self) -> &str {
        "broker"
    }

    async fn on_start(&self) -> EssResult<()> {
        self.recovery.sweep(&self.ctx, None, true)?;
        Ok(())
    }

    fn task_key(&self, task: &BrokerTask) -> Option<String> {
        Some(task.request.request_id.to_string())
    }

    async fn discover_tasks(&self, capacity: usize) -> EssResult<Vec<BrokerTask>> {
        let limit = self.config.batch_size.min(capacity);
        if limit == 0 {
            return Ok(Vec::new());
        }
        if let Err(e) = self.recovery.sweep(&self.ctx, None, false) {
            warn!("broker: stale claim sweep failed: {}", e);
        }
        let mut filter = RequestFilter::by_status(RequestStatus::New).with_limit(limit);
        filter.statuses.push(RequestStatus::Waiting);
        let requests = self.ctx.catalog.get_requests(&filter)?;
        Ok(requests
            .into_iter()
            .map(|request| BrokerTask {
                request,
                claimed: false,
                outcome: None,
            })
            .collect())
    }

    async fn process_task(&self, task: &mut BrokerTask) -> EssResult<()> {
        let request_id = task.request.request_id;
        let from = task.request.status;
        if !self.ctx.catalog.transition_request(
            request_id,
            from,
            &RequestUpdate::status(RequestStatus::Brokering),
        )? {
            debug!("broker: request already taken: request_id={}", request_id);
            return Ok(());
        }
        task.claimed = true;

        task.outcome = Some(match self.broker_request(&task.request).await {
            Ok((edge_id, meta)) => BrokerOutcome::Assigned { edge_id, meta },
            Err(EssError::NoSuitableCandidate(msg)) => BrokerOutcome::Waiting(msg),
            Err(e @ EssError::InvalidParam(_)) => BrokerOutcome::Failed(e.to_string()),
            Err(e) if e.is_plugin_error() => BrokerOutcome::Failed(e.to_string()),
            Err(e) => BrokerOutcome::Waiting(e.to_string()),
        });
        Ok(())
    }

    async fn collect_results(&self, results: Vec<BrokerTask>) -> EssResult<()> {
        for task in results {
            if !task.claimed {
                continue;
            }
            let request_id = task.request.request_id;
            let outcome = task
                .outcome
                .unwrap_or_else(|| BrokerOutcome::Waiting("brokering was interrupted".to_string()));
            let update = match &outcome {
                BrokerOutcome::Assigned { edge_id, meta } => {
                    RequestUpdate::status(RequestStatus::Assigning)
                        .with_edge(*edge_id)
                        .with_meta(meta.clone())
                        .clear_error()
                }
                BrokerOutcome::Waiting(msg) => {
                    RequestUpdate::status(RequestStatus::Waiting).with_error(msg.clone())
                }
                BrokerOutcome::Failed(msg) => {
                    RequestUpdate::status(RequestStatus::Error).with_error(msg.clone())
                }
            };
            match self
                .ctx
                .catalog
                .transition_request(request_id, RequestStatus::Brokering, &update)
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        "broker: request left BROKERING before its result landed: request_id={}",
                        request_id
                    );
                    continue;
                }
                Err(e) => {
                    error!(
                        "broker: record result failed, left for recovery: request_id={}, err={}",
                        request_id, e
                    );
                    continue;
                }
            }
            match outcome {
                BrokerOutcome::Assigned { edge_id, .. } => info!(
                    "broker: request assigned: request_id={}, edge_id={}",
                    request_id, edge_id
                ),
                BrokerOutcome::Waiting(msg) => info!(
                    "broker: request waiting: request_id={}, reason={}",
                    request_id, msg
                ),
                BrokerOutcome::Failed(msg) => warn!(
                    "broker: request failed: request_id={}, err={}",
                    request_id, msg
                ),
            }
        }
        Ok(())
    }
}
