// ========== Daemon Runner ==========

use crate::assigner::Assigner;
use crate::broker::Broker;
use crate::config::{EssConfig, PluginSlots, ALL_DAEMONS};
use crate::context::DaemonContext;
use crate::engine::{DaemonEngine, DaemonTasks, EngineOptions, StopSignal};
use crate::finisher::Finisher;
use crate::messaging::{EventQueue, DEFAULT_EVENT_QUEUE_SIZE};
use crate::precacher::PreCacheDaemon;
use crate::registry::PluginRegistry;
use crate::resource_manager::ResourceManager;
use crate::splitter::SplitterDaemon;
use crate::stager::StagerDaemon;
use ess_catalog::{CatalogDB, HeadClient};
use ess_lib::{EssError, EssResult};
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

type Launcher = Box<dyn FnOnce(StopSignal) -> JoinHandle<EssResult<()>> + Send>;

fn launcher<D: DaemonTasks>(daemon: D, options: EngineOptions) -> Launcher {
    let daemon = Arc::new(daemon);
    Box::new(move |stop: StopSignal| {
        tokio::spawn(async move {
            let name = daemon.name().to_string();
            let result = DaemonEngine::new(daemon, options, stop.clone()).run().await;
            match &result {
                Ok(()) => info!("{}: stopped", name),
                Err(e) => {
                    error!("{}: failed, stopping all daemons: {}", name, e);
                    stop.stop();
                }
            }
            result
        })
    })
}

fn event_queue(
    registry: &PluginRegistry,
    slots: &PluginSlots,
    send_messaging: bool,
) -> EssResult<Option<Arc<EventQueue>>> {
    if !send_messaging {
        return Ok(None);
    }
    Ok(registry
        .messaging_sender(slots)?
        .map(|sender| Arc::new(EventQueue::start(sender, DEFAULT_EVENT_QUEUE_SIZE))))
}

/// Builds one daemon with its plugins. A missing or broken required plugin fails here.
fn build_daemon(
    name: &str,
    config: &EssConfig,
    registry: &PluginRegistry,
    ctx: Arc<DaemonContext>,
) -> EssResult<Launcher> {
    let launcher = match name {
        "resourcemanager" => {
            let cfg = &config.resourcemanager;
            let checker = registry.resource_checker(&cfg.plugins)?;
            launcher(
                ResourceManager::new(ctx, cfg.clone(), checker)?,
                cfg.engine.to_options(),
            )
        }
        "broker" => {
            let cfg = &config.broker;
            let finder = registry.data_finder(&cfg.plugins)?;
            let policy = registry.request_broker(&cfg.plugins)?;
            launcher(
                Broker::new(ctx, cfg.clone(), finder, policy),
                cfg.engine.to_options(),
            )
        }
        "assigner" => {
            let cfg = &config.assigner;
            launcher(Assigner::new(ctx, cfg.clone()), cfg.engine.to_options())
        }
        "precacher" => {
            let cfg = &config.precacher;
            let plugin = registry.pre_cacher(&cfg.plugins)?;
            launcher(
                PreCacheDaemon::new(ctx, cfg.clone(), plugin),
                cfg.engine.to_options(),
            )
        }
        "splitter" => {
            let cfg = &config.splitter;
            let plugin = registry.splitter(&cfg.plugins)?;
            launcher(
                SplitterDaemon::new(ctx, cfg.clone(), plugin)?,
                cfg.engine.to_options(),
            )
        }
        "stager" => {
            let cfg = &config.stager;
            let plugin = registry.stager(&cfg.plugins)?;
            let events = event_queue(registry, &cfg.plugins, cfg.send_messaging)?;
            launcher(
                StagerDaemon::new(ctx, cfg.clone(), plugin, events),
                cfg.engine.to_options(),
            )
        }
        "finisher" => {
            let cfg = &config.finisher;
            let events = event_queue(registry, &cfg.plugins, cfg.send_messaging)?;
            launcher(
                Finisher::new(ctx, cfg.clone(), events),
                cfg.engine.to_options(),
            )
        }
        other => {
            return Err(EssError::InvalidParam(format!(
                "unknown daemon '{}', expected one of {}",
                other,
                ALL_DAEMONS.join(", ")
            )))
        }
    };
    Ok(launcher)
}

/// Runs the named daemons over one shared catalog until `stop` is raised or one of
/// them fails. Every daemon is built before any starts.
pub async fn run_daemons(
    config: &EssConfig,
    registry: &PluginRegistry,
    names: &[String],
    stop: StopSignal,
) -> EssResult<()> {
    if names.is_empty() {
        return Err(EssError::InvalidParam("no daemon selected".to_string()));
    }

    let db_path = config.common.db_path.to_string_lossy().to_string();
    let catalog = Arc::new(CatalogDB::new(db_path.clone())?);
    let head = match &config.common.head_service {
        Some(url) => Some(Arc::new(HeadClient::new_remote(
            url,
            Duration::from_secs(config.common.head_timeout_secs),
            config.common.head_retries,
        )?)),
        None => None,
    };
    info!(
        "ess: starting: resource_name={}, db_path={}, head={}, daemons={}",
        config.common.resource_name,
        db_path,
        config.common.head_service.as_deref().unwrap_or("-"),
        names.join(",")
    );
    let ctx = Arc::new(DaemonContext::new(
        catalog,
        head,
        &config.common.resource_name,
    ));

    let mut launchers = Vec::with_capacity(names.len());
    for name in names {
        let launcher = build_daemon(name, config, registry, ctx.clone()).map_err(|e| {
            error!("{}: cannot start: {}", name, e);
            e
        })?;
        launchers.push((name.clone(), launcher));
    }

    let handles = launchers
        .into_iter()
        .map(|(name, launch)| (name, launch(stop.clone())))
        .collect::<Vec<_>>();

    let mut first_error = None;
    for (name, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                stop.stop();
                Err(EssError::Internal(format!("{} task aborted: {}", name, e)))
            }
        };
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => {
            info!("ess: all daemons stopped");
            Ok(())
        }
    }
}
