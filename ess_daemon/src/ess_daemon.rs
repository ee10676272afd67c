use ess_daemons::{
    load_config, resolve_config_path, run_daemons, EssConfig, LoggingConfig, PluginRegistry,
    StopSignal,
};
use ess_lib::EssResult;
use log::{info, warn};
use simplelog::{
    ColorChoice, CombinedLogger, Config, LevelFilter, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::runtime::Runtime;

pub const ESS_LOG_ENV: &str = "ESS_LOG";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EssDaemonRunOptions {
    pub config_path: Option<PathBuf>,
    /// Overrides `[common] daemons` when set.
    pub daemons: Option<Vec<String>>,
}

pub fn parse_daemon_list(value: &str) -> Result<Vec<String>, String> {
    let names = value
        .split(',')
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect::<Vec<_>>();
    if names.is_empty() {
        return Err(format!("empty daemon list: '{}'", value));
    }
    Ok(names)
}

fn log_level(logging: &LoggingConfig) -> LevelFilter {
    let name = match std::env::var(ESS_LOG_ENV) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => logging.level.clone(),
    };
    match LevelFilter::from_str(name.trim()) {
        Ok(level) => level,
        Err(_) => {
            eprintln!("unknown log level '{}', using info", name);
            LevelFilter::Info
        }
    }
}

/// Terminal logging, plus a log file when configured. Falls back to env_logger when
/// simplelog cannot be installed.
pub fn init_logging(logging: &LoggingConfig) {
    let level = log_level(logging);
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = &logging.log_file {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => loggers.push(WriteLogger::new(level, Config::default(), file)),
            Err(e) => eprintln!("open log file {} failed: {}", path.display(), e),
        }
    }
    if CombinedLogger::init(loggers).is_err() {
        let _ = env_logger::Builder::new().filter_level(level).try_init();
    }
}

/// Raises `stop` on ctrl-c or SIGTERM. Returns early once `stop` is raised elsewhere.
async fn watch_signals(stop: StopSignal) {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("ess_daemon: listen for ctrl-c failed: {}", e);
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!("ess_daemon: listen for SIGTERM failed: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("ess_daemon: interrupt received, stopping"),
        _ = terminate => info!("ess_daemon: SIGTERM received, stopping"),
        _ = stop.stopped() => return,
    }
    stop.stop();
}

pub async fn serve(config: EssConfig, names: Vec<String>, stop: StopSignal) -> EssResult<()> {
    let signals = tokio::spawn(watch_signals(stop.clone()));
    let registry = PluginRegistry::with_builtins();
    let result = run_daemons(&config, &registry, &names, stop.clone()).await;
    stop.stop();
    let _ = signals.await;
    result
}

pub fn run_ess_daemon(options: EssDaemonRunOptions) -> EssResult<()> {
    let config_path = resolve_config_path(options.config_path.as_deref());
    let config = load_config(&config_path)?;
    init_logging(&config.logging);
    let names = options
        .daemons
        .unwrap_or_else(|| config.common.daemons.clone());
    info!(
        "ess_daemon: config={}, daemons={}",
        config_path.display(),
        names.join(",")
    );

    let runtime = Runtime::new()?;
    runtime.block_on(serve(config, names, StopSignal::new()))
}
