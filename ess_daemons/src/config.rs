use crate::engine::EngineOptions;
use ess_lib::{parse_space, EdgeType, EssError, EssResult};
use log::{info, warn};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ESS_CONFIG_ENV: &str = "ESS_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "ess.toml";
pub const DEFAULT_STALE_CLAIM_SECS: u64 = 3600;

pub const ALL_DAEMONS: [&str; 7] = [
    "resourcemanager",
    "broker",
    "assigner",
    "precacher",
    "splitter",
    "stager",
    "finisher",
];

/// One named plugin slot: `kind` picks the registered constructor, every other key is
/// handed to it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PluginConfig {
    pub kind: String,
    #[serde(flatten)]
    pub settings: toml::Table,
}

pub type PluginSlots = BTreeMap<String, PluginConfig>;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(alias = "workers")]
    pub num_threads: usize,
    pub task_queue_size: usize,
    pub result_queue_size: usize,
    #[serde(alias = "period")]
    pub poll_interval_secs: Option<u64>,
    pub busy_interval_ms: u64,
    pub idle_interval_ms: u64,
    pub drain_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_threads: 1,
            task_queue_size: 100,
            result_queue_size: 100,
            poll_interval_secs: None,
            busy_interval_ms: 2000,
            idle_interval_ms: 4000,
            drain_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    pub fn to_options(&self) -> EngineOptions {
        EngineOptions {
            num_workers: self.num_threads.max(1),
            task_queue_size: self.task_queue_size.max(1),
            result_queue_size: self.result_queue_size.max(1),
            poll_interval: self.poll_interval_secs.map(Duration::from_secs),
            busy_interval: Duration::from_millis(self.busy_interval_ms),
            idle_interval: Duration::from_millis(self.idle_interval_ms),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    #[serde(alias = "edge_name")]
    pub resource_name: String,
    pub db_path: PathBuf,
    /// Base URL of the head catalog service; unset means this node is standalone.
    pub head_service: Option<String>,
    pub head_timeout_secs: u64,
    pub head_retries: u32,
    pub daemons: Vec<String>,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            resource_name: "localhost".to_string(),
            db_path: PathBuf::from("ess.db"),
            head_service: None,
            head_timeout_secs: 30,
            head_retries: 2,
            daemons: ALL_DAEMONS.iter().map(|d| d.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResourceManagerConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
    pub plugins: PluginSlots,
    pub edge_type: EdgeType,
    pub is_independent: bool,
    pub continent: Option<String>,
    pub country_name: Option<String>,
    pub region_code: Option<String>,
    pub city: Option<String>,
    pub longitude: Option<String>,
    pub latitude: Option<String>,
    pub total_space: String,
    pub reserved_space: String,
    pub resource_check_period: u64,
    pub clean_edges_period: u64,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            plugins: PluginSlots::new(),
            edge_type: EdgeType::Edge,
            is_independent: true,
            continent: None,
            country_name: None,
            region_code: None,
            city: None,
            longitude: None,
            latitude: None,
            total_space: "0".to_string(),
            reserved_space: "0".to_string(),
            resource_check_period: 600,
            clean_edges_period: 1200,
        }
    }
}

impl ResourceManagerConfig {
    pub fn total_space_bytes(&self) -> EssResult<u64> {
        parse_space(&self.total_space)
    }

    pub fn reserved_space_bytes(&self) -> EssResult<u64> {
        parse_space(&self.reserved_space)
    }

    /// The stale-edge sweep never runs more often than every second check.
    pub fn effective_clean_edges_period(&self) -> u64 {
        let floor = self.resource_check_period.saturating_mul(2);
        if self.clean_edges_period < floor {
            warn!(
                "resourcemanager: clean_edges_period {} is below twice resource_check_period, using {}",
                self.clean_edges_period, floor
            );
            return floor;
        }
        self.clean_edges_period
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
    pub plugins: PluginSlots,
    pub batch_size: usize,
    /// BROKERING claims untouched this long are handed back as WAITING.
    pub stale_claim_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            plugins: PluginSlots::new(),
            batch_size: 20,
            stale_claim_secs: DEFAULT_STALE_CLAIM_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AssignerConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
    pub plugins: PluginSlots,
    pub batch_size: usize,
    /// How often ASSIGNING requests are pulled from the head.
    pub remote_poll_secs: u64,
}

impl Default for AssignerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            plugins: PluginSlots::new(),
            batch_size: 20,
            remote_poll_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PreCacherConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
    pub plugins: PluginSlots,
    pub batch_size: usize,
    /// PRECACHING claims untouched this long go back to ASSIGNED.
    pub stale_claim_secs: u64,
}

impl Default for PreCacherConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            plugins: PluginSlots::new(),
            batch_size: 10,
            stale_claim_secs: DEFAULT_STALE_CLAIM_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SplitterConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
    pub plugins: PluginSlots,
    pub batch_size: usize,
    /// Status a finished range lands in: AVAILABLE, SPLITTED or TOSTAGEDOUT.
    pub completed_status: String,
    /// A range whose split failed this many times becomes UNAVAILABLE.
    pub max_split_failures: u32,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            plugins: PluginSlots::new(),
            batch_size: 20,
            completed_status: "AVAILABLE".to_string(),
            max_split_failures: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StagerConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
    pub plugins: PluginSlots,
    pub batch_size: usize,
    pub send_messaging: bool,
    /// Unset keeps retrying failed uploads forever.
    pub max_stageout_retries: Option<u32>,
    pub recover_on_start: bool,
}

impl Default for StagerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            plugins: PluginSlots::new(),
            batch_size: 20,
            send_messaging: false,
            max_stageout_retries: None,
            recover_on_start: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FinisherConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
    pub plugins: PluginSlots,
    pub batch_size: usize,
    pub sync_to_head: bool,
    pub send_messaging: bool,
}

impl Default for FinisherConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            plugins: PluginSlots::new(),
            batch_size: 50,
            sync_to_head: false,
            send_messaging: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EssConfig {
    pub common: CommonConfig,
    pub logging: LoggingConfig,
    pub resourcemanager: ResourceManagerConfig,
    pub broker: BrokerConfig,
    pub assigner: AssignerConfig,
    pub precacher: PreCacherConfig,
    pub splitter: SplitterConfig,
    pub stager: StagerConfig,
    pub finisher: FinisherConfig,
}

impl EssConfig {
    pub fn from_toml_str(text: &str) -> EssResult<Self> {
        toml::from_str(text).map_err(|e| EssError::DecodeError(format!("parse config: {}", e)))
    }
}

/// `--config` wins, then `ESS_CONFIG`, then `ess.toml` in the working directory.
pub fn resolve_config_path(arg: Option<&Path>) -> PathBuf {
    if let Some(path) = arg {
        return path.to_path_buf();
    }
    match std::env::var(ESS_CONFIG_ENV) {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_CONFIG_PATH),
    }
}

pub fn load_config(path: &Path) -> EssResult<EssConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        warn!("load config failed: path={}, err={}", path.display(), e);
        EssError::IoError(format!("read config {}: {}", path.display(), e))
    })?;
    let config = EssConfig::from_toml_str(&text)?;
    info!(
        "config loaded: path={}, resource_name={}, head_service={:?}, daemons={:?}",
        path.display(),
        config.common.resource_name,
        config.common.head_service,
        config.common.daemons
    );
    Ok(config)
}
