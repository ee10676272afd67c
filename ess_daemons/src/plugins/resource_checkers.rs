use crate::registry::plugin_settings;
use async_trait::async_trait;
use ess_lib::{parse_space, EssError, EssResult, ResourceChecker};
use log::debug;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct DirUsageSettings {
    #[serde(alias = "path")]
    pub cache_dir: PathBuf,
}

/// Reports the recursive size of the cache directory as used space.
pub struct DirUsageChecker {
    cache_dir: PathBuf,
}

impl DirUsageChecker {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    pub fn from_settings(settings: &toml::Table) -> EssResult<Self> {
        let settings: DirUsageSettings = plugin_settings("dir_usage", settings)?;
        Ok(Self::new(settings.cache_dir))
    }
}

#[async_trait]
impl ResourceChecker for DirUsageChecker {
    async fn used_space(&self) -> EssResult<u64> {
        let dir = self.cache_dir.clone();
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            debug!("dir_usage: {} does not exist yet", dir.display());
            return Ok(0);
        }
        let size = tokio::task::spawn_blocking(move || fs_extra::dir::get_size(&dir))
            .await
            .map_err(|e| EssError::Internal(format!("dir_usage task failed: {}", e)))?
            .map_err(|e| {
                EssError::PluginExecution(format!(
                    "measure {}: {}",
                    self.cache_dir.display(),
                    e
                ))
            })?;
        Ok(size)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticUsageSettings {
    pub used_space: String,
}

/// A fixed used-space figure, for nodes whose storage is accounted elsewhere.
pub struct StaticUsageChecker {
    used_space: u64,
}

impl StaticUsageChecker {
    pub fn new(used_space: u64) -> Self {
        Self { used_space }
    }

    pub fn from_settings(settings: &toml::Table) -> EssResult<Self> {
        let settings: StaticUsageSettings = plugin_settings("static", settings)?;
        Ok(Self::new(parse_space(&settings.used_space)?))
    }
}

#[async_trait]
impl ResourceChecker for StaticUsageChecker {
    async fn used_space(&self) -> EssResult<u64> {
        Ok(self.used_space)
    }
}
