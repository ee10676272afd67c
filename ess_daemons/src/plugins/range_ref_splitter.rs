use crate::registry::plugin_settings;
use async_trait::async_trait;
use ess_lib::{Content, EssError, EssResult, SplitOutput, Splitter};
use log::{debug, error};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RangeRefSettings {
    pub max_pending: usize,
}

impl Default for RangeRefSettings {
    fn default() -> Self {
        Self { max_pending: 100 }
    }
}

/// Resolves each range in process to a `<pfn>#<min>-<max>` reference into the cached
/// file, without materializing a new object.
pub struct RangeRefSplitter {
    max_pending: usize,
    outputs: Mutex<VecDeque<SplitOutput>>,
}

impl RangeRefSplitter {
    pub fn new(max_pending: usize) -> Self {
        Self {
            max_pending: max_pending.max(1),
            outputs: Mutex::new(VecDeque::new()),
        }
    }

    pub fn from_settings(settings: &toml::Table) -> EssResult<Self> {
        let settings: RangeRefSettings = plugin_settings("range_ref", settings)?;
        Ok(Self::new(settings.max_pending))
    }

    fn pending(&self) -> usize {
        match self.outputs.lock() {
            Ok(outputs) => outputs.len(),
            Err(e) => {
                error!("range_ref: outputs lock poisoned: {}", e);
                self.max_pending
            }
        }
    }
}

#[async_trait]
impl Splitter for RangeRefSplitter {
    async fn start(&self) -> EssResult<()> {
        Ok(())
    }

    async fn stop(&self) -> EssResult<()> {
        Ok(())
    }

    fn need_more_requests(&self) -> bool {
        self.pending() < self.max_pending
    }

    async fn send_requests(&self, contents: &[Content]) -> EssResult<()> {
        let mut refs = Vec::with_capacity(contents.len());
        for content in contents {
            let pfn = content.pfn.as_deref().ok_or_else(|| {
                EssError::PluginExecution(format!(
                    "content #{} has no source pfn",
                    content.content_id
                ))
            })?;
            refs.push(SplitOutput::done(
                content,
                format!("{}#{}-{}", pfn, content.min_id, content.max_id),
                content.pfn_size,
            ));
        }
        let mut outputs = self
            .outputs
            .lock()
            .map_err(|e| EssError::Internal(format!("range_ref outputs lock poisoned: {}", e)))?;
        debug!("range_ref: {} ranges resolved", refs.len());
        outputs.extend(refs);
        Ok(())
    }

    fn has_outputs(&self) -> bool {
        self.pending() > 0
    }

    async fn get_outputs(&self) -> EssResult<Vec<SplitOutput>> {
        let mut outputs = self
            .outputs
            .lock()
            .map_err(|e| EssError::Internal(format!("range_ref outputs lock poisoned: {}", e)))?;
        Ok(outputs.drain(..).collect())
    }
}
