use crate::{
    Collection, CollectionStatus, CollectionType, Content, ContentStatus, Edge, EssEvent,
    EssResult, Request,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub collection_type: CollectionType,
    pub size: u64,
    pub total_files: u64,
    #[serde(default)]
    pub status: CollectionStatus,
}

/// A whole file materialized (or not yet) by a pre-cacher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub scope: String,
    pub name: String,
    pub min_id: u64,
    pub max_id: u64,
    pub status: ContentStatus,
    pub size: u64,
    #[serde(default)]
    pub pfn: Option<String>,
    #[serde(default)]
    pub checksums: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitOutput {
    pub content_id: i64,
    pub coll_id: i64,
    pub size: u64,
    pub pfn: String,
    /// Set when the range could not be split; `pfn` is empty then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SplitOutput {
    pub fn done(content: &Content, pfn: String, size: u64) -> Self {
        Self {
            content_id: content.content_id,
            coll_id: content.coll_id,
            size,
            pfn,
            error: None,
        }
    }

    pub fn failed(content: &Content, reason: impl Into<String>) -> Self {
        Self {
            content_id: content.content_id,
            coll_id: content.coll_id,
            size: 0,
            pfn: String::new(),
            error: Some(reason.into()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub content_id: i64,
    pub pfn: String,
    pub size: u64,
}

#[async_trait]
pub trait DataFinder: Send + Sync {
    async fn find_dataset(&self, scope: &str, name: &str) -> EssResult<DatasetInfo>;
}

/// Placement policy. `candidates` is never empty.
pub trait RequestBroker: Send + Sync {
    fn choose_edge<'a>(
        &self,
        request: &Request,
        collection: &Collection,
        candidates: &'a [Edge],
    ) -> EssResult<&'a Edge>;
}

#[async_trait]
pub trait ResourceChecker: Send + Sync {
    async fn used_space(&self) -> EssResult<u64>;
}

#[async_trait]
pub trait PreCacher: Send + Sync {
    /// Fails with `NoRequestedData` when the dataset cannot be found.
    async fn pre_cache(&self, scope: &str, name: &str) -> EssResult<Vec<FileDescriptor>>;
}

#[async_trait]
pub trait Splitter: Send + Sync {
    async fn start(&self) -> EssResult<()>;
    async fn stop(&self) -> EssResult<()>;
    fn need_more_requests(&self) -> bool;
    async fn send_requests(&self, contents: &[Content]) -> EssResult<()>;
    fn has_outputs(&self) -> bool;
    /// Finished ranges, failed ones included.
    async fn get_outputs(&self) -> EssResult<Vec<SplitOutput>>;
    /// False once the plugin can no longer answer the ranges it was sent.
    fn is_running(&self) -> bool {
        true
    }
}

#[async_trait]
pub trait Stager: Send + Sync {
    /// Contents missing from the result are treated as failed uploads.
    async fn upload_batch(&self, contents: &[Content]) -> EssResult<Vec<StageOutput>>;
}

#[async_trait]
pub trait MessagingSender: Send + Sync {
    async fn send(&self, event: &EssEvent) -> EssResult<()>;
}
