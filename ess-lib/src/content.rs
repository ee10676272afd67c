use crate::unix_timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

catalog_enum! {
    ContentType default File {
        File => "FILE",
        Partial => "PARTIAL",
    }
}

catalog_enum! {
    ContentStatus default New {
        New => "NEW",
        Available => "AVAILABLE",
        Unavailable => "UNAVAILABLE",
        Bad => "BAD",
        Precached => "PRECACHED",
        ToSplit => "TOSPLIT",
        Splitting => "SPLITTING",
        Splitted => "SPLITTED",
        ToStagedOut => "TOSTAGEDOUT",
        StagingOut => "STAGINGOUT",
        Removable => "REMOVABLE",
        Removing => "REMOVING",
        Removed => "REMOVED",
    }
}

impl ContentStatus {
    pub fn can_transition_to(&self, next: ContentStatus) -> bool {
        use ContentStatus::*;
        matches!(
            (*self, next),
            (New, Available)
                | (New, Unavailable)
                | (New, Precached)
                | (Precached, Available)
                | (Unavailable, New)
                | (Unavailable, Available)
                | (Bad, New)
                | (Bad, Available)
                | (ToSplit, Splitting)
                | (Splitting, Available)
                | (Splitting, Splitted)
                | (Splitting, ToStagedOut)
                | (Splitting, ToSplit)
                | (Splitting, Unavailable)
                | (Available, ToStagedOut)
                | (Splitted, ToStagedOut)
                | (ToStagedOut, StagingOut)
                | (StagingOut, Available)
                | (StagingOut, Unavailable)
                | (StagingOut, ToStagedOut)
                | (Available, Removable)
                | (Removable, Removing)
                | (Removing, Removed)
        )
    }
}

/// A whole file or an event range of a file, placed at one edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Content {
    pub content_id: i64,
    pub coll_id: i64,
    pub scope: String,
    pub name: String,
    pub min_id: u64,
    pub max_id: u64,
    pub content_type: ContentType,
    pub status: ContentStatus,
    pub priority: i32,
    pub edge_id: i64,
    pub num_success: u32,
    pub num_failure: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failed_at: Option<u64>,
    pub pfn_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pfn: Option<String>,
    pub object_metadata: Value,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Default for Content {
    fn default() -> Self {
        let now = unix_timestamp();
        Self {
            content_id: 0,
            coll_id: 0,
            scope: String::new(),
            name: String::new(),
            min_id: 0,
            max_id: 0,
            content_type: ContentType::File,
            status: ContentStatus::New,
            priority: 0,
            edge_id: 0,
            num_success: 0,
            num_failure: 0,
            last_failed_at: None,
            pfn_size: 0,
            pfn: None,
            object_metadata: Value::Null,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Content {
    /// Number of events covered by `[min_id, max_id]`.
    pub fn range_len(&self) -> u64 {
        self.max_id.saturating_sub(self.min_id) + 1
    }

    pub fn covers(&self, min_id: u64, max_id: u64) -> bool {
        self.min_id <= min_id && max_id <= self.max_id
    }

    /// Share of `pfn_size` taken by `events` of this row's range.
    pub fn estimated_size(&self, events: u64) -> u64 {
        ((self.pfn_size as u128 * events as u128) / self.range_len() as u128) as u64
    }

    /// Chunks `[min_id, max_id]` into PARTIAL rows of `level` events, status TOSPLIT.
    pub fn split_into_partials(&self, level: u64) -> Vec<Content> {
        split_ranges(self.min_id, self.max_id, level)
            .into_iter()
            .map(|(min_id, max_id)| Content {
                content_id: 0,
                min_id,
                max_id,
                content_type: ContentType::Partial,
                status: ContentStatus::ToSplit,
                num_success: 0,
                num_failure: 0,
                last_failed_at: None,
                pfn_size: self.estimated_size(max_id - min_id + 1),
                object_metadata: Value::Null,
                ..self.clone()
            })
            .collect()
    }
}

/// `[min, max]` cut into consecutive chunks of `level`; the last one is truncated at `max`.
pub fn split_ranges(min_id: u64, max_id: u64, level: u64) -> Vec<(u64, u64)> {
    if level == 0 || max_id < min_id {
        return Vec::new();
    }
    let mut ranges = Vec::new();
    let mut start = min_id;
    loop {
        let end = start.saturating_add(level - 1).min(max_id);
        ranges.push((start, end));
        if end >= max_id {
            break;
        }
        start = end + 1;
    }
    ranges
}

/// Selection over content rows. Empty `statuses` matches every status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentFilter {
    pub coll_id: Option<i64>,
    pub edge_id: Option<i64>,
    pub scope: Option<String>,
    pub name: Option<String>,
    pub content_type: Option<ContentType>,
    pub statuses: Vec<ContentStatus>,
    pub limit: Option<usize>,
}

impl ContentFilter {
    pub fn for_collection(coll_id: i64, edge_id: i64) -> Self {
        Self {
            coll_id: Some(coll_id),
            edge_id: Some(edge_id),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, content_type: ContentType) -> Self {
        self.content_type = Some(content_type);
        self
    }

    pub fn with_status(mut self, status: ContentStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Partial update of one content row; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentUpdate {
    pub content_id: i64,
    pub status: Option<ContentStatus>,
    pub pfn: Option<String>,
    pub pfn_size: Option<u64>,
    pub priority: Option<i32>,
    pub object_metadata: Option<Value>,
    pub add_success: u32,
    pub add_failure: u32,
    pub last_failed_at: Option<u64>,
}

impl ContentUpdate {
    pub fn new(content_id: i64) -> Self {
        Self {
            content_id,
            ..Default::default()
        }
    }

    pub fn status(mut self, status: ContentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn location(mut self, pfn: &str, pfn_size: u64) -> Self {
        self.pfn = Some(pfn.to_string());
        self.pfn_size = Some(pfn_size);
        self
    }

    pub fn success(mut self) -> Self {
        self.add_success += 1;
        self
    }

    pub fn failure(mut self, at: u64) -> Self {
        self.add_failure += 1;
        self.last_failed_at = Some(at);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentStatistic {
    pub edge_id: i64,
    pub coll_id: i64,
    pub content_type: ContentType,
    pub status: ContentStatus,
    pub count: u64,
}
