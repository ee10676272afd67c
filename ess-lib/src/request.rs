use crate::{unix_timestamp, CollectionStatus, CollectionType, ContentType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

catalog_enum! {
    DataType default Dataset {
        Dataset => "DATASET",
        Container => "CONTAINER",
        File => "FILE",
    }
}

catalog_enum! {
    GranularityType default Partial {
        File => "FILE",
        Partial => "PARTIAL",
    }
}

impl GranularityType {
    /// Content rows whose availability decides completion.
    pub fn content_type(&self) -> ContentType {
        match self {
            GranularityType::File => ContentType::File,
            GranularityType::Partial => ContentType::Partial,
        }
    }
}

catalog_enum! {
    RequestStatus default New {
        New => "NEW",
        Replicating => "REPLICATING",
        Available => "AVAILABLE",
        Error => "ERROR",
        Brokering => "BROKERING",
        Waiting => "WAITING",
        Assigning => "ASSIGNING",
        AssigningFailed => "ASSIGNINGFAILED",
        Assigned => "ASSIGNED",
        Precaching => "PRECACHING",
        Precached => "PRECACHED",
        ToSplitting => "TOSPLITTING",
        Splitting => "SPLITTING",
        Splitted => "SPLITTED",
    }
}

impl RequestStatus {
    /// Edges of the request workflow. WAITING re-enters brokering on a later cycle.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (*self, next),
            (New, Brokering)
                | (Waiting, Brokering)
                | (Brokering, Assigning)
                | (Brokering, Waiting)
                | (Brokering, Error)
                | (Assigning, Assigned)
                | (Assigned, Precaching)
                | (Precaching, Precached)
                | (Precaching, Error)
                | (Precached, ToSplitting)
                | (ToSplitting, Splitting)
                | (Precached, Available)
                | (Splitting, Available)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Available | RequestStatus::Error)
    }
}

/// Workflow bookkeeping kept on a request. Unknown keys pass through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMeta {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub coll_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub collection_type: Option<CollectionType>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub total_files: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub collection_status: Option<CollectionStatus>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub original_request_id: Option<i64>,
    #[serde(skip_serializing_if = "is_zero", default)]
    pub retries: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestErrors {
    pub message: String,
    #[serde(default)]
    pub at: u64,
}

impl RequestErrors {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            at: unix_timestamp(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Request {
    pub request_id: i64,
    pub scope: String,
    pub name: String,
    pub data_type: DataType,
    pub granularity_type: GranularityType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granularity_level: Option<u64>,
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<i64>,
    pub status: RequestStatus,
    pub request_meta: Value,
    pub processing_meta: ProcessingMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<RequestErrors>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Default for Request {
    fn default() -> Self {
        let now = unix_timestamp();
        Self {
            request_id: 0,
            scope: String::new(),
            name: String::new(),
            data_type: DataType::Dataset,
            granularity_type: GranularityType::Partial,
            granularity_level: None,
            priority: 0,
            edge_id: None,
            status: RequestStatus::New,
            request_meta: Value::Null,
            processing_meta: ProcessingMeta::default(),
            errors: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Request {
    pub fn new(scope: &str, name: &str, granularity_type: GranularityType) -> Self {
        Self {
            scope: scope.to_string(),
            name: name.to_string(),
            granularity_type,
            ..Default::default()
        }
    }

    pub fn new_partial(scope: &str, name: &str, granularity_level: u64) -> Self {
        let mut req = Self::new(scope, name, GranularityType::Partial);
        req.granularity_level = Some(granularity_level);
        req
    }

    pub fn is_partial(&self) -> bool {
        self.granularity_type == GranularityType::Partial
    }
}

/// Selection over requests. Empty `statuses` matches every status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestFilter {
    pub edge_id: Option<i64>,
    pub statuses: Vec<RequestStatus>,
    pub granularity_type: Option<GranularityType>,
    pub scope: Option<String>,
    pub name: Option<String>,
    pub limit: Option<usize>,
}

impl RequestFilter {
    pub fn by_status(status: RequestStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Default::default()
        }
    }

    pub fn at_edge(mut self, edge_id: i64) -> Self {
        self.edge_id = Some(edge_id);
        self
    }

    pub fn with_granularity(mut self, granularity_type: GranularityType) -> Self {
        self.granularity_type = Some(granularity_type);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Partial update of a request; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestUpdate {
    pub status: Option<RequestStatus>,
    pub edge_id: Option<i64>,
    pub priority: Option<i32>,
    pub processing_meta: Option<ProcessingMeta>,
    pub errors: Option<RequestErrors>,
    /// Drops a previously recorded error. Ignored when `errors` is set.
    pub clear_errors: bool,
}

impl RequestUpdate {
    pub fn status(status: RequestStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_edge(mut self, edge_id: i64) -> Self {
        self.edge_id = Some(edge_id);
        self
    }

    pub fn with_meta(mut self, meta: ProcessingMeta) -> Self {
        self.processing_meta = Some(meta);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.errors = Some(RequestErrors::new(message));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.clear_errors = true;
        self
    }
}
