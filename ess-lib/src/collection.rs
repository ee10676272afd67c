use crate::unix_timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

catalog_enum! {
    CollectionType default Dataset {
        Dataset => "DATASET",
        Container => "CONTAINER",
        File => "FILE",
    }
}

catalog_enum! {
    CollectionStatus default New {
        New => "NEW",
        Replicating => "REPLICATING",
        Available => "AVAILABLE",
        PartlyAvailable => "PARTLYAVAILABLE",
        Unavailable => "UNAVAILABLE",
        Bad => "BAD",
        Removable => "REMOVABLE",
        Removing => "REMOVING",
        Removed => "REMOVED",
    }
}

catalog_enum! {
    CollectionReplicaStatus default New {
        New => "NEW",
        Replicating => "REPLICATING",
        Available => "AVAILABLE",
        PartlyAvailable => "PARTLYAVAILABLE",
        Unavailable => "UNAVAILABLE",
        Bad => "BAD",
        Removable => "REMOVABLE",
        Removing => "REMOVING",
        Removed => "REMOVED",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Collection {
    pub coll_id: i64,
    pub scope: String,
    pub name: String,
    pub collection_type: CollectionType,
    pub coll_size: u64,
    pub global_status: CollectionStatus,
    pub total_files: u64,
    pub num_replicas: u32,
    pub coll_metadata: Value,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Default for Collection {
    fn default() -> Self {
        let now = unix_timestamp();
        Self {
            coll_id: 0,
            scope: String::new(),
            name: String::new(),
            collection_type: CollectionType::Dataset,
            coll_size: 0,
            global_status: CollectionStatus::New,
            total_files: 0,
            num_replicas: 0,
            coll_metadata: Value::Null,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Collection {
    pub fn new(scope: &str, name: &str) -> Self {
        Self {
            scope: scope.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }
}

/// Replication progress of one collection at one edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionReplica {
    pub coll_id: i64,
    pub edge_id: i64,
    pub status: CollectionReplicaStatus,
    pub transferring_files: u64,
    pub replicated_files: u64,
    pub num_active_requests: u32,
    pub retries: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Default for CollectionReplica {
    fn default() -> Self {
        let now = unix_timestamp();
        Self {
            coll_id: 0,
            edge_id: 0,
            status: CollectionReplicaStatus::New,
            transferring_files: 0,
            replicated_files: 0,
            num_active_requests: 0,
            retries: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

impl CollectionReplica {
    pub fn new(coll_id: i64, edge_id: i64) -> Self {
        Self {
            coll_id,
            edge_id,
            ..Default::default()
        }
    }
}
