use crate::unix_timestamp;
use serde::{Deserialize, Serialize};

catalog_enum! {
    EdgeType default Edge {
        Head => "HEAD",
        Edge => "EDGE",
        Composite => "COMPOSITE",
    }
}

catalog_enum! {
    EdgeStatus default Active {
        Active => "ACTIVE",
        LostHeartbeat => "LOSTHEARTBEAT",
        Failed => "FAILED",
    }
}

/// A cache node and the capacity figures it last reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Edge {
    pub edge_id: i64,
    pub edge_name: String,
    pub edge_type: EdgeType,
    pub status: EdgeStatus,
    pub is_independent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<String>,
    pub total_space: u64,
    pub used_space: u64,
    pub reserved_space: u64,
    pub num_files: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Default for Edge {
    fn default() -> Self {
        let now = unix_timestamp();
        Self {
            edge_id: 0,
            edge_name: String::new(),
            edge_type: EdgeType::Edge,
            status: EdgeStatus::Active,
            is_independent: false,
            continent: None,
            country_name: None,
            region_code: None,
            city: None,
            longitude: None,
            latitude: None,
            total_space: 0,
            used_space: 0,
            reserved_space: 0,
            num_files: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Edge {
    pub fn new(edge_name: &str, edge_type: EdgeType) -> Self {
        Self {
            edge_name: edge_name.to_string(),
            edge_type,
            ..Default::default()
        }
    }

    /// `total - used - reserved`, floored at zero.
    pub fn free_space(&self) -> u64 {
        self.total_space
            .saturating_sub(self.used_space)
            .saturating_sub(self.reserved_space)
    }

    pub fn is_active(&self) -> bool {
        self.status == EdgeStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_space_saturates() {
        let mut edge = Edge::new("edge-a", EdgeType::Edge);
        edge.total_space = 100;
        edge.used_space = 30;
        edge.reserved_space = 20;
        assert_eq!(edge.free_space(), 50);

        edge.reserved_space = 200;
        assert_eq!(edge.free_space(), 0);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(EdgeStatus::LostHeartbeat.as_str(), "LOSTHEARTBEAT");
        assert_eq!(
            "lostheartbeat".parse::<EdgeStatus>().unwrap(),
            EdgeStatus::LostHeartbeat
        );
        let json = serde_json::to_string(&EdgeType::Composite).unwrap();
        assert_eq!(json, "\"COMPOSITE\"");
    }
}
