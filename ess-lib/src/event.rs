use crate::{Content, Request};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

catalog_enum! {
    EventType default FileAvailable {
        FileAvailable => "FILE_AVAILABLE",
        RequestDone => "REQUEST_DONE",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EssEvent {
    pub event_type: EventType,
    pub payload: Value,
    pub created_at: String,
}

impl EssEvent {
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            event_type,
            payload,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn file_available(content: &Content) -> Self {
        Self::new(
            EventType::FileAvailable,
            json!({
                "scope": content.scope,
                "name": content.name,
                "startEvent": content.min_id,
                "lastEvent": content.max_id,
                "pfn": content.pfn,
            }),
        )
    }

    pub fn request_done(request: &Request, edge_name: &str) -> Self {
        Self::new(
            EventType::RequestDone,
            json!({
                "request_id": request.request_id,
                "scope": request.scope,
                "name": request.name,
                "edge": edge_name,
            }),
        )
    }

    /// Wire form: lower-cased event type, payload and timestamp.
    pub fn to_message(&self) -> Value {
        json!({
            "event_type": self.event_type.as_str().to_ascii_lowercase(),
            "payload": self.payload,
            "created_at": self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_available_payload() {
        let content = Content {
            scope: "s".to_string(),
            name: "f1".to_string(),
            min_id: 11,
            max_id: 20,
            pfn: Some("http://store/b-1/f1".to_string()),
            ..Default::default()
        };
        let event = EssEvent::file_available(&content);
        assert_eq!(event.payload["startEvent"], 11);
        assert_eq!(event.payload["lastEvent"], 20);
        let msg = event.to_message();
        assert_eq!(msg["event_type"], "file_available");
        assert_eq!(msg["payload"]["pfn"], "http://store/b-1/f1");
    }
}
