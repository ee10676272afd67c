use crate::CatalogDB;
use ess_lib::{
    Collection, Content, ContentFilter, Edge, EssError, EssResult, Request, RequestFilter,
    RequestStatus, RequestUpdate,
};
use log::{debug, warn};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Deserialize)]
struct IdReply {
    #[serde(alias = "edge_id", alias = "coll_id", alias = "request_id")]
    id: i64,
}

#[derive(Deserialize)]
struct CountReply {
    #[serde(alias = "added")]
    count: usize,
}

struct RemoteHead {
    base_url: String,
    client: Client,
    retries: u32,
}

enum HeadBackend {
    Remote(RemoteHead),
    InProcess(Arc<CatalogDB>),
}

/// Access to the head catalog, either over HTTP or, when the head runs in this
/// process, directly on its `CatalogDB`.
pub struct HeadClient {
    backend: HeadBackend,
}

impl HeadClient {
    pub fn new_remote(base_url: &str, timeout: Duration, retries: u32) -> EssResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EssError::Internal(format!("build head http client failed: {}", e)))?;
        Ok(Self {
            backend: HeadBackend::Remote(RemoteHead {
                base_url: base_url.trim_end_matches('/').to_string(),
                client,
                retries,
            }),
        })
    }

    pub fn new_in_process(db: Arc<CatalogDB>) -> Self {
        Self {
            backend: HeadBackend::InProcess(db),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.backend, HeadBackend::Remote(_))
    }

    pub async fn register_edge(&self, edge: &Edge) -> EssResult<i64> {
        match &self.backend {
            HeadBackend::Remote(head) => {
                let reply: IdReply = head
                    .call(
                        Method::POST,
                        &format!("edges/{}", edge.edge_name),
                        &[],
                        Some(serde_json::to_value(edge)?),
                    )
                    .await?;
                Ok(reply.id)
            }
            HeadBackend::InProcess(db) => db.add_edge(edge),
        }
    }

    pub async fn update_edge(&self, edge: &Edge) -> EssResult<()> {
        match &self.backend {
            HeadBackend::Remote(head) => {
                let _: Value = head
                    .call(
                        Method::PUT,
                        &format!("edges/{}", edge.edge_name),
                        &[],
                        Some(serde_json::to_value(edge)?),
                    )
                    .await?;
                Ok(())
            }
            HeadBackend::InProcess(db) => db.update_edge(edge),
        }
    }

    pub async fn get_edge(&self, edge_name: &str) -> EssResult<Edge> {
        match &self.backend {
            HeadBackend::Remote(head) => {
                head.call(Method::GET, &format!("edges/{}", edge_name), &[], None)
                    .await
            }
            HeadBackend::InProcess(db) => db.get_edge(edge_name),
        }
    }

    pub async fn get_collection(&self, scope: &str, name: &str) -> EssResult<Collection> {
        match &self.backend {
            HeadBackend::Remote(head) => {
                head.call(
                    Method::GET,
                    &format!("catalog/collection/{}/{}", scope, name),
                    &[],
                    None,
                )
                .await
            }
            HeadBackend::InProcess(db) => db.get_collection(scope, name),
        }
    }

    pub async fn add_collection(&self, coll: &Collection) -> EssResult<i64> {
        match &self.backend {
            HeadBackend::Remote(head) => {
                let reply: IdReply = head
                    .call(
                        Method::POST,
                        &format!("catalog/collection/{}/{}", coll.scope, coll.name),
                        &[],
                        Some(serde_json::to_value(coll)?),
                    )
                    .await?;
                Ok(reply.id)
            }
            HeadBackend::InProcess(db) => db.add_collection(coll),
        }
    }

    /// Requests the head placed at `edge_name` that are in `status`.
    pub async fn get_requests(&self, edge_name: &str, status: RequestStatus) -> EssResult<Vec<Request>> {
        match &self.backend {
            HeadBackend::Remote(head) => {
                head.call(
                    Method::GET,
                    "requests",
                    &[("edge_name", edge_name), ("status", status.as_str())],
                    None,
                )
                .await
            }
            HeadBackend::InProcess(db) => {
                let edge = db.get_edge(edge_name)?;
                db.get_requests(&RequestFilter::by_status(status).at_edge(edge.edge_id))
            }
        }
    }

    pub async fn get_request(&self, request_id: i64) -> EssResult<Request> {
        match &self.backend {
            HeadBackend::Remote(head) => {
                head.call(Method::GET, &format!("requests/{}", request_id), &[], None)
                    .await
            }
            HeadBackend::InProcess(db) => db.get_request(request_id),
        }
    }

    pub async fn add_request(&self, request: &Request) -> EssResult<i64> {
        match &self.backend {
            HeadBackend::Remote(head) => {
                let reply: IdReply = head
                    .call(
                        Method::POST,
                        "requests",
                        &[],
                        Some(serde_json::to_value(request)?),
                    )
                    .await?;
                Ok(reply.id)
            }
            HeadBackend::InProcess(db) => db.add_request(request),
        }
    }

    pub async fn update_request(&self, request_id: i64, update: &RequestUpdate) -> EssResult<()> {
        match &self.backend {
            HeadBackend::Remote(head) => {
                let _: Value = head
                    .call(
                        Method::PUT,
                        &format!("requests/{}", request_id),
                        &[],
                        Some(serde_json::to_value(update)?),
                    )
                    .await?;
                Ok(())
            }
            HeadBackend::InProcess(db) => db.update_request(request_id, update),
        }
    }

    /// Publishes an edge's contents of `scope:name` to the head. The head rewrites the
    /// collection and edge ids to its own; rows it already has are skipped.
    pub async fn add_contents(
        &self,
        scope: &str,
        name: &str,
        edge_name: &str,
        contents: &[Content],
    ) -> EssResult<usize> {
        match &self.backend {
            HeadBackend::Remote(head) => {
                let reply: CountReply = head
                    .call(
                        Method::POST,
                        &format!("catalog/contents/{}/{}/{}", scope, name, edge_name),
                        &[],
                        Some(serde_json::to_value(contents)?),
                    )
                    .await?;
                Ok(reply.count)
            }
            HeadBackend::InProcess(db) => {
                let edge = db.get_edge(edge_name)?;
                let coll = db.get_collection(scope, name)?;
                let rebased = contents
                    .iter()
                    .map(|c| Content {
                        content_id: 0,
                        coll_id: coll.coll_id,
                        edge_id: edge.edge_id,
                        ..c.clone()
                    })
                    .collect::<Vec<_>>();
                db.add_contents(&rebased)
            }
        }
    }

    pub async fn get_contents(&self, scope: &str, name: &str, edge_name: &str) -> EssResult<Vec<Content>> {
        match &self.backend {
            HeadBackend::Remote(head) => {
                head.call(
                    Method::GET,
                    &format!("catalog/contents/{}/{}/{}", scope, name, edge_name),
                    &[],
                    None,
                )
                .await
            }
            HeadBackend::InProcess(db) => {
                let edge = db.get_edge(edge_name)?;
                let coll = db.get_collection(scope, name)?;
                db.get_contents(&ContentFilter::for_collection(coll.coll_id, edge.edge_id))
            }
        }
    }
}

impl RemoteHead {
    /// Sends one request, retrying transport failures `retries` times.
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> EssResult<T> {
        let url = format!("{}/{}", self.base_url, path);
        let mut attempt = 0u32;
        loop {
            let mut builder = self.client.request(method.clone(), &url);
            if !query.is_empty() {
                builder = builder.query(query);
            }
            if let Some(body) = &body {
                builder = builder.json(body);
            }

            match builder.send().await {
                Ok(resp) => return Self::decode(resp, &url).await,
                Err(e) if (e.is_connect() || e.is_timeout()) && attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        "HeadClient: {} {} failed, retry {}/{}: {}",
                        method, url, attempt, self.retries, e
                    );
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    warn!("HeadClient: {} {} unreachable: {}", method, url, e);
                    return Err(EssError::ConnectionError(format!("{}: {}", url, e)));
                }
                Err(e) => return Err(EssError::from(e)),
            }
        }
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response, url: &str) -> EssResult<T> {
        let status = resp.status();
        if status.is_success() {
            let text = resp.text().await?;
            // Verbs without a reply body still decode into `Value`.
            let text = if text.trim().is_empty() { "null" } else { text.as_str() };
            return serde_json::from_str(text)
                .map_err(|e| EssError::DecodeError(format!("{}: {}", url, e)));
        }

        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(|m| m.as_str()).map(|m| m.to_string()))
            .unwrap_or(body);
        debug!("HeadClient: {} answered {}: {}", url, status, message);
        Err(EssError::from_http_status(
            status,
            format!("{}: {}", url, message),
        ))
    }
}

/// Error body a head service answers with.
pub fn head_error_reply(err: &EssError) -> Value {
    json!({ "error": err.to_string() })
}
