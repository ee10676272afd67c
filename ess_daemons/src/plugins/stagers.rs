use crate::registry::plugin_settings;
use async_trait::async_trait;
use ess_lib::{Content, EssError, EssResult, StageOutput, Stager};
use log::{debug, info, warn};
use reqwest::header::CONTENT_LENGTH;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObjectStoreSettings {
    pub endpoint: String,
    #[serde(alias = "bucket")]
    pub bucket_name: String,
    pub timeout_secs: u64,
}

impl Default for ObjectStoreSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            bucket_name: "ess".to_string(),
            timeout_secs: 300,
        }
    }
}

/// Uploads each file with a plain HTTP PUT to `{endpoint}/{bucket}-{coll_id}/{basename}`
/// and reads the stored size back with HEAD. Objects already stored at the right size
/// are not sent again.
pub struct HttpObjectStoreStager {
    endpoint: String,
    bucket_name: String,
    client: Client,
}

impl HttpObjectStoreStager {
    pub fn new(settings: ObjectStoreSettings) -> EssResult<Self> {
        if settings.endpoint.trim().is_empty() {
            return Err(EssError::InvalidParam(
                "http_object_store needs an endpoint".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| EssError::Internal(format!("build object store client: {}", e)))?;
        Ok(Self {
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            bucket_name: settings.bucket_name,
            client,
        })
    }

    pub fn from_settings(settings: &toml::Table) -> EssResult<Self> {
        Self::new(plugin_settings("http_object_store", settings)?)
    }

    pub fn object_url(&self, content: &Content, local_path: &str) -> String {
        let basename = Path::new(local_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| content.name.clone());
        format!(
            "{}/{}-{}/{}",
            self.endpoint, self.bucket_name, content.coll_id, basename
        )
    }

    /// Size of the stored object, `None` when the store does not have it.
    async fn stored_size(&self, url: &str) -> EssResult<Option<u64>> {
        let resp = self.client.head(url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(EssError::from_http_status(
                resp.status(),
                format!("HEAD {}", url),
            ));
        }
        resp.headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Some)
            .ok_or_else(|| {
                EssError::PluginExecution(format!("HEAD {} returned no content-length", url))
            })
    }

    async fn put_file(&self, file_path: &str, url: &str) -> EssResult<()> {
        let body = tokio::fs::read(file_path).await.map_err(|e| {
            EssError::PluginExecution(format!("read {}: {}", file_path, e))
        })?;
        let resp = self.client.put(url).body(body).send().await?;
        if !resp.status().is_success() {
            return Err(EssError::from_http_status(
                resp.status(),
                format!("PUT {}", url),
            ));
        }
        Ok(())
    }

    /// Stores the file behind `content` unless the store already holds it at the
    /// expected size. `stored` remembers the objects this batch already verified.
    async fn upload_one(
        &self,
        content: &Content,
        stored: &mut HashMap<String, u64>,
    ) -> EssResult<StageOutput> {
        let local_path = content.pfn.as_deref().ok_or_else(|| {
            EssError::PluginExecution(format!("content #{} has no pfn", content.content_id))
        })?;
        // A range reference points into a file; the file is stored once and the range
        // stays on the published location.
        let (file_path, fragment) = match local_path.split_once('#') {
            Some((path, range)) => (path, Some(range)),
            None => (local_path, None),
        };
        let expected = tokio::fs::metadata(file_path)
            .await
            .map_err(|e| EssError::PluginExecution(format!("stat {}: {}", file_path, e)))?
            .len();
        let url = self.object_url(content, file_path);

        let size = match stored.get(&url) {
            Some(size) => *size,
            None => {
                let size = match self.stored_size(&url).await? {
                    Some(size) if size == expected => {
                        debug!("http_object_store: already stored: url={}, size={}", url, size);
                        size
                    }
                    _ => {
                        self.put_file(file_path, &url).await?;
                        self.stored_size(&url).await?.ok_or_else(|| {
                            EssError::PluginExecution(format!("HEAD {} found nothing after PUT", url))
                        })?
                    }
                };
                if size != expected {
                    return Err(EssError::PluginExecution(format!(
                        "HEAD {} reports {} bytes, uploaded {}",
                        url, size, expected
                    )));
                }
                stored.insert(url.clone(), size);
                size
            }
        };
        // The cataloged size covers the whole file only when no range is attached.
        if fragment.is_none() && content.pfn_size != 0 && size != content.pfn_size {
            return Err(EssError::PluginExecution(format!(
                "HEAD {} reports {} bytes, content #{} expects {}",
                url, size, content.content_id, content.pfn_size
            )));
        }
        debug!(
            "http_object_store: uploaded: content_id={}, url={}, size={}",
            content.content_id, url, size
        );
        let (pfn, size) = match fragment {
            Some(range) => (format!("{}#{}", url, range), content.pfn_size),
            None => (url, size),
        };
        Ok(StageOutput {
            content_id: content.content_id,
            pfn,
            size,
        })
    }
}

#[async_trait]
impl Stager for HttpObjectStoreStager {
    async fn upload_batch(&self, contents: &[Content]) -> EssResult<Vec<StageOutput>> {
        let mut outputs = Vec::with_capacity(contents.len());
        let mut stored = HashMap::new();
        for content in contents {
            match self.upload_one(content, &mut stored).await {
                Ok(output) => outputs.push(output),
                Err(e) => warn!(
                    "http_object_store: upload failed: content_id={}, err={}",
                    content.content_id, e
                ),
            }
        }
        info!(
            "http_object_store: batch uploaded: contents={}/{}, objects={}",
            outputs.len(),
            contents.len(),
            stored.len()
        );
        Ok(outputs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PassthroughSettings {
    /// Prefix that replaces the local directory in published locations.
    pub public_base_url: Option<String>,
}

/// Publishes contents where they already are, optionally behind a public URL prefix.
pub struct PassthroughStager {
    public_base_url: Option<String>,
}

impl PassthroughStager {
    pub fn new(public_base_url: Option<String>) -> Self {
        Self {
            public_base_url: public_base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    pub fn from_settings(settings: &toml::Table) -> EssResult<Self> {
        let settings: PassthroughSettings = plugin_settings("passthrough", settings)?;
        Ok(Self::new(settings.public_base_url))
    }
}

#[async_trait]
impl Stager for PassthroughStager {
    async fn upload_batch(&self, contents: &[Content]) -> EssResult<Vec<StageOutput>> {
        let mut outputs = Vec::with_capacity(contents.len());
        for content in contents {
            let Some(pfn) = content.pfn.as_deref() else {
                warn!("passthrough: content #{} has no pfn", content.content_id);
                continue;
            };
            let (file_path, fragment) = match pfn.split_once('#') {
                Some((path, range)) => (path, Some(range)),
                None => (pfn, None),
            };
            let size = match tokio::fs::metadata(file_path).await {
                Ok(meta) if fragment.is_none() => meta.len(),
                _ => content.pfn_size,
            };
            let published = match &self.public_base_url {
                Some(base) => {
                    let basename = Path::new(file_path)
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| content.name.clone());
                    match fragment {
                        Some(range) => format!("{}/{}#{}", base, basename, range),
                        None => format!("{}/{}", base, basename),
                    }
                }
                None => pfn.to_string(),
            };
            outputs.push(StageOutput {
                content_id: content.content_id,
                pfn: published,
                size,
            });
        }
        Ok(outputs)
    }
}
