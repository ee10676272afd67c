use crate::registry::plugin_settings;
use async_trait::async_trait;
use ess_lib::{
    CollectionStatus, CollectionType, ContentStatus, DataFinder, DatasetInfo, EssError,
    EssResult, FileDescriptor, PreCacher,
};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

/// A JSON listing of the datasets this site can serve.
///
/// ```json
/// { "datasets": [ { "scope": "s", "name": "n", "files": [
///     { "name": "f1", "min_id": 1, "max_id": 23, "size": 2300, "source": "/data/f1" } ] } ] }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatasetManifest {
    #[serde(default)]
    pub datasets: Vec<ManifestDataset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestDataset {
    pub scope: String,
    pub name: String,
    #[serde(default)]
    pub collection_type: CollectionType,
    #[serde(default)]
    pub status: CollectionStatus,
    #[serde(default)]
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestFile {
    #[serde(default)]
    pub scope: Option<String>,
    pub name: String,
    #[serde(default = "default_min_id")]
    pub min_id: u64,
    pub max_id: u64,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub source: Option<PathBuf>,
    #[serde(default)]
    pub checksums: Map<String, Value>,
}

fn default_min_id() -> u64 {
    1
}

impl DatasetManifest {
    pub fn find(&self, scope: &str, name: &str) -> Option<&ManifestDataset> {
        self.datasets
            .iter()
            .find(|d| d.scope == scope && d.name == name)
    }
}

pub async fn load_manifest(path: &Path) -> EssResult<DatasetManifest> {
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        warn!("manifest: read failed: path={}, err={}", path.display(), e);
        EssError::PluginExecution(format!("read manifest {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&text).map_err(|e| {
        EssError::PluginExecution(format!("parse manifest {}: {}", path.display(), e))
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestFinderSettings {
    pub manifest_path: PathBuf,
}

pub struct ManifestDataFinder {
    manifest_path: PathBuf,
}

impl ManifestDataFinder {
    pub fn new(manifest_path: PathBuf) -> Self {
        Self { manifest_path }
    }

    pub fn from_settings(settings: &toml::Table) -> EssResult<Self> {
        let settings: ManifestFinderSettings = plugin_settings("manifest", settings)?;
        Ok(Self::new(settings.manifest_path))
    }
}

#[async_trait]
impl DataFinder for ManifestDataFinder {
    async fn find_dataset(&self, scope: &str, name: &str) -> EssResult<DatasetInfo> {
        let manifest = load_manifest(&self.manifest_path).await?;
        let dataset = manifest.find(scope, name).ok_or_else(|| {
            EssError::NoRequestedData(format!("{}:{} is not in the manifest", scope, name))
        })?;
        let info = DatasetInfo {
            collection_type: dataset.collection_type,
            size: dataset.files.iter().map(|f| f.size).sum(),
            total_files: dataset.files.len() as u64,
            status: dataset.status,
        };
        debug!(
            "manifest: dataset found: scope={}, name={}, size={}, total_files={}",
            scope, name, info.size, info.total_files
        );
        Ok(info)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalDiskSettings {
    pub manifest_path: PathBuf,
    pub cache_dir: PathBuf,
}

/// Copies a dataset's files from their manifest `source` into `cache_dir/<scope>/<name>/`.
pub struct LocalDiskPreCacher {
    manifest_path: PathBuf,
    cache_dir: PathBuf,
}

impl LocalDiskPreCacher {
    pub fn new(manifest_path: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            manifest_path,
            cache_dir,
        }
    }

    pub fn from_settings(settings: &toml::Table) -> EssResult<Self> {
        let settings: LocalDiskSettings = plugin_settings("local_disk", settings)?;
        Ok(Self::new(settings.manifest_path, settings.cache_dir))
    }

    async fn cache_file(&self, target_dir: &Path, scope: &str, file: &ManifestFile) -> EssResult<FileDescriptor> {
        let mut descriptor = FileDescriptor {
            scope: file.scope.clone().unwrap_or_else(|| scope.to_string()),
            name: file.name.clone(),
            min_id: file.min_id,
            max_id: file.max_id,
            status: ContentStatus::New,
            size: file.size,
            pfn: None,
            checksums: file.checksums.clone(),
        };

        let source = match &file.source {
            Some(source) if tokio::fs::metadata(source).await.is_ok() => source.clone(),
            _ => {
                warn!(
                    "local_disk: source missing, file left NEW: name={}, source={:?}",
                    file.name, file.source
                );
                return Ok(descriptor);
            }
        };

        let target = target_dir.join(file.name.replace('/', "_"));
        let copied = tokio::fs::copy(&source, &target).await.map_err(|e| {
            EssError::PluginExecution(format!(
                "copy {} to {}: {}",
                source.display(),
                target.display(),
                e
            ))
        })?;
        let digest = sha256_file(target.clone()).await?;
        descriptor
            .checksums
            .insert("sha256".to_string(), Value::String(digest));
        descriptor.status = ContentStatus::Available;
        descriptor.size = copied;
        descriptor.pfn = Some(target.to_string_lossy().to_string());
        Ok(descriptor)
    }
}

#[async_trait]
impl PreCacher for LocalDiskPreCacher {
    async fn pre_cache(&self, scope: &str, name: &str) -> EssResult<Vec<FileDescriptor>> {
        let manifest = load_manifest(&self.manifest_path).await?;
        let dataset = manifest.find(scope, name).ok_or_else(|| {
            EssError::NoRequestedData(format!("{}:{} is not in the manifest", scope, name))
        })?;

        let target_dir = self.cache_dir.join(scope).join(name);
        tokio::fs::create_dir_all(&target_dir).await.map_err(|e| {
            EssError::PluginExecution(format!("create {}: {}", target_dir.display(), e))
        })?;

        let mut descriptors = Vec::with_capacity(dataset.files.len());
        for file in &dataset.files {
            descriptors.push(self.cache_file(&target_dir, scope, file).await?);
        }
        info!(
            "local_disk: dataset cached: scope={}, name={}, files={}, available={}",
            scope,
            name,
            descriptors.len(),
            descriptors
                .iter()
                .filter(|d| d.status == ContentStatus::Available)
                .count()
        );
        Ok(descriptors)
    }
}

/// Lower-case hex sha256 of a file.
pub async fn sha256_file(path: PathBuf) -> EssResult<String> {
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        let digest = hasher.finalize();
        Ok::<String, std::io::Error>(digest.iter().map(|b| format!("{:02x}", b)).collect())
    })
    .await
    .map_err(|e| EssError::Internal(format!("sha256 task failed: {}", e)))?
    .map_err(|e| EssError::PluginExecution(format!("sha256: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_manifest(dir: &Path, source: Option<&Path>) -> PathBuf {
        let manifest = json!({
            "datasets": [{
                "scope": "s",
                "name": "n",
                "files": [
                    { "name": "f1", "min_id": 1, "max_id": 23, "size": 11, "source": source },
                    { "name": "f2", "max_id": 5, "size": 40, "source": dir.join("nowhere") }
                ]
            }]
        });
        let path = dir.join("manifest.json");
        std::fs::write(&path, manifest.to_string()).expect("write manifest");
        path
    }

    #[tokio::test]
    async fn test_manifest_finder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let finder = ManifestDataFinder::new(write_manifest(dir.path(), None));

        let info = finder.find_dataset("s", "n").await.expect("found");
        assert_eq!(info.size, 51);
        assert_eq!(info.total_files, 2);
        assert_eq!(info.collection_type, CollectionType::Dataset);

        let err = finder.find_dataset("s", "other").await.expect_err("missing");
        assert!(matches!(err, EssError::NoRequestedData(_)));
    }

    #[tokio::test]
    async fn test_local_disk_pre_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("source-f1");
        std::fs::write(&source, b"hello world").expect("write source");
        let cache_dir = dir.path().join("cache");
        let precacher =
            LocalDiskPreCacher::new(write_manifest(dir.path(), Some(&source)), cache_dir.clone());

        let descriptors = precacher.pre_cache("s", "n").await.expect("pre cache");
        assert_eq!(descriptors.len(), 2);

        let f1 = &descriptors[0];
        assert_eq!(f1.status, ContentStatus::Available);
        assert_eq!(f1.size, 11);
        assert_eq!((f1.min_id, f1.max_id), (1, 23));
        assert_eq!(
            f1.checksums.get("sha256").and_then(|v| v.as_str()),
            Some("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9")
        );
        let pfn = PathBuf::from(f1.pfn.clone().expect("pfn"));
        assert!(pfn.starts_with(cache_dir.join("s").join("n")));
        assert_eq!(std::fs::read(&pfn).expect("cached"), b"hello world");

        let f2 = &descriptors[1];
        assert_eq!(f2.status, ContentStatus::New);
        assert_eq!(f2.min_id, 1);
        assert!(f2.pfn.is_none());

        let err = precacher.pre_cache("s", "missing").await.expect_err("no data");
        assert!(matches!(err, EssError::NoRequestedData(_)));
    }
}
