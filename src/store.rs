//! Model store capability consumed by the translation handlers.
//!
//! Models live in an Ollama-style layout: one manifest file per
//! repository+tag under `manifests/`, content-addressed blobs under
//! `blobs/`. The canonical key everywhere is the normalized model
//! reference `repository:tag`, where the repository is the manifest's
//! directory path relative to the manifests root with `/` separators.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::registry::{Manifest, ModelDetailsConfig, RegistryClient};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("model '{0}' not found")]
    NotFound(String),

    #[error("pull cancelled")]
    Cancelled,

    #[error("digest mismatch for {expected}: downloaded content hashed to {computed}")]
    DigestMismatch { expected: String, computed: String },

    #[error("registry error: {0}")]
    Registry(#[from] reqwest::Error),

    #[error("manifest parse error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Full metadata for one stored model version, read from its manifest.
#[derive(Debug, Clone)]
pub struct ModelManifest {
    pub repository: String,
    pub tag: String,
    /// Digest of the manifest file contents.
    pub digest: String,
    pub size: i64,
    pub modified_at: DateTime<Utc>,
    pub format: String,
    pub family: String,
    pub families: Vec<String>,
    pub parameter_size: String,
    pub quantization_level: String,
}

/// One entry produced by walking the manifest tree.
#[derive(Debug, Clone)]
pub struct WalkEntry {
    /// Path relative to the manifests root, `/`-separated.
    pub rel_path: String,
    pub is_dir: bool,
    pub modified: DateTime<Utc>,
}

/// One incremental update emitted while a blob downloads.
#[derive(Debug, Clone)]
pub struct PullProgress {
    pub digest: String,
    pub total: u64,
    pub completed: u64,
}

pub type ProgressSender = mpsc::Sender<PullProgress>;

#[async_trait]
pub trait ModelStore: Send + Sync {
    /// Enumerates the manifest tree. Restartable; each call walks afresh.
    async fn walk_manifests(&self) -> Result<Vec<WalkEntry>, StoreError>;

    /// Resolves a normalized reference to full manifest metadata.
    async fn get_model(&self, reference: &str) -> Result<ModelManifest, StoreError>;

    /// Downloads a model. Long-running; stops promptly once `cancel` fires.
    /// Progress is reported through `progress` as blobs arrive.
    async fn pull(
        &self,
        reference: &str,
        cancel: CancellationToken,
        progress: ProgressSender,
    ) -> Result<(), StoreError>;

    /// Removes the manifest for a reference.
    async fn delete(&self, reference: &str) -> Result<(), StoreError>;

    /// Removes directories left empty under the manifests root.
    async fn prune(&self) -> Result<(), StoreError>;
}

/// A parsed model reference with registry normalization applied: bare names
/// gain the `library/` prefix, the host defaults to the configured registry,
/// and a missing tag means `latest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub host: String,
    pub name: String,
    pub tag: String,
}

impl ModelRef {
    pub fn parse(reference: &str, default_host: &str) -> Self {
        let (rest, tag) = match reference.rsplit_once(':') {
            Some((rest, tag)) if !tag.contains('/') => (rest.to_string(), tag.to_string()),
            _ => (reference.to_string(), "latest".to_string()),
        };

        let (host, name) = match rest.split_once('/') {
            Some((host, name)) if host.contains('.') || host.contains(':') => {
                (host.to_string(), name.to_string())
            }
            _ => (default_host.to_string(), rest),
        };

        let name = if name.contains('/') {
            name
        } else {
            format!("library/{name}")
        };

        Self { host, name, tag }
    }

    /// Repository part of the normalized reference.
    pub fn repository(&self) -> String {
        format!("{}/{}", self.host, self.name)
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.host, self.name, self.tag)
    }
}

/// Filesystem store over an Ollama model directory.
pub struct OllamaStore {
    root: PathBuf,
    default_host: String,
    registry: RegistryClient,
}

impl OllamaStore {
    pub fn new(root: PathBuf, registry: RegistryClient, default_host: String) -> Self {
        Self {
            root,
            default_host,
            registry,
        }
    }

    fn manifests_root(&self) -> PathBuf {
        self.root.join("manifests")
    }

    fn blobs_root(&self) -> PathBuf {
        self.root.join("blobs")
    }

    fn manifest_path(&self, mref: &ModelRef) -> PathBuf {
        let mut path = self.manifests_root().join(&mref.host);
        for part in mref.name.split('/') {
            path.push(part);
        }
        path.join(&mref.tag)
    }

    /// Blob digests `sha256:<hex>` are stored as files named `sha256-<hex>`.
    fn blob_path(&self, digest: &str) -> PathBuf {
        self.blobs_root().join(digest.replace(':', "-"))
    }

    async fn read_details(&self, config_digest: &str) -> Option<ModelDetailsConfig> {
        let bytes = tokio::fs::read(self.blob_path(config_digest)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn blob_is_complete(&self, digest: &str, size: u64) -> bool {
        match tokio::fs::metadata(self.blob_path(digest)).await {
            Ok(meta) => meta.len() == size,
            Err(_) => false,
        }
    }

    fn prune_dir(dir: PathBuf) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send>> {
        Box::pin(async move {
            let mut read = tokio::fs::read_dir(&dir).await?;
            let mut empty = true;
            while let Some(entry) = read.next_entry().await? {
                let is_dir = match entry.file_type().await {
                    Ok(kind) => kind.is_dir(),
                    // Entry vanished under us; treat as gone.
                    Err(_) => continue,
                };
                if is_dir {
                    if Self::prune_dir(entry.path()).await? {
                        tokio::fs::remove_dir(entry.path()).await?;
                    } else {
                        empty = false;
                    }
                } else {
                    empty = false;
                }
            }
            Ok(empty)
        })
    }
}

#[async_trait]
impl ModelStore for OllamaStore {
    async fn walk_manifests(&self) -> Result<Vec<WalkEntry>, StoreError> {
        let root = self.manifests_root();
        tokio::fs::create_dir_all(&root).await?;

        let mut entries = Vec::new();
        let mut pending = vec![root.clone()];
        while let Some(dir) = pending.pop() {
            let mut read = match tokio::fs::read_dir(&dir).await {
                Ok(read) => read,
                // A subdirectory that vanished mid-walk (a concurrent
                // delete + prune) or turned unreadable is skipped; only
                // failing to read the root is fatal.
                Err(err) if dir != root => {
                    tracing::debug!(
                        path = %dir.display(),
                        error = %err,
                        "skipping unreadable directory"
                    );
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = read.next_entry().await? {
                let path = entry.path();
                // An entry deleted mid-walk is skipped, not fatal.
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                let rel_path = path
                    .strip_prefix(&root)
                    .unwrap_or(&path)
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let modified = meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                if meta.is_dir() {
                    pending.push(path);
                }
                entries.push(WalkEntry {
                    rel_path,
                    is_dir: meta.is_dir(),
                    modified,
                });
            }
        }
        Ok(entries)
    }

    async fn get_model(&self, reference: &str) -> Result<ModelManifest, StoreError> {
        let mref = ModelRef::parse(reference, &self.default_host);
        let path = self.manifest_path(&mref);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(reference.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let meta = tokio::fs::metadata(&path).await?;
        let manifest: Manifest = serde_json::from_slice(&bytes)?;

        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&bytes)));
        let size = manifest.config.size + manifest.layers.iter().map(|l| l.size).sum::<u64>();
        let details = self
            .read_details(&manifest.config.digest)
            .await
            .unwrap_or_default();

        Ok(ModelManifest {
            repository: mref.repository(),
            tag: mref.tag,
            digest,
            size: size as i64,
            modified_at: meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
            format: details.model_format,
            family: details.model_family,
            families: details.model_families,
            parameter_size: details.model_type,
            quantization_level: details.file_type,
        })
    }

    async fn pull(
        &self,
        reference: &str,
        cancel: CancellationToken,
        progress: ProgressSender,
    ) -> Result<(), StoreError> {
        let mref = ModelRef::parse(reference, &self.default_host);
        let (manifest_bytes, manifest) = self.registry.fetch_manifest(&mref).await?;

        tokio::fs::create_dir_all(self.blobs_root()).await?;

        let mut descriptors = vec![manifest.config.clone()];
        descriptors.extend(manifest.layers.iter().cloned());

        for descriptor in &descriptors {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            if self.blob_is_complete(&descriptor.digest, descriptor.size).await {
                let _ = progress
                    .send(PullProgress {
                        digest: descriptor.digest.clone(),
                        total: descriptor.size,
                        completed: descriptor.size,
                    })
                    .await;
                continue;
            }
            self.registry
                .pull_blob(
                    &mref,
                    descriptor,
                    &self.blob_path(&descriptor.digest),
                    &cancel,
                    &progress,
                )
                .await?;
        }

        // The manifest is written last so a partially pulled model never
        // becomes visible to listings.
        let manifest_path = self.manifest_path(&mref);
        if let Some(parent) = manifest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&manifest_path, &manifest_bytes).await?;
        Ok(())
    }

    async fn delete(&self, reference: &str) -> Result<(), StoreError> {
        let mref = ModelRef::parse(reference, &self.default_host);
        match tokio::fs::remove_file(self.manifest_path(&mref)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(reference.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn prune(&self) -> Result<(), StoreError> {
        let root = self.manifests_root();
        if !root.exists() {
            return Ok(());
        }
        // The root itself is kept even when empty.
        Self::prune_dir(root).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "registry.ollama.ai";

    fn store(root: &Path) -> OllamaStore {
        OllamaStore::new(
            root.to_path_buf(),
            RegistryClient::new(false),
            HOST.to_string(),
        )
    }

    fn seed_model(root: &Path, host: &str, name: &str, tag: &str) -> (Vec<u8>, String) {
        let config_blob = serde_json::json!({
            "model_format": "gguf",
            "model_family": "llama",
            "model_families": ["llama"],
            "model_type": "7B",
            "file_type": "Q4_0",
        })
        .to_string()
        .into_bytes();
        let config_digest = format!("sha256:{}", hex::encode(Sha256::digest(&config_blob)));

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "digest": config_digest,
                "size": config_blob.len(),
            },
            "layers": [{
                "mediaType": "application/vnd.ollama.image.model",
                "digest": "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                "size": 4096,
            }],
        })
        .to_string()
        .into_bytes();

        let blobs = root.join("blobs");
        std::fs::create_dir_all(&blobs).unwrap();
        std::fs::write(blobs.join(config_digest.replace(':', "-")), &config_blob).unwrap();

        let manifest_dir = root.join("manifests").join(host).join(name);
        std::fs::create_dir_all(&manifest_dir).unwrap();
        std::fs::write(manifest_dir.join(tag), &manifest).unwrap();

        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&manifest)));
        (manifest, digest)
    }

    #[test]
    fn parse_bare_name() {
        let mref = ModelRef::parse("llama3", HOST);
        assert_eq!(mref.host, HOST);
        assert_eq!(mref.name, "library/llama3");
        assert_eq!(mref.tag, "latest");
    }

    #[test]
    fn parse_name_and_tag() {
        let mref = ModelRef::parse("llama3:7b", HOST);
        assert_eq!(mref.name, "library/llama3");
        assert_eq!(mref.tag, "7b");
    }

    #[test]
    fn parse_full_reference() {
        let mref = ModelRef::parse("registry.ollama.ai/library/llama3:7b", HOST);
        assert_eq!(mref.host, "registry.ollama.ai");
        assert_eq!(mref.name, "library/llama3");
        assert_eq!(mref.tag, "7b");
    }

    #[test]
    fn parse_host_with_port() {
        let mref = ModelRef::parse("localhost:5000/me/model:dev", HOST);
        assert_eq!(mref.host, "localhost:5000");
        assert_eq!(mref.name, "me/model");
        assert_eq!(mref.tag, "dev");
    }

    #[tokio::test]
    async fn walk_lists_manifest_files() {
        let dir = tempfile::tempdir().unwrap();
        seed_model(dir.path(), HOST, "library/foo", "latest");

        let entries = store(dir.path()).walk_manifests().await.unwrap();
        let files: Vec<_> = entries.iter().filter(|e| !e.is_dir).collect();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].rel_path, format!("{HOST}/library/foo/latest"));
    }

    #[tokio::test]
    async fn walk_skips_unreadable_subdirectory() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        seed_model(dir.path(), HOST, "library/foo", "latest");
        let locked = dir.path().join("manifests").join(HOST).join("locked");
        std::fs::create_dir_all(&locked).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0)).unwrap();

        let entries = store(dir.path()).walk_manifests().await.unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        let files: Vec<_> = entries.iter().filter(|e| !e.is_dir).collect();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].rel_path, format!("{HOST}/library/foo/latest"));
    }

    #[tokio::test]
    async fn walk_creates_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let entries = store(dir.path()).walk_manifests().await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn get_model_reads_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let (_, digest) = seed_model(dir.path(), HOST, "library/foo", "latest");

        let model = store(dir.path()).get_model("foo:latest").await.unwrap();
        assert_eq!(model.digest, digest);
        assert_eq!(model.repository, format!("{HOST}/library/foo"));
        assert_eq!(model.tag, "latest");
        assert_eq!(model.format, "gguf");
        assert_eq!(model.family, "llama");
        assert_eq!(model.parameter_size, "7B");
        assert_eq!(model.quantization_level, "Q4_0");
        assert!(model.size > 4096);
    }

    #[tokio::test]
    async fn get_model_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = store(dir.path()).get_model("nope:latest").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = store(dir.path()).delete("nope:latest").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_then_prune_clears_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        seed_model(dir.path(), HOST, "library/foo", "latest");
        let s = store(dir.path());

        s.delete("foo:latest").await.unwrap();
        s.prune().await.unwrap();

        let manifests = dir.path().join("manifests");
        assert!(manifests.exists());
        assert!(!manifests.join(HOST).exists());
    }
}
