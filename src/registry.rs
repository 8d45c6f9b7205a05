//! Registry client used by the store to pull models.
//!
//! Models are distributed through an OCI-style registry: a JSON manifest
//! per repository+tag referencing a config blob and layer blobs, all
//! addressed by sha256 digest.

use std::path::Path;

use reqwest::header;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::store::{ModelRef, ProgressSender, PullProgress, StoreError};

const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Descriptor for one content blob referenced by a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

/// A model manifest as stored on disk and served by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: i32,
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// Model details carried in the config blob. All fields are optional on
/// the wire; missing ones stay empty.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelDetailsConfig {
    #[serde(default)]
    pub model_format: String,
    #[serde(default)]
    pub model_family: String,
    #[serde(default)]
    pub model_families: Vec<String>,
    #[serde(default)]
    pub model_type: String,
    #[serde(default)]
    pub file_type: String,
}

pub struct RegistryClient {
    http: reqwest::Client,
    insecure: bool,
}

impl RegistryClient {
    pub fn new(insecure: bool) -> Self {
        Self {
            http: reqwest::Client::new(),
            insecure,
        }
    }

    fn base_url(&self, host: &str) -> String {
        let scheme = if self.insecure { "http" } else { "https" };
        format!("{scheme}://{host}/v2")
    }

    pub async fn fetch_manifest(
        &self,
        mref: &ModelRef,
    ) -> Result<(bytes::Bytes, Manifest), StoreError> {
        let url = format!(
            "{}/{}/manifests/{}",
            self.base_url(&mref.host),
            mref.name,
            mref.tag
        );

        let response = self
            .http
            .get(&url)
            .header(header::ACCEPT, MANIFEST_MEDIA_TYPE)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(mref.to_string()));
        }
        let bytes = response.error_for_status()?.bytes().await?;
        let manifest: Manifest = serde_json::from_slice(&bytes)?;
        Ok((bytes, manifest))
    }

    /// Downloads one blob to `dest`, reporting progress per chunk and
    /// verifying the digest before the file becomes visible under its
    /// final name.
    pub async fn pull_blob(
        &self,
        mref: &ModelRef,
        descriptor: &Descriptor,
        dest: &Path,
        cancel: &CancellationToken,
        progress: &ProgressSender,
    ) -> Result<(), StoreError> {
        let url = format!(
            "{}/{}/blobs/{}",
            self.base_url(&mref.host),
            mref.name,
            descriptor.digest
        );

        let response = self.http.get(&url).send().await?.error_for_status()?;

        let partial = dest.with_extension("partial");
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut hasher = Sha256::new();
        let mut completed = 0u64;
        let mut stream = response.bytes_stream();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&partial).await;
                    return Err(StoreError::Cancelled);
                }
                chunk = stream.next() => {
                    let Some(chunk) = chunk else { break };
                    let chunk = chunk?;
                    hasher.update(&chunk);
                    file.write_all(&chunk).await?;
                    completed += chunk.len() as u64;
                    let _ = progress
                        .send(PullProgress {
                            digest: descriptor.digest.clone(),
                            total: descriptor.size,
                            completed,
                        })
                        .await;
                }
            }
        }
        file.flush().await?;
        drop(file);

        let computed = format!("sha256:{}", hex::encode(hasher.finalize()));
        if computed != descriptor.digest {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(StoreError::DigestMismatch {
                expected: descriptor.digest.clone(),
                computed,
            });
        }

        tokio::fs::rename(&partial, dest).await?;
        Ok(())
    }
}
