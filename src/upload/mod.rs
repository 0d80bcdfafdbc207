//! Remote object-store upload.
//!
//! Finished JPEGs are offloaded under `photo_<epochMillis>.jpg` keys. The
//! uploader seam is synchronous (it runs on a blocking task); durability and
//! retries live in [`worker`], not here.

pub mod worker;

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use crate::config::UploadConfig;
use crate::error::PipelineError;

pub use worker::UploadWorker;

/// Visibility of the stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    #[default]
    Public,
    Private,
}

impl AccessLevel {
    fn acl_header(&self) -> &'static str {
        match self {
            AccessLevel::Public => "public-read",
            AccessLevel::Private => "private",
        }
    }
}

/// Object key for a capture taken at the given epoch-millisecond timestamp.
pub fn object_key(epoch_millis: i64) -> String {
    format!("photo_{epoch_millis}.jpg")
}

pub trait RemoteUploader: Send + Sync {
    /// Transfer a local file under the given key. Returns the stored key on
    /// confirmed acknowledgment.
    fn upload(&self, file: &Path, key: &str, access: AccessLevel)
        -> Result<String, PipelineError>;
}

/// Uploader speaking plain HTTP PUT against an S3-compatible endpoint.
pub struct HttpUploader {
    endpoint: String,
    bucket: String,
    token: Option<String>,
    agent: ureq::Agent,
}

impl HttpUploader {
    pub fn from_config(config: &UploadConfig) -> Option<Self> {
        let endpoint = config.endpoint.clone()?;
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(120))
            .build();
        Some(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            token: config.token.clone(),
            agent,
        })
    }
}

impl RemoteUploader for HttpUploader {
    fn upload(
        &self,
        file: &Path,
        key: &str,
        access: AccessLevel,
    ) -> Result<String, PipelineError> {
        let handle = File::open(file)
            .map_err(|e| PipelineError::UriConversionFailed(e.to_string()))?;
        let url = format!("{}/{}/{}", self.endpoint, self.bucket, key);

        let mut request = self
            .agent
            .put(&url)
            .set("Content-Type", "image/jpeg")
            .set("x-amz-acl", access.acl_header());
        if let Some(token) = &self.token {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }

        request
            .send(BufReader::new(handle))
            .map_err(|e| PipelineError::RemoteUploadFailed(e.to_string()))?;
        Ok(key.to_string())
    }
}
