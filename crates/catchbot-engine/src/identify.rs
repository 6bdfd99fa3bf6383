use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client as HttpClient;
use thiserror::Error;
use tracing::debug;

use crate::hash::{average_hash, HashDigest, HashIndex};

const IMAGE_FETCH_TIMEOUT_SECONDS: u64 = 15;

#[derive(Debug, Error)]
pub enum IdentifyError {
    #[error("failed to fetch image {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("image request {url} failed with status {status}")]
    Status { url: String, status: u16 },
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identification {
    Known(String),
    Unknown,
}

impl Identification {
    pub fn identity(&self) -> Option<&str> {
        match self {
            Self::Known(identity) => Some(identity.as_str()),
            Self::Unknown => None,
        }
    }
}

/// Where spawn image bytes come from.
pub trait ImageSource: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, IdentifyError>;
}

pub struct HttpImageSource {
    client: HttpClient,
}

impl HttpImageSource {
    pub fn new() -> Result<Self> {
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(IMAGE_FETCH_TIMEOUT_SECONDS))
            .build()
            .context("failed to build image http client")?;
        Ok(Self { client })
    }
}

impl ImageSource for HttpImageSource {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, IdentifyError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|source| IdentifyError::Fetch {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(IdentifyError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let bytes = response.bytes().map_err(|source| IdentifyError::Fetch {
            url: url.to_string(),
            source,
        })?;
        Ok(bytes.to_vec())
    }
}

/// Resolves image bytes to an identity through the hash index.
#[derive(Debug, Clone)]
pub struct Identifier {
    index: HashIndex,
    max_distance: u32,
}

impl Identifier {
    pub fn new(index: HashIndex) -> Self {
        Self {
            index,
            max_distance: 0,
        }
    }

    /// Accept index entries up to `max_distance` differing bits when no
    /// exact digest matches. Zero keeps lookups exact.
    pub fn with_max_distance(mut self, max_distance: u32) -> Self {
        self.max_distance = max_distance;
        self
    }

    pub fn identify(&self, bytes: &[u8]) -> Result<Identification, IdentifyError> {
        let digest = average_hash(bytes)?;
        Ok(self.lookup(digest))
    }

    pub fn lookup(&self, digest: HashDigest) -> Identification {
        if let Some(identity) = self.index.get(digest) {
            return Identification::Known(identity.to_string());
        }
        if self.max_distance > 0 {
            if let Some((identity, distance)) = self.index.nearest(digest, self.max_distance) {
                debug!(%digest, identity, distance, "matched nearest digest");
                return Identification::Known(identity.to_string());
            }
        }
        debug!(%digest, "digest not in index");
        Identification::Unknown
    }
}
