//! Backing store contracts and their adapters.
//!
//! The core only sees the traits below. `s3`, `elasticsearch` and `clickhouse`
//! talk to the managed services; `memory` keeps everything in process for local
//! runs and tests.

pub mod clickhouse;
pub mod elasticsearch;
pub mod memory;
pub mod s3;

use crate::model::{CredentialRecord, Post};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

pub use self::clickhouse::ClickHouseWideColumnStore;
pub use self::elasticsearch::{EsCredentialStore, EsPostIndex};
pub use self::memory::{MemoryBlobStore, MemoryCredentialStore, MemoryPostIndex, MemoryWideColumnStore};
pub use self::s3::S3BlobStore;

/// Failure of a single backing store call
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store rejected the request: {0}")]
    Rejected(String),

    #[error("failed to decode store response: {0}")]
    Decode(String),
}

/// Run one store call under an upper time bound
pub async fn with_timeout<F, T>(duration: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(duration, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(duration)),
    }
}

/// Result of an atomic insert-if-absent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// Username -> credential record
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_username(&self, username: &str)
        -> Result<Option<CredentialRecord>, StoreError>;

    /// Write the record unless its username is already taken, in one store call
    async fn insert_if_absent(&self, record: &CredentialRecord)
        -> Result<InsertOutcome, StoreError>;
}

/// Opaque byte payloads under a key
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<(), StoreError>;

    async fn set_public_readable(&self, key: &str) -> Result<(), StoreError>;

    /// Dereferenceable locator of the object stored under `key`
    fn public_url(&self, key: &str) -> String;
}

/// Searchable post documents with a geo-point `location`
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PostIndex: Send + Sync {
    /// Index the post so the very next query can see it
    async fn index_now(&self, post: &Post) -> Result<(), StoreError>;

    /// Posts within `radius_km` of the point, in the store's native order
    async fn query_by_radius(
        &self,
        lat: f64,
        lon: f64,
        radius_km: f64,
    ) -> Result<Vec<Post>, StoreError>;
}

/// Sparse rows of versioned cells grouped into column families
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WideColumnStore: Send + Sync {
    async fn append_row(&self, row_key: &str, mutation: &RowMutation) -> Result<(), StoreError>;
}

pub const FAMILY_POST: &str = "post";
pub const FAMILY_LOCATION: &str = "location";

/// Cells to write into one row, all stamped with the same write time
#[derive(Debug, Clone, PartialEq)]
pub struct RowMutation {
    timestamp: DateTime<Utc>,
    cells: BTreeMap<String, BTreeMap<String, String>>,
}

impl RowMutation {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            cells: BTreeMap::new(),
        }
    }

    /// Set `family:qualifier` to `value`, replacing any earlier value in this mutation
    pub fn set(&mut self, family: &str, qualifier: &str, value: impl Into<String>) -> &mut Self {
        self.cells
            .entry(family.to_string())
            .or_default()
            .insert(qualifier.to_string(), value.into());
        self
    }

    /// The post attributes the analytics table keeps
    pub fn for_post(post: &Post, timestamp: DateTime<Utc>) -> Self {
        let mut mutation = Self::new(timestamp);
        mutation
            .set(FAMILY_POST, "user", post.user.as_str())
            .set(FAMILY_POST, "message", post.message.as_str())
            .set(FAMILY_LOCATION, "lat", post.location.lat.to_string())
            .set(FAMILY_LOCATION, "lon", post.location.lon.to_string());
        if !post.url.is_empty() {
            mutation.set(FAMILY_POST, "url", post.url.as_str());
        }
        mutation
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn get(&self, family: &str, qualifier: &str) -> Option<&str> {
        self.cells
            .get(family)
            .and_then(|columns| columns.get(qualifier))
            .map(String::as_str)
    }

    /// `(family, qualifier, value)` in family then qualifier order
    pub fn cells(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.cells.iter().flat_map(|(family, columns)| {
            columns
                .iter()
                .map(move |(qualifier, value)| (family.as_str(), qualifier.as_str(), value.as_str()))
        })
    }

    pub fn len(&self) -> usize {
        self.cells.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
