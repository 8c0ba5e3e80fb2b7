//! In-process store implementations.
//!
//! Every store can be switched offline to simulate an outage of that one service.

use super::{
    BlobStore, CredentialStore, InsertOutcome, PostIndex, RowMutation, StoreError,
    WideColumnStore,
};
use crate::model::{CredentialRecord, Post};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// Mean Earth radius in kilometres, the value Elasticsearch uses for arc distance
const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Great-circle distance between two points in kilometres
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}

#[derive(Debug, Default)]
struct Outage(AtomicBool);

impl Outage {
    fn set(&self, offline: bool) {
        self.0.store(offline, Ordering::SeqCst);
    }

    fn check(&self, store: &str) -> Result<(), StoreError> {
        if self.0.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable(format!("{store} is offline")))
        } else {
            Ok(())
        }
    }
}

/// Credential records keyed by username
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    records: RwLock<HashMap<String, CredentialRecord>>,
    outage: Outage,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.outage.set(offline);
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_by_username(
        &self,
        username: &str,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        self.outage.check("credential store")?;
        let records = self.records.read().map_err(poisoned)?;
        Ok(records.get(username).cloned())
    }

    async fn insert_if_absent(
        &self,
        record: &CredentialRecord,
    ) -> Result<InsertOutcome, StoreError> {
        self.outage.check("credential store")?;
        let mut records = self.records.write().map_err(poisoned)?;
        if records.contains_key(&record.username) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        records.insert(record.username.clone(), record.clone());
        Ok(InsertOutcome::Inserted)
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_type: String,
    pub public: bool,
}

/// Objects keyed by name inside one named bucket
#[derive(Debug)]
pub struct MemoryBlobStore {
    bucket: String,
    objects: RwLock<HashMap<String, StoredObject>>,
    outage: Outage,
    reject_acl: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(HashMap::new()),
            outage: Outage::default(),
            reject_acl: AtomicBool::new(false),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.outage.set(offline);
    }

    /// Make `set_public_readable` fail while uploads keep working
    pub fn set_reject_acl(&self, reject: bool) {
        self.reject_acl.store(reject, Ordering::SeqCst);
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().ok()?.get(key).cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<(), StoreError> {
        self.outage.check("blob store")?;
        let mut objects = self.objects.write().map_err(poisoned)?;
        objects.insert(
            key.to_string(),
            StoredObject {
                body,
                content_type: content_type.to_string(),
                public: false,
            },
        );
        Ok(())
    }

    async fn set_public_readable(&self, key: &str) -> Result<(), StoreError> {
        self.outage.check("blob store")?;
        if self.reject_acl.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected(format!("ACL update denied for {key}")));
        }
        let mut objects = self.objects.write().map_err(poisoned)?;
        match objects.get_mut(key) {
            Some(object) => {
                object.public = true;
                Ok(())
            }
            None => Err(StoreError::Rejected(format!("no such object: {key}"))),
        }
    }

    fn public_url(&self, key: &str) -> String {
        format!("memory://{}/{}", self.bucket, key)
    }
}

/// Posts in insertion order; radius queries filter by great-circle distance
#[derive(Debug, Default)]
pub struct MemoryPostIndex {
    posts: RwLock<Vec<Post>>,
    outage: Outage,
}

impl MemoryPostIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.outage.set(offline);
    }

    pub fn contains(&self, id: &uuid::Uuid) -> bool {
        self.posts
            .read()
            .map(|posts| posts.iter().any(|p| &p.id == id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.posts.read().map(|posts| posts.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PostIndex for MemoryPostIndex {
    async fn index_now(&self, post: &Post) -> Result<(), StoreError> {
        self.outage.check("document index")?;
        let mut posts = self.posts.write().map_err(poisoned)?;
        match posts.iter_mut().find(|p| p.id == post.id) {
            Some(existing) => *existing = post.clone(),
            None => posts.push(post.clone()),
        }
        Ok(())
    }

    async fn query_by_radius(
        &self,
        lat: f64,
        lon: f64,
        radius_km: f64,
    ) -> Result<Vec<Post>, StoreError> {
        self.outage.check("document index")?;
        let posts = self.posts.read().map_err(poisoned)?;
        Ok(posts
            .iter()
            .filter(|p| haversine_km(lat, lon, p.location.lat, p.location.lon) <= radius_km)
            .cloned()
            .collect())
    }
}

/// Versions of each row, oldest first
#[derive(Debug, Default)]
pub struct MemoryWideColumnStore {
    rows: RwLock<HashMap<String, Vec<RowMutation>>>,
    outage: Outage,
}

impl MemoryWideColumnStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.outage.set(offline);
    }

    pub fn row(&self, row_key: &str) -> Option<Vec<RowMutation>> {
        self.rows.read().ok()?.get(row_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl WideColumnStore for MemoryWideColumnStore {
    async fn append_row(&self, row_key: &str, mutation: &RowMutation) -> Result<(), StoreError> {
        self.outage.check("wide-column store")?;
        let mut rows = self.rows.write().map_err(poisoned)?;
        rows.entry(row_key.to_string())
            .or_default()
            .push(mutation.clone());
        Ok(())
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Unavailable("in-memory store lock poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Location;
    use chrono::Utc;
    use uuid::Uuid;

    fn post_at(lat: f64, lon: f64) -> Post {
        Post {
            id: Uuid::new_v4(),
            user: "alice".to_string(),
            message: "hi".to_string(),
            url: String::new(),
            location: Location::new(lat, lon),
            face: None,
        }
    }

    #[test]
    fn test_haversine_known_distance() {
        // San Francisco to Los Angeles is roughly 559 km
        let d = haversine_km(37.7749, -122.4194, 34.0522, -118.2437);
        assert!((d - 559.0).abs() < 5.0, "got {d}");
        assert_eq!(haversine_km(10.0, 10.0, 10.0, 10.0), 0.0);
    }

    #[tokio::test]
    async fn test_insert_if_absent_is_exclusive() {
        let store = MemoryCredentialStore::new();
        let record = CredentialRecord {
            username: "bob".to_string(),
            password_hash: "h".to_string(),
            age: 30,
            gender: "m".to_string(),
            created_at: Utc::now(),
        };

        assert_eq!(
            store.insert_if_absent(&record).await,
            Ok(InsertOutcome::Inserted)
        );
        assert_eq!(
            store.insert_if_absent(&record).await,
            Ok(InsertOutcome::AlreadyExists)
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_radius_query_filters_by_distance() {
        let index = MemoryPostIndex::new();
        let near = post_at(37.0, -122.0);
        let far = post_at(40.7, -74.0);
        index.index_now(&near).await.unwrap();
        index.index_now(&far).await.unwrap();

        let hits = index.query_by_radius(37.001, -122.001, 1.0).await.unwrap();
        assert_eq!(hits, vec![near]);
    }

    #[tokio::test]
    async fn test_offline_store_fails_calls() {
        let columns = MemoryWideColumnStore::new();
        columns.set_offline(true);

        let result = columns
            .append_row("row", &RowMutation::new(Utc::now()))
            .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert!(columns.is_empty());
    }

    #[tokio::test]
    async fn test_blob_acl_requires_object() {
        let blobs = MemoryBlobStore::new("bucket");
        assert!(blobs.set_public_readable("missing").await.is_err());

        blobs
            .put("k", Bytes::from_static(b"img"), "image/jpeg")
            .await
            .unwrap();
        blobs.set_public_readable("k").await.unwrap();

        let object = blobs.object("k").unwrap();
        assert!(object.public);
        assert_eq!(blobs.public_url("k"), "memory://bucket/k");
    }
}
