use super::{CredentialStore, InsertOutcome, PostIndex, StoreError};
use crate::config::ElasticsearchConfig;
use crate::model::{CredentialRecord, Post};
use ::elasticsearch::{
    http::transport::{SingleNodeConnectionPool, TransportBuilder},
    http::response::Response,
    indices::{IndicesCreateParts, IndicesExistsParts},
    params::Refresh,
    CreateParts, Elasticsearch, GetParts, IndexParts, SearchParts,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, instrument};
use url::Url;

/// Build a client for a single Elasticsearch node
pub fn connect(url: &str, timeout: Duration) -> Result<Elasticsearch, StoreError> {
    let parsed = Url::parse(url)
        .map_err(|e| StoreError::Unavailable(format!("invalid Elasticsearch URL {url}: {e}")))?;
    let pool = SingleNodeConnectionPool::new(parsed);
    let transport = TransportBuilder::new(pool)
        .timeout(timeout)
        .build()
        .map_err(|e| StoreError::Unavailable(format!("failed to build transport: {e}")))?;
    Ok(Elasticsearch::new(transport))
}

/// Post documents in one index with `location` mapped as geo_point
#[derive(Clone)]
pub struct EsPostIndex {
    client: Elasticsearch,
    index: String,
    max_results: u32,
}

impl EsPostIndex {
    pub fn new(client: Elasticsearch, config: &ElasticsearchConfig) -> Self {
        Self {
            client,
            index: config.post_index.clone(),
            max_results: config.max_results,
        }
    }

    /// Create the index with its geo_point mapping unless it exists
    pub async fn ensure_index(&self) -> Result<(), StoreError> {
        let mapping = json!({
            "mappings": {
                "properties": {
                    "id": { "type": "keyword" },
                    "user": { "type": "keyword" },
                    "message": { "type": "text" },
                    "url": { "type": "keyword", "index": false },
                    "location": { "type": "geo_point" },
                    "face": { "type": "float" }
                }
            }
        });
        ensure_index(&self.client, &self.index, mapping).await
    }
}

#[async_trait]
impl PostIndex for EsPostIndex {
    #[instrument(skip(self, post), fields(index = %self.index, post_id = %post.id))]
    async fn index_now(&self, post: &Post) -> Result<(), StoreError> {
        let id = post.id.to_string();
        let response = self
            .client
            .index(IndexParts::IndexId(&self.index, &id))
            .refresh(Refresh::True)
            .body(post)
            .send()
            .await
            .map_err(transport_error)?;

        expect_success(response, "index post").await?;
        debug!("Post indexed");
        Ok(())
    }

    #[instrument(skip(self), fields(index = %self.index))]
    async fn query_by_radius(
        &self,
        lat: f64,
        lon: f64,
        radius_km: f64,
    ) -> Result<Vec<Post>, StoreError> {
        let index = [self.index.as_str()];
        let response = self
            .client
            .search(SearchParts::Index(&index))
            .body(geo_distance_query(lat, lon, radius_km, self.max_results))
            .send()
            .await
            .map_err(transport_error)?;

        let body = expect_success(response, "radius search").await?;
        let posts = decode_hits::<Post>(&body)?;
        debug!(hits = posts.len(), "Radius search finished");
        Ok(posts)
    }
}

/// Credential records, one document per username (the username is the document id)
#[derive(Clone)]
pub struct EsCredentialStore {
    client: Elasticsearch,
    index: String,
}

impl EsCredentialStore {
    pub fn new(client: Elasticsearch, config: &ElasticsearchConfig) -> Self {
        Self {
            client,
            index: config.user_index.clone(),
        }
    }

    pub async fn ensure_index(&self) -> Result<(), StoreError> {
        let mapping = json!({
            "mappings": {
                "properties": {
                    "username": { "type": "keyword" },
                    "password_hash": { "type": "keyword", "index": false },
                    "age": { "type": "integer" },
                    "gender": { "type": "keyword" },
                    "created_at": { "type": "date" }
                }
            }
        });
        ensure_index(&self.client, &self.index, mapping).await
    }
}

#[async_trait]
impl CredentialStore for EsCredentialStore {
    #[instrument(skip(self), fields(index = %self.index))]
    async fn find_by_username(
        &self,
        username: &str,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        let response = self
            .client
            .get(GetParts::IndexId(&self.index, username))
            .send()
            .await
            .map_err(transport_error)?;

        if response.status_code().as_u16() == 404 {
            return Ok(None);
        }

        let body = expect_success(response, "get credential").await?;
        let document: GetResponse<CredentialRecord> =
            serde_json::from_str(&body).map_err(|e| StoreError::Decode(e.to_string()))?;

        let found = document.found;
        Ok(document
            .source
            .filter(|record| found && record.username == username))
    }

    #[instrument(skip(self, record), fields(index = %self.index, username = %record.username))]
    async fn insert_if_absent(
        &self,
        record: &CredentialRecord,
    ) -> Result<InsertOutcome, StoreError> {
        let response = self
            .client
            .create(CreateParts::IndexId(&self.index, &record.username))
            .refresh(Refresh::True)
            .body(record)
            .send()
            .await
            .map_err(transport_error)?;

        // _create answers 409 when the document id is already taken
        if response.status_code().as_u16() == 409 {
            return Ok(InsertOutcome::AlreadyExists);
        }

        expect_success(response, "create credential").await?;
        Ok(InsertOutcome::Inserted)
    }
}

async fn ensure_index(client: &Elasticsearch, index: &str, mapping: Value) -> Result<(), StoreError> {
    let exists_response = client
        .indices()
        .exists(IndicesExistsParts::Index(&[index]))
        .send()
        .await
        .map_err(transport_error)?;

    if exists_response.status_code().is_success() {
        return Ok(());
    }

    let response = client
        .indices()
        .create(IndicesCreateParts::Index(index))
        .body(mapping)
        .send()
        .await
        .map_err(transport_error)?;

    expect_success(response, "create index").await?;
    info!(index = %index, "Elasticsearch index created");
    Ok(())
}

/// Point-radius predicate over `location`; the radius is sent in kilometres
fn geo_distance_query(lat: f64, lon: f64, radius_km: f64, size: u32) -> Value {
    json!({
        "size": size,
        "query": {
            "geo_distance": {
                "distance": format!("{radius_km}km"),
                "location": { "lat": lat, "lon": lon }
            }
        }
    })
}

#[derive(Debug, Deserialize)]
struct SearchResponse<T> {
    hits: InnerHits<T>,
}

#[derive(Debug, Deserialize)]
struct InnerHits<T> {
    hits: Vec<Hit<T>>,
}

#[derive(Debug, Deserialize)]
struct Hit<T> {
    #[serde(rename = "_source")]
    source: Option<T>,
}

#[derive(Debug, Deserialize)]
struct GetResponse<T> {
    #[serde(default)]
    found: bool,
    #[serde(rename = "_source")]
    source: Option<T>,
}

/// Decode the `_source` of every hit, keeping the response order
fn decode_hits<T: DeserializeOwned>(body: &str) -> Result<Vec<T>, StoreError> {
    let response: SearchResponse<T> =
        serde_json::from_str(body).map_err(|e| StoreError::Decode(e.to_string()))?;
    Ok(response
        .hits
        .hits
        .into_iter()
        .filter_map(|hit| hit.source)
        .collect())
}

async fn expect_success(response: Response, operation: &str) -> Result<String, StoreError> {
    let status = response.status_code();
    let body = response.text().await.map_err(transport_error)?;

    if status.is_success() {
        Ok(body)
    } else if status.is_server_error() {
        Err(StoreError::Unavailable(format!("{operation} failed with {status}: {body}")))
    } else {
        Err(StoreError::Rejected(format!("{operation} failed with {status}: {body}")))
    }
}

fn transport_error(e: ::elasticsearch::Error) -> StoreError {
    match e.status_code() {
        Some(status) => StoreError::Rejected(format!("Elasticsearch returned {status}: {e}")),
        None => StoreError::Unavailable(e.to_string()),
    }
}
