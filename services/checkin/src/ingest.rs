//! Post ingestion: one submission becomes a media object, an indexed document and
//! a row in the cell table, all keyed by the same freshly minted post id.
//!
//! The media upload is the only write that gates the rest. The two secondary
//! writes run concurrently and are not transactional: when one fails the other is
//! kept, and the outcome names what is missing so the caller can retry exactly
//! that write with [`IngestPipeline::write_secondary`]. Nothing reconciles the
//! stores in the background.

use crate::annotate::ImageAnnotator;
use crate::model::{Location, Post};
use crate::stores::{with_timeout, BlobStore, PostIndex, RowMutation, StoreError, WideColumnStore};
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Image attached to a submission
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub body: Bytes,
    pub content_type: String,
}

/// Decoded post request, before it has an id
#[derive(Debug, Clone)]
pub struct PostSubmission {
    pub message: String,
    pub location: Location,
    pub media: Option<MediaUpload>,
}

impl PostSubmission {
    /// Build from raw form values; bad coordinates land on 0.0 (see [`Location::from_raw`])
    pub fn from_fields(
        message: Option<String>,
        lat: Option<&str>,
        lon: Option<&str>,
        media: Option<MediaUpload>,
    ) -> Self {
        Self {
            message: message.unwrap_or_default(),
            location: Location::from_raw(lat, lon),
            media: media.filter(|m| !m.body.is_empty()),
        }
    }
}

/// Stores written after the media upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecondaryStore {
    DocumentIndex,
    WideColumn,
}

impl SecondaryStore {
    pub const ALL: [SecondaryStore; 2] = [SecondaryStore::DocumentIndex, SecondaryStore::WideColumn];
}

impl fmt::Display for SecondaryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecondaryStore::DocumentIndex => write!(f, "document_index"),
            SecondaryStore::WideColumn => write!(f, "wide_column"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Media (if any) and every secondary store hold the post
    Complete(Post),
    /// The post exists in some stores; `missing` lists the secondary writes that failed
    Partial {
        post: Post,
        missing: BTreeSet<SecondaryStore>,
    },
}

impl IngestOutcome {
    pub fn post(&self) -> &Post {
        match self {
            IngestOutcome::Complete(post) | IngestOutcome::Partial { post, .. } => post,
        }
    }

    /// Treat a partial write as an error
    pub fn into_result(self) -> Result<Post, IngestError> {
        match self {
            IngestOutcome::Complete(post) => Ok(post),
            IngestOutcome::Partial { post, missing } => Err(IngestError::PartialWrite {
                post: Box::new(post),
                missing,
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    /// Upload or ACL change failed; nothing was written downstream
    #[error("media upload failed: {0}")]
    BlobStoreFailed(StoreError),

    #[error("post {} is missing from {missing:?}", .post.id)]
    PartialWrite {
        post: Box<Post>,
        missing: BTreeSet<SecondaryStore>,
    },
}

pub struct IngestPipeline {
    blobs: Arc<dyn BlobStore>,
    index: Arc<dyn PostIndex>,
    columns: Arc<dyn WideColumnStore>,
    annotator: Option<Arc<dyn ImageAnnotator>>,
    store_timeout: Duration,
}

impl IngestPipeline {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        index: Arc<dyn PostIndex>,
        columns: Arc<dyn WideColumnStore>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            blobs,
            index,
            columns,
            annotator: None,
            store_timeout,
        }
    }

    /// Score uploaded images with the given annotator
    pub fn with_annotator(mut self, annotator: Arc<dyn ImageAnnotator>) -> Self {
        self.annotator = Some(annotator);
        self
    }

    /// Turn one submission by `author` into a stored post
    #[instrument(skip(self, submission), fields(author = %author))]
    pub async fn submit(
        &self,
        author: &str,
        submission: PostSubmission,
    ) -> Result<IngestOutcome, IngestError> {
        let id = Uuid::new_v4();
        let PostSubmission {
            message,
            location,
            media,
        } = submission;

        let mut post = Post {
            id,
            user: author.to_string(),
            message,
            url: String::new(),
            location,
            face: None,
        };

        if let Some(media) = media {
            post.url = self.upload_media(&id, &media).await.map_err(|e| {
                warn!(post_id = %id, error = %e, "Media upload failed, post dropped");
                metrics::counter!("checkin.posts.rejected").increment(1);
                IngestError::BlobStoreFailed(e)
            })?;
            post.face = self.annotate(&id, &media).await;
        }

        let missing = self.fan_out(&post).await;

        if missing.is_empty() {
            info!(post_id = %id, has_media = !post.url.is_empty(), "Post stored");
            metrics::counter!("checkin.posts.created").increment(1);
            Ok(IngestOutcome::Complete(post))
        } else {
            warn!(post_id = %id, missing = ?missing, "Post stored partially");
            metrics::counter!("checkin.posts.partial").increment(1);
            Ok(IngestOutcome::Partial { post, missing })
        }
    }

    /// Write `post` to one secondary store
    pub async fn write_secondary(
        &self,
        post: &Post,
        store: SecondaryStore,
    ) -> Result<(), StoreError> {
        match store {
            SecondaryStore::DocumentIndex => {
                with_timeout(self.store_timeout, self.index.index_now(post)).await
            }
            SecondaryStore::WideColumn => {
                let mutation = RowMutation::for_post(post, Utc::now());
                let row_key = post.id.to_string();
                with_timeout(
                    self.store_timeout,
                    self.columns.append_row(&row_key, &mutation),
                )
                .await
            }
        }
    }

    async fn fan_out(&self, post: &Post) -> BTreeSet<SecondaryStore> {
        let (indexed, appended) = tokio::join!(
            self.write_secondary(post, SecondaryStore::DocumentIndex),
            self.write_secondary(post, SecondaryStore::WideColumn),
        );

        let mut missing = BTreeSet::new();
        for (store, result) in [
            (SecondaryStore::DocumentIndex, indexed),
            (SecondaryStore::WideColumn, appended),
        ] {
            match result {
                Ok(()) => debug!(post_id = %post.id, %store, "Secondary write done"),
                Err(e) => {
                    warn!(post_id = %post.id, %store, error = %e, "Secondary write failed");
                    missing.insert(store);
                }
            }
        }
        missing
    }

    /// Upload under the post id, open it for public reads, return its locator
    async fn upload_media(&self, id: &Uuid, media: &MediaUpload) -> Result<String, StoreError> {
        let key = id.to_string();
        let started = Instant::now();

        with_timeout(
            self.store_timeout,
            self.blobs
                .put(&key, media.body.clone(), &media.content_type),
        )
        .await?;
        with_timeout(self.store_timeout, self.blobs.set_public_readable(&key)).await?;

        metrics::histogram!("checkin.blob.upload.duration_seconds")
            .record(started.elapsed().as_secs_f64());
        metrics::counter!("checkin.blob.bytes.uploaded").increment(media.body.len() as u64);

        Ok(self.blobs.public_url(&key))
    }

    async fn annotate(&self, id: &Uuid, media: &MediaUpload) -> Option<f64> {
        let annotator = self.annotator.as_ref()?;

        match tokio::time::timeout(self.store_timeout, annotator.face_probability(&media.body)).await {
            Ok(Ok(score)) => Some(score),
            Ok(Err(e)) => {
                warn!(post_id = %id, error = %e, "Image annotation failed");
                None
            }
            Err(_) => {
                warn!(post_id = %id, "Image annotation timed out");
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::annotate::{AnnotateError, MockImageAnnotator};
    use crate::stores::{
        MemoryBlobStore, MemoryPostIndex, MemoryWideColumnStore, MockBlobStore, FAMILY_POST,
    };

    pub(crate) struct Harness {
        pub blobs: Arc<MemoryBlobStore>,
        pub index: Arc<MemoryPostIndex>,
        pub columns: Arc<MemoryWideColumnStore>,
        pub pipeline: IngestPipeline,
    }

    pub(crate) fn harness() -> Harness {
        let blobs = Arc::new(MemoryBlobStore::new("post-images"));
        let index = Arc::new(MemoryPostIndex::new());
        let columns = Arc::new(MemoryWideColumnStore::new());
        let pipeline = IngestPipeline::new(
            blobs.clone(),
            index.clone(),
            columns.clone(),
            Duration::from_secs(1),
        );
        Harness {
            blobs,
            index,
            columns,
            pipeline,
        }
    }

    fn jpeg() -> MediaUpload {
        MediaUpload {
            body: Bytes::from_static(&[0xff, 0xd8, 0xff, 0xe0, 1, 2, 3]),
            content_type: "image/jpeg".to_string(),
        }
    }

    fn submission(media: Option<MediaUpload>) -> PostSubmission {
        PostSubmission {
            message: "hello".to_string(),
            location: Location::new(37.0, -122.0),
            media,
        }
    }

    #[tokio::test]
    async fn test_submit_without_media() {
        let h = harness();
        let post = h
            .pipeline
            .submit("alice", submission(None))
            .await
            .unwrap()
            .into_result()
            .unwrap();

        assert!(post.url.is_empty());
        assert_eq!(post.user, "alice");
        assert!(h.index.contains(&post.id));

        let row = h.columns.row(&post.id.to_string()).unwrap();
        assert_eq!(row.len(), 1);
        assert_eq!(row[0].get(FAMILY_POST, "message"), Some("hello"));
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let h = harness();
        let mut ids = BTreeSet::new();
        for _ in 0..50 {
            let outcome = h.pipeline.submit("alice", submission(None)).await.unwrap();
            assert!(ids.insert(outcome.post().id));
        }
        assert_eq!(h.index.len(), 50);
    }

    #[tokio::test]
    async fn test_media_is_uploaded_public_under_post_id() {
        let h = harness();
        let post = h
            .pipeline
            .submit("alice", submission(Some(jpeg())))
            .await
            .unwrap()
            .into_result()
            .unwrap();

        let key = post.id.to_string();
        let object = h.blobs.object(&key).unwrap();
        assert!(object.public);
        assert_eq!(object.content_type, "image/jpeg");
        assert_eq!(object.body, jpeg().body);
        assert_eq!(post.url, format!("memory://post-images/{key}"));

        let row = h.columns.row(&key).unwrap();
        assert_eq!(row[0].get(FAMILY_POST, "url"), Some(post.url.as_str()));
    }

    #[tokio::test]
    async fn test_blob_outage_leaves_no_artifacts() {
        let h = harness();
        h.blobs.set_offline(true);

        let result = h.pipeline.submit("alice", submission(Some(jpeg()))).await;

        assert!(matches!(result, Err(IngestError::BlobStoreFailed(_))));
        assert!(h.index.is_empty());
        assert!(h.columns.is_empty());
    }

    #[tokio::test]
    async fn test_acl_rejection_aborts_submission() {
        let h = harness();
        h.blobs.set_reject_acl(true);

        let result = h.pipeline.submit("alice", submission(Some(jpeg()))).await;

        assert!(matches!(
            result,
            Err(IngestError::BlobStoreFailed(StoreError::Rejected(_)))
        ));
        assert!(h.index.is_empty());
        assert!(h.columns.is_empty());
    }

    #[tokio::test]
    async fn test_media_key_is_post_id() {
        let mut blobs = MockBlobStore::new();
        blobs
            .expect_put()
            .withf(|key, body, content_type| {
                Uuid::parse_str(key).is_ok() && body.len() == 7 && content_type.starts_with("image/jpeg")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        blobs
            .expect_set_public_readable()
            .times(1)
            .returning(|_| Ok(()));
        blobs
            .expect_public_url()
            .returning(|key| format!("https://cdn.example/{key}"));

        let pipeline = IngestPipeline::new(
            Arc::new(blobs),
            Arc::new(MemoryPostIndex::new()),
            Arc::new(MemoryWideColumnStore::new()),
            Duration::from_secs(1),
        );

        let post = pipeline
            .submit("alice", submission(Some(jpeg())))
            .await
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(post.url, format!("https://cdn.example/{}", post.id));
    }

    /// Blob store whose every call outlives any sane store timeout
    struct StalledBlobStore;

    #[async_trait::async_trait]
    impl BlobStore for StalledBlobStore {
        async fn put(&self, _: &str, _: Bytes, _: &str) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }

        async fn set_public_readable(&self, _: &str) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }

        fn public_url(&self, key: &str) -> String {
            format!("stalled://{key}")
        }
    }

    #[tokio::test]
    async fn test_stalled_upload_times_out_without_artifacts() {
        let index = Arc::new(MemoryPostIndex::new());
        let columns = Arc::new(MemoryWideColumnStore::new());
        let pipeline = IngestPipeline::new(
            Arc::new(StalledBlobStore),
            index.clone(),
            columns.clone(),
            Duration::from_millis(20),
        );

        let result = pipeline.submit("alice", submission(Some(jpeg()))).await;

        assert!(matches!(
            result,
            Err(IngestError::BlobStoreFailed(StoreError::Timeout(_)))
        ));
        assert!(index.is_empty());
        assert!(columns.is_empty());
    }

    #[tokio::test]
    async fn test_index_failure_is_partial() {
        let h = harness();
        h.index.set_offline(true);

        let outcome = h.pipeline.submit("alice", submission(None)).await.unwrap();

        match &outcome {
            IngestOutcome::Partial { post, missing } => {
                assert_eq!(
                    missing.iter().copied().collect::<Vec<_>>(),
                    vec![SecondaryStore::DocumentIndex]
                );
                // The sibling write is kept
                assert!(h.columns.row(&post.id.to_string()).is_some());
            }
            other => panic!("expected partial outcome, got {other:?}"),
        }

        let err = outcome.clone().into_result().unwrap_err();
        assert!(matches!(err, IngestError::PartialWrite { .. }));
    }

    #[tokio::test]
    async fn test_missing_write_can_be_retried() {
        let h = harness();
        h.columns.set_offline(true);

        let outcome = h.pipeline.submit("alice", submission(None)).await.unwrap();
        let IngestOutcome::Partial { post, missing } = outcome else {
            panic!("expected partial outcome");
        };
        assert!(missing.contains(&SecondaryStore::WideColumn));
        assert!(h.index.contains(&post.id));

        h.columns.set_offline(false);
        for store in missing {
            h.pipeline.write_secondary(&post, store).await.unwrap();
        }
        assert!(h.columns.row(&post.id.to_string()).is_some());
    }

    #[tokio::test]
    async fn test_both_secondaries_failing() {
        let h = harness();
        h.index.set_offline(true);
        h.columns.set_offline(true);

        let outcome = h.pipeline.submit("alice", submission(None)).await.unwrap();
        let IngestOutcome::Partial { missing, .. } = outcome else {
            panic!("expected partial outcome");
        };
        assert_eq!(missing, SecondaryStore::ALL.into_iter().collect::<BTreeSet<_>>());
    }

    #[tokio::test]
    async fn test_annotator_score_recorded() {
        let mut annotator = MockImageAnnotator::new();
        annotator
            .expect_face_probability()
            .times(1)
            .returning(|_| Ok(0.87));

        let h = harness();
        let pipeline = h.pipeline.with_annotator(Arc::new(annotator));
        let outcome = pipeline.submit("alice", submission(Some(jpeg()))).await.unwrap();

        assert_eq!(outcome.post().face, Some(0.87));
    }

    #[tokio::test]
    async fn test_annotator_failure_is_not_fatal() {
        let mut annotator = MockImageAnnotator::new();
        annotator
            .expect_face_probability()
            .returning(|_| Err(AnnotateError::EmptyResponse));

        let h = harness();
        let pipeline = h.pipeline.with_annotator(Arc::new(annotator));
        let post = pipeline
            .submit("alice", submission(Some(jpeg())))
            .await
            .unwrap()
            .into_result()
            .unwrap();

        assert_eq!(post.face, None);
        assert!(!post.url.is_empty());
    }

    #[tokio::test]
    async fn test_annotator_skipped_without_media() {
        let mut annotator = MockImageAnnotator::new();
        annotator.expect_face_probability().never();

        let h = harness();
        let pipeline = h.pipeline.with_annotator(Arc::new(annotator));
        pipeline.submit("alice", submission(None)).await.unwrap();
    }

    #[test]
    fn test_from_fields_applies_coordinate_policy() {
        let empty_media = MediaUpload {
            body: Bytes::new(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
        };
        let submission =
            PostSubmission::from_fields(None, Some("abc"), Some("-122"), Some(empty_media));

        assert_eq!(submission.message, "");
        assert_eq!(submission.location, Location::new(0.0, -122.0));
        assert!(submission.media.is_none());
    }
}
