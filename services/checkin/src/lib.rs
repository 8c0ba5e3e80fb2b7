//! Around Check-in Service
//!
//! Location-aware social check-ins. Users sign up and log in for a bearer token,
//! publish short posts pinned to a coordinate (optionally with an image), and
//! search for posts within a radius of a point.
//!
//! ## Features
//!
//! - **Token Auth**: Argon2id password hashes, HS256 tokens with a 24 hour lifetime
//! - **Post Fanout**: One post id shared by the media object, the search document
//!   and the analytics row; partial writes are reported, never hidden
//! - **Geo Search**: Radius queries against a geo_point index, 200 km by default
//! - **Image Scoring**: Optional face probability from a hosted prediction model
//!
//! ## Architecture
//!
//! ```text
//!                     ┌──────────────┐
//!  /signup /login ───▶│ AuthService  │──────────▶ Credential index (Elasticsearch)
//!                     └──────────────┘
//!                            │ bearer token
//!                            ▼
//!                     ┌──────────────┐           ┌──────────────┐
//!  /post ────────────▶│ Ingest       │──────────▶│ S3 bucket    │
//!                     │ Pipeline     │           └──────────────┘
//!                     └──────────────┘
//!                       │         │  (concurrent)
//!                       ▼         ▼
//!             ┌──────────────┐ ┌──────────────┐
//!             │ Post index   │ │ post_cells   │
//!             │ (geo_point)  │ │ (ClickHouse) │
//!             └──────────────┘ └──────────────┘
//!                    ▲
//!                    │
//!                     ┌──────────────┐
//!  /search ──────────▶│ GeoQuery     │
//!                     │ Engine       │
//!                     └──────────────┘
//! ```

pub mod annotate;
pub mod api;
pub mod auth;
pub mod config;
pub mod ingest;
pub mod model;
pub mod query;
pub mod stores;

pub use annotate::{ImageAnnotator, PredictionClient};
pub use api::{create_router, start_api_server, AppState};
pub use auth::{AuthError, AuthService, Clock, SystemClock, TokenIssuer};
pub use config::Config;
pub use ingest::{IngestError, IngestOutcome, IngestPipeline, PostSubmission, SecondaryStore};
pub use model::{Account, Location, Post};
pub use query::{GeoQueryEngine, QueryError, SearchRequest};
pub use stores::{BlobStore, CredentialStore, PostIndex, StoreError, WideColumnStore};
