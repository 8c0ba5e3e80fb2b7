use crate::auth::{AuthError, AuthService};
use crate::config::ApiConfig;
use crate::ingest::{
    IngestError, IngestPipeline, MediaUpload, PostSubmission, SecondaryStore, DEFAULT_CONTENT_TYPE,
};
use crate::model::{Account, Post};
use crate::query::{GeoQueryEngine, QueryError, SearchRequest};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub ingest: Arc<IngestPipeline>,
    pub query: Arc<GeoQueryEngine>,
}

/// Username taken from a verified bearer token
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub String);

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Raw search query values; parsing happens in [`SearchRequest::from_params`]
#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    pub lat: Option<String>,
    pub lon: Option<String>,
    pub range: Option<String>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    /// Post id, on partial writes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    /// Stores that do not hold the post, on partial writes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<Vec<SecondaryStore>>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>, code: &str) -> Self {
        Self {
            error: error.into(),
            code: code.to_string(),
            id: None,
            missing: None,
        }
    }
}

/// Every failure a handler can answer with
#[derive(Debug)]
pub enum ApiError {
    Signup(AuthError),
    Login(AuthError),
    Unauthorized,
    BadRequest(String),
    Ingest(IngestError),
    Query(QueryError),
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        ApiError::Ingest(e)
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        ApiError::Query(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            // Auth endpoints answer in plain text
            ApiError::Signup(AuthError::Validation(_)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Empty password or username",
            )
                .into_response(),
            ApiError::Signup(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Failed to add a new user").into_response()
            }
            ApiError::Login(AuthError::Internal(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Failed to issue token").into_response()
            }
            ApiError::Login(_) => {
                (StatusCode::FORBIDDEN, "Invalid password or username").into_response()
            }
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer")],
                "Unauthorized",
            )
                .into_response(),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(message, "BAD_REQUEST")),
            )
                .into_response(),
            ApiError::Ingest(IngestError::BlobStoreFailed(_)) => (
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse::new(
                    "Failed to store post media",
                    "BLOB_STORE_FAILED",
                )),
            )
                .into_response(),
            ApiError::Ingest(IngestError::PartialWrite { post, missing }) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    id: Some(post.id),
                    missing: Some(missing.into_iter().collect()),
                    ..ErrorResponse::new("Post was only partially stored", "PARTIAL_WRITE")
                }),
            )
                .into_response(),
            ApiError::Query(QueryError::MalformedRange(range)) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(
                    format!("range must be a positive number of kilometres, got {range:?}"),
                    "MALFORMED_RANGE",
                )),
            )
                .into_response(),
            ApiError::Query(QueryError::StoreUnavailable(_)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse::new(
                    "Search is temporarily unavailable",
                    "SEARCH_UNAVAILABLE",
                )),
            )
                .into_response(),
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        }
    } else {
        CorsLayer::new()
    };

    let protected = Router::new()
        .route("/post", post(create_post))
        .route("/search", get(search_posts))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/signup", post(signup))
        .route("/login", post(login))
        .merge(protected)
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Reject requests without a valid `Authorization: Bearer <token>`
async fn require_bearer(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim())
        .filter(|token| !token.is_empty())
        .ok_or(ApiError::Unauthorized)?;

    let username = state.auth.authorize(token).map_err(|_| {
        metrics::counter!("checkin.auth.token.rejected").increment(1);
        ApiError::Unauthorized
    })?;

    request.extensions_mut().insert(AuthenticatedUser(username));
    Ok(next.run(request).await)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "checkin-service"
    }))
}

#[instrument(skip_all)]
async fn signup(State(state): State<AppState>, body: Bytes) -> Result<&'static str, ApiError> {
    let account: Account = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "Undecodable signup body");
        ApiError::BadRequest("Cannot decode user data from client".to_string())
    })?;

    state.auth.signup(account).await.map_err(|e| {
        info!(error = %e, "Signup failed");
        ApiError::Signup(e)
    })?;

    Ok("User added successfully")
}

#[instrument(skip_all)]
async fn login(State(state): State<AppState>, body: Bytes) -> Result<String, ApiError> {
    let request: LoginRequest = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "Undecodable login body");
        ApiError::BadRequest("Cannot decode login data from client".to_string())
    })?;

    let issued = state
        .auth
        .login(&request.username, &request.password)
        .await
        .map_err(ApiError::Login)?;

    Ok(issued.token)
}

#[instrument(skip_all, fields(user = %user.0))]
async fn create_post(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    multipart: Multipart,
) -> Result<Json<Post>, ApiError> {
    let submission = read_submission(multipart).await?;

    let post = state
        .ingest
        .submit(&user.0, submission)
        .await?
        .into_result()
        .inspect_err(|e| error!(error = %e, "Post submission failed"))?;

    Ok(Json(post))
}

async fn read_submission(mut multipart: Multipart) -> Result<PostSubmission, ApiError> {
    let mut message = None;
    let mut lat = None;
    let mut lon = None;
    let mut media = None;

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "message" => message = Some(field.text().await.map_err(bad_multipart)?),
            "lat" => lat = Some(field.text().await.map_err(bad_multipart)?),
            "lon" => lon = Some(field.text().await.map_err(bad_multipart)?),
            "image" => {
                let content_type = field
                    .content_type()
                    .unwrap_or(DEFAULT_CONTENT_TYPE)
                    .to_string();
                let body = field.bytes().await.map_err(bad_multipart)?;
                media = Some(MediaUpload { body, content_type });
            }
            _ => {}
        }
    }

    Ok(PostSubmission::from_fields(
        message,
        lat.as_deref(),
        lon.as_deref(),
        media,
    ))
}

fn bad_multipart(e: axum::extract::multipart::MultipartError) -> ApiError {
    warn!(error = %e, "Malformed multipart body");
    ApiError::BadRequest(format!("malformed multipart body: {e}"))
}

#[instrument(skip(state))]
async fn search_posts(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<Post>>, ApiError> {
    let request = SearchRequest::from_params(
        params.lat.as_deref(),
        params.lon.as_deref(),
        params.range.as_deref(),
    )?;

    Ok(Json(state.query.search(request).await?))
}

/// Serve the API until `shutdown` resolves
pub async fn start_api_server<F>(state: AppState, config: &ApiConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting check-in API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
