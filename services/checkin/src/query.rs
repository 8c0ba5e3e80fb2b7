//! Radius search over indexed posts.

use crate::model::{Location, Post};
use crate::stores::{with_timeout, PostIndex, StoreError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Radius used when a search names none
pub const DEFAULT_RADIUS_KM: f64 = 200.0;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("malformed range: {0:?}")]
    MalformedRange(String),

    #[error("document index unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchRequest {
    pub center: Location,
    pub radius_km: f64,
}

impl SearchRequest {
    /// Parse raw query values. Coordinates follow [`Location::from_raw`]; an absent
    /// or empty range means [`DEFAULT_RADIUS_KM`], anything else must be a positive
    /// number of kilometres.
    pub fn from_params(
        lat: Option<&str>,
        lon: Option<&str>,
        range: Option<&str>,
    ) -> Result<Self, QueryError> {
        let radius_km = match range.map(str::trim).filter(|r| !r.is_empty()) {
            None => DEFAULT_RADIUS_KM,
            Some(raw) => {
                let raw = raw.strip_suffix("km").unwrap_or(raw);
                match raw.parse::<f64>() {
                    Ok(km) if km.is_finite() && km > 0.0 => km,
                    _ => return Err(QueryError::MalformedRange(raw.to_string())),
                }
            }
        };

        Ok(Self {
            center: Location::from_raw(lat, lon),
            radius_km,
        })
    }
}

pub struct GeoQueryEngine {
    index: Arc<dyn PostIndex>,
    store_timeout: Duration,
}

impl GeoQueryEngine {
    pub fn new(index: Arc<dyn PostIndex>, store_timeout: Duration) -> Self {
        Self {
            index,
            store_timeout,
        }
    }

    /// Posts within the radius, in the order the index returns them
    #[instrument(skip(self), fields(lat = request.center.lat, lon = request.center.lon, radius_km = request.radius_km))]
    pub async fn search(&self, request: SearchRequest) -> Result<Vec<Post>, QueryError> {
        let posts = with_timeout(
            self.store_timeout,
            self.index.query_by_radius(
                request.center.lat,
                request.center.lon,
                request.radius_km,
            ),
        )
        .await
        .map_err(|e| {
            warn!(error = %e, "Radius query failed");
            QueryError::from(e)
        })?;

        debug!(hits = posts.len(), "Radius query done");
        metrics::counter!("checkin.search.requests").increment(1);
        metrics::histogram!("checkin.search.hits").record(posts.len() as f64);
        Ok(posts)
    }
}
