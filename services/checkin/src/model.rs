use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

pub const MAX_LATITUDE: f64 = 90.0;
pub const MAX_LONGITUDE: f64 = 180.0;

/// Geographic point, serialized in the `{lat, lon}` form a geo_point field accepts
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

impl Location {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Build a location from raw request values.
    ///
    /// Missing, unparsable, non-finite or out-of-range values fall back to `0.0`
    /// for that axis, so a bad request lands on the origin instead of failing.
    pub fn from_raw(lat: Option<&str>, lon: Option<&str>) -> Self {
        Self {
            lat: parse_coordinate("lat", lat, MAX_LATITUDE),
            lon: parse_coordinate("lon", lon, MAX_LONGITUDE),
        }
    }
}

/// A published check-in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    /// Shared primary key across blob store, document index and cell table
    pub id: Uuid,
    /// Author username
    pub user: String,
    pub message: String,
    /// Public media locator, empty when the post carries no image
    #[serde(default)]
    pub url: String,
    pub location: Location,
    /// Face probability reported by the image annotator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face: Option<f64>,
}

/// Signup input
#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub age: i32,
    #[serde(default)]
    pub gender: String,
}

impl Account {
    /// Username a signup is allowed to claim: one or more of `[a-z0-9_]`
    pub fn is_valid_username(username: &str) -> bool {
        !username.is_empty()
            && username
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    }
}

/// Account as held by the credential store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub username: String,
    /// Argon2 PHC string, salt included
    pub password_hash: String,
    #[serde(default)]
    pub age: i32,
    #[serde(default)]
    pub gender: String,
    pub created_at: DateTime<Utc>,
}

fn parse_coordinate(field: &str, raw: Option<&str>, limit: f64) -> f64 {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        warn!(field, "Coordinate missing, defaulting to 0.0");
        return 0.0;
    };

    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() && value.abs() <= limit => value,
        Ok(value) => {
            warn!(field, value, "Coordinate out of range, defaulting to 0.0");
            0.0
        }
        Err(_) => {
            warn!(field, raw, "Coordinate is not a number, defaulting to 0.0");
            0.0
        }
    }
}
