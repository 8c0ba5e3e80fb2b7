use super::AuthError;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Bearer token claims
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Username the token was issued to
    pub sub: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

/// Signed token handed back by a successful login
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Mints and checks HS256 tokens with one symmetric key.
///
/// Both directions take the instant explicitly so expiry never depends on the
/// wall clock of whoever calls them.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(signing_key: &[u8], ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(signing_key),
            decoding_key: DecodingKey::from_secret(signing_key),
            ttl,
        }
    }

    pub fn issue_at(&self, subject: &str, now: DateTime<Utc>) -> Result<IssuedToken, AuthError> {
        let expires_at = now
            .checked_add_signed(self.ttl)
            .ok_or_else(|| AuthError::Internal("token expiry is out of range".to_string()))?;
        let claims = Claims {
            sub: subject.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(format!("failed to sign token: {e}")))?;

        Ok(IssuedToken { token, expires_at })
    }

    /// Check signature, algorithm and `now < exp`
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is compared against `now` below instead of the system clock
        validation.validate_exp = false;
        validation.leeway = 0;

        let claims = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|_| AuthError::InvalidToken)?
            .claims;

        if now.timestamp() >= claims.exp || claims.sub.is_empty() {
            return Err(AuthError::InvalidToken);
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(KEY, Duration::hours(24))
    }

    fn minted_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_round_trip_subject() {
        let issued = issuer().issue_at("alice", minted_at()).unwrap();
        let claims = issuer().verify_at(&issued.token, minted_at()).unwrap();

        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.exp - claims.iat, 24 * 60 * 60);
        assert_eq!(issued.expires_at, minted_at() + Duration::hours(24));
    }

    #[test]
    fn test_expiry_boundary() {
        let t = minted_at();
        let issued = issuer().issue_at("alice", t).unwrap();

        let almost = t + Duration::hours(23) + Duration::minutes(59);
        assert!(issuer().verify_at(&issued.token, almost).is_ok());

        let after = t + Duration::hours(24) + Duration::minutes(1);
        assert!(matches!(
            issuer().verify_at(&issued.token, after),
            Err(AuthError::InvalidToken)
        ));

        // Exactly at exp the token is already expired
        let at_exp = t + Duration::hours(24);
        assert!(issuer().verify_at(&issued.token, at_exp).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let issued = issuer().issue_at("alice", minted_at()).unwrap();
        let other = TokenIssuer::new(b"another-key-another-key-another-", Duration::hours(24));

        assert!(matches!(
            other.verify_at(&issued.token, minted_at()),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let issued = issuer().issue_at("alice", minted_at()).unwrap();
        let mut tampered = issued.token.clone();
        tampered.push('x');

        assert!(issuer().verify_at(&tampered, minted_at()).is_err());
        assert!(issuer().verify_at("not-a-token", minted_at()).is_err());
    }

    #[test]
    fn test_expiry_overflow_is_an_error() {
        let issuer = TokenIssuer::new(KEY, Duration::days(365 * 1000));
        let far_future = Utc.with_ymd_and_hms(262_000, 1, 1, 0, 0, 0).unwrap();

        assert!(matches!(
            issuer.issue_at("alice", far_future),
            Err(AuthError::Internal(_))
        ));
    }

    #[test]
    fn test_other_algorithm_rejected() {
        let claims = Claims {
            sub: "mallory".to_string(),
            iat: minted_at().timestamp(),
            exp: (minted_at() + Duration::hours(1)).timestamp(),
        };
        let token = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(KEY),
        )
        .unwrap();

        assert!(issuer().verify_at(&token, minted_at()).is_err());
    }
}
