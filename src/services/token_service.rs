//! One-time, purpose-bound download tokens.
//!
//! A token is an HS256 JWT binding `{jti, purpose, files, iat}` plus a row in
//! `one_time_tokens`. Verification checks the signed payload first and then
//! consumes the row with a single conditional update, so both the signature
//! age and the persisted expiry must hold for a token to be accepted once.

use crate::entities::one_time_tokens;
use crate::services::guard::Caller;
use crate::utils::clock::{Clock, SystemClock};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Tolerated clock drift for tokens that claim to be issued in the future
const ISSUED_AT_LEEWAY_SECS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenPurpose {
    DownloadFile,
    DownloadZip,
}

impl TokenPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenPurpose::DownloadFile => "download_file",
            TokenPurpose::DownloadZip => "download_zip",
        }
    }
}

impl fmt::Display for TokenPurpose {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("Token expired")]
    Expired,

    #[error("Token invalid")]
    Invalid,

    #[error("Token issued for a different purpose")]
    PurposeMismatch,

    #[error("Token issued for a different resource")]
    ResourceMismatch,

    #[error("Token already used or unknown")]
    AlreadyUsed,

    #[error("Token store error: {0}")]
    Store(String),
}

impl From<sea_orm::DbErr> for TokenError {
    fn from(e: sea_orm::DbErr) -> Self {
        TokenError::Store(e.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    jti: String,
    purpose: String,
    files: String,
    iat: i64,
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub id: String,
    pub expires_at: DateTime<Utc>,
}

pub struct TokenService {
    db: DatabaseConnection,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    clock: Arc<dyn Clock>,
}

impl TokenService {
    pub fn new(db: DatabaseConnection, secret: &str) -> Self {
        Self {
            db,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Persists an unused token record and signs a payload bound to `resource`.
    pub async fn issue(
        &self,
        caller: &Caller,
        purpose: TokenPurpose,
        resource: &str,
        ttl: Duration,
    ) -> Result<IssuedToken, TokenError> {
        let now = self.clock.now();
        let id = Uuid::new_v4().to_string();
        let expires_at = now + ttl;

        let record = one_time_tokens::ActiveModel {
            id: Set(id.clone()),
            purpose: Set(purpose.as_str().to_string()),
            created_at: Set(now),
            expires_at: Set(expires_at),
            used: Set(false),
        };
        record.insert(&self.db).await?;

        let claims = TokenClaims {
            jti: id.clone(),
            purpose: purpose.as_str().to_string(),
            files: resource.to_string(),
            iat: now.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| TokenError::Store(format!("signing failed: {}", e)))?;

        tracing::info!(
            "🎟️  Issued {} token {} for {} on {}",
            purpose,
            id,
            caller.identity(),
            resource
        );

        Ok(IssuedToken {
            token,
            id,
            expires_at,
        })
    }

    fn decode(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Age is checked against iat below, not a signed exp
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        decode::<TokenClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!("Token signature rejected: {}", e);
                TokenError::Invalid
            })
    }

    /// Verifies and consumes a token. Succeeds at most once per token.
    ///
    /// Failing checks never mark the token as used.
    pub async fn verify(
        &self,
        token: &str,
        expected: TokenPurpose,
        resource: &str,
        max_age: Duration,
    ) -> Result<(), TokenError> {
        let claims = self.decode(token)?;

        let now = self.clock.now();
        let age = now.timestamp() - claims.iat;
        if age < -ISSUED_AT_LEEWAY_SECS {
            return Err(TokenError::Invalid);
        }
        if age > max_age.num_seconds() {
            return Err(TokenError::Expired);
        }

        if claims.purpose != expected.as_str() {
            return Err(TokenError::PurposeMismatch);
        }

        if claims.files != resource {
            return Err(TokenError::ResourceMismatch);
        }

        let result = one_time_tokens::Entity::update_many()
            .col_expr(one_time_tokens::Column::Used, Expr::value(true))
            .filter(one_time_tokens::Column::Id.eq(claims.jti.as_str()))
            .filter(one_time_tokens::Column::Purpose.eq(expected.as_str()))
            .filter(one_time_tokens::Column::Used.eq(false))
            .filter(one_time_tokens::Column::ExpiresAt.gt(now))
            .exec(&self.db)
            .await?;

        if result.rows_affected != 1 {
            return Err(TokenError::AlreadyUsed);
        }

        tracing::debug!("Consumed {} token {}", expected, claims.jti);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purpose_strings() {
        assert_eq!(TokenPurpose::DownloadFile.as_str(), "download_file");
        assert_eq!(TokenPurpose::DownloadZip.to_string(), "download_zip");
    }
}
