//! Caller identity for the messaging endpoints.
//!
//! Identity is always derived from the bearer token. The `x-user-id` header
//! that clients send is only cross-checked against it, never trusted.

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts},
};
use chrono::Utc;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    store::Store,
};

pub const USER_ID_HEADER: &str = "x-user-id";

/// Resolves bearer tokens to user ids through the session table.
#[derive(Clone, Debug)]
pub struct Authenticator {
    store: Store,
}

impl Authenticator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn authenticate(&self, token: &str) -> AppResult<Uuid> {
        let session = self
            .store
            .find_session(token)
            .await?
            .ok_or_else(|| AppError::authentication("bearer token is not recognised"))?;

        if !session.is_live_at(Utc::now()) {
            return Err(AppError::authentication("bearer token has expired or been revoked"));
        }

        Ok(session.user_id)
    }
}

/// The authenticated user making the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Uuid,
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    Authenticator: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;

        let authenticator = Authenticator::from_ref(state);
        let user_id = authenticator.authenticate(token).await?;

        if let Some(claimed) = claimed_user_id(parts)? {
            if claimed != user_id {
                tracing::warn!(%user_id, %claimed, "x-user-id does not match bearer token");
                return Err(AppError::authorization(
                    "x-user-id header does not match the authenticated user",
                ));
            }
        }

        tracing::trace!(%user_id, "caller authenticated");

        Ok(Caller { user_id })
    }
}

fn bearer_token(parts: &Parts) -> AppResult<&str> {
    let value = parts
        .headers
        .get(AUTHORIZATION)
        .ok_or_else(|| AppError::authentication("missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::authentication("Authorization header is not valid ASCII"))?;

    // Auth schemes are case-insensitive (RFC 7235).
    let token = value
        .split_once(' ')
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("Bearer"))
        .map(|(_, token)| token.trim())
        .ok_or_else(|| AppError::authentication("Authorization header must use the Bearer scheme"))?;

    if token.is_empty() {
        return Err(AppError::authentication("bearer token is empty"));
    }

    Ok(token)
}

fn claimed_user_id(parts: &Parts) -> AppResult<Option<Uuid>> {
    let Some(value) = parts.headers.get(USER_ID_HEADER) else {
        return Ok(None);
    };

    value
        .to_str()
        .ok()
        .and_then(|s| Uuid::parse_str(s.trim()).ok())
        .map(Some)
        .ok_or_else(|| AppError::validation("x-user-id header must be a UUID"))
}
