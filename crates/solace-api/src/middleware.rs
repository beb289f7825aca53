use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tracing::debug;
use uuid::Uuid;

use solace_types::api::Claims;

use crate::AppState;
use crate::error::ApiError;

/// Extract and validate the bearer JWT; handlers read the `Claims` extension.
pub async fn require_auth(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(TypedHeader(Authorization(bearer))) = bearer else {
        return Err(ApiError::Unauthorized);
    };
    let claims = decode_token(&state.jwt_secret, bearer.token()).ok_or(ApiError::Unauthorized)?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

/// Returns the claims of a valid, unexpired token.
pub fn decode_token(secret: &str, token: &str) -> Option<Claims> {
    match decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &Validation::default()) {
        Ok(data) => Some(data.claims),
        Err(e) => {
            debug!("Rejected token: {}", e);
            None
        }
    }
}

/// Issues a token for `user_id`. Sessions are owned by the identity service;
/// this exists for provisioning scripts and tests.
pub fn issue_token(secret: &str, user_id: Uuid, ttl: Duration) -> anyhow::Result<String> {
    let exp = SystemTime::now().duration_since(UNIX_EPOCH)? + ttl;
    let claims = Claims {
        sub: user_id,
        exp: exp.as_secs() as usize,
    };
    Ok(encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))?)
}
