use axum::{
    body::Body,
    extract::State,
    http::{Request, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::{error::ApiError, state::AppState};

/// Bearer-token guard for operator and device routes. Without a configured
/// token every request passes.
pub async fn api_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected_token) = state.config.api_token.as_deref() else {
        return Ok(next.run(req).await);
    };

    let Some(provided_token) = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
    else {
        return Err(ApiError::unauthorized(
            "missing or invalid Authorization header",
        ));
    };

    if !constant_time_eq(expected_token.as_bytes(), provided_token.as_bytes()) {
        return Err(ApiError::unauthorized("invalid token"));
    }

    Ok(next.run(req).await)
}

fn bearer_token(value: &str) -> Option<&str> {
    let trimmed = value.trim_start();
    let scheme = trimmed.get(..7)?;
    if scheme.eq_ignore_ascii_case("bearer ") {
        trimmed.get(7..).map(str::trim)
    } else {
        None
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bearer_token_case_insensitively() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer   abc "), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bear"), None);
    }
}
