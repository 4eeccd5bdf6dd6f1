//! Request-scoped identity handed to every core operation.

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, Request};
use axum::middleware;
use axum::response::Response;

use crate::config::USER_ID_HEADER;
use crate::error::ApiError;
use crate::layout::UserId;

/// Who is acting. Authentication and CSRF checks happened upstream; the core
/// trusts this value completely and never reads ambient state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: UserId,
}

impl RequestContext {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }
}

fn context_from_headers(headers: &HeaderMap) -> Option<RequestContext> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<UserId>().ok())
        .filter(|id| *id > 0)
        .map(RequestContext::new)
}

/// Attaches a [`RequestContext`] to API requests, rejecting those without one.
pub async fn identity_middleware(
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, ApiError> {
    if !req.uri().path().starts_with("/api/") {
        return Ok(next.run(req).await);
    }
    let Some(ctx) = context_from_headers(req.headers()) else {
        return Err(ApiError::Unauthorized(HeaderMap::new()));
    };
    req.extensions_mut().insert(ctx);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn parses_positive_user_ids_only() {
        let mut headers = HeaderMap::new();
        assert_eq!(context_from_headers(&headers), None);

        headers.insert(USER_ID_HEADER, HeaderValue::from_static(" 42 "));
        assert_eq!(context_from_headers(&headers), Some(RequestContext::new(42)));

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("0"));
        assert_eq!(context_from_headers(&headers), None);

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("abc"));
        assert_eq!(context_from_headers(&headers), None);
    }
}
