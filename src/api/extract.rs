//! Building a [`RequestContext`] from request headers.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;

use super::envelope::ResultEnvelope;
use crate::orchestrator::{Principal, RequestContext};

pub const PRINCIPAL_HEADER: &str = "x-principal";
pub const TENANT_HEADER: &str = "x-tenant-id";
pub const TRIAL_TENANT_HEADER: &str = "x-trial-tenant";

type Rejection = (StatusCode, Json<ResultEnvelope<()>>);

fn reject(message: String) -> Rejection {
    (StatusCode::UNAUTHORIZED, Json(ResultEnvelope::error(message)))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, Rejection> {
    headers
        .get(name)
        .map(|v| v.to_str().map_err(|_| reject(format!("{} is not valid text", name))))
        .transpose()
}

/// `x-principal` is `system` or `user:<id>`.
fn parse_principal(raw: &str) -> Option<Principal> {
    if raw.eq_ignore_ascii_case("system") {
        return Some(Principal::System);
    }
    raw.strip_prefix("user:")
        .and_then(|id| id.trim().parse().ok())
        .map(Principal::User)
}

pub fn context_from_headers(headers: &HeaderMap) -> Result<RequestContext, Rejection> {
    let raw = header(headers, PRINCIPAL_HEADER)?
        .ok_or_else(|| reject(format!("missing {} header", PRINCIPAL_HEADER)))?;
    let principal = parse_principal(raw)
        .ok_or_else(|| reject(format!("unrecognised principal '{}'", raw)))?;

    let tenant_id = match header(headers, TENANT_HEADER)? {
        Some(raw) => Some(
            raw.trim()
                .parse::<i64>()
                .map_err(|_| reject(format!("invalid {} '{}'", TENANT_HEADER, raw)))?,
        ),
        None => None,
    };
    let trial_tenant = header(headers, TRIAL_TENANT_HEADER)?
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false);

    Ok(RequestContext {
        principal,
        tenant_id,
        trial_tenant,
    })
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Rejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        context_from_headers(&parts.headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn test_user_context() {
        let ctx = context_from_headers(&headers(&[
            (PRINCIPAL_HEADER, "user:12"),
            (TENANT_HEADER, "7"),
            (TRIAL_TENANT_HEADER, "true"),
        ]))
        .unwrap();
        assert_eq!(ctx.principal, Principal::User(12));
        assert_eq!(ctx.tenant_id, Some(7));
        assert!(ctx.trial_tenant);
    }

    #[test]
    fn test_system_context() {
        let ctx = context_from_headers(&headers(&[(PRINCIPAL_HEADER, "SYSTEM")])).unwrap();
        assert!(ctx.is_system());
        assert!(!ctx.trial_tenant);
    }

    #[test]
    fn test_rejections() {
        assert!(context_from_headers(&HeaderMap::new()).is_err());
        assert!(context_from_headers(&headers(&[(PRINCIPAL_HEADER, "root")])).is_err());
        let (status, _) = context_from_headers(&headers(&[
            (PRINCIPAL_HEADER, "user:1"),
            (TENANT_HEADER, "seven"),
        ]))
        .unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
