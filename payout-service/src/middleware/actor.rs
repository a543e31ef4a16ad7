use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;

/// Operator performing a ledger operation.
///
/// Taken from the `X-User-ID` header set by the trusted front end. Every
/// mutating route requires it; the id is what the audit trail records and
/// what credential re-entry is checked against.
#[derive(Debug, Clone)]
pub struct Actor(pub String);

impl Actor {
    pub fn id(&self) -> &str {
        &self.0
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let actor_id = parts
            .headers
            .get("X-User-ID")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                AppError::AuthError(anyhow::anyhow!(
                    "Missing X-User-ID header (required from BFF)"
                ))
            })?;

        tracing::Span::current().record("user_id", actor_id);

        Ok(Actor(actor_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(req: Request<()>) -> Result<Actor, AppError> {
        let (mut parts, _) = req.into_parts();
        Actor::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn header_becomes_actor() {
        let req = Request::builder()
            .header("X-User-ID", "ops-7")
            .body(())
            .unwrap();
        assert_eq!(extract(req).await.unwrap().id(), "ops-7");
    }

    #[tokio::test]
    async fn missing_or_blank_header_is_rejected() {
        let req = Request::builder().body(()).unwrap();
        assert!(matches!(extract(req).await, Err(AppError::AuthError(_))));

        let req = Request::builder().header("X-User-ID", "  ").body(()).unwrap();
        assert!(matches!(extract(req).await, Err(AppError::AuthError(_))));
    }
}
