use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Unauthorized: {0}")]
    Unauthorized(anyhow::Error),

    #[error("Forbidden: {0}")]
    Forbidden(anyhow::Error),

    #[error("Authentication error: {0}")]
    AuthError(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    /// A business rule rejected the whole operation. Each violation names the
    /// row or entity that caused it.
    #[error("{message} ({} violation(s))", violations.len())]
    BusinessRule {
        message: String,
        violations: Vec<String>,
    },

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Service Unavailable")]
    ServiceUnavailable,

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl AppError {
    pub fn business_rule(message: impl Into<String>, violations: Vec<String>) -> Self {
        AppError::BusinessRule {
            message: message.into(),
            violations,
        }
    }

    /// Short label used for error metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) => "validation_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::Unauthorized(_) | AppError::AuthError(_) => "unauthorized",
            AppError::Forbidden(_) => "forbidden",
            AppError::Conflict(_) => "conflict",
            AppError::BusinessRule { .. } => "business_rule",
            AppError::InternalError(_) => "internal_error",
            AppError::ServiceUnavailable => "service_unavailable",
            AppError::DatabaseError(_) => "db_error",
            AppError::ConfigError(_) => "config_error",
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            details: Option<String>,
            #[serde(skip_serializing_if = "Vec::is_empty")]
            violations: Vec<String>,
        }

        let (status, error_message, details, violations) = match self {
            AppError::ValidationError(err) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "Validation error".to_string(),
                Some(err.to_string()),
                Vec::new(),
            ),
            AppError::BadRequest(err) => {
                (StatusCode::BAD_REQUEST, err.to_string(), None, Vec::new())
            }
            AppError::NotFound(err) => (StatusCode::NOT_FOUND, err.to_string(), None, Vec::new()),
            AppError::Unauthorized(err) => {
                (StatusCode::UNAUTHORIZED, err.to_string(), None, Vec::new())
            }
            AppError::Forbidden(err) => (StatusCode::FORBIDDEN, err.to_string(), None, Vec::new()),
            AppError::AuthError(err) => {
                (StatusCode::UNAUTHORIZED, err.to_string(), None, Vec::new())
            }
            AppError::Conflict(err) => (StatusCode::CONFLICT, err.to_string(), None, Vec::new()),
            AppError::BusinessRule {
                message,
                violations,
            } => (StatusCode::UNPROCESSABLE_ENTITY, message, None, violations),
            AppError::InternalError(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                Some(format!("{:#?}", err)),
                Vec::new(),
            ),
            AppError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable".to_string(),
                None,
                Vec::new(),
            ),
            AppError::DatabaseError(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
                Some(err.to_string()),
                Vec::new(),
            ),
            AppError::ConfigError(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Configuration error".to_string(),
                Some(err.to_string()),
                Vec::new(),
            ),
        };

        (
            status,
            Json(ErrorResponse {
                error: error_message,
                details,
                violations,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_rule_maps_to_unprocessable_entity() {
        let err = AppError::business_rule(
            "Import rejected",
            vec!["Row 2: duplicate driver id D-1".to_string()],
        );
        assert_eq!(err.kind(), "business_rule");
        assert_eq!(err.to_string(), "Import rejected (1 violation(s))");

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn conflict_maps_to_409() {
        let response = AppError::Conflict(anyhow::anyhow!("busy")).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
