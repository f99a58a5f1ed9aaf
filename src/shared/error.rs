use axum::{response::IntoResponse, Json};

use super::models::MeetingStatus;

/// Error surface of the lifecycle manager. Every variant has a fixed HTTP
/// mapping; `Unavailable` is the only transient (retryable) kind.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("concurrent bot limit reached ({0})")]
    LimitExceeded(i32),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition {
        from: MeetingStatus,
        to: MeetingStatus,
    },
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("orchestrator failed: {0}")]
    OrchestratorFailed(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("validation error: {0}")]
    Validation(String),
}

impl ManagerError {
    /// Stable machine-readable code carried in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::LimitExceeded(_) => "limit_exceeded",
            Self::Conflict(_) => "conflict",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::IllegalState(_) => "illegal_state",
            Self::NotFound(_) => "not_found",
            Self::Unavailable(_) => "unavailable",
            Self::OrchestratorFailed(_) => "orchestrator_failed",
            Self::Unauthorized => "unauthorized",
            Self::Validation(_) => "validation",
        }
    }
}

impl IntoResponse for ManagerError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        let status = match &self {
            Self::LimitExceeded(_)
            | Self::Conflict(_)
            | Self::IllegalTransition { .. }
            | Self::IllegalState(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::OrchestratorFailed(_) => StatusCode::BAD_GATEWAY,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
        };
        (
            status,
            Json(serde_json::json!({
                "error": self.code(),
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}

impl From<diesel::result::Error> for ManagerError {
    fn from(err: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error};
        match err {
            Error::NotFound => ManagerError::NotFound("record not found".to_string()),
            Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                ManagerError::Conflict(info.message().to_string())
            }
            other => ManagerError::Unavailable(other.to_string()),
        }
    }
}

impl From<diesel::r2d2::PoolError> for ManagerError {
    fn from(err: diesel::r2d2::PoolError) -> Self {
        ManagerError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for ManagerError {
    fn from(err: serde_json::Error) -> Self {
        ManagerError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    #[test]
    fn http_mapping() {
        let cases = [
            (ManagerError::LimitExceeded(1), StatusCode::CONFLICT),
            (
                ManagerError::Conflict("duplicate".into()),
                StatusCode::CONFLICT,
            ),
            (
                ManagerError::NotFound("meeting".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                ManagerError::Unavailable("pool".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ManagerError::OrchestratorFailed("create".into()),
                StatusCode::BAD_GATEWAY,
            ),
            (ManagerError::Unauthorized, StatusCode::UNAUTHORIZED),
            (
                ManagerError::Validation("bot_name".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                ManagerError::IllegalState("not live".into()),
                StatusCode::CONFLICT,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn diesel_not_found_maps_to_not_found() {
        let err: ManagerError = diesel::result::Error::NotFound.into();
        assert!(matches!(err, ManagerError::NotFound(_)));
    }
}
