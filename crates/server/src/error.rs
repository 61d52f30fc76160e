use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use relaydesk_core::errors::{ApplicationError, DomainError, InterfaceError};
use relaydesk_core::events::EventBusError;
use relaydesk_db::RepositoryError;
use serde::Serialize;
use tracing::{error, warn};

/// HTTP face of [`InterfaceError`].
#[derive(Debug)]
pub struct ApiError(pub InterfaceError);

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: &'static str,
    pub detail: String,
    pub correlation_id: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self(InterfaceError::BadRequest {
            message: message.into(),
            correlation_id: correlation_id.into(),
        })
    }

    pub fn unauthorized(message: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self(InterfaceError::Unauthorized {
            message: message.into(),
            correlation_id: correlation_id.into(),
        })
    }

    pub fn not_found(
        entity: &'static str,
        id: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self::from_application(
            ApplicationError::Domain(DomainError::NotFound { entity, id: id.into() }),
            correlation_id,
        )
    }

    pub fn from_application(error: ApplicationError, correlation_id: impl Into<String>) -> Self {
        Self(error.into_interface(correlation_id))
    }

    pub fn persistence(error: RepositoryError, correlation_id: impl Into<String>) -> Self {
        Self::from_application(ApplicationError::Persistence(error.to_string()), correlation_id)
    }

    pub fn event_bus(error: EventBusError, correlation_id: impl Into<String>) -> Self {
        Self::from_application(ApplicationError::Integration(error.to_string()), correlation_id)
    }

    pub fn status(&self) -> StatusCode {
        match self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self.0 {
            InterfaceError::BadRequest { .. } => "bad_request",
            InterfaceError::Unauthorized { .. } => "unauthorized",
            InterfaceError::NotFound { .. } => "not_found",
            InterfaceError::ServiceUnavailable { .. } => "service_unavailable",
            InterfaceError::Internal { .. } => "internal",
        }
    }
}

impl From<InterfaceError> for ApiError {
    fn from(value: InterfaceError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(
                event_name = "http.request.failed",
                correlation_id = %self.0.correlation_id(),
                status = status.as_u16(),
                error = %self.0,
                "request failed"
            );
        } else {
            warn!(
                event_name = "http.request.rejected",
                correlation_id = %self.0.correlation_id(),
                status = status.as_u16(),
                error = %self.0,
                "request rejected"
            );
        }

        let body = ErrorBody {
            error: self.code(),
            message: self.0.user_message(),
            detail: self.0.message().to_owned(),
            correlation_id: self.0.correlation_id().to_owned(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use relaydesk_core::domain::request::IntegrationType;
    use relaydesk_core::errors::{ApplicationError, DomainError};
    use relaydesk_core::normalizer::NormalizeError;

    use super::ApiError;

    #[test]
    fn interface_errors_map_to_http_statuses() {
        let invalid = ApiError::from_application(
            ApplicationError::from(DomainError::from(NormalizeError::MissingField {
                integration: IntegrationType::Tool,
                field: "tool_id",
            })),
            "req-1",
        );
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::unauthorized("bad signature", "r").status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::not_found("session", "s-1", "r").status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::from_application(ApplicationError::Persistence("locked".into()), "r")
                .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from_application(ApplicationError::Configuration("x".into()), "r").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
