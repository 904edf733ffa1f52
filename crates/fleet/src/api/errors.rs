use core::error::Error;

use api_types::ErrorResponse;
use poem::error::ResponseError;
use poem::http::StatusCode;
use poem::web::Json;
use poem::IntoResponse;
use poem::Response;

/// API errors
///
/// Every variant renders as `{"error": "<message>"}` with its status code.
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("{message}")]
    BadRequest { message: String },
    #[display("{message}")]
    NotFound { message: String },
    #[display("{message}")]
    ServiceUnavailable { message: String },
    #[display("Server error: {message}")]
    ServerError { message: String },
}

impl Error for ApiError {}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            message: message.into(),
        }
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::ServerError {
            message: message.into(),
        }
    }

    /// Message sent to the client, without the log prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest { message }
            | Self::NotFound { message }
            | Self::ServiceUnavailable { message }
            | Self::ServerError { message } => message,
        }
    }
}

impl ResponseError for ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ServerError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn as_response(&self) -> Response {
        error_response(self.status(), self.message())
    }
}

/// JSON error body with the given status.
pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    Json(ErrorResponse {
        error: message.into(),
    })
    .with_status(status)
    .into_response()
}
