use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use vellum_core::VellumError;

/// Every handler error goes through here on its way to the client.
#[derive(Debug)]
pub struct ApiError(pub VellumError);

impl From<VellumError> for ApiError {
    fn from(error: VellumError) -> Self {
        Self(error)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            VellumError::Unauthorized | VellumError::Expired => StatusCode::UNAUTHORIZED,
            VellumError::Forbidden => StatusCode::FORBIDDEN,
            VellumError::NotFound(_) => StatusCode::NOT_FOUND,
            VellumError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            VellumError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            VellumError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            VellumError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            VellumError::InvalidKey(_)
            | VellumError::InvalidRequest(_)
            | VellumError::BodyAborted(_) => StatusCode::BAD_REQUEST,
            VellumError::Upstream(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn reason(&self) -> String {
        match &self.0 {
            // Expired and bad signatures look the same from outside.
            VellumError::Unauthorized | VellumError::Expired => "unauthorized".to_string(),
            VellumError::NotFound(_) => "not found".to_string(),
            VellumError::Upstream(_) => "bad gateway".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let reason = if status.is_server_error() && status != StatusCode::BAD_GATEWAY {
            tracing::error!("Request failed: {}", self.0);
            "internal server error".to_string()
        } else {
            if status == StatusCode::BAD_GATEWAY {
                tracing::warn!("Upstream failure: {}", self.0);
            } else {
                tracing::debug!("Request rejected with {}: {}", status, self.0);
            }
            self.reason()
        };

        let mut response = (status, Json(serde_json::json!({ "error": reason }))).into_response();

        if let VellumError::RangeNotSatisfiable { size } = &self.0 {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", size)) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }

        response
    }
}
