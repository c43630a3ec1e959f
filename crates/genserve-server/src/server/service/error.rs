use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use genserve::Error;
use serde_json::json;

/// Converts a pipeline [`Error`] into an HTTP response with a JSON body of
/// the form `{"error": {"kind": ..., "message": ...}}`.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    pub const fn status(&self) -> StatusCode {
        match self.0 {
            Error::BadRequest { .. } | Error::Tokenization { .. } => StatusCode::BAD_REQUEST,
            Error::Generation { .. } | Error::ChannelError { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Error::ChannelTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::WorkerUnavailable { .. } | Error::ServiceShutdown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::RequestCancelled => StatusCode::REQUEST_TIMEOUT,
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("Request failed: {}", self.0);
        } else {
            tracing::debug!("Request rejected: {}", self.0);
        }

        let body = json!({
            "error": {
                "kind": self.0.kind(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}
