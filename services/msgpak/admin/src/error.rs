//! Admin request errors and their HTTP mapping

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE, WWW_AUTHENTICATE};
use hyper::{Response, StatusCode};
use msgpak_storage::QueueError;
use thiserror::Error;

/// Realm advertised on 401 responses
pub const AUTH_REALM: &str = "Basic realm=\"msgpak admin\"";

/// Reasons an admin request is refused
#[derive(Error, Debug)]
pub enum AdminError {
    /// Missing or wrong basic-auth credentials
    #[error("unauthorized")]
    Unauthorized,

    /// Remote address is not allowed
    #[error("address not allowed")]
    Forbidden,

    /// Request parameters failed validation
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Every peer queue is full
    #[error("all peer queues are full")]
    Unavailable,

    /// Body larger than the configured limit
    #[error("request body too large")]
    PayloadTooLarge,

    /// Unknown route
    #[error("not found")]
    NotFound,

    /// Known route, wrong method
    #[error("method not allowed")]
    MethodNotAllowed,
}

impl AdminError {
    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            AdminError::Unauthorized => StatusCode::UNAUTHORIZED,
            AdminError::Forbidden => StatusCode::FORBIDDEN,
            AdminError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AdminError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            AdminError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AdminError::NotFound => StatusCode::NOT_FOUND,
            AdminError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    /// JSON error response
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let body = serde_json::json!({ "error": self.to_string() });
        let mut resp = Response::new(Full::new(Bytes::from(body.to_string())));
        *resp.status_mut() = self.status();
        resp.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if matches!(self, AdminError::Unauthorized) {
            resp.headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static(AUTH_REALM));
        }
        resp
    }
}

impl From<QueueError> for AdminError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::DataTooLarge { .. } => AdminError::PayloadTooLarge,
            other => AdminError::BadRequest(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgpak_storage::QueueError;

    #[test]
    fn test_status_mapping() {
        assert_eq!(AdminError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AdminError::Unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);

        let err: AdminError = QueueError::DataTooLarge { size: 10, limit: 5 }.into();
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let err: AdminError = QueueError::Corruption("time".into()).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_unauthorized_sets_challenge() {
        let resp = AdminError::Unauthorized.into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers()[WWW_AUTHENTICATE], AUTH_REALM);
    }
}
