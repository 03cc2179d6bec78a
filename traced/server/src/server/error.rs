use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use traced_core::QueryError;
use traced_proto::prelude::ProtoError;

use super::live::LiveError;

/// A malformed request parameter.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("invalid value `{value}` for `{key}`")]
    Invalid { key: String, value: String },
}

#[derive(Debug)]
pub struct ApiError(pub anyhow::Error);

pub type ApiResult<T> = Result<T, ApiError>;

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        ApiError(err.into())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        if let Some(err) = self.0.downcast_ref::<QueryError>() {
            return match err {
                QueryError::NotFound(_) | QueryError::BlobNotFound(_) | QueryError::NoBlobStore => {
                    StatusCode::NOT_FOUND
                }
                QueryError::InvalidThreshold(_) => StatusCode::BAD_REQUEST,
                QueryError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
        }
        if self.0.downcast_ref::<RequestError>().is_some()
            || self.0.downcast_ref::<ProtoError>().is_some()
            || matches!(
                self.0.downcast_ref::<LiveError>(),
                Some(LiveError::BackfillNeedsRun)
            )
        {
            return StatusCode::BAD_REQUEST;
        }
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("request failed: {:#}", self.0);
        } else {
            log::debug!("request rejected: {:#}", self.0);
        }
        (status, format!("{:#}", self.0)).into_response()
    }
}
