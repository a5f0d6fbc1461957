use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fluxlens_core::errors::{ErrorKind as CoreErrorKind, FluxLensError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
#[error(transparent)]
pub struct AppError(Box<ErrorKind>);

#[derive(Error, Debug)]
#[error(transparent)]
pub enum ErrorKind {
    #[error("FluxLensError: {0}")]
    FluxLens(#[from] FluxLensError),
    #[error("InvalidAction: {0}")]
    InvalidAction(String),
    #[error("ReadOnly: {0}")]
    ReadOnly(String),
}

impl<E> From<E> for AppError
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        AppError(Box::new(ErrorKind::from(err)))
    }
}

impl AppError {
    pub fn not_found(what: impl Into<String>) -> Self {
        FluxLensError::from(CoreErrorKind::NotFound(what.into())).into()
    }

    fn get_codes(&self) -> (StatusCode, u16) {
        match &*self.0 {
            ErrorKind::FluxLens(err) => match err.kind() {
                CoreErrorKind::InvalidResourceTypeError(_) => (StatusCode::BAD_REQUEST, 40001),
                CoreErrorKind::MalformedEvent(_) => (StatusCode::BAD_REQUEST, 40003),
                CoreErrorKind::NotFound(_) => (StatusCode::NOT_FOUND, 40401),
                CoreErrorKind::KubeClientError(_) if err.is_not_found() => {
                    (StatusCode::NOT_FOUND, 40402)
                }
                CoreErrorKind::Conflict(_) => (StatusCode::CONFLICT, 40901),
                CoreErrorKind::AlreadySuspended(_) => (StatusCode::CONFLICT, 40902),
                CoreErrorKind::InvalidState(_) => (StatusCode::CONFLICT, 40903),
                CoreErrorKind::ReadinessFailed(_) => (StatusCode::UNPROCESSABLE_ENTITY, 42201),
                CoreErrorKind::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, 50401),
                CoreErrorKind::KubeClientError(_) | CoreErrorKind::HelmStorageError(_) => {
                    (StatusCode::BAD_GATEWAY, 50201)
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, 50001),
            },
            ErrorKind::InvalidAction(_) => (StatusCode::BAD_REQUEST, 40002),
            ErrorKind::ReadOnly(_) => (StatusCode::NOT_IMPLEMENTED, 50101),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorCode {
    pub code: u16,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status_code, code) = self.get_codes();
        let message = self.to_string();
        let body = Json(ErrorCode { code, message });
        (status_code, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
