//! Error types for the licensing core and server

use axum::{
  http::StatusCode,
  response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::validator::Failure;

#[derive(Debug, Error)]
pub enum Error {
  /// Container is malformed, tampered with, or cannot be decrypted.
  /// The cause is intentionally not reported.
  #[error("Invalid license format")]
  InvalidFormat,

  #[error("License expired")]
  Expired,

  #[error("Feature '{0}' is not included in your license")]
  FeatureNotLicensed(String),

  #[error("License validation failed: {0}")]
  ValidationFailed(Failure),

  #[error("Seat limit reached ({active}/{max})")]
  CapacityExceeded { active: u64, max: u64 },

  #[error("Remote call failed: {0}")]
  RemoteCallFailed(String),

  #[error("Key management failed: {0}")]
  KeyManagementFailed(String),

  #[error("License not found")]
  LicenseNotFound,

  #[error("License revoked")]
  LicenseRevoked,

  #[error("License generation error: {0}")]
  Generation(String),

  #[error("Invalid argument: {0}")]
  InvalidArgument(String),

  #[error("Database error: {0}")]
  Database(#[from] sea_orm::DbErr),

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),
}

impl From<Failure> for Error {
  fn from(failure: Failure) -> Self {
    match failure {
      Failure::Expired => Error::Expired,
      failure => Error::ValidationFailed(failure),
    }
  }
}

impl IntoResponse for Error {
  fn into_response(self) -> Response {
    let status = match &self {
      Error::LicenseNotFound => StatusCode::NOT_FOUND,
      Error::LicenseRevoked | Error::Expired => StatusCode::FORBIDDEN,
      Error::CapacityExceeded { .. } => StatusCode::CONFLICT,
      Error::InvalidFormat | Error::InvalidArgument(_) => {
        StatusCode::BAD_REQUEST
      }
      Error::ValidationFailed(_) | Error::FeatureNotLicensed(_) => {
        StatusCode::UNPROCESSABLE_ENTITY
      }
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let message = match &self {
      Error::Database(_) | Error::Io(_) | Error::KeyManagementFailed(_) => {
        "Internal error".to_string()
      }
      err => err.to_string(),
    };

    let body = json::json!({
      "success": false,
      "error": message
    });

    (status, axum::Json(body)).into_response()
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
