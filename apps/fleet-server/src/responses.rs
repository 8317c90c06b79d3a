use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use fleet_protocol::ProblemDetails;
use fleet_runtime::ConfigError;
use serde::Serialize;

use crate::remote::RemoteError;
use crate::secrets::SecretError;
use crate::store::StoreError;

pub fn json_ok<T: Serialize>(value: T) -> Response {
    (StatusCode::OK, Json(value)).into_response()
}

pub fn json_status<T: Serialize>(status: StatusCode, value: T) -> Response {
    (status, Json(value)).into_response()
}

pub fn problem(status: StatusCode, title: &str, detail: Option<String>) -> Response {
    let body = ProblemDetails::new(status.as_u16(), title, detail);
    (status, Json(body)).into_response()
}

pub fn unauthorized(detail: Option<&str>) -> Response {
    problem(
        StatusCode::UNAUTHORIZED,
        "Unauthorized",
        detail.map(str::to_string),
    )
}

pub fn not_found(detail: impl Into<String>) -> Response {
    problem(StatusCode::NOT_FOUND, "Not Found", Some(detail.into()))
}

pub fn bad_request(detail: impl Into<String>) -> Response {
    problem(StatusCode::BAD_REQUEST, "Bad Request", Some(detail.into()))
}

pub fn internal(detail: impl Into<String>) -> Response {
    problem(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal Server Error",
        Some(detail.into()),
    )
}

pub(crate) fn store_error(err: StoreError) -> Response {
    match err {
        StoreError::NotFound(_) => not_found(err.to_string()),
        StoreError::Persistence(_) => internal(err.to_string()),
    }
}

pub(crate) fn remote_error(err: RemoteError) -> Response {
    match err {
        RemoteError::NotFound(_) => not_found(err.to_string()),
        RemoteError::Invalid(_) => bad_request(err.to_string()),
        RemoteError::Persistence(_) => internal(err.to_string()),
    }
}

pub(crate) fn config_error(err: ConfigError) -> Response {
    bad_request(err.to_string())
}

pub(crate) fn secret_error(err: SecretError) -> Response {
    internal(err.to_string())
}
