use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
}

/// RFC 7807 error body returned for rejected status callbacks.
#[derive(Debug)]
pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                detail: detail.into(),
            },
        }
    }

    pub fn unauthorized<S: Into<String>>(detail: S) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "invalid_signature", detail)
    }

    pub fn bad_request<S: Into<String>>(detail: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_form", detail)
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
