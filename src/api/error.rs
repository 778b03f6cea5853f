//! Mapping of domain errors onto HTTP responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::domain::VeaError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Handler error; wraps [`VeaError`] so handlers can use `?` on service calls.
#[derive(Debug)]
pub struct ApiError(pub VeaError);

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            err if err.is_invalid_data() => StatusCode::BAD_REQUEST,
            VeaError::NotFound { .. } => StatusCode::NOT_FOUND,
            VeaError::EngineNotInstalled { .. } => StatusCode::PRECONDITION_FAILED,
            VeaError::Busy(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<VeaError> for ApiError {
    fn from(err: VeaError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if let Some(problems) = self.0.compile_problems() {
            let body = json!({
                "error": "invalid frouter",
                "problems": problems,
            });
            return (status, Json(body)).into_response();
        }
        let body = match &self.0 {
            VeaError::EngineNotInstalled { engine, .. } => json!({
                "error": self.0.to_string(),
                "engine": engine,
            }),
            VeaError::Io(err) => {
                tracing::error!("request failed: {:#}", err);
                json!({ "error": format!("{:#}", err) })
            }
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CompileError, EntityKind};

    #[test]
    fn test_status_codes() {
        let cases = [
            (VeaError::invalid("bad"), StatusCode::BAD_REQUEST),
            (
                CompileError::new(vec!["missing default edge".to_string()]).into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                VeaError::not_found(EntityKind::Node, "n1"),
                StatusCode::NOT_FOUND,
            ),
            (
                VeaError::EngineNotInstalled {
                    engine: "singbox".to_string(),
                    cause: "missing".to_string(),
                },
                StatusCode::PRECONDITION_FAILED,
            ),
            (VeaError::Busy("starting".to_string()), StatusCode::CONFLICT),
            (
                VeaError::Io(anyhow::anyhow!("disk full")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
    }

    #[test]
    fn test_compile_error_response_status() {
        let err = ApiError::from(VeaError::from(CompileError::new(vec!["x".to_string()])));
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_compile_error_body_lists_problems() {
        let err = ApiError::from(VeaError::from(CompileError::new(vec![
            "missing default edge".to_string(),
        ])));
        let body = axum::body::to_bytes(err.into_response().into_body(), usize::MAX)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "invalid frouter");
        assert_eq!(value["problems"], json!(["missing default edge"]));
    }
}
