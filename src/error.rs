use crate::aggregation::AggregationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

// Erreur remontée jusqu'à la frontière HTTP.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "Invalid request"),
            AppError::Aggregation(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch dashboard aggregates",
            ),
        };

        (
            status,
            Json(serde_json::json!({
                "message": message,
                "error": self.to_string(),
            })),
        )
            .into_response()
    }
}
