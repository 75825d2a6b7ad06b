use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Failures a watering driver or API call reports to its caller.
#[derive(Debug, Error)]
pub enum WateringError {
    #[error("sensor {0} not found")]
    SensorNotFound(i64),
    #[error("schedule {0} not found")]
    ScheduleNotFound(i64),
    #[error("crop {0} not found")]
    CropNotFound(i64),
    /// The sensor has no crop, so there is no band or dose to water with.
    #[error("sensor {0} has no crop assigned")]
    MissingCrop(i64),
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    /// Storage round trip failed. Background loops retry on their next tick.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type WateringResult<T> = std::result::Result<T, WateringError>;

impl WateringError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::SensorNotFound(_) | Self::ScheduleNotFound(_) | Self::CropNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::MissingCrop(_) => StatusCode::CONFLICT,
            Self::InvalidSchedule(_) => StatusCode::BAD_REQUEST,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WateringError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let Self::Storage(e) = &self {
            error!("request failed: {e:#}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
