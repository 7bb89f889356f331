use std::path::PathBuf;

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to download weights from {url}: {source}")]
    Transfer {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("weights file I/O failed at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("cannot read checkpoint: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint is not a valid torch archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("checkpoint tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
    #[error("no data.pkl entry in {}", .0.display())]
    NoPickle(PathBuf),
    #[error("checkpoint {} does not hold a name -> tensor mapping", .0.display())]
    NotAMapping(PathBuf),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
    #[error("shape mismatch for {name}: model expects {expected:?}, checkpoint has {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("checkpoint rejected by load policy: {0}")]
    Policy(String),
    #[error("label vocabulary is not bound to the weights: {0}")]
    LabelBinding(String),
    #[error("model produced {found} scores, expected {expected}")]
    OutputWidth { expected: usize, found: usize },
    #[error("model produced non-finite scores {0:?}")]
    NonFiniteScores(Vec<f32>),
}

/// Failures of the decode-and-classify step that runs on the blocking pool.
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("cannot decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("malformed multipart upload: {0}")]
    Multipart(#[from] actix_multipart::MultipartError),
    #[error("multipart field `{0}` is missing")]
    MissingField(&'static str),
    #[error(transparent)]
    Predict(#[from] PredictError),
    #[error("blocking pool is gone")]
    Blocking(#[from] actix_web::error::BlockingError),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Multipart(_) | ApiError::MissingField(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("predict failed: {self}");
        }
        HttpResponse::build(status).json(serde_json::json!({ "error": self.to_string() }))
    }
}
