use std::io::Cursor;
use std::path::Path;

use actix_files::{Files, NamedFile};
use actix_multipart::Multipart;
use actix_web::{get, post, web, HttpResponse, Responder};
use futures_util::TryStreamExt;
use image::{ImageReader, RgbImage};
use serde_json::json;

use crate::error::{ApiError, PredictError};
use crate::state::AppState;

/// Multipart field carrying the image.
pub const UPLOAD_FIELD: &str = "file";

pub fn configure(cfg: &mut web::ServiceConfig, static_dir: &Path) {
    cfg.service(root)
        .service(health)
        .service(webcam)
        .service(predict)
        .service(Files::new("/static", static_dir));
}

#[get("/")]
async fn root() -> impl Responder {
    HttpResponse::Ok().json(json!({ "message": "server ok" }))
}

// liveness check, must not touch the model
#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(json!({ "ok": true }))
}

#[get("/webcam")]
async fn webcam(data: web::Data<AppState>) -> actix_web::Result<NamedFile> {
    Ok(NamedFile::open_async(data.static_dir.join("index.html")).await?)
}

#[post("/predict")]
async fn predict(mut payload: Multipart, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    // 1. Pull the whole upload into memory
    let image_bytes = read_upload(&mut payload).await?;

    // 2. Decode, then load (first call only) and run the model off the async workers
    // MultipartError is not Send, so only PredictError crosses the thread boundary
    let prediction = web::block(move || {
        let image = decode_rgb(&image_bytes)?;
        let classifier = data.model.get_or_load()?;
        Ok::<_, PredictError>(classifier.predict(&image)?)
    })
    .await??;

    Ok(HttpResponse::Ok().json(prediction))
}

async fn read_upload(payload: &mut Multipart) -> Result<Vec<u8>, ApiError> {
    while let Some(mut field) = payload.try_next().await? {
        let wanted = field.name() == Some(UPLOAD_FIELD);
        let mut bytes = Vec::new();
        while let Some(chunk) = field.try_next().await? {
            if wanted {
                bytes.extend_from_slice(&chunk);
            }
        }
        if wanted {
            return Ok(bytes);
        }
    }
    Err(ApiError::MissingField(UPLOAD_FIELD))
}

/// Decodes any supported format; alpha and palettes are dropped.
fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, image::ImageError> {
    let image = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?
        .decode()?;
    Ok(image.to_rgb8())
}
