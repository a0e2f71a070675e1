use std::io::Cursor;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::multipart::{Field, Multipart};
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::{prelude::BASE64_STANDARD, Engine};
use image::DynamicImage;
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use easel_core::{Device, GenerationRequest, TrainingSpec, TrainingStatus, UploadedImage};

use crate::error::ApiError;
use crate::state::AppState;

/// Multipart ceiling: a full training set plus form overhead.
const MAX_UPLOAD_BYTES: usize = 128 * 1024 * 1024;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/generate", post(generate))
        .route("/generate/image", post(generate_image))
        .route("/cache", delete(clear_cache))
        .route("/train", post(submit_training))
        .route("/train/{training_id}/status", get(training_status))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "service": "easel",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": "GET /health",
            "generate": "POST /generate",
            "generate_image": "POST /generate/image",
            "clear_cache": "DELETE /cache",
            "train": "POST /train",
            "training_status": "GET /train/{training_id}/status",
        },
    }))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    device: Device,
    models_loaded: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        device: state.cache.device(),
        models_loaded: state.cache.len(),
    })
}

#[derive(Serialize)]
struct GenerateResponse {
    /// Base64-encoded PNG.
    image: String,
    model_id: String,
    generation_time: f64,
    seed: u64,
}

async fn generate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerationRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let result = state.generation.generate(&request).await?;
    Ok(Json(GenerateResponse {
        image: image_to_base64_png(&result.image)?,
        model_id: result.model.to_string(),
        generation_time: result.elapsed.as_secs_f64(),
        seed: result.seed,
    }))
}

/// Same as [`generate`] but replies with raw PNG bytes; the metadata moves
/// into response headers.
async fn generate_image(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerationRequest>,
) -> Result<Response, ApiError> {
    let result = state.generation.generate(&request).await?;
    let bytes = png_bytes(&result.image)?;
    let headers = [
        (header::CONTENT_TYPE, "image/png".to_string()),
        (
            HeaderName::from_static("x-model-used"),
            result.model.to_string(),
        ),
        (
            HeaderName::from_static("x-generation-time"),
            format!("{:.3}", result.elapsed.as_secs_f64()),
        ),
        (HeaderName::from_static("x-seed"), result.seed.to_string()),
    ];
    Ok((headers, bytes).into_response())
}

#[derive(Serialize)]
struct CacheClearResponse {
    status: &'static str,
    message: String,
}

async fn clear_cache(State(state): State<Arc<AppState>>) -> Json<CacheClearResponse> {
    let dropped = state.cache.invalidate_all();
    Json(CacheClearResponse {
        status: "success",
        message: format!("cleared {dropped} cached pipeline(s)"),
    })
}

#[derive(Serialize)]
struct TrainResponse {
    success: bool,
    message: &'static str,
    model_identifier: String,
    training_id: String,
    images_saved: usize,
    estimated_time_minutes: u32,
}

async fn submit_training(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<TrainResponse>), ApiError> {
    let (spec, images) = parse_training_form(multipart).await?;
    let identifier = spec.identifier.clone();
    let receipt = state.training.submit(spec, images).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(TrainResponse {
            success: true,
            message: "training started",
            model_identifier: identifier,
            training_id: receipt.training_id.to_string(),
            images_saved: receipt.images_saved,
            estimated_time_minutes: receipt.estimated_minutes,
        }),
    ))
}

async fn training_status(
    State(state): State<Arc<AppState>>,
    Path(training_id): Path<String>,
) -> Result<Json<TrainingStatus>, ApiError> {
    Ok(Json(state.training.status(&training_id)?))
}

async fn parse_training_form(
    mut multipart: Multipart,
) -> Result<(TrainingSpec, Vec<UploadedImage>), ApiError> {
    let mut spec = TrainingSpec::default();
    let mut identifier = None;
    let mut images = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(format!("malformed multipart body: {err}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "model_identifier" => identifier = Some(text(field, &name).await?),
            "user_id" => spec.user_id = text(field, &name).await?,
            "num_train_epochs" => spec.epochs = parsed(field, &name).await?,
            "learning_rate" => spec.learning_rate = parsed(field, &name).await?,
            "train_batch_size" => spec.batch_size = parsed(field, &name).await?,
            "images" => {
                let content_type = field.content_type().map(str::to_string);
                if !content_type
                    .as_deref()
                    .is_some_and(|ct| ct.starts_with("image/"))
                {
                    warn!(?content_type, "skipping non-image upload part");
                    continue;
                }
                let filename = field.file_name().unwrap_or("upload.png").to_string();
                let bytes = field.bytes().await.map_err(|err| {
                    ApiError::BadRequest(format!("failed to read image {filename}: {err}"))
                })?;
                images.push(UploadedImage {
                    filename,
                    bytes: bytes.to_vec(),
                });
            }
            other => warn!(field = other, "ignoring unknown form field"),
        }
    }

    spec.identifier = identifier.ok_or_else(|| {
        ApiError::BadRequest("missing required field model_identifier".to_string())
    })?;
    Ok((spec, images))
}

async fn text(field: Field<'_>, name: &str) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|err| ApiError::BadRequest(format!("invalid value for {name}: {err}")))
}

async fn parsed<T>(field: Field<'_>, name: &str) -> Result<T, ApiError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    text(field, name)
        .await?
        .trim()
        .parse()
        .map_err(|err| ApiError::BadRequest(format!("invalid value for {name}: {err}")))
}

fn png_bytes(image: &DynamicImage) -> anyhow::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

fn image_to_base64_png(image: &DynamicImage) -> anyhow::Result<String> {
    Ok(BASE64_STANDARD.encode(png_bytes(image)?))
}
