use std::fs::File;
use std::io::Write;
use std::sync::{Arc, Mutex};

use actix_multipart::Multipart;
use actix_web::{web, Error, HttpResponse, Result};
use chrono::{SecondsFormat, Utc};
use futures_util::StreamExt;
use tempfile::Builder;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::annotate;
use crate::detector::Detect;
use crate::models::{ErrorResponse, HistoryResponse, PredictionResponse};

/// Shared per-process state: the loaded model and the prediction log.
pub struct AppState {
    pub detector: Arc<dyn Detect>,
    pub history: Mutex<Vec<PredictionResponse>>,
}

pub async fn predict(
    state: web::Data<AppState>,
    mut payload: Multipart,
) -> Result<HttpResponse, Error> {
    // Spool the upload into a temporary directory
    let upload_dir = Builder::new()
        .prefix("fracture_uploads")
        .tempdir()
        .map_err(|e| {
            error!("failed to create temporary directory: {e}");
            actix_web::error::ErrorInternalServerError("Could not create temp directory")
        })?;

    let mut filepath = None;

    while let Some(item) = payload.next().await {
        let mut field = item?;
        let filename = format!("{}.img", Uuid::new_v4());
        let path = upload_dir.path().join(filename);

        let path_for_closure = path.clone();
        let mut f = web::block(move || File::create(path_for_closure))
            .await?
            .map_err(|e| {
                error!("failed to create upload file: {e}");
                actix_web::error::ErrorInternalServerError("Could not save file")
            })?;

        while let Some(chunk) = field.next().await {
            let data = chunk?;
            f = web::block(move || f.write_all(&data).map(|_| f))
                .await?
                .map_err(|e| {
                    error!("failed to write upload data: {e}");
                    actix_web::error::ErrorInternalServerError("Could not write to file")
                })?;
        }

        filepath = Some(path);
    }

    // A missing or undecodable upload is the same failure to the caller
    let Some(filepath) = filepath else {
        warn!("predict called without an upload field");
        return Ok(HttpResponse::Ok().json(ErrorResponse::new("Could not decode image")));
    };

    let bytes = web::block(move || std::fs::read(filepath))
        .await?
        .map_err(|e| {
            error!("failed to read upload back: {e}");
            actix_web::error::ErrorInternalServerError("Could not read uploaded file")
        })?;

    let img = match image::load_from_memory(&bytes) {
        Ok(img) => img.to_rgb8(),
        Err(e) => {
            warn!("could not decode upload: {e}");
            return Ok(HttpResponse::Ok().json(ErrorResponse::new("Could not decode image")));
        }
    };
    let (width, height) = img.dimensions();

    // Inference is CPU-bound; keep it off the async workers
    let detector = state.detector.clone();
    let (mut img, detect_result) = web::block(move || {
        let result = detector.detect(&img);
        (img, result)
    })
    .await?;
    let boxes = detect_result.map_err(|e| {
        error!("inference failed: {e}");
        actix_web::error::ErrorInternalServerError("Inference error")
    })?;

    annotate::draw_detections(&mut img, &boxes);

    let annotated_image_b64 = match annotate::encode_jpeg_b64(&img) {
        Ok(b64) => b64,
        Err(e) => {
            error!("annotated image encode failed: {e}");
            return Ok(HttpResponse::Ok()
                .json(ErrorResponse::new("Failed to encode annotated image")));
        }
    };

    let best_confidence = boxes.iter().map(|b| b.conf).fold(0.0f32, f32::max);
    let response = PredictionResponse {
        has_fracture: !boxes.is_empty(),
        best_confidence,
        num_boxes: boxes.len(),
        boxes,
        annotated_image_b64,
        width,
        height,
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
    };

    debug!(
        num_boxes = response.num_boxes,
        best_confidence = response.best_confidence,
        "prediction complete"
    );

    state.history.lock().unwrap().push(response.clone());

    Ok(HttpResponse::Ok().json(response))
}

pub async fn history(state: web::Data<AppState>) -> Result<HttpResponse, Error> {
    let records = state.history.lock().unwrap();
    let history: Vec<PredictionResponse> = records.iter().rev().cloned().collect();
    Ok(HttpResponse::Ok().json(HistoryResponse { history }))
}
