mod annotate;
mod config;
mod detector;
mod handlers;
mod models;

use std::sync::{Arc, Mutex};

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::detector::OnnxDetector;
use crate::handlers::AppState;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();

    let detector = OnnxDetector::load(
        &config.model_path,
        config.input_size,
        config.conf_threshold,
        config.iou_threshold,
    )
    .with_context(|| format!("loading model from {}", config.model_path.display()))?;
    info!(model = %config.model_path.display(), "model loaded");

    let state = web::Data::new(AppState {
        detector: Arc::new(detector),
        history: Mutex::new(Vec::new()),
    });

    info!(host = %config.host, port = config.port, "server starting");

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header();

        App::new()
            .wrap(cors)
            .app_data(state.clone())
            .service(web::resource("/predict").route(web::post().to(handlers::predict)))
            .service(web::resource("/history").route(web::get().to(handlers::history)))
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await
    .context("server error")
}
