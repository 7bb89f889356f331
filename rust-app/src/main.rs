mod checkpoint;
mod config;
mod efficientnet;
mod engine;
mod error;
mod provision;
mod routes;
mod state;

use std::sync::Arc;

use actix_web::{middleware, web, App, HttpServer};
use clap::Parser;
use log::info;

use config::{InitMode, Settings};
use engine::{Classify, EmotionClassifier};
use provision::HttpTransfer;
use state::{AppState, ModelSlot};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let settings = Settings::parse();

    let engine_settings = settings.engine();
    let slot = ModelSlot::new(move || {
        let classifier = EmotionClassifier::load(&engine_settings, &HttpTransfer)?;
        Ok(Arc::new(classifier) as Arc<dyn Classify>)
    });

    let state = web::Data::new(AppState {
        model: slot,
        static_dir: settings.static_dir.clone(),
    });

    if settings.init == InitMode::Eager {
        info!("Loading model before accepting requests...");
        let eager = state.clone();
        web::block(move || eager.model.get_or_load().map(|_| ()))
            .await
            .map_err(std::io::Error::other)?
            .map_err(std::io::Error::other)?;
    }
    if !state.model.is_loaded() {
        info!("Model will be loaded on the first /predict");
    }

    info!("Starting server at {}:{}", settings.host, settings.port);
    let static_dir = settings.static_dir.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .configure(|cfg| routes::configure(cfg, &static_dir))
    })
    .bind((settings.host.as_str(), settings.port))?
    .run()
    .await
}
