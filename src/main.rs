use std::path::Path;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tokio_util::sync::CancellationToken;

use crate::config::dispatch_config::DispatchConfig;
use crate::logger::init_logger;
use crate::services::broadcast_service::BroadcastService;
use crate::services::delivery_channel::TelegramChannel;
use crate::services::delivery_service::DeliveryService;
use crate::services::dispatch_service::DispatchService;

mod app;
mod config;
mod handlers;
mod logger;
mod models;
mod services;

#[cfg(test)]
mod tests;

async fn setup_database(database_url: &str) -> anyhow::Result<Pool<Sqlite>> {
    log::info!("Conectando a SQLite en {}", database_url);

    let options = database_url
        .parse::<SqliteConnectOptions>()
        .with_context(|| format!("DATABASE_URL inválida: {}", database_url))?
        .create_if_missing(true);

    // Crear carpeta del archivo si hace falta (p.ej. ./data)
    let file_part = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if !file_part.is_empty() && file_part != ":memory:" {
        if let Some(dir) = Path::new(file_part).parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("No se pudo crear directorio {}", dir.display()))?;
        }
    }

    let db_pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("No se pudo conectar a la base de datos SQLite.")?;

    Ok(db_pool)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok(); // Cargar .env al inicio
    init_logger();

    // Sin token no arrancamos
    let config = match DispatchConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Configuración inválida: {:#}", e);
            std::process::exit(1);
        }
    };

    let db_pool = setup_database(&config.database_url)
        .await
        .expect("No se pudo inicializar la base de datos");

    let broadcast_service = BroadcastService::new(db_pool.clone());
    if let Err(e) = broadcast_service.run_migrations().await {
        panic!("Fallo en migraciones de 'broadcasts': {:?}", e);
    }
    let delivery_service = DeliveryService::new(db_pool.clone());

    let channel = TelegramChannel::new(&config).expect("No se pudo inicializar TelegramChannel");
    let dispatch_service = DispatchService::new(db_pool.clone(), Arc::new(channel), config.clone());

    // Despachador en segundo plano; se detiene entre lotes al cancelar
    let cancel = CancellationToken::new();
    let dispatch_cancel = cancel.clone();
    let dispatcher_handle = tokio::spawn(async move {
        if let Err(e) = dispatch_service.run(dispatch_cancel).await {
            log::error!("Despachador terminó con error: {:?}", e);
        }
    });

    // Levantar servidor (solo consulta de progreso)
    log::info!("Levantando servidor en {}", config.server_addr);
    let server_result = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(broadcast_service.clone()))
            .app_data(web::Data::new(delivery_service.clone()))
            .configure(app::init_app)
    })
    .workers(1)
    .bind(config.server_addr.as_str())?
    .run()
    .await;

    // El servidor atiende SIGINT/SIGTERM; después dejamos terminar el lote en curso
    log::info!("Broadcast script terminated by user. Esperando al lote en curso...");
    cancel.cancel();
    if let Err(e) = dispatcher_handle.await {
        log::error!("La tarea del despachador falló: {:?}", e);
    }

    server_result
}
