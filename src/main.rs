mod aggregation;
mod app_state;
mod cache;
mod cached;
mod config;
mod database;
mod error;
mod handlers;
mod import;
mod models;
mod records;
mod warmup;

use app_state::AppState;
use cache::CacheStore;
use config::AppConfig;
use database::init_database;
use handlers::router;
use import::load_seed_file;
use records::SqliteVulnerabilityStore;
use std::{net::SocketAddr, sync::Arc};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = AppConfig::from_env()?;

    info!("Initializing database...");
    let pool = init_database(&config.database_file).await?;
    let records = Arc::new(SqliteVulnerabilityStore::new(pool));

    // Seed optionnel : remplace le contenu de la table avant tout calcul.
    if let Some(seed_file) = &config.seed_file {
        let seed = load_seed_file(seed_file).await?;
        let imported = records.replace_all(&seed).await?;
        info!("Data import completed, {} records", imported);
    }

    let cache = CacheStore::start(config.cache.clone());
    let port = config.port;
    let state = AppState::new(records, cache, config);

    // Le warm-up tourne en parallèle : le serveur accepte les connexions sans l'attendre.
    info!("[Cache] Starting cache warm-up...");
    warmup::spawn_warm_up(state.clone());

    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app).await?;

    Ok(())
}
