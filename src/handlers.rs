// Importations de l'état de l'application, des modèles de données, et des composants Axum.
use crate::aggregation::AggregateOptions;
use crate::app_state::AppState;
use crate::cache::{CachePattern, CacheStats};
use crate::cached::{cache_key, get_or_compute, Cached, AGGREGATES_PREFIX};
use crate::error::AppError;
use crate::models::{DashboardAggregate, HealthStatus, InvalidateRequest, InvalidateResponse};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

pub const DEFAULT_INVALIDATION_PATTERN: &str = "dashboard:*";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/dashboard/aggregates", get(aggregates_handler))
        .route("/cache/invalidate", post(invalidate_cache_handler))
        .route("/cache/clear", post(clear_cache_handler))
        .route("/cache/stats", get(cache_stats_handler))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

// `timelineMonths` doit être un entier strictement positif ; absent, on prend la valeur par défaut.
fn parse_aggregate_options(
    params: &BTreeMap<String, String>,
    default_months: u32,
) -> Result<AggregateOptions, AppError> {
    let timeline_months = match params.get("timelineMonths") {
        None => default_months,
        Some(raw) => match raw.trim().parse::<u32>() {
            Ok(months) if months > 0 => months,
            _ => {
                return Err(AppError::Validation(format!(
                    "timelineMonths must be a positive integer, got {:?}",
                    raw
                )))
            }
        },
    };
    Ok(AggregateOptions { timeline_months })
}

// Handler pour GET `/dashboard/aggregates` : toutes les cartes du dashboard en une réponse.
pub async fn aggregates_handler(
    State(state): State<AppState>,
    // Un `BTreeMap` garde les paramètres triés : la clé de cache ne dépend pas de leur ordre.
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<Cached<Arc<DashboardAggregate>>>, AppError> {
    // La validation passe avant toute lecture du cache ou requête.
    let options = parse_aggregate_options(&params, state.config.default_timeline_months)?;
    let key = cache_key(AGGREGATES_PREFIX, &params);

    let response = get_or_compute(&state.cache, key, Some(state.config.aggregates_ttl), || async {
        state.engine.aggregate(options).await.map(Arc::new)
    })
    .await?;

    Ok(Json(response))
}

// Handler pour POST `/cache/invalidate` : corps optionnel `{ "pattern": "..." }`.
pub async fn invalidate_cache_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<InvalidateResponse>, AppError> {
    // Un corps vide équivaut à `{}`.
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        InvalidateRequest::default()
    } else {
        serde_json::from_slice::<InvalidateRequest>(&body)
            .map_err(|e| AppError::Validation(format!("invalid request body: {}", e)))?
    };

    // Pas de motif : on vise toutes les clés du dashboard. Un motif vide, lui, ne vise rien.
    let raw = request
        .pattern
        .unwrap_or_else(|| DEFAULT_INVALIDATION_PATTERN.to_string());
    // Seul un motif à plusieurs `*` est refusé (400).
    let pattern = CachePattern::parse(&raw).map_err(|e| AppError::Validation(e.to_string()))?;

    let deleted_keys = state.cache.invalidate(&pattern).await;
    info!(
        "[Cache INVALIDATE] Removed {} keys matching {}",
        deleted_keys, raw
    );

    Ok(Json(InvalidateResponse {
        success: true,
        message: format!("Cache invalidated for pattern: {}", raw),
        deleted_keys,
        timestamp: Utc::now(),
    }))
}

// Handler pour POST `/cache/clear` : vide tout le cache et remet les statistiques à zéro.
pub async fn clear_cache_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let success = state.cache.flush_all().await;
    info!("[Cache CLEAR] All cache cleared");

    Json(serde_json::json!({
        "success": success,
        "message": if success { "All cache cleared successfully" } else { "Failed to clear cache" },
        "timestamp": Utc::now(),
    }))
}

#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    pub success: bool,
    pub stats: CacheStats,
    pub timestamp: chrono::DateTime<Utc>,
}

// Handler pour GET `/cache/stats`.
pub async fn cache_stats_handler(State(state): State<AppState>) -> Json<CacheStatsResponse> {
    Json(CacheStatsResponse {
        success: true,
        stats: state.cache.stats().await,
        timestamp: Utc::now(),
    })
}

// Handler pour GET `/health` : un simple comptage, sans cache ni agrégation.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthStatus>) {
    match state.records.count_all().await {
        Ok(count) => (
            StatusCode::OK,
            Json(HealthStatus {
                healthy: true,
                vulnerability_count: Some(count),
                error: None,
                timestamp: Utc::now(),
            }),
        ),
        Err(e) => {
            error!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthStatus {
                    healthy: false,
                    vulnerability_count: None,
                    error: Some(e.to_string()),
                    timestamp: Utc::now(),
                }),
            )
        }
    }
}
