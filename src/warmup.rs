use crate::aggregation::AggregateOptions;
use crate::app_state::AppState;
use crate::cached::{cache_key, populate, AGGREGATES_PREFIX};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

// Pré-remplit l'entrée de la requête sans paramètres, en tâche de fond.
// Le serveur n'attend jamais cette tâche : en cas d'échec, la première
// requête réelle passera simplement par le chemin "miss".
pub fn spawn_warm_up(state: AppState) -> JoinHandle<bool> {
    tokio::spawn(async move { warm_up(&state).await })
}

pub async fn warm_up(state: &AppState) -> bool {
    // Même clé que celle calculée par le handler pour une requête sans paramètres.
    let key = cache_key(AGGREGATES_PREFIX, BTreeMap::<String, String>::new());
    info!("[Cache WARM] Starting for {}...", key);

    let options = AggregateOptions {
        timeline_months: state.config.default_timeline_months,
    };
    let aggregate = match state.engine.aggregate(options).await {
        Ok(aggregate) => Arc::new(aggregate),
        Err(e) => {
            error!(
                "[Cache WARM] Failed for {}, will populate on first request: {}",
                key, e
            );
            return false;
        }
    };

    match populate(&state.cache, &key, aggregate, Some(state.config.aggregates_ttl)).await {
        Ok(_) => {
            info!("[Cache WARM] Dashboard cache warmed successfully");
            true
        }
        Err(e) => {
            warn!("[Cache WARM] Could not store {}: {}", key, e);
            false
        }
    }
}
