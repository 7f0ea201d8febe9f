use crate::aggregation::AggregationEngine;
use crate::cache::CacheStore;
use crate::config::AppConfig;
use crate::models::DashboardAggregate;
use crate::records::VulnerabilityStore;
use std::sync::Arc;

pub type DashboardCache = CacheStore<Arc<DashboardAggregate>>;

// État partagé injecté dans chaque handler ; tout est derrière un `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub records: Arc<dyn VulnerabilityStore>,
    pub engine: Arc<AggregationEngine>,
    pub cache: Arc<DashboardCache>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(
        records: Arc<dyn VulnerabilityStore>,
        cache: Arc<DashboardCache>,
        config: AppConfig,
    ) -> Self {
        let engine = Arc::new(AggregationEngine::new(
            records.clone(),
            config.query_timeout,
        ));
        Self {
            records,
            engine,
            cache,
            config: Arc::new(config),
        }
    }
}
