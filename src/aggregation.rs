use crate::models::{
    AggregateMetadata, DashboardAggregate, DashboardStats, SeverityBreakdown,
};
use crate::records::{StoreError, VulnerabilityStore};
use chrono::{DateTime, Months, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

// Fenêtre de la timeline par défaut, en mois.
pub const DEFAULT_TIMELINE_MONTHS: u32 = 12;
// Nombre de facteurs de risque renvoyés au dashboard.
pub const TOP_RISK_FACTORS: usize = 10;
// Reporté tel quel dans `metadata.queriesExecuted`.
pub const QUERIES_EXECUTED: u32 = 6;
// Délai maximal accordé à chaque requête.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("{query} query failed: {source}")]
    Query {
        query: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("{query} query timed out after {after:?}")]
    Timeout { query: &'static str, after: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateOptions {
    pub timeline_months: u32,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            timeline_months: DEFAULT_TIMELINE_MONTHS,
        }
    }
}

// Début de la fenêtre glissante : `months` mois calendaires avant `now`.
// Le jour est ramené à la fin du mois si besoin (31 mars - 1 mois = 28/29 février).
// `None` si la soustraction sort du calendrier, la fenêtre est alors illimitée.
pub fn timeline_start(now: DateTime<Utc>, months: u32) -> Option<DateTime<Utc>> {
    now.checked_sub_months(Months::new(months))
}

// Orchestre les requêtes du dashboard ; ne met jamais rien en cache lui-même.
pub struct AggregationEngine {
    store: Arc<dyn VulnerabilityStore>,
    query_timeout: Duration,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn VulnerabilityStore>, query_timeout: Duration) -> Self {
        Self {
            store,
            query_timeout,
        }
    }

    // Borne une requête dans le temps et étiquette son éventuel échec.
    async fn bounded<T>(
        &self,
        query: &'static str,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, AggregationError> {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(AggregationError::Query { query, source }),
            Err(_) => Err(AggregationError::Timeout {
                query,
                after: self.query_timeout,
            }),
        }
    }

    // Calcule l'agrégat complet du dashboard.
    // Les six requêtes partent en parallèle ; la première erreur (ou le premier
    // dépassement de délai) fait échouer l'ensemble, sans résultat partiel.
    pub async fn aggregate(
        &self,
        options: AggregateOptions,
    ) -> Result<DashboardAggregate, AggregationError> {
        let since = timeline_start(Utc::now(), options.timeline_months);
        let store = self.store.as_ref();

        // `try_join!` lance les six futures ensemble et abandonne les autres dès la première erreur.
        let result = tokio::try_join!(
            self.bounded("total", store.count_all()),
            self.bounded("severity", store.count_by_severity()),
            self.bounded("affected packages", store.count_distinct_packages()),
            self.bounded("fix progress", store.fix_progress()),
            self.bounded("risk factors", store.risk_factor_frequencies(TOP_RISK_FACTORS)),
            self.bounded("timeline", store.published_per_month(since)),
        );

        let (total, severities, affected, progress, mut risk_factors, timeline) = match result {
            Ok(parts) => parts,
            Err(e) => {
                error!("[Dashboard] Error fetching aggregates: {}", e);
                return Err(e);
            }
        };

        // Tri stable : à égalité, l'ordre rendu par le store est conservé.
        risk_factors.sort_by(|a, b| b.count.cmp(&a.count));
        risk_factors.truncate(TOP_RISK_FACTORS);

        // Assemblage final, horodaté au moment du calcul.
        Ok(DashboardAggregate {
            stats: DashboardStats {
                total,
                affected_resources: affected,
                fixed_percentage: progress.percentage(),
                severity_breakdown: SeverityBreakdown::from_counts(severities),
            },
            risk_factors,
            timeline,
            metadata: AggregateMetadata {
                generated_at: Utc::now(),
                timeline_months: options.timeline_months,
                queries_executed: QUERIES_EXECUTED,
            },
        })
    }
}
