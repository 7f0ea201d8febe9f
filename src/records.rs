// Accès en lecture au stock de vulnérabilités, et écriture en lot pour le seed.
use crate::models::{FixProgress, RiskFactorCount, TimelineBucket, VulnerabilityRecord};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqlitePool;
use thiserror::Error;
use tracing::info;

// Taille des lots d'insertion, comme l'import d'origine.
const INSERT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("unexpected value in {column}: {value}")]
    InvalidValue { column: &'static str, value: i64 },
}

// Les requêtes dont l'agrégation a besoin : comptage, regroupement, valeurs distinctes.
#[async_trait]
pub trait VulnerabilityStore: Send + Sync {
    async fn count_all(&self) -> Result<u64, StoreError>;

    // Nombre d'enregistrements par libellé de sévérité (en minuscules).
    async fn count_by_severity(&self) -> Result<Vec<(String, u64)>, StoreError>;

    async fn count_distinct_packages(&self) -> Result<u64, StoreError>;

    // Total, et nombre dont le statut contient "fixed" (sans tenir compte de la casse).
    async fn fix_progress(&self) -> Result<FixProgress, StoreError>;

    // Fréquence des clés de facteurs de risque, décroissante, au plus `limit` entrées.
    async fn risk_factor_frequencies(&self, limit: usize)
        -> Result<Vec<RiskFactorCount>, StoreError>;

    // Comptage par (année, mois) de publication, croissant, depuis `since` inclus.
    async fn published_per_month(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<TimelineBucket>, StoreError>;
}

// Format de stockage de `published` : comparable lexicographiquement.
pub fn storage_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn to_count(column: &'static str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::InvalidValue { column, value })
}

pub struct SqliteVulnerabilityStore {
    db: SqlitePool,
}

impl SqliteVulnerabilityStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    // Remplace tout le contenu de la table, dans une seule transaction.
    pub async fn replace_all(&self, records: &[VulnerabilityRecord]) -> Result<u64, StoreError> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM vulnerabilities")
            .execute(&mut *tx)
            .await?;

        let mut imported = 0u64;
        for batch in records.chunks(INSERT_BATCH_SIZE) {
            for record in batch {
                let risk_factors = record
                    .risk_factors
                    .as_ref()
                    .map(|factors| serde_json::Value::Object(factors.clone()).to_string());

                sqlx::query(
                    "INSERT INTO vulnerabilities (cve, package_name, severity, status, published, risk_factors) VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(record.cve.as_deref())
                .bind(record.package_name.as_deref())
                // Les sévérités sont stockées en minuscules.
                .bind(record.severity.as_deref().map(|s| s.trim().to_lowercase()))
                .bind(record.status.as_deref())
                .bind(record.published.map(storage_timestamp))
                .bind(risk_factors)
                .execute(&mut *tx)
                .await?;
            }
            imported += batch.len() as u64;
            info!("Imported {} / {} records", imported, records.len());
        }

        tx.commit().await?;
        Ok(imported)
    }
}

#[async_trait]
impl VulnerabilityStore for SqliteVulnerabilityStore {
    async fn count_all(&self) -> Result<u64, StoreError> {
        let (count,) = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM vulnerabilities")
            .fetch_one(&self.db)
            .await?;
        to_count("count", count)
    }

    async fn count_by_severity(&self) -> Result<Vec<(String, u64)>, StoreError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT LOWER(severity) AS label, COUNT(*) FROM vulnerabilities
             WHERE severity IS NOT NULL
             GROUP BY label",
        )
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(|(label, count)| Ok((label, to_count("severity", count)?)))
            .collect()
    }

    async fn count_distinct_packages(&self) -> Result<u64, StoreError> {
        let (count,) = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(DISTINCT package_name) FROM vulnerabilities",
        )
        .fetch_one(&self.db)
        .await?;
        to_count("package_name", count)
    }

    async fn fix_progress(&self) -> Result<FixProgress, StoreError> {
        // `LIKE` est insensible à la casse pour l'ASCII dans SQLite.
        let (total, fixed) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status LIKE '%fixed%' THEN 1 ELSE 0 END), 0)
             FROM vulnerabilities",
        )
        .fetch_one(&self.db)
        .await?;

        Ok(FixProgress {
            total: to_count("count", total)?,
            fixed: to_count("status", fixed)?,
        })
    }

    async fn risk_factor_frequencies(
        &self,
        limit: usize,
    ) -> Result<Vec<RiskFactorCount>, StoreError> {
        // `json_each` déplie chaque objet en une ligne par clé.
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT factor.key AS name, COUNT(*) AS hits
             FROM vulnerabilities v, json_each(v.risk_factors) AS factor
             WHERE v.risk_factors IS NOT NULL AND json_type(v.risk_factors) = 'object'
             GROUP BY factor.key
             ORDER BY hits DESC
             LIMIT ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(|(name, count)| {
                Ok(RiskFactorCount {
                    name,
                    count: to_count("risk_factors", count)?,
                })
            })
            .collect()
    }

    async fn published_per_month(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<TimelineBucket>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, i64, i64)>(
            "SELECT CAST(strftime('%Y', published) AS INTEGER) AS year,
                    CAST(strftime('%m', published) AS INTEGER) AS month,
                    COUNT(*)
             FROM vulnerabilities
             WHERE published IS NOT NULL
               AND strftime('%Y', published) IS NOT NULL
               AND (?1 IS NULL OR published >= ?1)
             GROUP BY year, month
             ORDER BY year, month",
        )
        .bind(since.map(storage_timestamp))
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(|(year, month, count)| {
                Ok(TimelineBucket {
                    year: i32::try_from(year).map_err(|_| StoreError::InvalidValue {
                        column: "published",
                        value: year,
                    })?,
                    month: u32::try_from(month).map_err(|_| StoreError::InvalidValue {
                        column: "published",
                        value: month,
                    })?,
                    count: to_count("published", count)?,
                })
            })
            .collect()
    }
}

// Doublure en mémoire pour les tests des couches supérieures.
#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::models::SeverityBreakdown;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    pub const SEVERITY: &str = "severity";
    pub const TIMELINE: &str = "timeline";
    pub const TOTAL: &str = "total";
    pub const PACKAGES: &str = "packages";
    pub const FIX_PROGRESS: &str = "fix progress";
    pub const RISK_FACTORS: &str = "risk factors";

    #[derive(Default)]
    pub struct StubStore {
        pub total: u64,
        pub severities: SeverityBreakdown,
        pub packages: u64,
        pub fixed: u64,
        pub risk_factors: Vec<RiskFactorCount>,
        pub timeline: Vec<TimelineBucket>,
        pub fail_on: Option<&'static str>,
        pub hang_on: Option<&'static str>,
        // Délai simulé appliqué à chaque requête.
        pub latency: Duration,
        pub aggregate_calls: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub peak_in_flight: AtomicUsize,
    }

    impl StubStore {
        pub fn failing_on(query: &'static str) -> Self {
            Self {
                fail_on: Some(query),
                ..Self::default()
            }
        }

        pub fn hanging_on(query: &'static str) -> Self {
            Self {
                hang_on: Some(query),
                ..Self::default()
            }
        }

        pub fn with_latency(latency: Duration) -> Self {
            Self {
                latency,
                ..Self::default()
            }
        }

        async fn gate(&self, query: &'static str) -> Result<(), StoreError> {
            // On mesure combien de requêtes sont en cours en même temps.
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.hang_on == Some(query) {
                std::future::pending::<()>().await;
            }
            if self.fail_on == Some(query) {
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            Ok(())
        }

        pub fn aggregate_calls(&self) -> usize {
            self.aggregate_calls.load(Ordering::SeqCst)
        }

        pub fn peak_in_flight(&self) -> usize {
            self.peak_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl VulnerabilityStore for StubStore {
        async fn count_all(&self) -> Result<u64, StoreError> {
            self.gate(TOTAL).await?;
            Ok(self.total)
        }

        async fn count_by_severity(&self) -> Result<Vec<(String, u64)>, StoreError> {
            // Une agrégation complète appelle cette requête exactement une fois.
            self.aggregate_calls.fetch_add(1, Ordering::SeqCst);
            self.gate(SEVERITY).await?;
            let s = self.severities;
            Ok([
                ("critical", s.critical),
                ("high", s.high),
                ("medium", s.medium),
                ("low", s.low),
            ]
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(label, count)| (label.to_string(), count))
            .collect())
        }

        async fn count_distinct_packages(&self) -> Result<u64, StoreError> {
            self.gate(PACKAGES).await?;
            Ok(self.packages)
        }

        async fn fix_progress(&self) -> Result<FixProgress, StoreError> {
            self.gate(FIX_PROGRESS).await?;
            Ok(FixProgress {
                total: self.total,
                fixed: self.fixed,
            })
        }

        async fn risk_factor_frequencies(
            &self,
            limit: usize,
        ) -> Result<Vec<RiskFactorCount>, StoreError> {
            self.gate(RISK_FACTORS).await?;
            Ok(self.risk_factors.iter().take(limit).cloned().collect())
        }

        async fn published_per_month(
            &self,
            _since: Option<DateTime<Utc>>,
        ) -> Result<Vec<TimelineBucket>, StoreError> {
            self.gate(TIMELINE).await?;
            Ok(self.timeline.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_database;
    use chrono::TimeZone;
    use serde_json::{json, Map, Value};

    fn record(severity: &str, status: &str) -> VulnerabilityRecord {
        VulnerabilityRecord {
            severity: Some(severity.to_string()),
            status: Some(status.to_string()),
            ..VulnerabilityRecord::default()
        }
    }

    fn factors(keys: &[&str]) -> Option<Map<String, Value>> {
        Some(keys.iter().map(|k| (k.to_string(), json!({}))).collect())
    }

    async fn store_with(records: &[VulnerabilityRecord]) -> SqliteVulnerabilityStore {
        let store = SqliteVulnerabilityStore::new(init_database(":memory:").await.unwrap());
        store.replace_all(records).await.unwrap();
        store
    }

    #[tokio::test]
    async fn severity_labels_are_lowercased_and_grouped() {
        let store = store_with(&[
            record("Critical", "open"),
            record("CRITICAL", "open"),
            record("medium", "open"),
        ])
        .await;

        let mut counts = store.count_by_severity().await.unwrap();
        counts.sort();
        assert_eq!(
            counts,
            vec![("critical".to_string(), 2), ("medium".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn fixed_status_match_is_case_insensitive_substring() {
        let store = store_with(&[
            record("low", "Fixed in 1.2.3"),
            record("low", "FIXED"),
            record("low", "open"),
            record("low", "will not fix"),
        ])
        .await;

        assert_eq!(
            store.fix_progress().await.unwrap(),
            FixProgress { total: 4, fixed: 2 }
        );
    }

    #[tokio::test]
    async fn empty_store_counts_are_zero() {
        let store = store_with(&[]).await;
        assert_eq!(store.count_all().await.unwrap(), 0);
        assert_eq!(store.count_distinct_packages().await.unwrap(), 0);
        assert_eq!(store.fix_progress().await.unwrap(), FixProgress::default());
        assert!(store.count_by_severity().await.unwrap().is_empty());
        assert!(store.risk_factor_frequencies(10).await.unwrap().is_empty());
        assert!(store.published_per_month(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn distinct_packages_ignore_duplicates_and_nulls() {
        let mut records = Vec::new();
        for name in [Some("openssl"), Some("openssl"), Some("zlib"), None] {
            records.push(VulnerabilityRecord {
                package_name: name.map(str::to_string),
                ..VulnerabilityRecord::default()
            });
        }
        let store = store_with(&records).await;
        assert_eq!(store.count_distinct_packages().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn risk_factor_keys_are_counted_across_records() {
        let store = store_with(&[
            VulnerabilityRecord {
                risk_factors: factors(&["Has fix", "Attack complexity: low"]),
                ..VulnerabilityRecord::default()
            },
            VulnerabilityRecord {
                risk_factors: factors(&["Has fix"]),
                ..VulnerabilityRecord::default()
            },
            VulnerabilityRecord::default(),
        ])
        .await;

        let frequencies = store.risk_factor_frequencies(10).await.unwrap();
        assert_eq!(
            frequencies,
            vec![
                RiskFactorCount {
                    name: "Has fix".to_string(),
                    count: 2
                },
                RiskFactorCount {
                    name: "Attack complexity: low".to_string(),
                    count: 1
                },
            ]
        );
        assert_eq!(store.risk_factor_frequencies(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn timeline_buckets_by_month_from_inclusive_bound() {
        let at = |y, m, d| Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap();
        let mut records = Vec::new();
        for published in [at(2023, 12, 31), at(2024, 1, 15), at(2024, 1, 20), at(2024, 3, 1)] {
            records.push(VulnerabilityRecord {
                published: Some(published),
                ..VulnerabilityRecord::default()
            });
        }
        records.push(VulnerabilityRecord::default());
        let store = store_with(&records).await;

        let all = store.published_per_month(None).await.unwrap();
        assert_eq!(
            all,
            vec![
                TimelineBucket { year: 2023, month: 12, count: 1 },
                TimelineBucket { year: 2024, month: 1, count: 2 },
                TimelineBucket { year: 2024, month: 3, count: 1 },
            ]
        );

        // La borne basse est inclusive.
        let recent = store.published_per_month(Some(at(2024, 1, 15))).await.unwrap();
        assert_eq!(
            recent,
            vec![
                TimelineBucket { year: 2024, month: 1, count: 2 },
                TimelineBucket { year: 2024, month: 3, count: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn replace_all_discards_previous_rows() {
        let store = store_with(&[record("low", "open"), record("low", "open")]).await;
        assert_eq!(store.count_all().await.unwrap(), 2);

        assert_eq!(store.replace_all(&[record("high", "open")]).await.unwrap(), 1);
        assert_eq!(store.count_all().await.unwrap(), 1);
    }
}
