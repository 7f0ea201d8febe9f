use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

// TTL par défaut : 30 minutes. Balayage des entrées expirées : toutes les 10 minutes.
pub const DEFAULT_TTL_SECS: u64 = 1800;
pub const DEFAULT_CHECK_PERIOD_SECS: u64 = 600;

// Borne utilisée quand un TTL déborderait l'horloge monotone.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub default_ttl: Duration,
    pub check_period: Duration,
    // `None` : pas de limite sur le nombre de clés.
    pub max_keys: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            check_period: Duration::from_secs(DEFAULT_CHECK_PERIOD_SECS),
            max_keys: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache is full ({max_keys} keys), cannot insert {key}")]
    CapacityExceeded { key: String, max_keys: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("pattern {0:?} contains more than one wildcard")]
    MultipleWildcards(String),
}

// Motif d'invalidation : une clé exacte, ou un seul `*` ancré
// (préfixe avant l'étoile, suffixe après).
// Un motif vide ne correspond à aucune clé, ce n'est pas une erreur.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachePattern {
    Nothing,
    Exact(String),
    Wildcard { prefix: String, suffix: String },
}

impl CachePattern {
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        if raw.is_empty() {
            return Ok(Self::Nothing);
        }
        match raw.split_once('*') {
            None => Ok(Self::Exact(raw.to_string())),
            Some((_, suffix)) if suffix.contains('*') => {
                Err(PatternError::MultipleWildcards(raw.to_string()))
            }
            Some((prefix, suffix)) => Ok(Self::Wildcard {
                prefix: prefix.to_string(),
                suffix: suffix.to_string(),
            }),
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Nothing => false,
            Self::Exact(exact) => key == exact,
            Self::Wildcard { prefix, suffix } => {
                // Le préfixe et le suffixe ne doivent pas se chevaucher ("ab*ba" ne vise pas "aba").
                key.len() >= prefix.len() + suffix.len()
                    && key.starts_with(prefix.as_str())
                    && key.ends_with(suffix.as_str())
            }
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    // Échéance sur l'horloge monotone (fait foi), et sa copie murale pour les réponses.
    expires_at: Instant,
    expires_at_utc: DateTime<Utc>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

// Résultat d'une lecture réussie.
#[derive(Debug, Clone)]
pub struct CacheHit<V> {
    pub value: V,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Inner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    last_reset: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: String,
    pub keys: usize,
    pub last_reset: DateTime<Utc>,
}

// Pourcentage arrondi à 2 décimales, "0%" tant qu'aucune lecture n'a eu lieu.
pub fn format_hit_rate(hits: u64, misses: u64) -> String {
    let total = hits + misses;
    if total == 0 {
        return "0%".to_string();
    }
    format!("{:.2}%", hits as f64 / total as f64 * 100.0)
}

// Table clé → valeur partagée par tout le process, avec expiration par entrée.
// Les entrées expirées sont invisibles dès leur échéance (vérification à la
// lecture) et retirées physiquement par la tâche de balayage périodique.
#[derive(Debug)]
pub struct CacheStore<V> {
    inner: RwLock<Inner<V>>,
    // Compteurs hors verrou : une lecture ne prend que le verrou partagé.
    hits: AtomicU64,
    misses: AtomicU64,
    config: CacheConfig,
}

impl<V> CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::with_capacity(64),
                last_reset: Utc::now(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            config,
        }
    }

    // Construit le store et démarre sa tâche de balayage.
    pub fn start(config: CacheConfig) -> Arc<Self> {
        let store = Arc::new(Self::new(config));
        store.spawn_sweeper();
        store
    }

    // La tâche ne garde qu'une référence faible : elle s'arrête quand le store est libéré.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        let period = self.config.check_period.max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // Le premier tick est immédiat.
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let removed = store.sweep_expired().await;
                if removed > 0 {
                    info!("[Cache SWEEP] Removed {} expired keys", removed);
                }
            }
        })
    }

    fn effective_ttl(&self, ttl: Option<Duration>) -> Duration {
        match ttl {
            Some(ttl) if !ttl.is_zero() => ttl,
            _ => self.config.default_ttl,
        }
    }

    // Échéance (horloge murale) qu'aurait une entrée écrite maintenant.
    pub fn expiry_for(&self, ttl: Option<Duration>) -> DateTime<Utc> {
        wall_clock_after(self.effective_ttl(ttl))
    }

    pub async fn get(&self, key: &str) -> Option<CacheHit<V>> {
        let now = Instant::now();
        // Verrou en lecture : plusieurs `get` peuvent tourner en même temps.
        let inner = self.inner.read().await;

        // Pas de TTL glissant : la lecture ne touche pas à l'échéance.
        match inner.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(CacheHit {
                    value: entry.value.clone(),
                    expires_at: entry.expires_at_utc,
                })
            }
            // Absente ou expirée : les deux comptent comme un miss.
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    // Insère ou remplace `key`. `None` ou un TTL nul prennent le TTL par défaut.
    pub async fn set(
        &self,
        key: impl Into<String>,
        value: V,
        ttl: Option<Duration>,
    ) -> Result<DateTime<Utc>, CacheError> {
        let key = key.into();
        let ttl = self.effective_ttl(ttl);
        let now = Instant::now();
        let mut inner = self.inner.write().await;

        // Remplacer une clé existante ne consomme pas de place.
        if let Some(max_keys) = self.config.max_keys {
            if !inner.entries.contains_key(&key) && inner.entries.len() >= max_keys {
                // Les entrées expirées ne doivent pas occuper de place.
                inner.entries.retain(|_, entry| !entry.is_expired(now));
                if inner.entries.len() >= max_keys {
                    return Err(CacheError::CapacityExceeded { key, max_keys });
                }
            }
        }

        let expires_at_utc = wall_clock_after(ttl);
        // Un `insert` sur une clé existante remplace valeur et échéance d'un coup.
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                expires_at: now.checked_add(ttl).unwrap_or(now + FAR_FUTURE),
                expires_at_utc,
            },
        );
        Ok(expires_at_utc)
    }

    pub async fn delete_exact(&self, key: &str) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        match inner.entries.remove(key) {
            Some(entry) if !entry.is_expired(now) => 1,
            _ => 0,
        }
    }

    // Supprime les entrées correspondant à `pattern` et retourne le nombre d'entrées vivantes retirées.
    pub async fn invalidate(&self, pattern: &CachePattern) -> usize {
        match pattern {
            // Rien à parcourir, et pas besoin du verrou d'écriture.
            CachePattern::Nothing => return 0,
            // Une clé exacte évite de parcourir toute la table.
            CachePattern::Exact(key) => return self.delete_exact(key).await,
            CachePattern::Wildcard { .. } => {}
        }

        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let mut removed = 0;
        // Parcours complet de la table ; les entrées expirées qui correspondent partent aussi.
        inner.entries.retain(|key, entry| {
            if !pattern.matches(key) {
                return true;
            }
            if !entry.is_expired(now) {
                removed += 1;
            }
            false
        });
        removed
    }

    // Vide le cache et remet les compteurs à zéro, sous le même verrou.
    pub async fn flush_all(&self) -> bool {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.last_reset = Utc::now();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        true
    }

    pub async fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let inner = self.inner.read().await;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);

        CacheStats {
            hits,
            misses,
            hit_rate: format_hit_rate(hits, misses),
            // Seules les entrées encore vivantes sont comptées.
            keys: inner
                .entries
                .values()
                .filter(|entry| !entry.is_expired(now))
                .count(),
            last_reset: inner.last_reset,
        }
    }

    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let before = inner.entries.len();
        inner.entries.retain(|key, entry| {
            let expired = entry.is_expired(now);
            if expired {
                debug!(
                    "[Cache EXPIRE] {} after {:?}",
                    key,
                    now.duration_since(entry.inserted_at)
                );
            }
            !expired
        });
        before - inner.entries.len()
    }
}

// `now + ttl` sur l'horloge murale, plafonné à la date maximale de chrono.
fn wall_clock_after(ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
impl<V> CacheStore<V> {
    // Entrées physiquement présentes, expirées comprises.
    pub async fn resident_len(&self) -> usize {
        self.inner.read().await.entries.len()
    }
}
