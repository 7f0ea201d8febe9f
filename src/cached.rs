// Couche "cache-aside" devant les endpoints de lecture.
use crate::cache::{CacheError, CacheStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

// Préfixe commun des clés de la route des agrégats.
pub const AGGREGATES_PREFIX: &str = "dashboard:aggregates";

// Construit la clé de cache `prefix:{"a":"1","b":"2"}`.
// Les paramètres passent par un `BTreeMap` : l'ordre d'arrivée n'a aucune
// influence, deux requêtes équivalentes donnent la même clé octet pour octet.
pub fn cache_key<I, K, V>(prefix: &str, params: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    // Tri des paramètres par nom.
    let canonical: BTreeMap<String, String> = params
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();

    let mut key = String::with_capacity(prefix.len() + 2 + canonical.len() * 16);
    key.push_str(prefix);
    key.push(':');
    // Un map de chaînes se sérialise toujours.
    match serde_json::to_string(&canonical) {
        Ok(json) => key.push_str(&json),
        Err(_) => key.push_str("{}"),
    }
    key
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
    // `true` si la réponse vient du cache, `false` si elle vient d'être calculée.
    pub hit: bool,
    pub key: String,
    pub expires_at: DateTime<Utc>,
}

// Réponse composite : la charge utile inchangée, plus les métadonnées de cache.
#[derive(Debug, Clone, Serialize)]
pub struct Cached<T> {
    // Les champs de la charge utile restent au premier niveau du JSON.
    #[serde(flatten)]
    pub payload: T,
    #[serde(rename = "_cache")]
    pub cache: CacheInfo,
}

// Écrit une valeur fraîche dans le cache. Partagé par le chemin "miss" et le warm-up.
pub async fn populate<V>(
    cache: &CacheStore<V>,
    key: &str,
    value: V,
    ttl: Option<Duration>,
) -> Result<DateTime<Utc>, CacheError>
where
    V: Clone + Send + Sync + 'static,
{
    let expires_at = cache.set(key, value, ttl).await?;
    info!("[Cache SET] {} until {}", key, expires_at.to_rfc3339());
    Ok(expires_at)
}

// Sert `key` depuis le cache, ou calcule la valeur avec `compute` et la stocke.
// Une erreur de `compute` est propagée telle quelle et rien n'est écrit.
// Un échec d'écriture dans le cache est seulement journalisé.
pub async fn get_or_compute<V, E, F, Fut>(
    cache: &CacheStore<V>,
    key: String,
    ttl: Option<Duration>,
    compute: F,
) -> Result<Cached<V>, E>
where
    V: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, E>>,
{
    // --- Étape 1: lecture ---
    if let Some(hit) = cache.get(&key).await {
        debug!("[Cache HIT] {}", key);
        return Ok(Cached {
            payload: hit.value,
            cache: CacheInfo {
                hit: true,
                key,
                expires_at: hit.expires_at,
            },
        });
    }

    // --- Étape 2: calcul (cache miss) ---
    debug!("[Cache MISS] {}", key);
    // En cas d'erreur, on sort ici : rien n'est mis en cache.
    let value = compute().await?;

    // --- Étape 3: écriture ---
    let expires_at = match populate(cache, &key, value.clone(), ttl).await {
        Ok(expires_at) => expires_at,
        Err(e) => {
            // La réponse part quand même ; l'échéance annoncée est celle qu'aurait eue l'entrée.
            warn!("[Cache ERROR] Failed to cache response: {}", e);
            cache.expiry_for(ttl)
        }
    };

    Ok(Cached {
        payload: value,
        cache: CacheInfo {
            hit: false,
            key,
            expires_at,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn key_is_independent_of_parameter_order() {
        let forward = cache_key("p", [("timelineMonths", "6"), ("team", "core")]);
        let backward = cache_key("p", [("team", "core"), ("timelineMonths", "6")]);
        assert_eq!(forward, backward);
        assert_eq!(forward, r#"p:{"team":"core","timelineMonths":"6"}"#);

        let from_hash_map: HashMap<String, String> = [
            ("team".to_string(), "core".to_string()),
            ("timelineMonths".to_string(), "6".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(cache_key("p", &from_hash_map), forward);
    }

    #[test]
    fn parameterless_key_matches_warm_up_key() {
        let key = cache_key(AGGREGATES_PREFIX, BTreeMap::<String, String>::new());
        assert_eq!(key, "dashboard:aggregates:{}");
    }

    #[test]
    fn different_values_give_different_keys() {
        assert_ne!(
            cache_key("p", [("timelineMonths", "6")]),
            cache_key("p", [("timelineMonths", "12")])
        );
    }

    #[tokio::test]
    async fn miss_then_hit_computes_once() {
        let cache = CacheStore::new(CacheConfig::default());
        let calls = AtomicUsize::new(0);
        let compute = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(42u32)
        };

        let first = get_or_compute(&cache, "k".to_string(), None, compute)
            .await
            .unwrap();
        assert!(!first.cache.hit);
        assert_eq!(first.payload, 42);

        let second = get_or_compute(&cache, "k".to_string(), None, compute)
            .await
            .unwrap();
        assert!(second.cache.hit);
        assert_eq!(second.cache.expires_at, first.cache.expires_at);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats().await;
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn failed_computation_is_not_cached() {
        let cache = CacheStore::<u32>::new(CacheConfig::default());

        let result = get_or_compute(&cache, "k".to_string(), None, || async {
            Err::<u32, _>("severity query failed")
        })
        .await;
        assert_eq!(result.unwrap_err(), "severity query failed");
        assert_eq!(cache.stats().await.keys, 0);

        // La requête suivante repasse par le chemin "miss".
        let retry = get_or_compute(&cache, "k".to_string(), None, || async {
            Ok::<_, &str>(7)
        })
        .await
        .unwrap();
        assert!(!retry.cache.hit);
        assert_eq!(cache.stats().await.misses, 2);
    }

    #[tokio::test]
    async fn cache_write_failure_still_returns_fresh_value() {
        let cache = CacheStore::new(CacheConfig {
            max_keys: Some(0),
            ..CacheConfig::default()
        });

        let response = get_or_compute(&cache, "k".to_string(), None, || async {
            Ok::<_, String>("fresh".to_string())
        })
        .await
        .unwrap();

        assert_eq!(response.payload, "fresh");
        assert!(!response.cache.hit);
        assert!(response.cache.expires_at > Utc::now());
        assert_eq!(cache.stats().await.keys, 0);
    }

    #[tokio::test]
    async fn metadata_is_a_sibling_of_the_payload() {
        #[derive(Clone, Serialize)]
        struct Payload {
            total: u64,
        }

        let cache = CacheStore::new(CacheConfig::default());
        let response = get_or_compute(&cache, "k".to_string(), None, || async {
            Ok::<_, String>(Payload { total: 3 })
        })
        .await
        .unwrap();

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["total"], 3);
        assert_eq!(json["_cache"]["hit"], false);
        assert_eq!(json["_cache"]["key"], "k");
        assert!(json["_cache"]["expiresAt"].is_string());
    }
}
