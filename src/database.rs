// Importe le pool de connexions SQLite de SQLx et le logger `info` de `tracing`.
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

// Une migration de schéma, appliquée une seule fois et dans l'ordre des versions.
struct Migration {
    version: i32,
    name: &'static str,
    // `include_str!` intègre le fichier SQL dans le binaire à la compilation.
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_vulnerabilities",
        sql: include_str!("../migrations/001_create_vulnerabilities.sql"),
    },
    Migration {
        version: 2,
        name: "add_dashboard_indexes",
        sql: include_str!("../migrations/002_add_dashboard_indexes.sql"),
    },
];

const MEMORY_DATABASE: &str = ":memory:";

// Une connexion par requête de l'agrégation : les six lectures tournent vraiment en parallèle.
const MEMORY_POOL_SIZE: u32 = 6;

// Ouvre (ou crée) la base, applique les migrations manquantes et retourne le pool.
pub async fn init_database(db_file: &str) -> Result<SqlitePool, sqlx::Error> {
    let pool = if db_file == MEMORY_DATABASE {
        // SQLx nomme chaque base `sqlite::memory:` de façon unique, en cache partagé :
        // toutes les connexions de ce pool voient les mêmes données, et deux pools restent isolés.
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .busy_timeout(Duration::from_secs(5));
        // La base disparaît avec sa dernière connexion : aucune n'est jamais recyclée.
        SqlitePoolOptions::new()
            .max_connections(MEMORY_POOL_SIZE)
            .min_connections(MEMORY_POOL_SIZE)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        // Les PRAGMA passent par les options de connexion : ils s'appliquent
        // ainsi à chaque connexion du pool, pas seulement à la première.
        let options = SqliteConnectOptions::new()
            .filename(db_file)
            .create_if_missing(true)
            // WAL : les lecteurs ne sont pas bloqués par les écritures.
            .journal_mode(SqliteJournalMode::Wal)
            // Moins de `fsync`, risque minime en cas de crash système.
            .synchronous(SqliteSynchronous::Normal)
            // Attend 5s si la base est verrouillée avant de retourner une erreur.
            .busy_timeout(Duration::from_secs(5))
            // 128MB de cache de pages, tables temporaires en RAM.
            .pragma("cache_size", "-128000")
            .pragma("temp_store", "MEMORY")
            .pragma("mmap_size", "536870912");
        SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?
    };

    // Table de suivi des migrations déjà appliquées.
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at REAL NOT NULL
        )",
    )
    .execute(&pool)
    .await?;

    for migration in MIGRATIONS {
        let applied =
            sqlx::query_as::<_, (i32,)>("SELECT version FROM schema_migrations WHERE version = ?")
                .bind(migration.version)
                .fetch_optional(&pool)
                .await?
                .is_some();

        if !applied {
            info!(
                "Running migration {}: {}",
                migration.version, migration.name
            );

            // Chaque migration tourne dans sa propre transaction : tout ou rien.
            let mut tx = pool.begin().await?;
            sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;

            sqlx::query(
                "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)",
            )
            .bind(migration.version)
            .bind(migration.name)
            .bind(current_timestamp())
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            info!("Migration {} applied successfully", migration.version);
        } else {
            info!("Migration {} already applied, skipping", migration.version);
        }
    }

    // Statistiques pour l'optimiseur de requêtes de SQLite.
    sqlx::query("ANALYZE").execute(&pool).await?;

    info!("Database initialization complete");

    Ok(pool)
}

// Timestamp actuel en secondes (f64).
fn current_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}
