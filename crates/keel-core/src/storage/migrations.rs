//! Database migrations
//!
//! Schema migrations for the knowledge store. Migrations are versioned and
//! applied automatically when a [`Database`](super::Database) is opened.

use sqlx::SqlitePool;

/// Current schema version
pub const CURRENT_VERSION: i32 = 4;

/// SQL for creating the migrations tracking table
const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1: Knowledge store (entities, relationships, embeddings, query cache)
const MIGRATION_V1: &str = r#"
    -- Modules and functions
    CREATE TABLE IF NOT EXISTS entities (
        id TEXT PRIMARY KEY NOT NULL,
        kind TEXT NOT NULL CHECK (kind IN ('module', 'function')),
        name TEXT NOT NULL,
        path TEXT NOT NULL,
        signature TEXT,
        size INTEGER NOT NULL DEFAULT 0,
        checksum TEXT NOT NULL,
        complexity REAL NOT NULL DEFAULT 0.0,
        last_modified TEXT NOT NULL,
        indexed_at TEXT NOT NULL,
        tombstoned INTEGER NOT NULL DEFAULT 0,
        version INTEGER NOT NULL DEFAULT 1
    );

    CREATE INDEX IF NOT EXISTS idx_entities_path ON entities(path);
    CREATE INDEX IF NOT EXISTS idx_entities_kind ON entities(kind);

    -- Directed edges; owners and test files are not required to be entities
    CREATE TABLE IF NOT EXISTS relationships (
        source_id TEXT NOT NULL,
        target_id TEXT NOT NULL,
        kind TEXT NOT NULL CHECK (kind IN ('imports', 'calls', 'co_changes', 'owns', 'tests')),
        weight REAL NOT NULL DEFAULT 1.0,
        created_at TEXT NOT NULL,
        PRIMARY KEY (source_id, target_id, kind)
    );

    CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships(target_id);
    CREATE INDEX IF NOT EXISTS idx_relationships_kind ON relationships(kind);

    -- One vector per entity, little-endian f32 blob
    CREATE TABLE IF NOT EXISTS embeddings (
        entity_id TEXT PRIMARY KEY NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
        model TEXT NOT NULL,
        dimensions INTEGER NOT NULL,
        vector BLOB NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model);

    -- Cold tier of the query cache
    CREATE TABLE IF NOT EXISTS query_cache (
        fingerprint TEXT PRIMARY KEY NOT NULL,
        params TEXT NOT NULL,
        response TEXT NOT NULL,
        created_at TEXT NOT NULL,
        expires_at TEXT NOT NULL,
        access_count INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_query_cache_expires_at ON query_cache(expires_at);

    CREATE TABLE IF NOT EXISTS cache_dependencies (
        fingerprint TEXT NOT NULL REFERENCES query_cache(fingerprint) ON DELETE CASCADE,
        path TEXT NOT NULL,
        PRIMARY KEY (fingerprint, path)
    );

    CREATE INDEX IF NOT EXISTS idx_cache_dependencies_path ON cache_dependencies(path);
"#;

/// Migration 2: Learning loop (context packs, outcomes, confidence events)
const MIGRATION_V2: &str = r#"
    CREATE TABLE IF NOT EXISTS context_packs (
        id TEXT PRIMARY KEY NOT NULL,
        target_entity_id TEXT NOT NULL,
        summary TEXT NOT NULL DEFAULT '',
        key_facts TEXT NOT NULL DEFAULT '[]',
        related_files TEXT NOT NULL DEFAULT '[]',
        score REAL NOT NULL DEFAULT 0.0,
        success_count INTEGER NOT NULL DEFAULT 0,
        failure_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_context_packs_target ON context_packs(target_entity_id);

    -- Entities covered by a pack (target plus related files)
    CREATE TABLE IF NOT EXISTS pack_entities (
        pack_id TEXT NOT NULL REFERENCES context_packs(id) ON DELETE CASCADE,
        entity_id TEXT NOT NULL,
        PRIMARY KEY (pack_id, entity_id)
    );

    CREATE INDEX IF NOT EXISTS idx_pack_entities_entity ON pack_entities(entity_id);

    -- Append-only outcome log
    CREATE TABLE IF NOT EXISTS outcomes (
        id TEXT PRIMARY KEY NOT NULL,
        submission_key TEXT NOT NULL UNIQUE,
        task_id TEXT,
        pack_ids TEXT NOT NULL,
        success INTEGER NOT NULL,
        failure_reason TEXT,
        failure_category TEXT,
        files_modified TEXT NOT NULL DEFAULT '[]',
        recorded_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_outcomes_recorded_at ON outcomes(recorded_at);

    -- Pack/outcome co-occurrence for spectrum-based attribution
    CREATE TABLE IF NOT EXISTS outcome_packs (
        outcome_id TEXT NOT NULL REFERENCES outcomes(id) ON DELETE CASCADE,
        pack_id TEXT NOT NULL,
        success INTEGER NOT NULL,
        recorded_at TEXT NOT NULL,
        PRIMARY KEY (outcome_id, pack_id)
    );

    CREATE INDEX IF NOT EXISTS idx_outcome_packs_pack ON outcome_packs(pack_id);

    CREATE TABLE IF NOT EXISTS confidence_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_id TEXT NOT NULL,
        delta REAL NOT NULL,
        reason TEXT NOT NULL,
        recorded_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_confidence_events_entity ON confidence_events(entity_id, recorded_at);
"#;

/// Migration 3: Constraints and pattern observations
const MIGRATION_V3: &str = r#"
    CREATE TABLE IF NOT EXISTS constraints (
        id TEXT PRIMARY KEY NOT NULL,
        scope TEXT NOT NULL,
        rule TEXT NOT NULL,
        source TEXT NOT NULL CHECK (source IN ('explicit', 'inferred')),
        rationale TEXT NOT NULL DEFAULT '',
        expires_at TEXT,
        exception_reason TEXT,
        exception_expires_at TEXT,
        origin_pattern TEXT,
        observation_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_constraints_source ON constraints(source);
    CREATE INDEX IF NOT EXISTS idx_constraints_exception ON constraints(exception_expires_at);

    -- One row per (pattern, file) where a recurring pattern was validated
    CREATE TABLE IF NOT EXISTS pattern_observations (
        pattern_key TEXT NOT NULL,
        scope TEXT NOT NULL,
        rule TEXT NOT NULL,
        rationale TEXT NOT NULL DEFAULT '',
        file TEXT NOT NULL,
        observed_at TEXT NOT NULL,
        PRIMARY KEY (pattern_key, file)
    );
"#;

/// Migration 4: Entities each outcome covered when it was recorded
const MIGRATION_V4: &str = r#"
    CREATE TABLE IF NOT EXISTS outcome_entities (
        outcome_id TEXT NOT NULL REFERENCES outcomes(id) ON DELETE CASCADE,
        entity_id TEXT NOT NULL,
        PRIMARY KEY (outcome_id, entity_id)
    );

    CREATE INDEX IF NOT EXISTS idx_outcome_entities_entity ON outcome_entities(entity_id);

    -- Older outcomes only have current pack membership to go on
    INSERT OR IGNORE INTO outcome_entities (outcome_id, entity_id)
    SELECT op.outcome_id, pe.entity_id
    FROM outcome_packs op
    JOIN pack_entities pe ON pe.pack_id = op.pack_id;
"#;

/// Get the current schema version from the database
async fn get_current_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let row: Option<(Option<i32>,)> = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_optional(pool)
        .await?;

    Ok(row.and_then(|(v,)| v).unwrap_or(0))
}

/// Record that a migration has been applied
async fn record_migration(pool: &SqlitePool, version: i32) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let current_version = get_current_version(pool).await?;

    tracing::info!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking database migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Database is up to date");
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: Knowledge store");
        sqlx::raw_sql(MIGRATION_V1).execute(pool).await?;
        record_migration(pool, 1).await?;
    }

    if current_version < 2 {
        tracing::info!("Applying migration v2: Learning loop");
        sqlx::raw_sql(MIGRATION_V2).execute(pool).await?;
        record_migration(pool, 2).await?;
    }

    if current_version < 3 {
        tracing::info!("Applying migration v3: Constraints");
        sqlx::raw_sql(MIGRATION_V3).execute(pool).await?;
        record_migration(pool, 3).await?;
    }

    if current_version < 4 {
        tracing::info!("Applying migration v4: Outcome entity snapshots");
        sqlx::raw_sql(MIGRATION_V4).execute(pool).await?;
        record_migration(pool, 4).await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Check if the database needs migrations
pub async fn needs_migration(pool: &SqlitePool) -> anyhow::Result<bool> {
    let current_version = get_current_version(pool).await?;
    Ok(current_version < CURRENT_VERSION)
}

/// Get migration status information
pub async fn migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    let current_version = get_current_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Current schema version in the database
    pub current_version: i32,
    /// Target schema version (latest)
    pub target_version: i32,
    /// Whether migrations need to be run
    pub needs_migration: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool")
    }

    #[tokio::test]
    async fn test_run_migrations() {
        let pool = create_test_pool().await;

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, 0);
        assert!(status.needs_migration);

        run_migrations(&pool).await.unwrap();

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, CURRENT_VERSION);
        assert!(!status.needs_migration);
        assert!(!needs_migration(&pool).await.unwrap());
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let pool = create_test_pool().await;

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, CURRENT_VERSION);
    }

    #[tokio::test]
    async fn test_tables_created() {
        let pool = create_test_pool().await;
        run_migrations(&pool).await.unwrap();

        let tables = [
            "entities",
            "relationships",
            "embeddings",
            "query_cache",
            "cache_dependencies",
            "context_packs",
            "pack_entities",
            "outcomes",
            "outcome_packs",
            "outcome_entities",
            "confidence_events",
            "constraints",
            "pattern_observations",
        ];

        for table in tables {
            let result: (i32,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&pool)
                .await
                .unwrap_or_else(|_| panic!("Table {} should exist", table));
            assert_eq!(result.0, 0, "Table {} should be empty", table);
        }
    }

    #[tokio::test]
    async fn test_relationship_triple_is_unique() {
        let pool = create_test_pool().await;
        run_migrations(&pool).await.unwrap();

        let insert = "INSERT INTO relationships (source_id, target_id, kind, created_at) VALUES ('a', 'b', 'imports', '2024')";
        sqlx::query(insert).execute(&pool).await.unwrap();
        assert!(sqlx::query(insert).execute(&pool).await.is_err());
    }
}
