//! Migrations: embedded, ordered, idempotent schema changes.
//!
//! Modeled on `SqliteStateStore::apply_migrations`'s `Vec<(version, name,
//! description, statements)>` shape, generalized to the four tables this schema
//! requires. Applied once per process behind a global lock since SQLite migrations
//! are not safe to run concurrently.
use crate::errors::MigrationError;
use sqlx::sqlite::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, info};

static MIGRATION_LOCK: Mutex<()> = Mutex::const_new(());

struct Migration {
    version: i64,
    name: &'static str,
    statements: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_workflow_states",
        statements: &[
            r#"CREATE TABLE IF NOT EXISTS workflow_states (
                workflow_exec_id TEXT PRIMARY KEY NOT NULL,
                workflow_id TEXT NOT NULL,
                status TEXT NOT NULL,
                usage TEXT,
                input TEXT,
                output TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (usage IS NULL OR json_type(usage) = 'array')
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_workflow_states_status ON workflow_states(status)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_workflow_states_workflow_id ON workflow_states(workflow_id)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_workflow_states_created_at ON workflow_states(created_at)"#,
            r#"CREATE TRIGGER IF NOT EXISTS trg_workflow_states_updated_at
                AFTER UPDATE ON workflow_states
                FOR EACH ROW
                WHEN NEW.updated_at = OLD.updated_at
                BEGIN
                    UPDATE workflow_states
                    SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                    WHERE workflow_exec_id = NEW.workflow_exec_id;
                END"#,
        ],
    },
    Migration {
        version: 2,
        name: "create_task_states",
        statements: &[
            r#"CREATE TABLE IF NOT EXISTS task_states (
                task_exec_id TEXT PRIMARY KEY NOT NULL,
                component TEXT NOT NULL,
                status TEXT NOT NULL,
                task_id TEXT NOT NULL,
                workflow_exec_id TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                execution_type TEXT NOT NULL,
                usage TEXT,
                agent_id TEXT,
                tool_id TEXT,
                action_id TEXT,
                parent_state_id TEXT,
                input TEXT,
                output TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (usage IS NULL OR json_type(usage) = 'array'),
                FOREIGN KEY (workflow_exec_id) REFERENCES workflow_states(workflow_exec_id) ON DELETE CASCADE,
                FOREIGN KEY (parent_state_id) REFERENCES task_states(task_exec_id) ON DELETE CASCADE
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_task_states_status ON task_states(status)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_task_states_workflow_id ON task_states(workflow_id)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_task_states_workflow_exec_id ON task_states(workflow_exec_id)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_task_states_task_id ON task_states(task_id)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_task_states_parent_state_id ON task_states(parent_state_id)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_task_states_agent_id ON task_states(agent_id)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_task_states_tool_id ON task_states(tool_id)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_task_states_action_id ON task_states(action_id)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_task_states_execution_type ON task_states(execution_type)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_task_states_created_at ON task_states(created_at)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_task_states_updated_at ON task_states(updated_at)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_task_states_workflow_task ON task_states(workflow_exec_id, task_id)"#,
            r#"CREATE TRIGGER IF NOT EXISTS trg_task_states_updated_at
                AFTER UPDATE ON task_states
                FOR EACH ROW
                WHEN NEW.updated_at = OLD.updated_at
                BEGIN
                    UPDATE task_states
                    SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                    WHERE task_exec_id = NEW.task_exec_id;
                END"#,
        ],
    },
    Migration {
        version: 3,
        name: "create_users",
        statements: &[
            r#"CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY NOT NULL,
                email TEXT NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('admin', 'user')),
                created_at TEXT NOT NULL,
                updated_at TEXT
            )"#,
            r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_users_email_lower ON users(lower(email))"#,
        ],
    },
    Migration {
        version: 4,
        name: "create_api_keys",
        statements: &[
            r#"CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY NOT NULL,
                user_id TEXT NOT NULL,
                hash BLOB NOT NULL,
                prefix TEXT NOT NULL,
                fingerprint BLOB NOT NULL,
                created_at TEXT NOT NULL,
                last_used TEXT,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_api_keys_fingerprint ON api_keys(fingerprint)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_api_keys_user_id ON api_keys(user_id)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_api_keys_created_at ON api_keys(created_at)"#,
        ],
    },
];

const EXPECTED_TABLES: &[&str] = &["workflow_states", "task_states", "users", "api_keys"];

/// Apply all pending migrations, serialized process-wide by `MIGRATION_LOCK`.
pub async fn apply(pool: &SqlitePool) -> Result<(), MigrationError> {
    let _guard = MIGRATION_LOCK.lock().await;

    sqlx::query(
        r#"CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY NOT NULL,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL
        )"#,
    )
    .execute(pool)
    .await?;

    let max_version: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
        .fetch_one(pool)
        .await?;

    for migration in MIGRATIONS {
        if migration.version <= max_version {
            continue;
        }
        for statement in migration.statements {
            sqlx::query(statement)
                .execute(pool)
                .await
                .map_err(|source| MigrationError::Apply {
                    version: migration.version,
                    name: migration.name,
                    source,
                })?;
        }
        let now = crate::models::format_timestamp(&chrono::Utc::now());
        sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
            .bind(migration.version)
            .bind(migration.name)
            .bind(now)
            .execute(pool)
            .await
            .map_err(|source| MigrationError::Record {
                version: migration.version,
                name: migration.name,
                source,
            })?;
        debug!(version = migration.version, name = migration.name, "applied migration");
    }

    verify_schema(pool).await?;
    info!(count = MIGRATIONS.len(), "migrations up to date");
    Ok(())
}

async fn verify_schema(pool: &SqlitePool) -> Result<(), MigrationError> {
    for table in EXPECTED_TABLES {
        let exists: Option<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_optional(pool)
        .await?;
        if exists.is_none() {
            return Err(MigrationError::Incomplete(table.to_string()));
        }
    }
    Ok(())
}

/// Drop triggers, indexes, and tables in reverse dependency order. Intended for
/// test teardown and local development resets, not for production use.
pub async fn down(pool: &SqlitePool) -> Result<(), MigrationError> {
    let _guard = MIGRATION_LOCK.lock().await;
    sqlx::query("DROP TRIGGER IF EXISTS trg_task_states_updated_at").execute(pool).await?;
    sqlx::query("DROP TRIGGER IF EXISTS trg_workflow_states_updated_at").execute(pool).await?;
    sqlx::query("DROP TABLE IF EXISTS api_keys").execute(pool).await?;
    sqlx::query("DROP TABLE IF EXISTS users").execute(pool).await?;
    sqlx::query("DROP TABLE IF EXISTS task_states").execute(pool).await?;
    sqlx::query("DROP TABLE IF EXISTS workflow_states").execute(pool).await?;
    sqlx::query("DROP TABLE IF EXISTS schema_migrations").execute(pool).await?;
    Ok(())
}
