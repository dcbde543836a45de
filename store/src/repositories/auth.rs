//! Auth repository: CRUD for users and API keys, plus the bootstrap-admin guard.
use crate::errors::RepositoryError;
use crate::models::{format_timestamp, parse_timestamp, ApiKey, User, UserRole};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use uuid::Uuid;

#[async_trait]
pub trait AuthRepository: Send + Sync {
    async fn create_user(&self, user: &User) -> Result<User, RepositoryError>;
    async fn get_user_by_id(&self, id: &str) -> Result<User, RepositoryError>;
    async fn get_user_by_email(&self, email: &str) -> Result<User, RepositoryError>;
    async fn list_users(&self) -> Result<Vec<User>, RepositoryError>;
    async fn update_user(&self, user: &User) -> Result<(), RepositoryError>;
    async fn delete_user(&self, id: &str) -> Result<(), RepositoryError>;

    async fn create_api_key(&self, key: &ApiKey) -> Result<ApiKey, RepositoryError>;
    async fn get_api_key_by_id(&self, id: &str) -> Result<ApiKey, RepositoryError>;
    async fn get_api_key_by_fingerprint(&self, fingerprint: &[u8]) -> Result<ApiKey, RepositoryError>;
    async fn list_api_keys_by_user_id(&self, user_id: &str) -> Result<Vec<ApiKey>, RepositoryError>;
    async fn update_api_key_last_used(&self, id: &str) -> Result<(), RepositoryError>;
    async fn delete_api_key(&self, id: &str) -> Result<(), RepositoryError>;

    /// Atomic `INSERT ... SELECT ... WHERE NOT EXISTS` against any existing admin,
    /// eliminating the check-then-insert race.
    async fn create_initial_admin_if_none(&self, user: &User) -> Result<User, RepositoryError>;
}

struct UserRow {
    id: String,
    email: String,
    role: String,
    created_at: String,
    updated_at: Option<String>,
}

impl TryFrom<UserRow> for User {
    type Error = RepositoryError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            id: row.id,
            email: row.email,
            role: row.role.parse::<UserRole>()?,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: row.updated_at.map(|s| parse_timestamp(&s)).transpose()?,
        })
    }
}

struct ApiKeyRow {
    id: String,
    user_id: String,
    hash: Vec<u8>,
    prefix: String,
    fingerprint: Vec<u8>,
    created_at: String,
    last_used: Option<String>,
}

impl TryFrom<ApiKeyRow> for ApiKey {
    type Error = RepositoryError;

    fn try_from(row: ApiKeyRow) -> Result<Self, Self::Error> {
        Ok(ApiKey {
            id: row.id,
            user_id: row.user_id,
            hash: row.hash,
            prefix: row.prefix,
            fingerprint: row.fingerprint,
            created_at: parse_timestamp(&row.created_at)?,
            last_used: row.last_used.map(|s| parse_timestamp(&s)).transpose()?,
        })
    }
}

fn user_row_from(row: &sqlx::sqlite::SqliteRow) -> Result<UserRow, RepositoryError> {
    Ok(UserRow {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        role: row.try_get("role")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn api_key_row_from(row: &sqlx::sqlite::SqliteRow) -> Result<ApiKeyRow, RepositoryError> {
    Ok(ApiKeyRow {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        hash: row.try_get("hash")?,
        prefix: row.try_get("prefix")?,
        fingerprint: row.try_get("fingerprint")?,
        created_at: row.try_get("created_at")?,
        last_used: row.try_get("last_used")?,
    })
}

/// Concrete SQLite-backed [`AuthRepository`].
pub struct SqliteAuthRepository {
    pool: SqlitePool,
}

impl SqliteAuthRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuthRepository for SqliteAuthRepository {
    async fn create_user(&self, user: &User) -> Result<User, RepositoryError> {
        let created_at = if user.created_at == DateTime::<Utc>::default() {
            chrono::Utc::now()
        } else {
            user.created_at
        };
        let created_at = format_timestamp(&created_at);
        let updated_at = user.updated_at.map(|t| format_timestamp(&t));

        sqlx::query(
            "INSERT INTO users (id, email, role, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(user.role.as_str())
        .bind(&created_at)
        .bind(&updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if e.to_string().to_lowercase().contains("unique") {
                RepositoryError::EmailExists(user.email.clone())
            } else {
                RepositoryError::Database(e)
            }
        })?;

        self.get_user_by_id(&user.id).await
    }

    async fn get_user_by_id(&self, id: &str) -> Result<User, RepositoryError> {
        let row = sqlx::query("SELECT id, email, role, created_at, updated_at FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RepositoryError::UserNotFound(id.to_string()))?;
        user_row_from(&row)?.try_into()
    }

    async fn get_user_by_email(&self, email: &str) -> Result<User, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, email, role, created_at, updated_at FROM users WHERE lower(email) = lower(?)",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RepositoryError::UserNotFound(email.to_string()))?;
        user_row_from(&row)?.try_into()
    }

    async fn list_users(&self) -> Result<Vec<User>, RepositoryError> {
        let rows = sqlx::query("SELECT id, email, role, created_at, updated_at FROM users ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| user_row_from(row)?.try_into()).collect()
    }

    async fn update_user(&self, user: &User) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE users SET email = ?, role = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&user.email)
        .bind(user.role.as_str())
        .bind(format_timestamp(&chrono::Utc::now()))
        .bind(&user.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::UserNotFound(user.id.clone()));
        }
        Ok(())
    }

    async fn delete_user(&self, id: &str) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM api_keys WHERE user_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(RepositoryError::UserNotFound(id.to_string()));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn create_api_key(&self, key: &ApiKey) -> Result<ApiKey, RepositoryError> {
        let created_at = if key.created_at == DateTime::<Utc>::default() {
            chrono::Utc::now()
        } else {
            key.created_at
        };
        let created_at = format_timestamp(&created_at);
        let last_used = key.last_used.map(|t| format_timestamp(&t));

        sqlx::query(
            "INSERT INTO api_keys (id, user_id, hash, prefix, fingerprint, created_at, last_used)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&key.id)
        .bind(&key.user_id)
        .bind(&key.hash)
        .bind(&key.prefix)
        .bind(&key.fingerprint)
        .bind(&created_at)
        .bind(&last_used)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if RepositoryError::is_foreign_key_violation(&e) {
                RepositoryError::ForeignKey(format!("user {} does not exist", key.user_id))
            } else {
                RepositoryError::Database(e)
            }
        })?;

        self.get_api_key_by_id(&key.id).await
    }

    async fn get_api_key_by_id(&self, id: &str) -> Result<ApiKey, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, user_id, hash, prefix, fingerprint, created_at, last_used FROM api_keys WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RepositoryError::ApiKeyNotFound(id.to_string()))?;

        api_key_row_from(&row)?.try_into()
    }

    async fn get_api_key_by_fingerprint(&self, fingerprint: &[u8]) -> Result<ApiKey, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, user_id, hash, prefix, fingerprint, created_at, last_used
             FROM api_keys WHERE fingerprint = ?",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RepositoryError::ApiKeyNotFound(hex::encode(fingerprint)))?;

        api_key_row_from(&row)?.try_into()
    }

    async fn list_api_keys_by_user_id(&self, user_id: &str) -> Result<Vec<ApiKey>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, user_id, hash, prefix, fingerprint, created_at, last_used
             FROM api_keys WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| api_key_row_from(row)?.try_into()).collect()
    }

    async fn update_api_key_last_used(&self, id: &str) -> Result<(), RepositoryError> {
        let now = format_timestamp(&chrono::Utc::now());
        // Monotonic max of current value vs now, emulated via SQL CASE since SQLite
        // has no MAX()-as-scalar UPDATE shortcut across a single row.
        let result = sqlx::query(
            "UPDATE api_keys
             SET last_used = CASE
                WHEN last_used IS NULL OR last_used < ? THEN ?
                ELSE last_used
             END
             WHERE id = ?",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::ApiKeyNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete_api_key(&self, id: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::ApiKeyNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn create_initial_admin_if_none(&self, user: &User) -> Result<User, RepositoryError> {
        let id = if user.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            user.id.clone()
        };
        let created_at = format_timestamp(&user.created_at);

        let result = sqlx::query(
            "INSERT INTO users (id, email, role, created_at)
             SELECT ?, ?, 'admin', ?
             WHERE NOT EXISTS (SELECT 1 FROM users WHERE role = 'admin')",
        )
        .bind(&id)
        .bind(&user.email)
        .bind(&created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::AlreadyBootstrapped);
        }

        self.get_user_by_id(&id).await
    }
}
