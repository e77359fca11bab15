use async_trait::async_trait;

use super::kv::PersistenceAdapter;
use super::schema::Database;
use super::types::StorageError;

impl Database {
    // ========================================================================
    // Key-Value Operations
    // ========================================================================

    /// Get a single value by key.
    ///
    /// Keys use dotted convention: `articles.store`, `collections.saved`,
    /// `cache.lastRawBatch.business`.
    pub async fn get_value(&self, key: &str) -> Result<Option<String>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::from_sqlx)?;

        Ok(row.map(|(value,)| value))
    }

    /// Set a value (UPSERT), refreshing its timestamp.
    pub async fn set_value(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(StorageError::from_sqlx)?;

        Ok(())
    }

    /// Delete a key. Deleting an absent key is not an error.
    pub async fn remove_value(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(StorageError::from_sqlx)?;

        Ok(())
    }

    /// List keys sharing a prefix, ordered by key.
    ///
    /// The CLI uses it to list categories with a cached raw batch
    /// (`cache.lastRawBatch.`).
    pub async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        // Escape LIKE wildcards so a prefix like "cache.last_" matches literally
        let escaped = prefix
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let pattern = format!("{}%", escaped);
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT key FROM kv_store WHERE key LIKE ? ESCAPE '\\' ORDER BY key")
                .bind(&pattern)
                .fetch_all(&self.pool)
                .await
                .map_err(StorageError::from_sqlx)?;

        Ok(rows.into_iter().map(|(key,)| key).collect())
    }
}

#[async_trait]
impl PersistenceAdapter for Database {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.get_value(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.set_value(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.remove_value(key).await
    }
}
