//! Postgres gateway for the partitioned message store.
//!
//! The store keeps one list-partitioned `messages` table with a child
//! partition per tenant, plus the `tenants` registry and its per-tenant
//! `tenant_configs`. All structural DDL (partition creation) goes through
//! this module so the naming rules live in one place.
//!
//! # Example
//!
//! ```rust,ignore
//! use tributary::store::Store;
//!
//! let store = Store::connect(&config.store).await?;
//! store.create_partition(tenant_id).await?;
//! let id = store.insert_message(tenant_id, br#"{"hello":"world"}"#).await?;
//! ```

use crate::config::StoreConfig;
use crate::message::{Message, Tenant};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a caller waits for a pooled connection before failing fast.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from the store gateway.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Connectivity, pool exhaustion, or timeout. Retriable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The database rejected the statement (unknown partition, malformed
    /// payload, duplicate key). Not retriable.
    #[error("store constraint violation: {0}")]
    Constraint(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => StoreError::Constraint(db.to_string()),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Gateway over the shared Postgres connection pool.
///
/// Cheap to clone; all tenants' workers share the one pool.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect to Postgres and run embedded migrations.
    ///
    /// Migrations run before anything is served so the rest of the crate
    /// can assume the schema exists.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(&config.url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        info!("Connected to message store");
        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert one message into the owning tenant's partition.
    ///
    /// The payload is stored as-is; a body that is not valid JSON is
    /// rejected by the `jsonb` cast and surfaces as [`StoreError::Constraint`],
    /// which the worker treats as poison (straight to DLQ, no retry).
    pub async fn insert_message(
        &self,
        tenant_id: Uuid,
        payload: &[u8],
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let body = String::from_utf8_lossy(payload);

        sqlx::query("INSERT INTO messages (id, tenant_id, payload) VALUES ($1, $2, $3::jsonb)")
            .bind(id)
            .bind(tenant_id)
            .bind(body.as_ref())
            .execute(&self.pool)
            .await?;

        debug!(tenant_id = %tenant_id, message_id = %id, "Message stored");
        Ok(id)
    }

    /// Create the tenant's child partition of `messages`. Idempotent.
    ///
    /// The identifier is derived from a validated [`Uuid`] only (hyphens
    /// escaped to underscores) and quoted, so interpolation is safe.
    pub async fn create_partition(&self, tenant_id: Uuid) -> Result<(), StoreError> {
        let table = partition_table_name(tenant_id);
        let ddl = format!(
            r#"CREATE TABLE IF NOT EXISTS "{table}" PARTITION OF messages FOR VALUES IN ('{tenant_id}')"#,
        );

        sqlx::query(&ddl).execute(&self.pool).await?;

        info!(tenant_id = %tenant_id, table = %table, "Partition ready");
        Ok(())
    }

    /// Insert the tenant registry row and seed its config. Idempotent, so a
    /// re-create after a partial failure succeeds.
    pub async fn register_tenant(
        &self,
        tenant_id: Uuid,
        name: &str,
        default_workers: usize,
    ) -> Result<Tenant, StoreError> {
        let created_at: chrono::DateTime<chrono::Utc> = sqlx::query_scalar(
            r#"INSERT INTO tenants (id, name) VALUES ($1, $2)
               ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name
               RETURNING created_at"#,
        )
        .bind(tenant_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        sqlx::query(
            r#"INSERT INTO tenant_configs (tenant_id, workers) VALUES ($1, $2)
               ON CONFLICT (tenant_id) DO NOTHING"#,
        )
        .bind(tenant_id)
        .bind(default_workers as i32)
        .execute(&self.pool)
        .await?;

        Ok(Tenant {
            id: tenant_id,
            name: name.to_string(),
            created_at,
        })
    }

    /// Delete the tenant registry row; `tenant_configs` cascades.
    ///
    /// The tenant's partition and its rows are retained as audit trail.
    pub async fn unregister_tenant(&self, tenant_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM tenants WHERE id = $1")
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            warn!(tenant_id = %tenant_id, "Unregister: tenant row was already gone");
        }
        Ok(())
    }

    /// Persist the tenant's worker count.
    pub async fn update_tenant_workers(
        &self,
        tenant_id: Uuid,
        workers: usize,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE tenant_configs SET workers = $2 WHERE tenant_id = $1")
            .bind(tenant_id)
            .bind(workers as i32)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fetch one page of messages in `(created_at, id)` ascending order.
    ///
    /// The anchor subquery projects both ordering columns so the comparison
    /// stays a single indexable tuple predicate. A cursor that matches no
    /// row yields an empty page.
    pub async fn fetch_page(
        &self,
        cursor: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = match cursor {
            None => {
                sqlx::query_as::<_, Message>(
                    r#"SELECT id, tenant_id, payload, created_at FROM messages
                       ORDER BY created_at ASC, id ASC
                       LIMIT $1"#,
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            Some(anchor) => {
                sqlx::query_as::<_, Message>(
                    r#"SELECT id, tenant_id, payload, created_at FROM messages
                       WHERE (created_at, id) > (
                           SELECT created_at, id FROM messages WHERE id = $1
                       )
                       ORDER BY created_at ASC, id ASC
                       LIMIT $2"#,
                )
                .bind(anchor)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows)
    }

    /// Connectivity probe for the health endpoint.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

/// Child table name for a tenant's partition: hyphens are escaped to
/// underscores to keep the identifier storage-safe.
pub fn partition_table_name(tenant_id: Uuid) -> String {
    format!(
        "messages_tenant_{}",
        tenant_id.to_string().replace('-', "_")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_table_name() {
        let id = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
        assert_eq!(
            partition_table_name(id),
            "messages_tenant_11111111_1111_1111_1111_111111111111"
        );
    }

    #[test]
    fn test_partition_table_name_has_no_hyphens() {
        let name = partition_table_name(Uuid::new_v4());
        assert!(!name.contains('-'));
        assert!(name.starts_with("messages_tenant_"));
    }

    #[test]
    fn test_pool_error_is_retriable() {
        let err = StoreError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
