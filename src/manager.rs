//! Registry of active tenant consumers.
//!
//! The manager serialises tenant lifecycle: create, delete, and worker
//! resize all take the registry lock for the duration of the operation.
//! Lifecycle events are rare, so the coarse lock is the simple and
//! sufficient discipline.
//!
//! Tenant creation touches two external systems (store, broker) with no
//! distributed transaction; on failure the completed steps are compensated
//! in reverse order, best-effort. The partition is retained even then: it
//! is cheap, idempotent to re-create, and useful as audit trail.

use crate::broker::{Broker, BrokerError};
use crate::config::TributaryConfig;
use crate::consumer::{RetryPolicy, TenantConsumer};
use crate::message::Tenant;
use crate::store::{Store, StoreError};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Errors from tenant lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum TenantError {
    #[error("tenant {0} already exists")]
    AlreadyExists(Uuid),

    #[error("tenant {0} not found")]
    NotFound(Uuid),

    #[error("invalid worker count {workers}: expected 1..={max}")]
    InvalidConfig { workers: usize, max: usize },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Bounds check for a requested worker count.
pub fn validate_workers(workers: usize, max: usize) -> Result<(), TenantError> {
    if workers < 1 || workers > max {
        return Err(TenantError::InvalidConfig { workers, max });
    }
    Ok(())
}

/// Owns the `tenant_id -> TenantConsumer` registry and mediates all
/// lifecycle mutations.
pub struct TenantManager {
    consumers: Mutex<HashMap<Uuid, TenantConsumer>>,
    store: Arc<Store>,
    broker: Arc<Broker>,
    default_workers: usize,
    max_workers: usize,
    channel_capacity: usize,
    retry: RetryPolicy,
}

impl TenantManager {
    pub fn new(store: Arc<Store>, broker: Arc<Broker>, config: &TributaryConfig) -> Self {
        Self {
            consumers: Mutex::new(HashMap::new()),
            store,
            broker,
            default_workers: config.workers.default,
            max_workers: config.workers.max,
            channel_capacity: config.task_channel.capacity,
            retry: RetryPolicy::from(&config.retry),
        }
    }

    /// Provision a tenant: partition, registry row, queues, consumer.
    ///
    /// The id is generated when the caller does not supply one. Returns
    /// [`TenantError::AlreadyExists`] if a consumer is already registered.
    pub async fn create_tenant(
        &self,
        id: Option<Uuid>,
        name: &str,
    ) -> Result<Tenant, TenantError> {
        let tenant_id = id.unwrap_or_else(Uuid::new_v4);
        let mut consumers = self.consumers.lock().await;

        if consumers.contains_key(&tenant_id) {
            return Err(TenantError::AlreadyExists(tenant_id));
        }

        self.store.create_partition(tenant_id).await?;

        let tenant = self
            .store
            .register_tenant(tenant_id, name, self.default_workers)
            .await?;

        match TenantConsumer::start(
            tenant_id,
            &self.broker,
            self.store.clone(),
            self.default_workers,
            self.channel_capacity,
            self.retry,
        )
        .await
        {
            Ok(consumer) => {
                consumers.insert(tenant_id, consumer);
                info!(tenant_id = %tenant_id, name = %name, "Tenant created");
                Ok(tenant)
            }
            Err(e) => {
                error!(tenant_id = %tenant_id, error = %e, "Consumer start failed, rolling back");
                self.rollback_create(tenant_id).await;
                Err(e.into())
            }
        }
    }

    /// Compensate a failed create in reverse order. The partition is
    /// retained by design.
    async fn rollback_create(&self, tenant_id: Uuid) {
        if let Ok(chan) = self.broker.tenant_channel(tenant_id).await {
            if let Err(e) = chan.delete_main_queue().await {
                warn!(tenant_id = %tenant_id, error = %e, "Rollback: queue delete failed");
            }
            let _ = chan.close().await;
        }
        if let Err(e) = self.store.unregister_tenant(tenant_id).await {
            warn!(tenant_id = %tenant_id, error = %e, "Rollback: unregister failed");
        }
    }

    /// Tear a tenant down: stop its consumer (waiting for in-flight work),
    /// remove the queue, and delete the registry row.
    ///
    /// The partition and its rows are retained as audit trail.
    pub async fn delete_tenant(&self, tenant_id: Uuid) -> Result<(), TenantError> {
        let mut consumers = self.consumers.lock().await;

        let consumer = consumers
            .remove(&tenant_id)
            .ok_or(TenantError::NotFound(tenant_id))?;

        consumer.stop().await;
        self.store.unregister_tenant(tenant_id).await?;

        info!(tenant_id = %tenant_id, "Tenant deleted");
        Ok(())
    }

    /// Resize a tenant's worker pool to `workers`.
    pub async fn update_workers(&self, tenant_id: Uuid, workers: usize) -> Result<(), TenantError> {
        validate_workers(workers, self.max_workers)?;

        let mut consumers = self.consumers.lock().await;
        let consumer = consumers
            .get_mut(&tenant_id)
            .ok_or(TenantError::NotFound(tenant_id))?;

        consumer.resize(workers).await;
        self.store.update_tenant_workers(tenant_id, workers).await?;

        info!(tenant_id = %tenant_id, workers, "Tenant concurrency updated");
        Ok(())
    }

    /// Number of registered consumers.
    pub async fn tenant_count(&self) -> usize {
        self.consumers.lock().await.len()
    }

    /// Stop every consumer, bounded by the grace budget. Queues are left
    /// in place: this is process shutdown, not tenant removal, so the
    /// consumers are stopped without deleting broker resources.
    pub async fn shutdown(&self, grace: Duration) {
        let drained: Vec<TenantConsumer> = {
            let mut consumers = self.consumers.lock().await;
            consumers.drain().map(|(_, c)| c).collect()
        };

        if drained.is_empty() {
            return;
        }

        info!(consumers = drained.len(), "Stopping tenant consumers");
        let stop_all = join_all(drained.into_iter().map(TenantConsumer::halt));

        if tokio::time::timeout(grace, stop_all).await.is_err() {
            warn!(grace_secs = grace.as_secs(), "Shutdown grace exceeded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_workers_bounds() {
        assert!(validate_workers(1, 32).is_ok());
        assert!(validate_workers(32, 32).is_ok());
        assert!(validate_workers(0, 32).is_err());
        assert!(validate_workers(33, 32).is_err());
    }

    #[test]
    fn test_invalid_config_message() {
        let err = validate_workers(0, 8).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid worker count 0: expected 1..=8"
        );
    }
}
