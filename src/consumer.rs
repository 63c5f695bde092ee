//! Per-tenant consumer: binds one AMQP delivery stream to one worker pool.
//!
//! A dispatcher task forwards deliveries from the broker into a bounded
//! task channel; pool workers drain it, inserting each payload into the
//! tenant's partition with bounded retry and dead-letter fallback. Every
//! delivery the consumer observes is eventually acked or requeued, never
//! dropped silently.
//!
//! # Lifecycle
//!
//! ```text
//! Starting -> Running <-> Resizing
//!                |
//!                v
//!            Draining -> Terminated
//! ```
//!
//! A closed delivery stream (broker gone, consumer cancelled) moves the
//! consumer to `Draining` on its own; [`TenantConsumer::stop`] completes
//! the teardown either way.

use crate::broker::{Broker, BrokerError, TenantChannel};
use crate::config::RetryConfig;
use crate::metrics;
use crate::pool::{Task, WorkerPool};
use crate::store::{Store, StoreError};
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use lapin::Consumer;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Observable lifecycle state of a tenant consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    Starting = 0,
    Running = 1,
    Resizing = 2,
    Draining = 3,
    Terminated = 4,
}

impl ConsumerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConsumerState::Starting,
            1 => ConsumerState::Running,
            2 => ConsumerState::Resizing,
            3 => ConsumerState::Draining,
            _ => ConsumerState::Terminated,
        }
    }
}

/// Linear backoff policy for store inserts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub unit: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.unit * attempt
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            unit: config.unit(),
        }
    }
}

/// One tenant's consumer: channel, dispatcher, worker pool, stop signal.
pub struct TenantConsumer {
    tenant_id: Uuid,
    chan: TenantChannel,
    pool: WorkerPool,
    workers: usize,
    stop: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
    state: Arc<AtomicU8>,
}

impl TenantConsumer {
    /// Declare queues, open the delivery stream, start the worker pool,
    /// and wire the dispatcher.
    pub async fn start(
        tenant_id: Uuid,
        broker: &Broker,
        store: Arc<Store>,
        workers: usize,
        channel_capacity: usize,
        retry: RetryPolicy,
    ) -> Result<Self, BrokerError> {
        let state = Arc::new(AtomicU8::new(ConsumerState::Starting as u8));

        let chan = broker.tenant_channel(tenant_id).await?;
        chan.declare_queues().await?;

        // Prefetch matches the task channel so the broker absorbs slack
        // once the channel is full and the dispatcher parks.
        let prefetch = channel_capacity.min(u16::MAX as usize) as u16;
        let deliveries = chan.consume(prefetch).await?;

        let (task_tx, task_rx) = async_channel::bounded::<Task>(channel_capacity);

        let mut pool = WorkerPool::new(task_rx);
        pool.start(workers);
        metrics::set_workers(tenant_id, workers);

        let (stop_tx, stop_rx) = watch::channel(false);
        let dispatcher = tokio::spawn(dispatch_loop(
            tenant_id,
            deliveries,
            task_tx,
            stop_rx,
            state.clone(),
            store,
            chan.clone(),
            retry,
        ));

        state.store(ConsumerState::Running as u8, Ordering::SeqCst);
        info!(tenant_id = %tenant_id, workers, "Tenant consumer running");

        Ok(Self {
            tenant_id,
            chan,
            pool,
            workers,
            stop: stop_tx,
            dispatcher,
            state,
        })
    }

    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Current target worker count.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Resize the worker pool. Already-enqueued deliveries keep being
    /// processed; the dispatcher stays live throughout.
    pub async fn resize(&mut self, workers: usize) {
        self.state
            .store(ConsumerState::Resizing as u8, Ordering::SeqCst);

        self.pool.resize(workers).await;
        self.workers = workers;
        metrics::set_workers(self.tenant_id, workers);

        self.state
            .store(ConsumerState::Running as u8, Ordering::SeqCst);
        info!(tenant_id = %self.tenant_id, workers, "Worker pool resized");
    }

    /// Drain and tear down for tenant removal: stop the dispatcher, let
    /// workers finish their in-flight task, cancel the broker consumer,
    /// delete the main queue, close the channel.
    ///
    /// Deliveries still sitting in the task channel are abandoned unacked;
    /// the queue they would be redelivered to is deleted in the same
    /// operation. After this returns, no worker of this consumer touches
    /// the store or the broker again.
    pub async fn stop(self) {
        self.teardown(true).await;
    }

    /// Drain for process shutdown: same as [`stop`](Self::stop) except the
    /// durable queue is left in place, so unacked messages are redelivered
    /// to the next process that consumes it.
    pub async fn halt(self) {
        self.teardown(false).await;
    }

    async fn teardown(mut self, delete_queue: bool) {
        self.state
            .store(ConsumerState::Draining as u8, Ordering::SeqCst);
        debug!(tenant_id = %self.tenant_id, "Draining tenant consumer");

        let _ = self.stop.send(true);
        let _ = self.dispatcher.await;
        self.pool.stop().await;

        if let Err(e) = self.chan.cancel().await {
            warn!(tenant_id = %self.tenant_id, error = %e, "Consumer cancel failed");
        }
        if delete_queue {
            if let Err(e) = self.chan.delete_main_queue().await {
                warn!(tenant_id = %self.tenant_id, error = %e, "Queue delete failed");
            }
        }
        if let Err(e) = self.chan.close().await {
            warn!(tenant_id = %self.tenant_id, error = %e, "Channel close failed");
        }

        metrics::set_workers(self.tenant_id, 0);
        self.state
            .store(ConsumerState::Terminated as u8, Ordering::SeqCst);
        info!(tenant_id = %self.tenant_id, "Tenant consumer terminated");
    }
}

/// Forward deliveries from the broker stream into the task channel.
///
/// The send into the bounded channel is the backpressure point: with
/// saturated workers the dispatcher parks here and the broker's prefetch
/// window fills upstream.
#[allow(clippy::too_many_arguments)]
async fn dispatch_loop(
    tenant_id: Uuid,
    mut deliveries: Consumer,
    task_tx: async_channel::Sender<Task>,
    mut stop: watch::Receiver<bool>,
    state: Arc<AtomicU8>,
    store: Arc<Store>,
    chan: TenantChannel,
    retry: RetryPolicy,
) {
    loop {
        tokio::select! {
            biased;

            _ = stop.changed() => break,
            next = deliveries.next() => match next {
                Some(Ok(delivery)) => {
                    let task: Task = Box::pin(process_delivery(
                        store.clone(),
                        chan.clone(),
                        tenant_id,
                        delivery,
                        retry,
                    ));

                    tokio::select! {
                        biased;

                        _ = stop.changed() => break,
                        sent = task_tx.send(task) => {
                            if sent.is_err() {
                                break;
                            }
                            metrics::set_queue_depth(tenant_id, task_tx.len());
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(tenant_id = %tenant_id, error = %e, "Delivery stream error, draining");
                    state.store(ConsumerState::Draining as u8, Ordering::SeqCst);
                    break;
                }
                None => {
                    info!(tenant_id = %tenant_id, "Delivery stream closed, draining");
                    state.store(ConsumerState::Draining as u8, Ordering::SeqCst);
                    break;
                }
            },
        }
    }
    debug!(tenant_id = %tenant_id, "Dispatcher exited");
}

/// Worker task body for one delivery.
///
/// Insert with bounded retry; exhausted or poison deliveries go to the
/// DLQ. The worker sleeps through backoff; the pool size is the
/// tenant's concurrency budget.
async fn process_delivery(
    store: Arc<Store>,
    chan: TenantChannel,
    tenant_id: Uuid,
    delivery: Delivery,
    retry: RetryPolicy,
) {
    let mut attempt: u32 = 1;

    loop {
        match store.insert_message(tenant_id, &delivery.data).await {
            Ok(_) => {
                metrics::message_stored(tenant_id);
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    warn!(tenant_id = %tenant_id, error = %e, "Ack failed after insert");
                }
                return;
            }
            Err(err) => {
                let retriable = matches!(err, StoreError::Unavailable(_));
                if retriable && attempt < retry.max_attempts {
                    warn!(
                        tenant_id = %tenant_id,
                        attempt,
                        error = %err,
                        "Insert failed, backing off"
                    );
                    tokio::time::sleep(retry.delay(attempt)).await;
                    attempt += 1;
                    continue;
                }

                error!(
                    tenant_id = %tenant_id,
                    attempt,
                    error = %err,
                    "Insert attempts exhausted, dead-lettering"
                );
                dead_letter(&chan, tenant_id, &delivery).await;
                return;
            }
        }
    }
}

/// Route an exhausted delivery to the DLQ.
///
/// If the DLQ publish itself fails, the delivery is nacked with requeue so
/// the broker redelivers it (and eventually dead-letters it on its own).
async fn dead_letter(chan: &TenantChannel, tenant_id: Uuid, delivery: &Delivery) {
    match chan.publish_to_dlq(&delivery.data).await {
        Ok(()) => {
            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                warn!(tenant_id = %tenant_id, error = %e, "Ack failed after DLQ publish");
            }
        }
        Err(e) => {
            warn!(tenant_id = %tenant_id, error = %e, "DLQ publish failed, requeueing");
            let requeue = BasicNackOptions {
                requeue: true,
                ..BasicNackOptions::default()
            };
            if let Err(e) = delivery.nack(requeue).await {
                warn!(tenant_id = %tenant_id, error = %e, "Nack failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_is_linear() {
        let retry = RetryPolicy {
            max_attempts: 3,
            unit: Duration::from_secs(1),
        };

        assert_eq!(retry.delay(1), Duration::from_secs(1));
        assert_eq!(retry.delay(2), Duration::from_secs(2));
        assert_eq!(retry.delay(3), Duration::from_secs(3));
    }

    #[test]
    fn test_retry_policy_from_config() {
        let config = RetryConfig {
            max_attempts: 5,
            unit_ms: 250,
        };

        let retry = RetryPolicy::from(&config);
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.unit, Duration::from_millis(250));
    }

    #[test]
    fn test_state_roundtrip() {
        for state in [
            ConsumerState::Starting,
            ConsumerState::Running,
            ConsumerState::Resizing,
            ConsumerState::Draining,
            ConsumerState::Terminated,
        ] {
            assert_eq!(ConsumerState::from_u8(state as u8), state);
        }
    }
}
