//! AMQP gateway: per-tenant queue topology and consumption.
//!
//! One connection is shared across the process; every tenant consumer owns
//! its own [`TenantChannel`], because AMQP channels must not be shared
//! between consumers. DLQ publishes happen on the same channel that carried
//! the delivery.
//!
//! Queue topology per tenant:
//!
//! ```text
//! tenant_{id}_queue  --x-dead-letter-routing-key-->  tenant_{id}_dlq
//! ```
//!
//! Both queues are durable, non-exclusive, and never auto-deleted.

use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tracing::{debug, info};
use uuid::Uuid;

/// AMQP delivery mode 2: the broker persists the message to disk.
const PERSISTENT: u8 = 2;

/// Errors from the broker gateway.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(#[from] lapin::Error),
}

/// Main queue name for a tenant.
pub fn queue_name(tenant_id: Uuid) -> String {
    format!("tenant_{tenant_id}_queue")
}

/// Dead-letter queue name for a tenant.
pub fn dlq_name(tenant_id: Uuid) -> String {
    format!("tenant_{tenant_id}_dlq")
}

/// Consumer tag for a tenant's delivery stream.
pub fn consumer_tag(tenant_id: Uuid) -> String {
    format!("consumer_{tenant_id}")
}

/// Shared AMQP connection.
pub struct Broker {
    conn: Connection,
}

impl Broker {
    /// Connect to the broker.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let conn = Connection::connect(url, ConnectionProperties::default()).await?;
        info!("Connected to message broker");
        Ok(Self { conn })
    }

    /// Open a dedicated channel for one tenant consumer.
    pub async fn tenant_channel(&self, tenant_id: Uuid) -> Result<TenantChannel, BrokerError> {
        let channel = self.conn.create_channel().await?;
        Ok(TenantChannel { channel, tenant_id })
    }

    /// Whether the underlying connection is still up.
    pub fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }
}

/// One tenant's exclusive AMQP channel and queue handles.
///
/// Clones share the underlying channel; all of them belong to the same
/// tenant consumer.
#[derive(Clone)]
pub struct TenantChannel {
    channel: Channel,
    tenant_id: Uuid,
}

impl TenantChannel {
    /// Declare the tenant's DLQ, then the main queue dead-lettered into it.
    /// Idempotent: re-declaring with identical arguments is a no-op.
    pub async fn declare_queues(&self) -> Result<(), BrokerError> {
        let durable = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };

        // DLQ first so the main queue's dead-letter target always exists
        self.channel
            .queue_declare(&dlq_name(self.tenant_id), durable, FieldTable::default())
            .await?;

        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString("".into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(dlq_name(self.tenant_id).into()),
        );

        self.channel
            .queue_declare(&queue_name(self.tenant_id), durable, args)
            .await?;

        info!(tenant_id = %self.tenant_id, "Tenant queues declared");
        Ok(())
    }

    /// Begin consuming the main queue with manual acknowledgement.
    ///
    /// Prefetch is bounded so the broker stops pushing once this many
    /// deliveries are unacked; together with the bounded task channel this
    /// is the backpressure path.
    pub async fn consume(&self, prefetch: u16) -> Result<Consumer, BrokerError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        let consumer = self
            .channel
            .basic_consume(
                &queue_name(self.tenant_id),
                &consumer_tag(self.tenant_id),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        debug!(tenant_id = %self.tenant_id, "Consumer opened");
        Ok(consumer)
    }

    /// Publish a raw body to the tenant's DLQ as a persistent message.
    pub async fn publish_to_dlq(&self, body: &[u8]) -> Result<(), BrokerError> {
        self.channel
            .basic_publish(
                "",
                &dlq_name(self.tenant_id),
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(PERSISTENT),
            )
            .await?;
        Ok(())
    }

    /// Cancel the consumer; the broker stops pushing and the delivery
    /// stream terminates.
    pub async fn cancel(&self) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(&consumer_tag(self.tenant_id), BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    /// Delete the tenant's main queue. The DLQ is left in place so
    /// dead-lettered messages stay inspectable after tenant removal.
    pub async fn delete_main_queue(&self) -> Result<(), BrokerError> {
        self.channel
            .queue_delete(&queue_name(self.tenant_id), QueueDeleteOptions::default())
            .await?;

        info!(tenant_id = %self.tenant_id, "Main queue deleted");
        Ok(())
    }

    /// Close the channel.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.channel.close(200, "tenant consumer stopped").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_names() {
        let id = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
        assert_eq!(
            queue_name(id),
            "tenant_11111111-1111-1111-1111-111111111111_queue"
        );
        assert_eq!(
            dlq_name(id),
            "tenant_11111111-1111-1111-1111-111111111111_dlq"
        );
        assert_eq!(
            consumer_tag(id),
            "consumer_11111111-1111-1111-1111-111111111111"
        );
    }
}
