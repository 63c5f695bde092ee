//! Core domain types for Tributary.
//!
//! A [`Tenant`] is an isolated customer of the system: it owns a broker
//! queue, a dead-letter queue, a storage partition, and a worker pool.
//! A [`Message`] is one ingested payload row in that tenant's partition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A registered tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    /// Tenant identity; supplied by the caller or generated on creation
    pub id: Uuid,

    /// Opaque display name
    pub name: String,

    /// Registration timestamp, set by the store
    pub created_at: DateTime<Utc>,
}

/// A stored message, as returned by the read API.
///
/// # Example
///
/// ```json
/// {
///   "id": "7d4ab0ee-3c22-4f4b-9f3a-0b1c2d3e4f50",
///   "tenant_id": "11111111-1111-1111-1111-111111111111",
///   "payload": {"hello": "world"},
///   "created_at": "2026-08-02T12:00:00Z"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    /// Message identity, generated at ingest
    pub id: Uuid,

    /// Owning tenant
    pub tenant_id: Uuid,

    /// Opaque JSON document, stored as-is
    pub payload: Value,

    /// Insertion timestamp, set by the store
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_serialize() {
        let msg = Message {
            id: Uuid::nil(),
            tenant_id: Uuid::nil(),
            payload: json!({"hello": "world"}),
            created_at: Utc::now(),
        };

        let json_str = serde_json::to_string(&msg).unwrap();
        assert!(json_str.contains("tenant_id"));
        assert!(json_str.contains("hello"));
    }

    #[test]
    fn test_tenant_deserialize() {
        let json_str = r#"{
            "id": "11111111-1111-1111-1111-111111111111",
            "name": "acme",
            "created_at": "2026-08-02T12:00:00Z"
        }"#;

        let tenant: Tenant = serde_json::from_str(json_str).unwrap();
        assert_eq!(tenant.name, "acme");
        assert_eq!(
            tenant.id.to_string(),
            "11111111-1111-1111-1111-111111111111"
        );
    }
}
