//! Per-tenant metric names and recording helpers.
//!
//! Uses the `metrics` facade; without an installed recorder these are
//! no-ops, so the core stays free of any exposition concerns.

use uuid::Uuid;

/// Total messages stored per tenant.
pub const MESSAGES_TOTAL: &str = "messages_total";

/// Live worker count per tenant.
pub const TENANT_WORKERS: &str = "tenant_workers";

/// Current task channel depth per tenant.
pub const TENANT_QUEUE_DEPTH: &str = "tenant_queue_depth";

pub fn message_stored(tenant_id: Uuid) {
    metrics::counter!(MESSAGES_TOTAL, "tenant_id" => tenant_id.to_string()).increment(1);
}

pub fn set_workers(tenant_id: Uuid, workers: usize) {
    metrics::gauge!(TENANT_WORKERS, "tenant_id" => tenant_id.to_string()).set(workers as f64);
}

pub fn set_queue_depth(tenant_id: Uuid, depth: usize) {
    metrics::gauge!(TENANT_QUEUE_DEPTH, "tenant_id" => tenant_id.to_string()).set(depth as f64);
}
