//! Watcher runtime metrics.
//!
//! Static counters for submissions, transfers, and connection lifecycle.
//! Exposed through the `metriken` registry for whatever exposition layer
//! the embedding application runs.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "edgeio/requests/submitted",
    description = "Total requests accepted by the submission facade"
)]
pub static REQUESTS_SUBMITTED: Counter = Counter::new();

#[metric(
    name = "edgeio/completions/delivered",
    description = "Total completion results delivered to consumers"
)]
pub static COMPLETIONS_DELIVERED: Counter = Counter::new();

#[metric(
    name = "edgeio/batches/delivered",
    description = "Total completion batches delivered to consumers"
)]
pub static BATCHES_DELIVERED: Counter = Counter::new();

#[metric(
    name = "edgeio/deadlines/expired",
    description = "Requests completed with a deadline error"
)]
pub static DEADLINES_EXPIRED: Counter = Counter::new();

#[metric(
    name = "edgeio/connections/registered",
    description = "Connections registered with the watcher"
)]
pub static CONNECTIONS_REGISTERED: Counter = Counter::new();

#[metric(
    name = "edgeio/connections/released",
    description = "Connections released (free, error, EOF, sweep, shutdown)"
)]
pub static CONNECTIONS_RELEASED: Counter = Counter::new();

#[metric(
    name = "edgeio/connections/active",
    description = "Currently registered connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "edgeio/bytes/read", description = "Total bytes read")]
pub static BYTES_READ: Counter = Counter::new();

#[metric(name = "edgeio/bytes/written", description = "Total bytes written")]
pub static BYTES_WRITTEN: Counter = Counter::new();
