//! Instrumentation through the `metrics` facade.
//!
//! Every function compiles to nothing unless the `metrics` feature is
//! enabled. Installing a recorder (for example the Prometheus exporter) is
//! the embedding application's job; call [`describe`] afterwards.

#![cfg_attr(not(feature = "metrics"), allow(unused_variables))]

use std::time::Duration;

#[cfg(feature = "metrics")]
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use crate::config::ConnectionType;

// Cache metrics
#[cfg(feature = "metrics")]
const METRIC_CACHE_HITS: &str = "pgkeeper_cache_hits_total";
#[cfg(feature = "metrics")]
const METRIC_CACHE_MISSES: &str = "pgkeeper_cache_misses_total";
#[cfg(feature = "metrics")]
const METRIC_CACHE_SIZE: &str = "pgkeeper_cache_entries";
#[cfg(feature = "metrics")]
const METRIC_CONSTRUCTION_DURATION: &str = "pgkeeper_construction_seconds";
#[cfg(feature = "metrics")]
const METRIC_CONSTRUCTION_ERRORS: &str = "pgkeeper_construction_errors_total";

// Connection metrics
#[cfg(feature = "metrics")]
const METRIC_CONNECTIONS_OPENED: &str = "pgkeeper_connections_opened_total";
#[cfg(feature = "metrics")]
const METRIC_CHECKOUT_WAIT: &str = "pgkeeper_pool_wait_seconds";
#[cfg(feature = "metrics")]
const METRIC_CHECKOUT_ERRORS: &str = "pgkeeper_pool_errors_total";

// Teardown metrics
#[cfg(feature = "metrics")]
const METRIC_TEARDOWN_CLOSED: &str = "pgkeeper_teardown_closed_total";
#[cfg(feature = "metrics")]
const METRIC_TEARDOWN_FAILURES: &str = "pgkeeper_teardown_failures_total";

/// Register metric descriptions with the installed recorder.
pub fn describe() {
    #[cfg(feature = "metrics")]
    {
        describe_counter!(METRIC_CACHE_HITS, "Handle requests served from the cache");
        describe_counter!(METRIC_CACHE_MISSES, "Handle requests that built a new handle");
        describe_gauge!(METRIC_CACHE_SIZE, "Entries in the connection cache");
        describe_histogram!(
            METRIC_CONSTRUCTION_DURATION,
            "Time to build and connect a handle"
        );
        describe_counter!(METRIC_CONSTRUCTION_ERRORS, "Failed handle constructions");
        describe_counter!(METRIC_CONNECTIONS_OPENED, "Physical connections opened");
        describe_histogram!(
            METRIC_CHECKOUT_WAIT,
            "Time waiting for a connection from a pool"
        );
        describe_counter!(METRIC_CHECKOUT_ERRORS, "Failed pool checkouts");
        describe_counter!(METRIC_TEARDOWN_CLOSED, "Handles closed by cache clears");
        describe_counter!(
            METRIC_TEARDOWN_FAILURES,
            "Handles whose close failed during a cache clear"
        );
    }
}

pub fn record_cache_hit(ty: ConnectionType) {
    #[cfg(feature = "metrics")]
    counter!(METRIC_CACHE_HITS, "type" => ty.as_str()).increment(1);
}

pub fn record_cache_miss(ty: ConnectionType) {
    #[cfg(feature = "metrics")]
    counter!(METRIC_CACHE_MISSES, "type" => ty.as_str()).increment(1);
}

pub fn set_cache_size(entries: usize) {
    #[cfg(feature = "metrics")]
    #[allow(clippy::cast_precision_loss)]
    gauge!(METRIC_CACHE_SIZE).set(entries as f64);
}

pub fn record_construction(ty: ConnectionType, elapsed: Duration, ok: bool) {
    #[cfg(feature = "metrics")]
    {
        let status = if ok { "success" } else { "error" };
        histogram!(
            METRIC_CONSTRUCTION_DURATION,
            "type" => ty.as_str(),
            "status" => status,
        )
        .record(elapsed.as_secs_f64());
        if !ok {
            counter!(METRIC_CONSTRUCTION_ERRORS, "type" => ty.as_str()).increment(1);
        }
    }
}

pub fn record_connection_opened(ty: ConnectionType) {
    #[cfg(feature = "metrics")]
    counter!(METRIC_CONNECTIONS_OPENED, "type" => ty.as_str()).increment(1);
}

pub fn record_checkout(ty: ConnectionType, wait: Duration) {
    #[cfg(feature = "metrics")]
    histogram!(METRIC_CHECKOUT_WAIT, "type" => ty.as_str()).record(wait.as_secs_f64());
}

pub fn record_checkout_error(ty: ConnectionType) {
    #[cfg(feature = "metrics")]
    counter!(METRIC_CHECKOUT_ERRORS, "type" => ty.as_str()).increment(1);
}

pub fn record_teardown(closed: usize, failures: usize) {
    #[cfg(feature = "metrics")]
    {
        counter!(METRIC_TEARDOWN_CLOSED).increment(closed as u64);
        counter!(METRIC_TEARDOWN_FAILURES).increment(failures as u64);
    }
}
