//! Metrics for the erasure-coding engine.

use prometrics::metrics::{Counter, CounterBuilder, Histogram, HistogramBuilder};

use crate::Result;

fn duration_histogram(name: &str, subsystem: &'static str, help: &'static str) -> Result<Histogram> {
    let histogram = track!(HistogramBuilder::new(name)
        .namespace("ecstore")
        .subsystem(subsystem)
        .help(help)
        .bucket(0.001)
        .bucket(0.005)
        .bucket(0.01)
        .bucket(0.05)
        .bucket(0.1)
        .bucket(0.5)
        .bucket(1.0)
        .bucket(5.0)
        .bucket(10.0)
        .bucket(60.0)
        .default_registry()
        .finish())?;
    Ok(histogram)
}

fn counter(name: &str, subsystem: &'static str, help: &'static str) -> Result<Counter> {
    let counter = track!(CounterBuilder::new(name)
        .namespace("ecstore")
        .subsystem(subsystem)
        .help(help)
        .default_registry()
        .finish())?;
    Ok(counter)
}

/// Metrics of the put (encode) side.
#[derive(Debug, Clone)]
pub struct PutMetrics {
    pub(crate) objects_total: Counter,
    pub(crate) bytes_total: Counter,
    pub(crate) failures_total: Counter,
    pub(crate) lost_slices_total: Counter,
    pub(crate) encode_duration_seconds: Histogram,
    pub(crate) wait_duration_seconds: Histogram,
}
impl PutMetrics {
    pub(crate) fn new() -> Result<Self> {
        Ok(PutMetrics {
            objects_total: track!(counter("objects_total", "put", "Number of encoded objects"))?,
            bytes_total: track!(counter("bytes_total", "put", "Number of encoded bytes"))?,
            failures_total: track!(counter("failures_total", "put", "Number of failed encodes"))?,
            lost_slices_total: track!(counter(
                "lost_slices_total",
                "put",
                "Number of slice sends that failed"
            ))?,
            encode_duration_seconds: track!(duration_histogram(
                "encode_duration_seconds",
                "put",
                "Time spent encoding and dispatching one object"
            ))?,
            wait_duration_seconds: track!(duration_histogram(
                "wait_duration_seconds",
                "put",
                "Time an encode request waited in the queue"
            ))?,
        })
    }
}

/// Metrics of the get (restore) side.
#[derive(Debug, Clone)]
pub struct GetMetrics {
    pub(crate) objects_total: Counter,
    pub(crate) bytes_total: Counter,
    pub(crate) failures_total: Counter,
    pub(crate) decode_duration_seconds: Histogram,
    pub(crate) wait_duration_seconds: Histogram,
}
impl GetMetrics {
    pub(crate) fn new() -> Result<Self> {
        Ok(GetMetrics {
            objects_total: track!(counter("objects_total", "get", "Number of restored objects"))?,
            bytes_total: track!(counter("bytes_total", "get", "Number of restored bytes"))?,
            failures_total: track!(counter("failures_total", "get", "Number of failed restores"))?,
            decode_duration_seconds: track!(duration_histogram(
                "decode_duration_seconds",
                "get",
                "Time spent restoring one object"
            ))?,
            wait_duration_seconds: track!(duration_histogram(
                "wait_duration_seconds",
                "get",
                "Time a restore request waited in the queue"
            ))?,
        })
    }
}

/// Metrics of the peer-facing responder.
#[derive(Debug, Clone)]
pub struct ResponderMetrics {
    pub(crate) requests_total: Counter,
    pub(crate) bytes_total: Counter,
}
impl ResponderMetrics {
    pub(crate) fn new() -> Result<Self> {
        Ok(ResponderMetrics {
            requests_total: track!(counter(
                "requests_total",
                "responder",
                "Number of peer requests served"
            ))?,
            bytes_total: track!(counter(
                "bytes_total",
                "responder",
                "Number of payload bytes served or stored for peers"
            ))?,
        })
    }
}

/// All metrics of one engine instance.
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    /// Encode-side metrics.
    pub(crate) put: PutMetrics,

    /// Restore-side metrics.
    pub(crate) get: GetMetrics,

    /// Responder metrics.
    pub(crate) responder: ResponderMetrics,

    pub(crate) delete_duration_seconds: Histogram,
}
impl EngineMetrics {
    /// Registers all engine metrics in the default registry.
    pub fn new() -> Result<Self> {
        Ok(EngineMetrics {
            put: track!(PutMetrics::new())?,
            get: track!(GetMetrics::new())?,
            responder: track!(ResponderMetrics::new())?,
            delete_duration_seconds: track!(duration_histogram(
                "delete_duration_seconds",
                "delete",
                "Time spent deleting one object"
            ))?,
        })
    }
}
