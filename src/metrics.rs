//! Prometheus metrics for a lacecast node.
//!
//! Nothing is recorded until [`init`] has registered the collectors; the
//! recording helpers are no-ops before that, so library users who do not
//! want metrics pay only an atomic load per event.
//!
//! - `lacecast_messages_received_total{kind}` - fresh inbound envelopes by type
//! - `lacecast_duplicates_dropped_total` - envelopes dropped by the dedup window
//! - `lacecast_flood_fanout` - peers each flooded envelope was sent to (histogram)
//! - `lacecast_mutex_events_total{event}` - acquire, granted, timeout and release
//! - `lacecast_frames_dropped_total{transport}` - outbound frames dropped on backpressure

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

/// Inbound envelopes that passed duplicate suppression, by message type.
pub static MESSAGES_RECEIVED: OnceLock<IntCounterVec> = OnceLock::new();

/// Inbound envelopes whose stamp was already seen.
pub static DUPLICATES_DROPPED: OnceLock<IntCounter> = OnceLock::new();

/// Recipients per flooded envelope.
pub static FLOOD_FANOUT: OnceLock<Histogram> = OnceLock::new();

/// Cluster-wide lock lifecycle events.
pub static MUTEX_EVENTS: OnceLock<IntCounterVec> = OnceLock::new();

/// Outbound frames dropped because a destination queue was full.
pub static FRAMES_DROPPED: OnceLock<IntCounterVec> = OnceLock::new();

/// Register every collector. Later calls are no-ops.
pub fn init() {
    let r = registry();

    macro_rules! register {
        ($metric:ident, $init:expr) => {
            if $metric.get().is_none() {
                match $init {
                    Ok(m) => {
                        if let Err(e) = r.register(Box::new(m.clone())) {
                            tracing::warn!(error = %e, concat!("Failed to register metric ", stringify!($metric)));
                        }
                        let _ = $metric.set(m);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, concat!("Failed to create metric ", stringify!($metric)));
                    }
                }
            }
        };
    }

    register!(
        MESSAGES_RECEIVED,
        IntCounterVec::new(
            Opts::new("lacecast_messages_received_total", "Inbound envelopes by type"),
            &["kind"]
        )
    );
    register!(
        DUPLICATES_DROPPED,
        IntCounter::new("lacecast_duplicates_dropped_total", "Inbound envelopes dropped as duplicates")
    );
    register!(
        FLOOD_FANOUT,
        Histogram::with_opts(
            HistogramOpts::new("lacecast_flood_fanout", "Peers each flooded envelope was sent to")
                .buckets(vec![0.0, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0])
        )
    );
    register!(
        MUTEX_EVENTS,
        IntCounterVec::new(
            Opts::new("lacecast_mutex_events_total", "Cluster-wide lock events"),
            &["event"]
        )
    );
    register!(
        FRAMES_DROPPED,
        IntCounterVec::new(
            Opts::new("lacecast_frames_dropped_total", "Outbound frames dropped on backpressure"),
            &["transport"]
        )
    );
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
            String::new()
        }
    }
}

/// A lock lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexEvent {
    Acquire,
    Granted,
    Timeout,
    Release,
}

impl MutexEvent {
    fn label(self) -> &'static str {
        match self {
            Self::Acquire => "acquire",
            Self::Granted => "granted",
            Self::Timeout => "timeout",
            Self::Release => "release",
        }
    }
}

#[inline]
pub fn record_received(kind: &str) {
    if let Some(c) = MESSAGES_RECEIVED.get() {
        c.with_label_values(&[kind]).inc();
    }
}

#[inline]
pub fn record_duplicate() {
    if let Some(c) = DUPLICATES_DROPPED.get() {
        c.inc();
    }
}

/// Record how many peers one flood went out to.
#[inline]
pub fn record_fanout(recipients: usize) {
    if let Some(h) = FLOOD_FANOUT.get() {
        h.observe(recipients as f64);
    }
}

#[inline]
pub fn record_mutex(event: MutexEvent) {
    if let Some(c) = MUTEX_EVENTS.get() {
        c.with_label_values(&[event.label()]).inc();
    }
}

#[inline]
pub fn record_frame_dropped(transport: &str) {
    if let Some(c) = FRAMES_DROPPED.get() {
        c.with_label_values(&[transport]).inc();
    }
}
