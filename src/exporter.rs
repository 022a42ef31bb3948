//! Prometheus Exporter
//!
//! Mirrors a [`StatsSnapshot`] into a private Prometheus registry so the
//! binary can serve it on `/metrics`. Cumulative counters are advanced by the
//! delta since the previous observation; occupancy is exported as gauges.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::StatsSnapshot;
use crate::error::{Error, Result};

const NAMESPACE: &str = "tiercache";

/// Cache metrics registered in their own registry
pub struct PrometheusExporter {
    registry: Registry,
    hits: IntCounterVec,
    misses: IntCounterVec,
    events: IntCounterVec,
    backend_ops: IntCounterVec,
    entries: IntGaugeVec,
    size_bytes: IntGaugeVec,
    capacity_bytes: IntGaugeVec,
    get_latency_us: IntGauge,
    set_latency_us: IntGauge,
}

impl PrometheusExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let hits = IntCounterVec::new(
            Opts::new("hits_total", "Lookups answered by a tier").namespace(NAMESPACE),
            &["tier"],
        )
        .map_err(metrics_error)?;
        let misses = IntCounterVec::new(
            Opts::new("misses_total", "Lookups a tier could not answer").namespace(NAMESPACE),
            &["tier"],
        )
        .map_err(metrics_error)?;
        let events = IntCounterVec::new(
            Opts::new("events_total", "Cache events by kind").namespace(NAMESPACE),
            &["event"],
        )
        .map_err(metrics_error)?;
        let backend_ops = IntCounterVec::new(
            Opts::new("backend_operations_total", "Persistent backend operations")
                .namespace(NAMESPACE),
            &["op"],
        )
        .map_err(metrics_error)?;
        let entries = IntGaugeVec::new(
            Opts::new("entries", "Entries resident in a local tier").namespace(NAMESPACE),
            &["tier"],
        )
        .map_err(metrics_error)?;
        let size_bytes = IntGaugeVec::new(
            Opts::new("size_bytes", "Bytes used in a local tier").namespace(NAMESPACE),
            &["tier"],
        )
        .map_err(metrics_error)?;
        let capacity_bytes = IntGaugeVec::new(
            Opts::new("capacity_bytes", "Byte budget of a local tier").namespace(NAMESPACE),
            &["tier"],
        )
        .map_err(metrics_error)?;
        let get_latency_us = IntGauge::with_opts(
            Opts::new("get_latency_us", "Moving average get latency").namespace(NAMESPACE),
        )
        .map_err(metrics_error)?;
        let set_latency_us = IntGauge::with_opts(
            Opts::new("set_latency_us", "Moving average set latency").namespace(NAMESPACE),
        )
        .map_err(metrics_error)?;

        registry.register(Box::new(hits.clone())).map_err(metrics_error)?;
        registry.register(Box::new(misses.clone())).map_err(metrics_error)?;
        registry.register(Box::new(events.clone())).map_err(metrics_error)?;
        registry
            .register(Box::new(backend_ops.clone()))
            .map_err(metrics_error)?;
        registry.register(Box::new(entries.clone())).map_err(metrics_error)?;
        registry.register(Box::new(size_bytes.clone())).map_err(metrics_error)?;
        registry
            .register(Box::new(capacity_bytes.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(get_latency_us.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(set_latency_us.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            hits,
            misses,
            events,
            backend_ops,
            entries,
            size_bytes,
            capacity_bytes,
            get_latency_us,
            set_latency_us,
        })
    }

    /// Bring every metric up to date with `snapshot`
    pub fn observe(&self, snapshot: &StatsSnapshot) {
        for counters in &snapshot.tiers {
            let tier = counters.tier.name();
            advance(&self.hits.with_label_values(&[tier]), counters.hits);
            advance(&self.misses.with_label_values(&[tier]), counters.misses);
        }

        let events = [
            ("get", snapshot.gets),
            ("get_hit", snapshot.get_hits),
            ("set", snapshot.sets),
            ("set_failure", snapshot.set_failures),
            ("eviction", snapshot.evictions),
            ("expiration", snapshot.expirations),
            ("corruption", snapshot.corruptions),
            ("codec_failure", snapshot.codec_failures),
            ("invalidation", snapshot.invalidations),
            ("promotion", snapshot.promotions),
            ("warmup_loaded", snapshot.warmup_loaded),
            ("warmup_failed", snapshot.warmup_failed),
            ("sync_run", snapshot.sync_runs),
            ("sync_synchronized", snapshot.sync_synchronized),
            ("sync_conflict", snapshot.sync_conflicts),
            ("sync_error", snapshot.sync_errors),
            ("optimize_run", snapshot.optimize_runs),
        ];
        for (event, total) in events {
            advance(&self.events.with_label_values(&[event]), total);
        }

        if let Some(backend) = &snapshot.backend {
            let ops = [
                ("read", backend.reads),
                ("write", backend.writes),
                ("delete", backend.deletes),
            ];
            for (op, total) in ops {
                advance(&self.backend_ops.with_label_values(&[op]), total);
            }
        }

        for tier in &snapshot.occupancy {
            let label = [tier.kind.name()];
            self.entries
                .with_label_values(&label)
                .set(tier.entries as i64);
            self.size_bytes
                .with_label_values(&label)
                .set(tier.size_bytes as i64);
            self.capacity_bytes
                .with_label_values(&label)
                .set(tier.max_size_bytes as i64);
        }

        self.get_latency_us.set(snapshot.get_latency_us as i64);
        self.set_latency_us.set(snapshot.set_latency_us as i64);
    }

    /// Text exposition format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics not UTF-8: {}", e)))
    }

    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }
}

/// Move a counter forward to `total`; counters never go backwards
fn advance(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics error: {}", e))
}

// =============================================================================
// Tests
// =============================================================================
