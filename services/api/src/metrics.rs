use std::time::Duration;

use anyhow::Context;
use prometheus::{Encoder, HistogramVec, IntCounterVec, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    cache_hits: IntCounterVec,
    cache_misses: IntCounterVec,
    request_latency: HistogramVec,
    ticks_ingested: IntCounterVec,
    aggregation_runs: IntCounterVec,
    oracle_decisions: IntCounterVec,
    policy_transitions: IntCounterVec,
    broadcasts: IntCounterVec,
    events_processed: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let cache_hits = IntCounterVec::new(
            prometheus::Opts::new("cache_hits_total", "Cache hits by layer and endpoint"),
            &["layer", "endpoint"],
        )
        .context("cache_hits metric")?;

        let cache_misses = IntCounterVec::new(
            prometheus::Opts::new("cache_misses_total", "Cache misses by layer and endpoint"),
            &["layer", "endpoint"],
        )
        .context("cache_misses metric")?;

        let request_latency = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP latency in seconds",
            ),
            &["endpoint"],
        )
        .context("request_latency metric")?;

        let ticks_ingested = IntCounterVec::new(
            prometheus::Opts::new("price_ticks_total", "Price ticks ingested by source"),
            &["source", "outcome"],
        )
        .context("ticks_ingested metric")?;

        let aggregation_runs = IntCounterVec::new(
            prometheus::Opts::new("aggregation_runs_total", "Aggregation runs by outcome"),
            &["outcome"],
        )
        .context("aggregation_runs metric")?;

        let oracle_decisions = IntCounterVec::new(
            prometheus::Opts::new(
                "oracle_submitter_decisions_total",
                "Oracle submitter decisions by reason",
            ),
            &["decision", "reason"],
        )
        .context("oracle_decisions metric")?;

        let policy_transitions = IntCounterVec::new(
            prometheus::Opts::new(
                "policy_transitions_total",
                "Policy state transitions applied",
            ),
            &["from", "to"],
        )
        .context("policy_transitions metric")?;

        let broadcasts = IntCounterVec::new(
            prometheus::Opts::new(
                "chain_broadcasts_total",
                "Transaction broadcasts by kind and outcome",
            ),
            &["kind", "outcome"],
        )
        .context("broadcasts metric")?;

        let events_processed = IntCounterVec::new(
            prometheus::Opts::new(
                "chain_events_processed_total",
                "Contract events processed by topic",
            ),
            &["topic", "outcome"],
        )
        .context("events_processed metric")?;

        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(request_latency.clone()))?;
        registry.register(Box::new(ticks_ingested.clone()))?;
        registry.register(Box::new(aggregation_runs.clone()))?;
        registry.register(Box::new(oracle_decisions.clone()))?;
        registry.register(Box::new(policy_transitions.clone()))?;
        registry.register(Box::new(broadcasts.clone()))?;
        registry.register(Box::new(events_processed.clone()))?;

        Ok(Self {
            registry,
            cache_hits,
            cache_misses,
            request_latency,
            ticks_ingested,
            aggregation_runs,
            oracle_decisions,
            policy_transitions,
            broadcasts,
            events_processed,
        })
    }

    pub fn observe_hit(&self, layer: &str, endpoint: &str) {
        self.cache_hits.with_label_values(&[layer, endpoint]).inc();
    }

    pub fn observe_miss(&self, layer: &str, endpoint: &str) {
        self.cache_misses
            .with_label_values(&[layer, endpoint])
            .inc();
    }

    pub fn observe_request(&self, endpoint: &str, duration: Duration) {
        self.request_latency
            .with_label_values(&[endpoint])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_tick(&self, source: &str, outcome: &str) {
        self.ticks_ingested
            .with_label_values(&[source, outcome])
            .inc();
    }

    pub fn observe_aggregation(&self, outcome: &str) {
        self.aggregation_runs.with_label_values(&[outcome]).inc();
    }

    pub fn observe_oracle_decision(&self, decision: &str, reason: &str) {
        self.oracle_decisions
            .with_label_values(&[decision, reason])
            .inc();
    }

    pub fn observe_policy_transition(&self, from: &str, to: &str) {
        self.policy_transitions
            .with_label_values(&[from, to])
            .inc();
    }

    pub fn observe_broadcast(&self, kind: &str, outcome: &str) {
        self.broadcasts.with_label_values(&[kind, outcome]).inc();
    }

    pub fn observe_event(&self, topic: &str, outcome: &str) {
        self.events_processed
            .with_label_values(&[topic, outcome])
            .inc();
    }

    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = vec![];
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
