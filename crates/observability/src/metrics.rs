//! Metrics sink injected into the reconciliation pipeline.
//!
//! The pipeline never touches a global registry directly; it is handed a
//! `MetricsSink` once at process start. `FacadeMetrics` forwards to whatever
//! recorder the process installed for the `metrics` crate,
//! `RecordingMetrics` keeps everything in memory for tests.

use std::sync::{Arc, Mutex};

/// A metric tag: `(key, value)`.
pub type Tag<'a> = (&'a str, String);

/// Destination for pipeline counters and observations.
pub trait MetricsSink: Send + Sync {
    /// Increment a counter by one.
    fn increment(&self, name: &str, tags: &[Tag<'_>]);

    /// Record a single observation (e.g. an age in seconds).
    fn observe(&self, name: &str, value: f64, tags: &[Tag<'_>]);
}

impl<M> MetricsSink for Arc<M>
where
    M: MetricsSink + ?Sized,
{
    fn increment(&self, name: &str, tags: &[Tag<'_>]) {
        (**self).increment(name, tags)
    }

    fn observe(&self, name: &str, value: f64, tags: &[Tag<'_>]) {
        (**self).observe(name, value, tags)
    }
}

fn labels(tags: &[Tag<'_>]) -> Vec<metrics::Label> {
    tags.iter()
        .map(|(key, value)| metrics::Label::new(key.to_string(), value.clone()))
        .collect()
}

/// Sink backed by the `metrics` facade (counters and histograms).
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeMetrics;

impl MetricsSink for FacadeMetrics {
    fn increment(&self, name: &str, tags: &[Tag<'_>]) {
        metrics::counter!(name.to_string(), labels(tags)).increment(1);
    }

    fn observe(&self, name: &str, value: f64, tags: &[Tag<'_>]) {
        metrics::histogram!(name.to_string(), labels(tags)).record(value);
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &str, _tags: &[Tag<'_>]) {}

    fn observe(&self, _name: &str, _value: f64, _tags: &[Tag<'_>]) {}
}

/// One captured metric call.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    Increment {
        name: String,
        tags: Vec<(String, String)>,
    },
    Observe {
        name: String,
        value: f64,
        tags: Vec<(String, String)>,
    },
}

impl MetricEvent {
    pub fn name(&self) -> &str {
        match self {
            MetricEvent::Increment { name, .. } | MetricEvent::Observe { name, .. } => name,
        }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        let tags = match self {
            MetricEvent::Increment { tags, .. } | MetricEvent::Observe { tags, .. } => tags,
        };
        tags.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of every call so far, in order.
    pub fn events(&self) -> Vec<MetricEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Number of increments recorded under `name`.
    pub fn count(&self, name: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, MetricEvent::Increment { .. }) && e.name() == name)
            .count()
    }

    fn push(&self, event: MetricEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

fn owned(tags: &[Tag<'_>]) -> Vec<(String, String)> {
    tags.iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

impl MetricsSink for RecordingMetrics {
    fn increment(&self, name: &str, tags: &[Tag<'_>]) {
        self.push(MetricEvent::Increment {
            name: name.to_string(),
            tags: owned(tags),
        });
    }

    fn observe(&self, name: &str, value: f64, tags: &[Tag<'_>]) {
        self.push(MetricEvent::Observe {
            name: name.to_string(),
            value,
            tags: owned(tags),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_captures_calls_in_order() {
        let sink = RecordingMetrics::new();
        sink.increment("processed", &[("eventType", "A".to_string())]);
        sink.observe("age_seconds", 12.5, &[("eventType", "A".to_string())]);
        sink.increment("processed", &[("eventType", "B".to_string())]);

        assert_eq!(sink.count("processed"), 2);
        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].name(), "age_seconds");
        assert_eq!(events[2].tag("eventType"), Some("B"));
    }

    #[test]
    fn facade_sink_works_without_an_installed_recorder() {
        let sink = FacadeMetrics;
        sink.increment("noop_counter", &[("k", "v".to_string())]);
        sink.observe("noop_histogram", 1.0, &[]);
    }
}
