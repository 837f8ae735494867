//! Processing dispatcher: routes a work record to its domain handler.
//!
//! The dispatcher selects exactly one handler by event type, returns the
//! handler's outcome, and emits metrics. It does **not** catch handler errors;
//! those surface to the calling pass, which downgrades them to a retry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use reconciler_core::{DispatchOutcome, EventType, WorkRecord, status};
use reconciler_observability::MetricsSink;

use crate::config::ReconcilerConfig;

/// Counter incremented on every `Completed` outcome.
pub const SUCCESS_METRIC: &str = "reconciler_message_success_total";

/// Age (seconds since first receipt) observed on every `Completed` outcome.
pub const AGE_METRIC: &str = "reconciler_message_age_seconds";

/// Counter incremented on failures close to abandonment.
pub const FAILURE_METRIC: &str = "reconciler_message_failure_total";

/// Default lookback window for failure metrics.
pub const DEFAULT_FAILURE_WINDOW: Duration = Duration::hours(2);

/// Domain handler for one event type.
///
/// Handlers must tolerate being invoked more than once for the same logical
/// change; overlapping passes may dispatch a record twice.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, record: &WorkRecord) -> anyhow::Result<DispatchOutcome>;
}

impl<F> MessageHandler for F
where
    F: Fn(&WorkRecord) -> anyhow::Result<DispatchOutcome> + Send + Sync,
{
    fn handle(&self, record: &WorkRecord) -> anyhow::Result<DispatchOutcome> {
        self(record)
    }
}

/// Maps event types to handlers and reports outcomes as metrics.
pub struct Dispatcher {
    handlers: HashMap<EventType, Arc<dyn MessageHandler>>,
    metrics: Arc<dyn MetricsSink>,
    failure_window: Duration,
}

impl Dispatcher {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            handlers: HashMap::new(),
            metrics,
            failure_window: DEFAULT_FAILURE_WINDOW,
        }
    }

    /// A dispatcher using the configured failure metric window.
    pub fn from_config(config: &ReconcilerConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self::new(metrics).with_failure_window(config.failure_metric_window)
    }

    pub fn failure_window(&self) -> Duration {
        self.failure_window
    }

    /// Failures are only counted once the record's expiry is within `window` of now.
    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }

    /// Register the handler for an event type, replacing any previous one.
    pub fn register_handler<H>(&mut self, event_type: EventType, handler: H)
    where
        H: MessageHandler + 'static,
    {
        self.handlers.insert(event_type, Arc::new(handler));
    }

    pub fn has_handler(&self, event_type: &EventType) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Dispatch a record to its handler.
    ///
    /// Unknown or unregistered event types complete as a no-op with
    /// `NO_HANDLER`. Handler errors are returned untouched.
    pub fn dispatch(
        &self,
        record: &WorkRecord,
        now: DateTime<Utc>,
    ) -> anyhow::Result<DispatchOutcome> {
        let outcome = match self.handlers.get(&record.event_type) {
            Some(handler) => handler.handle(record)?,
            None => {
                debug!(
                    id = %record.id,
                    event_type = %record.event_type,
                    "no handler registered; completing as no-op"
                );
                DispatchOutcome::completed(status::NO_HANDLER)
            }
        };

        match &outcome {
            DispatchOutcome::Completed { .. } => self.record_success(record, now),
            DispatchOutcome::Retry { .. } => self.record_failure(record, now),
        }

        Ok(outcome)
    }

    /// Count a failed attempt, but only once the record is close to expiry.
    ///
    /// Passes call this directly for handler errors, which are treated the
    /// same as a `Retry` outcome.
    pub fn record_failure(&self, record: &WorkRecord, now: DateTime<Utc>) {
        let horizon = now.checked_add_signed(self.failure_window);
        if horizon.is_some_and(|horizon| record.expiry > horizon) {
            return;
        }
        self.metrics.increment(FAILURE_METRIC, &tags(record));
    }

    fn record_success(&self, record: &WorkRecord, now: DateTime<Utc>) {
        let tags = tags(record);
        self.metrics.increment(SUCCESS_METRIC, &tags);

        let age_seconds = record.age(now).num_milliseconds().max(0) as f64 / 1000.0;
        self.metrics.observe(AGE_METRIC, age_seconds, &tags);
    }
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("failure_window", &self.failure_window)
            .finish()
    }
}

fn tags(record: &WorkRecord) -> [(&'static str, String); 2] {
    [
        ("eventType", record.event_type.to_string()),
        ("retryCount", record.retry_count.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconciler_core::EntityId;
    use reconciler_observability::{MetricEvent, RecordingMetrics};

    fn record(event_type: EventType, created: DateTime<Utc>) -> WorkRecord {
        WorkRecord::new(EntityId::new(1), event_type, "{}", created)
    }

    fn dispatcher(metrics: Arc<RecordingMetrics>) -> Dispatcher {
        let mut dispatcher = Dispatcher::new(metrics);
        dispatcher.register_handler(EventType::ImprisonmentStatusChanged, |_: &WorkRecord| -> anyhow::Result<DispatchOutcome> {
            Ok(DispatchOutcome::processed())
        });
        dispatcher.register_handler(EventType::SentenceDatesChanged, |_: &WorkRecord| -> anyhow::Result<DispatchOutcome> {
            Ok(DispatchOutcome::retry())
        });
        dispatcher.register_handler(EventType::BookingNumberChanged, |_: &WorkRecord| -> anyhow::Result<DispatchOutcome> {
            anyhow::bail!("downstream unavailable")
        });
        dispatcher
    }

    #[test]
    fn completed_outcome_emits_success_and_age() {
        let metrics = RecordingMetrics::arc();
        let d = dispatcher(metrics.clone());
        let now = Utc::now();
        let r = record(EventType::ImprisonmentStatusChanged, now - Duration::seconds(90));

        let outcome = d.dispatch(&r, now).unwrap();
        assert_eq!(outcome, DispatchOutcome::processed());

        let events = metrics.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), SUCCESS_METRIC);
        assert_eq!(events[0].tag("eventType"), Some("IMPRISONMENT_STATUS-CHANGED"));
        assert_eq!(events[0].tag("retryCount"), Some("0"));
        match &events[1] {
            MetricEvent::Observe { name, value, .. } => {
                assert_eq!(name, AGE_METRIC);
                assert!((value - 90.0).abs() < f64::EPSILON);
            }
            other => panic!("expected age observation, got {other:?}"),
        }
    }

    #[test]
    fn unknown_event_type_completes_as_noop() {
        let metrics = RecordingMetrics::arc();
        let d = dispatcher(metrics.clone());
        let r = record(EventType::Unknown("SOMETHING_ELSE".to_string()), Utc::now());

        let outcome = d.dispatch(&r, Utc::now()).unwrap();
        assert_eq!(outcome, DispatchOutcome::completed(status::NO_HANDLER));
        assert_eq!(metrics.count(SUCCESS_METRIC), 1);
    }

    #[test]
    fn early_retry_does_not_emit_failure_metric() {
        let metrics = RecordingMetrics::arc();
        let d = dispatcher(metrics.clone());
        let now = Utc::now();
        let r = record(EventType::SentenceDatesChanged, now);

        assert_eq!(d.dispatch(&r, now).unwrap(), DispatchOutcome::retry());
        assert_eq!(metrics.count(FAILURE_METRIC), 0);
    }

    #[test]
    fn retry_near_expiry_emits_failure_metric() {
        let metrics = RecordingMetrics::arc();
        let d = dispatcher(metrics.clone()).with_failure_window(Duration::hours(1));
        let now = Utc::now();
        let r = record(EventType::SentenceDatesChanged, now - Duration::days(7))
            .with_expiry(now + Duration::minutes(30));

        d.dispatch(&r, now).unwrap();
        assert_eq!(metrics.count(FAILURE_METRIC), 1);
        assert_eq!(metrics.count(SUCCESS_METRIC), 0);
    }

    #[test]
    fn from_config_applies_failure_window() {
        let config = ReconcilerConfig {
            failure_metric_window: Duration::days(3),
            ..ReconcilerConfig::default()
        };
        let metrics = RecordingMetrics::arc();
        let d = Dispatcher::from_config(&config, metrics.clone());
        assert_eq!(d.failure_window(), Duration::days(3));

        let now = Utc::now();
        let inside = record(EventType::SentenceDatesChanged, now).with_expiry(now + Duration::days(2));
        let outside = record(EventType::SentenceDatesChanged, now).with_expiry(now + Duration::days(4));
        d.record_failure(&inside, now);
        d.record_failure(&outside, now);
        assert_eq!(metrics.count(FAILURE_METRIC), 1);
    }

    #[test]
    fn unbounded_failure_window_counts_every_failure() {
        let metrics = RecordingMetrics::arc();
        let d = Dispatcher::new(metrics.clone()).with_failure_window(Duration::MAX);
        let now = Utc::now();

        d.record_failure(&record(EventType::SentenceDatesChanged, now), now);
        assert_eq!(metrics.count(FAILURE_METRIC), 1);
    }

    #[test]
    fn handler_errors_propagate_without_metrics() {
        let metrics = RecordingMetrics::arc();
        let d = dispatcher(metrics.clone());
        let r = record(EventType::BookingNumberChanged, Utc::now());

        let err = d.dispatch(&r, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("downstream unavailable"));
        assert!(metrics.events().is_empty());
    }
}
