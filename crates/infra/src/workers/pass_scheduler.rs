use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::aggregator::Aggregator;
use crate::config::ReconcilerConfig;
use crate::dispatcher::Dispatcher;
use crate::lock::{LockProvider, with_lock};
use crate::pass::{ExpiryPurge, PassReport, ScheduledPass, panic_message};
use crate::retry::{RetryScheduler, RetryTier};
use crate::store::MessageStore;

/// What happened on one scheduled tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Ran(PassReport),
    /// Another instance holds the pass's lock.
    Skipped,
    /// The lock backend or candidate selection failed, or the pass panicked;
    /// the next tick retries.
    Failed,
}

/// Run one pass inside its named lock.
///
/// A panicking pass is contained here so the lock is still released and the
/// worker thread keeps ticking.
pub fn run_guarded<L, P>(lock: &L, pass: &P, max_duration: Duration) -> TickOutcome
where
    L: LockProvider + ?Sized,
    P: ScheduledPass + ?Sized,
{
    let name = pass.name();
    let body = || panic::catch_unwind(AssertUnwindSafe(|| pass.run_at(Utc::now())));
    match with_lock(lock, name, max_duration, body) {
        Ok(Some(Ok(Ok(report)))) => TickOutcome::Ran(report),
        Ok(Some(Ok(Err(e)))) => {
            error!(pass = name, error = %e, "pass failed");
            TickOutcome::Failed
        }
        Ok(Some(Err(payload))) => {
            error!(pass = name, panic = %panic_message(&*payload), "pass panicked");
            TickOutcome::Failed
        }
        Ok(None) => {
            debug!(pass = name, "pass skipped; lock held elsewhere");
            TickOutcome::Skipped
        }
        Err(e) => {
            warn!(pass = name, error = %e, "could not acquire pass lock");
            TickOutcome::Failed
        }
    }
}

struct ScheduledEntry {
    pass: Arc<dyn ScheduledPass>,
    interval: Duration,
}

/// Drives each pass on its own named thread and fixed interval.
///
/// Records within a pass are processed sequentially; passes run
/// independently of each other.
pub struct PassScheduler {
    lock: Arc<dyn LockProvider>,
    lock_max_duration: Duration,
    entries: Vec<ScheduledEntry>,
}

impl PassScheduler {
    pub fn new(lock: Arc<dyn LockProvider>, lock_max_duration: Duration) -> Self {
        Self {
            lock,
            lock_max_duration,
            entries: Vec::new(),
        }
    }

    pub fn with_pass<P>(mut self, pass: P, interval: Duration) -> Self
    where
        P: ScheduledPass + 'static,
    {
        self.entries.push(ScheduledEntry {
            pass: Arc::new(pass),
            interval,
        });
        self
    }

    /// The standard pipeline: aggregate, the three retry tiers and the purge.
    pub fn from_config<S>(
        config: &ReconcilerConfig,
        store: S,
        dispatcher: Arc<Dispatcher>,
        lock: Arc<dyn LockProvider>,
    ) -> Self
    where
        S: MessageStore + Clone + 'static,
    {
        let aggregator =
            Aggregator::new(store.clone(), dispatcher.clone()).with_hold_back(config.hold_back);

        let tier_interval = |tier: RetryTier| match tier {
            RetryTier::ShortTerm => config.short_term_interval,
            RetryTier::MediumTerm => config.medium_term_interval,
            RetryTier::LongTerm => config.long_term_interval,
        };

        let mut scheduler = Self::new(lock, config.lock_max_duration)
            .with_pass(aggregator, config.aggregate_interval);
        for tier in RetryTier::ALL {
            scheduler = scheduler.with_pass(
                RetryScheduler::new(tier, store.clone(), dispatcher.clone()),
                tier_interval(tier),
            );
        }
        scheduler.with_pass(ExpiryPurge::new(store), config.purge_interval)
    }

    pub fn pass_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.pass.name().to_string())
            .collect()
    }

    /// Run every pass once, in registration order, under its lock.
    pub fn tick_all(&self) -> Vec<(String, TickOutcome)> {
        self.entries
            .iter()
            .map(|e| {
                let outcome = run_guarded(&*self.lock, &*e.pass, self.lock_max_duration);
                (e.pass.name().to_string(), outcome)
            })
            .collect()
    }

    /// Spawn one thread per pass. Each waits its interval before every run.
    pub fn spawn(self) -> io::Result<SchedulerHandle> {
        let mut workers = Vec::with_capacity(self.entries.len());

        for entry in self.entries {
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            let name = entry.pass.name().to_string();
            let lock = self.lock.clone();
            let max_duration = self.lock_max_duration;

            let join = thread::Builder::new()
                .name(format!("reconciler-{name}"))
                .spawn(move || pass_loop(entry, lock, max_duration, shutdown_rx))?;

            workers.push(Worker {
                name,
                shutdown: shutdown_tx,
                join: Some(join),
            });
        }

        Ok(SchedulerHandle { workers })
    }
}

impl core::fmt::Debug for PassScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PassScheduler")
            .field("passes", &self.pass_names())
            .field("lock_max_duration", &self.lock_max_duration)
            .finish()
    }
}

fn pass_loop(
    entry: ScheduledEntry,
    lock: Arc<dyn LockProvider>,
    max_duration: Duration,
    shutdown_rx: mpsc::Receiver<()>,
) {
    let name = entry.pass.name().to_string();
    info!(pass = %name, interval_secs = entry.interval.as_secs(), "pass worker started");

    loop {
        match shutdown_rx.recv_timeout(entry.interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                run_guarded(&*lock, &*entry.pass, max_duration);
            }
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(pass = %name, "pass worker stopped");
}

#[derive(Debug)]
struct Worker {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

/// Handle to stop and join every pass worker.
#[derive(Debug)]
pub struct SchedulerHandle {
    workers: Vec<Worker>,
}

impl SchedulerHandle {
    pub fn pass_names(&self) -> Vec<&str> {
        self.workers.iter().map(|w| w.name.as_str()).collect()
    }

    /// Request graceful shutdown and wait for every worker. A pass that is
    /// mid-run finishes its current tick first.
    pub fn shutdown(mut self) {
        for worker in &self.workers {
            let _ = worker.shutdown.send(());
        }
        for worker in &mut self.workers {
            if let Some(join) = worker.join.take() {
                if join.join().is_err() {
                    warn!(pass = %worker.name, "pass worker panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InMemoryLockProvider;
    use crate::store::{InMemoryMessageStore, StoreError};
    use chrono::{DateTime, Duration as ChronoDuration};
    use reconciler_core::{DispatchOutcome, EntityId, EventType, WorkRecord};
    use reconciler_observability::NoopMetrics;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPass {
        runs: Arc<AtomicUsize>,
    }

    impl ScheduledPass for CountingPass {
        fn name(&self) -> &str {
            "counting"
        }

        fn run_at(&self, _now: DateTime<Utc>) -> Result<PassReport, StoreError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(PassReport::default())
        }
    }

    struct BrokenPass;

    impl ScheduledPass for BrokenPass {
        fn name(&self) -> &str {
            "broken"
        }

        fn run_at(&self, _now: DateTime<Utc>) -> Result<PassReport, StoreError> {
            Err(StoreError::Storage("connection refused".to_string()))
        }
    }

    /// Panics on its first run only.
    struct PanicOncePass {
        runs: Arc<AtomicUsize>,
    }

    impl ScheduledPass for PanicOncePass {
        fn name(&self) -> &str {
            "panic-once"
        }

        fn run_at(&self, _now: DateTime<Utc>) -> Result<PassReport, StoreError> {
            if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first tick blew up");
            }
            Ok(PassReport::default())
        }
    }

    #[test]
    fn guarded_run_skips_when_lock_is_held() {
        let locks = InMemoryLockProvider::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let pass = CountingPass { runs: runs.clone() };

        let held = locks
            .try_acquire("counting", Duration::from_secs(60))
            .unwrap()
            .unwrap();
        assert_eq!(
            run_guarded(&locks, &pass, Duration::from_secs(60)),
            TickOutcome::Skipped
        );
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        locks.release(&held).unwrap();
        assert_eq!(
            run_guarded(&locks, &pass, Duration::from_secs(60)),
            TickOutcome::Ran(PassReport::default())
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guarded_run_reports_selection_failure() {
        let locks = InMemoryLockProvider::new();
        assert_eq!(
            run_guarded(&locks, &BrokenPass, Duration::from_secs(60)),
            TickOutcome::Failed
        );
        assert!(!locks.is_held("broken"));
    }

    #[test]
    fn guarded_run_contains_panics_and_releases_the_lock() {
        let locks = InMemoryLockProvider::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let pass = PanicOncePass { runs: runs.clone() };

        assert_eq!(
            run_guarded(&locks, &pass, Duration::from_secs(60)),
            TickOutcome::Failed
        );
        assert!(!locks.is_held("panic-once"));

        assert_eq!(
            run_guarded(&locks, &pass, Duration::from_secs(60)),
            TickOutcome::Ran(PassReport::default())
        );
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn spawned_worker_survives_a_panicking_tick() {
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = PassScheduler::new(InMemoryLockProvider::arc(), Duration::from_secs(60))
            .with_pass(PanicOncePass { runs: runs.clone() }, Duration::from_millis(5));

        let handle = scheduler.spawn().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();

        assert!(runs.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn from_config_registers_every_pass() {
        let store = InMemoryMessageStore::arc();
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(NoopMetrics)));
        let scheduler = PassScheduler::from_config(
            &ReconcilerConfig::default(),
            store,
            dispatcher,
            InMemoryLockProvider::arc(),
        );

        assert_eq!(
            scheduler.pass_names(),
            vec![
                "aggregate-messages",
                "retry-short-term",
                "retry-medium-term",
                "retry-long-term",
                "purge-expired",
            ]
        );
    }

    #[test]
    fn tick_all_drives_the_pipeline() {
        let store = InMemoryMessageStore::arc();
        let now = Utc::now();
        let record = WorkRecord::new(
            EntityId::new(5),
            EventType::SentenceImposed,
            "{}",
            now - ChronoDuration::minutes(10),
        );
        store.insert(&record).unwrap();

        let mut dispatcher = Dispatcher::new(Arc::new(NoopMetrics));
        dispatcher.register_handler(EventType::SentenceImposed, |_: &WorkRecord| -> anyhow::Result<DispatchOutcome> {
            Ok(DispatchOutcome::processed())
        });
        let scheduler = PassScheduler::from_config(
            &ReconcilerConfig::default(),
            store.clone(),
            Arc::new(dispatcher),
            InMemoryLockProvider::arc(),
        );

        let outcomes = scheduler.tick_all();
        assert_eq!(outcomes.len(), 5);
        match &outcomes[0].1 {
            TickOutcome::Ran(report) => assert_eq!(report.completed, 1),
            other => panic!("aggregator did not run: {other:?}"),
        }
        assert!(store.get(record.id).unwrap().unwrap().is_processed());
    }

    #[test]
    fn spawned_workers_run_and_shut_down() {
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = PassScheduler::new(InMemoryLockProvider::arc(), Duration::from_secs(60))
            .with_pass(CountingPass { runs: runs.clone() }, Duration::from_millis(5));

        let handle = scheduler.spawn().unwrap();
        assert_eq!(handle.pass_names(), vec!["counting"]);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();

        assert!(runs.load(Ordering::SeqCst) >= 1);
    }
}
