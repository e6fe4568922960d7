use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connectivity::{Connectivity, ConnectivitySubscription};
use crate::worker::{AttemptOutcome, DeliveryWorker};

/// Capped exponential delay between attempts of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(5 * 60 * 60),
        }
    }
}

impl Backoff {
    /// Delay before the attempt that follows `attempts` recorded attempts.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub backoff: Backoff,
    /// Upper bound on ids picked up by one sweep.
    pub due_batch: i64,
    /// Periodic sweep for rows no dispatch is holding; `None` disables it.
    pub sweep_interval: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            due_batch: 50,
            sweep_interval: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    /// Connectivity came back: every due item is attempted now, replacing
    /// whatever backoff its dispatch was sleeping through.
    Reconnect,
    /// Housekeeping: only items without a live dispatch are picked up.
    Periodic,
}

struct Dispatch {
    generation: u64,
    superseded: CancellationToken,
    handle: JoinHandle<()>,
}

impl Dispatch {
    fn abort(self) {
        self.superseded.cancel();
        self.handle.abort();
    }
}

struct SchedulerInner {
    worker: DeliveryWorker,
    connectivity: Connectivity,
    config: SchedulerConfig,
    dispatches: Mutex<HashMap<i64, Dispatch>>,
    generation: AtomicU64,
    outcomes: broadcast::Sender<(i64, AttemptOutcome)>,
}

/// Keyed dispatcher of worker attempts.
///
/// Each queue item id owns at most one dispatch task. Scheduling an id that
/// already has one supersedes it: the old dispatch stops at its next wait
/// point, never in the middle of an attempt, and the replacement starts only
/// once it has wound down. Two attempts for one item therefore never overlap.
/// Distinct items run concurrently.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(worker: DeliveryWorker, connectivity: Connectivity, config: SchedulerConfig) -> Self {
        let (outcomes, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(SchedulerInner {
                worker,
                connectivity,
                config,
                dispatches: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                outcomes,
            }),
        }
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }

    /// Every finished attempt, as `(item id, outcome)`.
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<(i64, AttemptOutcome)> {
        self.inner.outcomes.subscribe()
    }

    /// Attempts `id` as soon as the device is online.
    pub async fn schedule(&self, id: i64) {
        self.schedule_after(id, Duration::ZERO).await;
    }

    /// Replaces any dispatch for `id` with one that starts after `delay`.
    pub async fn schedule_after(&self, id: i64, delay: Duration) {
        let mut dispatches = self.inner.dispatches.lock().await;
        let previous = dispatches.remove(&id).map(|dispatch| {
            dispatch.superseded.cancel();
            dispatch.handle
        });
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let superseded = CancellationToken::new();

        let inner = Arc::clone(&self.inner);
        let token = superseded.clone();
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            inner.dispatch(id, generation, delay, token).await;
        });

        debug!(item_id = id, generation, delay_ms = delay.as_millis() as u64, "dispatch armed");
        dispatches.insert(
            id,
            Dispatch {
                generation,
                superseded,
                handle,
            },
        );
    }

    /// Schedules `id` unless a live dispatch already holds it.
    pub async fn schedule_if_absent(&self, id: i64) -> bool {
        {
            let dispatches = self.inner.dispatches.lock().await;
            if dispatches
                .get(&id)
                .is_some_and(|dispatch| !dispatch.handle.is_finished())
            {
                return false;
            }
        }
        self.schedule(id).await;
        true
    }

    /// Schedules the oldest pending items. Returns how many were (re)armed.
    pub async fn sweep(&self, mode: SweepMode) -> Result<usize> {
        // Failed rows are retained until purged; they must not fill the batch.
        let due = self
            .inner
            .worker
            .store()
            .list_pending(self.inner.config.due_batch)
            .await?;

        let mut armed = 0;
        for id in due {
            match mode {
                SweepMode::Reconnect => {
                    self.schedule(id).await;
                    armed += 1;
                }
                SweepMode::Periodic => {
                    if self.schedule_if_absent(id).await {
                        armed += 1;
                    }
                }
            }
        }
        Ok(armed)
    }

    /// Number of dispatches that have not finished yet.
    pub async fn active(&self) -> usize {
        self.inner
            .dispatches
            .lock()
            .await
            .values()
            .filter(|dispatch| !dispatch.handle.is_finished())
            .count()
    }

    /// Starts reacting to connectivity: a reconnect sweep runs on the first
    /// online reading and on every offline to online transition after it.
    pub fn start(&self) -> SchedulerGuard {
        let subscription = self.inner.connectivity.subscribe();
        let stop = subscription.stop_token();

        let listener = {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.listen(subscription).await })
        };

        let periodic = self.inner.config.sweep_interval.map(|every| {
            let scheduler = self.clone();
            let stop = stop.clone();
            tokio::spawn(async move { scheduler.sweep_every(every, stop).await })
        });

        info!("delivery scheduler started");
        SchedulerGuard {
            scheduler: self.clone(),
            stop,
            listener,
            periodic,
        }
    }

    async fn listen(&self, mut subscription: ConnectivitySubscription) {
        let mut was_online = false;
        while let Some(online) = subscription.next().await {
            if online && !was_online {
                match self.sweep(SweepMode::Reconnect).await {
                    Ok(armed) => info!(armed, "online; due uploads scheduled"),
                    Err(err) => warn!(error = %err, "reconnect sweep failed"),
                }
            } else if !online && was_online {
                info!("offline; uploads will queue");
            }
            was_online = online;
        }
        debug!("connectivity listener stopped");
    }

    async fn sweep_every(&self, every: Duration, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick is immediate and the listener already covers startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.inner.connectivity.is_online() {
                        continue;
                    }
                    match self.sweep(SweepMode::Periodic).await {
                        Ok(0) => {}
                        Ok(armed) => debug!(armed, "periodic sweep picked up idle uploads"),
                        Err(err) => warn!(error = %err, "periodic sweep failed"),
                    }
                }
            }
        }
    }

    async fn abort_all(&self) {
        let mut dispatches = self.inner.dispatches.lock().await;
        for (_, dispatch) in dispatches.drain() {
            dispatch.abort();
        }
    }
}

impl SchedulerInner {
    async fn dispatch(
        &self,
        id: i64,
        generation: u64,
        mut delay: Duration,
        superseded: CancellationToken,
    ) {
        while self.wait_turn(delay, &superseded).await {
            let outcome = self.worker.run_attempt(id).await;
            let next = outcome.retry_after_attempts();
            let _ = self.outcomes.send((id, outcome));

            match next {
                Some(attempts) => {
                    delay = self.config.backoff.delay_for(attempts);
                    debug!(item_id = id, attempts, delay_secs = delay.as_secs(), "retry backoff");
                }
                None => break,
            }
        }

        let mut dispatches = self.dispatches.lock().await;
        if dispatches
            .get(&id)
            .is_some_and(|dispatch| dispatch.generation == generation)
        {
            dispatches.remove(&id);
        }
    }

    async fn wait_turn(&self, delay: Duration, superseded: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = superseded.cancelled() => false,
            _ = async {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                self.connectivity.wait_online().await;
            } => true,
        }
    }
}

/// Keeps the scheduler reacting to connectivity. Dropping it stops the
/// listener and aborts every pending dispatch; queue rows stay as they are.
pub struct SchedulerGuard {
    scheduler: Scheduler,
    stop: CancellationToken,
    listener: JoinHandle<()>,
    periodic: Option<JoinHandle<()>>,
}

impl SchedulerGuard {
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn stop(self) {
        self.stop.cancel();
        self.scheduler.abort_all().await;
        info!("delivery scheduler stopped");
    }
}

impl Drop for SchedulerGuard {
    fn drop(&mut self) {
        self.stop.cancel();
        self.listener.abort();
        if let Some(periodic) = &self.periodic {
            periodic.abort();
        }
        if let Ok(mut dispatches) = self.scheduler.inner.dispatches.try_lock() {
            for (_, dispatch) in dispatches.drain() {
                dispatch.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentials;
    use crate::testing::{QueueFixture, ScriptedTransport};
    use fieldpost_contract::{FailureReason, QueueStatus};
    use reqwest::StatusCode;

    fn scheduler(
        fixture: &QueueFixture,
        transport: Arc<ScriptedTransport>,
        connectivity: Connectivity,
        config: SchedulerConfig,
    ) -> Scheduler {
        let credentials = Arc::new(MemoryCredentials::new(Some("token".to_string())));
        let worker = DeliveryWorker::new(fixture.store.clone(), transport, credentials);
        Scheduler::new(worker, connectivity, config)
    }

    fn fast() -> SchedulerConfig {
        SchedulerConfig {
            backoff: Backoff {
                initial: Duration::from_millis(5),
                max: Duration::from_millis(20),
            },
            ..SchedulerConfig::default()
        }
    }

    async fn next_outcome(
        outcomes: &mut broadcast::Receiver<(i64, AttemptOutcome)>,
    ) -> (i64, AttemptOutcome) {
        tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
            .await
            .expect("outcome in time")
            .expect("outcome channel open")
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(300),
        };
        assert_eq!(backoff.delay_for(0), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(60));
        assert_eq!(backoff.delay_for(4), Duration::from_secs(240));
        assert_eq!(backoff.delay_for(5), Duration::from_secs(300));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn offline_dispatch_waits_for_connectivity() {
        let fixture = QueueFixture::new().await;
        let (id, path) = fixture.stage("report.pdf").await;
        let transport = ScriptedTransport::accepting();
        let connectivity = Connectivity::new(false);
        let scheduler = scheduler(&fixture, transport.clone(), connectivity.clone(), fast());
        let mut outcomes = scheduler.subscribe_outcomes();

        scheduler.schedule(id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.calls(), 0);
        assert_eq!(scheduler.active().await, 1);

        connectivity.set_online(true);
        let (delivered, outcome) = next_outcome(&mut outcomes).await;
        assert_eq!(delivered, id);
        assert!(matches!(outcome, AttemptOutcome::Delivered { .. }));
        assert_eq!(transport.calls(), 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn rescheduling_replaces_instead_of_duplicating() {
        let fixture = QueueFixture::new().await;
        let (id, _) = fixture.stage("report.pdf").await;
        let transport = ScriptedTransport::accepting();
        let connectivity = Connectivity::new(false);
        let scheduler = scheduler(&fixture, transport.clone(), connectivity.clone(), fast());
        let mut outcomes = scheduler.subscribe_outcomes();

        for _ in 0..5 {
            scheduler.schedule(id).await;
        }
        assert_eq!(scheduler.active().await, 1);

        connectivity.set_online(true);
        let (_, outcome) = next_outcome(&mut outcomes).await;
        assert!(matches!(outcome, AttemptOutcome::Delivered { .. }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.calls(), 1);
        assert!(outcomes.try_recv().is_err());
    }

    #[tokio::test]
    async fn retries_follow_backoff_until_cap() {
        let fixture = QueueFixture::new().await;
        let (id, _) = fixture.stage("report.pdf").await;
        let transport = ScriptedTransport::failing_with(StatusCode::SERVICE_UNAVAILABLE);
        let scheduler = scheduler(&fixture, transport.clone(), Connectivity::new(true), fast());
        let mut outcomes = scheduler.subscribe_outcomes();

        scheduler.schedule(id).await;
        loop {
            let (_, outcome) = next_outcome(&mut outcomes).await;
            if let AttemptOutcome::Failed { reason, attempts } = outcome {
                assert_eq!(reason, FailureReason::Http(503));
                assert_eq!(attempts, 10);
                break;
            }
        }

        assert_eq!(transport.calls(), 10);
        let item = fixture.store.get(id).await.expect("get").expect("row");
        assert_eq!(item.status, QueueStatus::Failed);
    }

    #[tokio::test]
    async fn reconnect_sweep_picks_up_due_items() {
        let fixture = QueueFixture::new().await;
        let (first, _) = fixture.stage("a.pdf").await;
        let (second, _) = fixture.stage("b.pdf").await;
        let transport = ScriptedTransport::accepting();
        let connectivity = Connectivity::new(false);
        let scheduler = scheduler(&fixture, transport.clone(), connectivity.clone(), fast());
        let mut outcomes = scheduler.subscribe_outcomes();
        let guard = scheduler.start();

        connectivity.set_online(true);
        let mut delivered = vec![next_outcome(&mut outcomes).await.0, next_outcome(&mut outcomes).await.0];
        delivered.sort_unstable();
        assert_eq!(delivered, vec![first, second]);
        assert!(fixture.store.list_all().await.expect("list").is_empty());

        guard.stop().await;
    }

    #[tokio::test]
    async fn failed_rows_do_not_starve_pending_ones() {
        let fixture = QueueFixture::new().await;
        for name in ["old-a.pdf", "old-b.pdf"] {
            let (id, _) = fixture.stage(name).await;
            fixture
                .store
                .update_state(
                    id,
                    QueueStatus::Failed,
                    10,
                    Some(FailureReason::Http(500)),
                    chrono::Utc::now(),
                )
                .await
                .expect("fail row");
        }
        let (pending, path) = fixture.stage("fresh.pdf").await;

        let transport = ScriptedTransport::accepting();
        let connectivity = Connectivity::new(false);
        let config = SchedulerConfig {
            due_batch: 2,
            sweep_interval: Some(Duration::from_millis(20)),
            ..fast()
        };
        let scheduler = scheduler(&fixture, transport.clone(), connectivity.clone(), config);
        let mut outcomes = scheduler.subscribe_outcomes();
        let guard = scheduler.start();

        connectivity.set_online(true);
        let (id, outcome) = next_outcome(&mut outcomes).await;
        assert_eq!(id, pending);
        assert!(matches!(outcome, AttemptOutcome::Delivered { .. }));
        assert_eq!(transport.calls(), 1);
        assert!(!path.exists());
        assert_eq!(scheduler.sweep(SweepMode::Periodic).await.expect("sweep"), 0);

        guard.stop().await;
    }

    #[tokio::test]
    async fn periodic_sweep_keeps_live_dispatches() {
        let fixture = QueueFixture::new().await;
        let (id, _) = fixture.stage("a.pdf").await;
        let scheduler = scheduler(
            &fixture,
            ScriptedTransport::accepting(),
            Connectivity::new(false),
            fast(),
        );

        assert_eq!(scheduler.sweep(SweepMode::Periodic).await.expect("sweep"), 1);
        assert_eq!(scheduler.sweep(SweepMode::Periodic).await.expect("sweep"), 0);
        assert!(!scheduler.schedule_if_absent(id).await);
        assert_eq!(scheduler.sweep(SweepMode::Reconnect).await.expect("sweep"), 1);
        assert_eq!(scheduler.active().await, 1);
    }

    #[tokio::test]
    async fn dropping_the_guard_aborts_dispatches() {
        let fixture = QueueFixture::new().await;
        let (id, path) = fixture.stage("a.pdf").await;
        let transport = ScriptedTransport::accepting();
        let connectivity = Connectivity::new(false);
        let scheduler = scheduler(&fixture, transport.clone(), connectivity.clone(), fast());

        let guard = scheduler.start();
        scheduler.schedule(id).await;
        drop(guard);
        tokio::task::yield_now().await;

        connectivity.set_online(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.calls(), 0);
        assert!(path.exists());
        assert_eq!(
            fixture.store.get(id).await.expect("get").expect("row").status,
            QueueStatus::Pending
        );
    }
}
