//! Adaptive scan scheduler
//!
//! One periodic tick: roll the budget window, claim due routes in tier
//! order, reserve budget per route, and fan the probes out to a bounded
//! worker pool under a hard wall-clock deadline.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::alerts::AlertSink;
use crate::budget::BudgetTracker;
use crate::probe::{ProbeClient, ProbeError};
use crate::registry::{ProbeLease, RouteRegistry};
use crate::reliability::record::Decision;
use crate::reliability::ReliabilityEngine;
use crate::store::Store;
use crate::types::{DateWindow, PriceSample, RouteCode};

/// Departure window probed on every dispatch, relative to today
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeWindowSpec {
    pub offset_days: u32,
    pub length_days: u32,
}

impl Default for ProbeWindowSpec {
    fn default() -> Self {
        Self {
            offset_days: 7,
            length_days: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    /// Max concurrent outbound probe jobs
    pub concurrency: usize,
    pub tick_deadline: Duration,
    pub windows: Vec<ProbeWindowSpec>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60 * 60),
            concurrency: 4,
            tick_deadline: Duration::from_secs(600),
            windows: vec![ProbeWindowSpec::default()],
        }
    }
}

impl SchedulerSettings {
    pub fn date_windows(&self, today: NaiveDate) -> Vec<DateWindow> {
        self.windows
            .iter()
            .map(|w| DateWindow::ahead(today, w.offset_days, w.length_days))
            .collect()
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub due: usize,
    pub dispatched: usize,
    pub skipped_budget: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub invalid: usize,
    pub probe_calls: u64,
    pub samples: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub verify: usize,
}

impl TickReport {
    fn absorb(&mut self, outcome: JobOutcome) {
        self.probe_calls += outcome.calls;
        match outcome.status {
            JobStatus::Probed => self.succeeded += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Invalid => {
                self.failed += 1;
                self.invalid += 1;
            }
        }
        self.samples += outcome.samples;
        self.accepted += outcome.accepted;
        self.rejected += outcome.rejected;
        self.verify += outcome.verify;
    }
}

impl std::fmt::Display for TickReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} due, {} dispatched, {} over budget, {} ok, {} failed ({} cancelled), {} calls, {} samples, {} accepted",
            self.due,
            self.dispatched,
            self.skipped_budget,
            self.succeeded,
            self.failed,
            self.cancelled,
            self.probe_calls,
            self.samples,
            self.accepted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobStatus {
    Probed,
    Failed,
    Invalid,
}

#[derive(Debug)]
struct JobOutcome {
    status: JobStatus,
    calls: u64,
    samples: usize,
    accepted: usize,
    rejected: usize,
    verify: usize,
}

impl JobOutcome {
    fn new(status: JobStatus, calls: u64) -> Self {
        Self {
            status,
            calls,
            samples: 0,
            accepted: 0,
            rejected: 0,
            verify: 0,
        }
    }
}

/// Budget bookkeeping for one in-flight job, shared with the tick so a
/// cancelled job's unfired calls can be handed back
struct JobLedger {
    code: RouteCode,
    reserved: AtomicU64,
    fired: AtomicU64,
    settled: AtomicBool,
    done: AtomicBool,
}

impl JobLedger {
    fn new(code: RouteCode, reserved: u64) -> Self {
        Self {
            code,
            reserved: AtomicU64::new(reserved),
            fired: AtomicU64::new(0),
            settled: AtomicBool::new(false),
            done: AtomicBool::new(false),
        }
    }

    /// Release reserved-but-unfired calls. Runs at most once.
    fn settle(&self, budget: &BudgetTracker) -> u64 {
        if self.settled.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let unfired = self
            .reserved
            .load(Ordering::Acquire)
            .saturating_sub(self.fired.load(Ordering::Acquire));
        budget.release(unfired);
        unfired
    }
}

/// Everything a probe job needs, cheap to clone into a task
#[derive(Clone)]
struct Worker {
    registry: Arc<RouteRegistry>,
    budget: Arc<BudgetTracker>,
    probe: Arc<dyn ProbeClient>,
    engine: Arc<ReliabilityEngine>,
    alerts: Arc<dyn AlertSink>,
}

impl Worker {
    async fn run(self, lease: ProbeLease, windows: Vec<DateWindow>, ledger: Arc<JobLedger>, now: DateTime<Utc>) -> JobOutcome {
        let code = lease.code().clone();
        let mut samples: Vec<PriceSample> = Vec::new();
        let mut any_ok = false;
        let mut invalid = None;

        for window in &windows {
            match self.probe_window(&code, window, &ledger).await {
                Ok(found) => {
                    any_ok = true;
                    samples.extend(found);
                }
                Err(ProbeError::InvalidRoute(reason)) => {
                    invalid = Some(reason);
                    break;
                }
                Err(e) => warn!("Probe {} {} failed: {}", code, window, e),
            }
        }
        let calls = ledger.fired.load(Ordering::Acquire);
        ledger.settle(&self.budget);

        if let Some(reason) = invalid {
            self.registry.mark_invalid(&code, reason);
            self.fail(&code, now).await;
            return JobOutcome::new(JobStatus::Invalid, calls);
        }
        if !any_ok {
            self.fail(&code, now).await;
            return JobOutcome::new(JobStatus::Failed, calls);
        }

        let mut outcome = JobOutcome::new(JobStatus::Probed, calls);
        outcome.samples = samples.len();
        for sample in &samples {
            let record = match self.engine.evaluate(lease.route(), sample, now).await {
                Ok(record) => record,
                Err(e) => {
                    warn!("Failed to evaluate sample for {}: {:#}", code, e);
                    continue;
                }
            };
            match record.decision {
                Decision::Accept => {
                    outcome.accepted += 1;
                    self.alerts.notify(lease.route(), &record).await;
                }
                Decision::Reject => outcome.rejected += 1,
                Decision::Verify => outcome.verify += 1,
            }
        }

        if let Err(e) = self
            .registry
            .mark_probed(&code, now, outcome.accepted as u64)
            .await
        {
            warn!("Failed to record probe of {}: {:#}", code, e);
        }
        outcome
    }

    /// One call, retried once on a transient error if budget allows
    async fn probe_window(&self, code: &RouteCode, window: &DateWindow, ledger: &JobLedger) -> Result<Vec<PriceSample>, ProbeError> {
        ledger.fired.fetch_add(1, Ordering::AcqRel);
        match self.probe.probe(code, window).await {
            Err(e) if e.is_transient() => {
                if self.budget.reserve(1) == 0 {
                    debug!("No budget left to retry {} {}", code, window);
                    return Err(e);
                }
                ledger.reserved.fetch_add(1, Ordering::AcqRel);
                ledger.fired.fetch_add(1, Ordering::AcqRel);
                warn!("Probe {} {} failed ({}), retrying once", code, window, e);
                self.probe.probe(code, window).await
            }
            other => other,
        }
    }

    async fn fail(&self, code: &RouteCode, now: DateTime<Utc>) {
        if let Err(e) = self.registry.record_failure(code, now).await {
            warn!("Failed to record failure of {}: {:#}", code, e);
        }
    }
}

/// Periodic driver for probing and scoring
pub struct ScanScheduler {
    worker: Worker,
    store: Arc<dyn Store>,
    settings: SchedulerSettings,
}

impl ScanScheduler {
    pub fn new(
        registry: Arc<RouteRegistry>,
        budget: Arc<BudgetTracker>,
        probe: Arc<dyn ProbeClient>,
        engine: Arc<ReliabilityEngine>,
        alerts: Arc<dyn AlertSink>,
        store: Arc<dyn Store>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            worker: Worker {
                registry,
                budget,
                probe,
                engine,
                alerts,
            },
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Run one scheduling tick at `now`
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let budget = &self.worker.budget;
        budget.rollover(now);

        let leases = self.worker.registry.due_routes(now);
        let windows = self.settings.date_windows(now.date_naive());
        let cost = windows.len() as u64;
        let mut report = TickReport {
            due: leases.len(),
            ..TickReport::default()
        };

        let permits = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut jobs = JoinSet::new();
        let mut ledgers = Vec::new();

        for lease in leases {
            let granted = budget.reserve(cost);
            if granted < cost {
                budget.release(granted);
                report.skipped_budget += 1;
                debug!("Budget exhausted, skipping {}", lease.code());
                continue;
            }

            let ledger = Arc::new(JobLedger::new(lease.code().clone(), cost));
            ledgers.push(ledger.clone());
            report.dispatched += 1;

            let worker = self.worker.clone();
            let permits = permits.clone();
            let windows = windows.clone();
            jobs.spawn(async move {
                // Semaphore is never closed
                let _permit = permits.acquire_owned().await.ok();
                let done = ledger.clone();
                let outcome = worker.run(lease, windows, ledger, now).await;
                done.done.store(true, Ordering::Release);
                outcome
            });
        }

        if report.skipped_budget > 0 {
            info!(
                "Budget exhausted: skipped {} route(s) ({} of {} used)",
                report.skipped_budget,
                budget.consumed(),
                budget.soft_ceiling()
            );
        }

        let deadline = tokio::time::Instant::now() + self.settings.tick_deadline;
        loop {
            match tokio::time::timeout_at(deadline, jobs.join_next()).await {
                Ok(Some(Ok(outcome))) => report.absorb(outcome),
                Ok(Some(Err(e))) => warn!("Probe job aborted: {}", e),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Tick deadline of {:?} reached with {} job(s) outstanding",
                        self.settings.tick_deadline,
                        jobs.len()
                    );
                    jobs.abort_all();
                    while let Some(joined) = jobs.join_next().await {
                        if let Ok(outcome) = joined {
                            report.absorb(outcome);
                        }
                    }
                    break;
                }
            }
        }

        // Anything that did not finish counts as a failure; unfired calls go back
        for ledger in ledgers.iter().filter(|l| !l.done.load(Ordering::Acquire)) {
            let returned = ledger.settle(budget);
            report.cancelled += 1;
            report.failed += 1;
            report.probe_calls += ledger.fired.load(Ordering::Acquire);
            debug!("Cancelled {} ({} unfired call(s) returned)", ledger.code, returned);
            if let Err(e) = self.worker.registry.record_failure(&ledger.code, now).await {
                warn!("Failed to record failure of {}: {:#}", ledger.code, e);
            }
        }

        if let Err(e) = self.store.save_budget(&budget.snapshot()).await {
            warn!("Failed to persist budget: {:#}", e);
        }

        Ok(report)
    }

    /// Tick until a shutdown signal arrives
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Scheduler started (tick: {:?}, workers: {}, deadline: {:?})",
            self.settings.tick_interval, self.settings.concurrency, self.settings.tick_deadline
        );

        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if report.due > 0 => info!("Tick: {}", report),
                        Ok(_) => debug!("Tick: nothing due"),
                        Err(e) => error!("Tick failed: {:#}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Scheduler shutting down");
                    break;
                }
            }
        }
    }
}
