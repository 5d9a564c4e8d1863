//! Snapshot cache: guarded initialization, single-flight refresh, stale-serving
//! and a periodic auto-refresh schedule.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sitepulse_core::{
    IngestedSnapshot, PackageComplianceMap, SiteAggregate, SourceReport, TaskWithStatus,
};
use sitepulse_sync::Ingestor;
use thiserror::Error;
use tokio::sync::watch;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "sitepulse-cache";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// `None` disables the repeating schedule.
    pub refresh_interval: Option<Duration>,
    /// Takes precedence over `refresh_interval` when set.
    pub refresh_cron: Option<String>,
    pub refresh_join_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Some(Duration::from_secs(300)),
            refresh_cron: None,
            refresh_join_timeout: Duration::from_secs(30),
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            refresh_interval: match std::env::var("SITEPULSE_REFRESH_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
            {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.refresh_interval,
            },
            refresh_cron: std::env::var("SITEPULSE_REFRESH_CRON")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            refresh_join_timeout: std::env::var("SITEPULSE_REFRESH_JOIN_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.refresh_join_timeout),
        }
    }

    fn trigger(&self) -> Option<RefreshTrigger> {
        if let Some(expr) = &self.refresh_cron {
            return Some(RefreshTrigger::Cron(expr.clone()));
        }
        self.refresh_interval
            .filter(|d| !d.is_zero())
            .map(RefreshTrigger::Every)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RefreshTrigger {
    Every(Duration),
    Cron(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("service initializing, retry shortly")]
    NotInitialized,
    #[error("cache initialization failed: {0}")]
    Init(String),
    #[error("cache refresh failed with no snapshot to fall back to: {0}")]
    Refresh(String),
    #[error("timed out after {0:?} waiting for the in-flight refresh")]
    RefreshTimeout(Duration),
}

/// Conjunctive site filter; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteFilter {
    pub package_id: Option<String>,
    pub district: Option<String>,
    #[serde(default)]
    pub only_non_compliant: bool,
    pub min_progress: Option<f64>,
}

impl SiteFilter {
    pub fn matches(&self, site: &SiteAggregate) -> bool {
        if let Some(package_id) = &self.package_id {
            if &site.package_id != package_id {
                return false;
            }
        }
        if let Some(district) = &self.district {
            if !site.district.eq_ignore_ascii_case(district.trim()) {
                return false;
            }
        }
        if self.only_non_compliant && site.compliant {
            return false;
        }
        if let Some(min) = self.min_progress {
            if site.progress < min {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Uninitialized,
    Initializing,
    Ready,
    Refreshing,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub lifecycle: Lifecycle,
    pub last_refresh: Option<DateTime<Utc>>,
    pub tasks: usize,
    pub sites: usize,
    pub auto_refresh: bool,
    pub source_reports: Vec<SourceReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlightKind {
    Init,
    Refresh,
}

type FlightOutcome = Result<Arc<IngestedSnapshot>, String>;

struct Flight {
    kind: FlightKind,
    outcome: watch::Receiver<Option<FlightOutcome>>,
}

enum FlightStart {
    Ready(Arc<IngestedSnapshot>),
    Joined(watch::Receiver<Option<FlightOutcome>>),
    Started(watch::Receiver<Option<FlightOutcome>>),
}

struct Inner {
    ingestor: Arc<dyn Ingestor>,
    config: CacheConfig,
    snapshot: RwLock<Option<Arc<IngestedSnapshot>>>,
    flight: Mutex<Option<Flight>>,
    scheduler: tokio::sync::Mutex<Option<JobScheduler>>,
    auto_refresh_armed: AtomicBool,
    auto_refresh_stopped: AtomicBool,
}

impl Inner {
    fn current(&self) -> Option<Arc<IngestedSnapshot>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, snapshot: Arc<IngestedSnapshot>) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
    }

    fn flight_kind(&self) -> Option<FlightKind> {
        self.flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|f| f.kind)
    }
}

/// Cheap-to-clone handle; every clone sees the same snapshot and flight.
#[derive(Clone)]
pub struct DataCache {
    inner: Arc<Inner>,
}

impl DataCache {
    pub fn new(ingestor: Arc<dyn Ingestor>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                ingestor,
                config,
                snapshot: RwLock::new(None),
                flight: Mutex::new(None),
                scheduler: tokio::sync::Mutex::new(None),
                auto_refresh_armed: AtomicBool::new(false),
                auto_refresh_stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Load the first snapshot. Concurrent callers share one ingestion run;
    /// a failure leaves the cache uninitialized so the call can be retried.
    pub async fn initialize(&self) -> Result<(), CacheError> {
        if self.inner.current().is_none() {
            match start_flight(&self.inner, FlightKind::Init) {
                FlightStart::Ready(_) => {}
                FlightStart::Joined(rx) | FlightStart::Started(rx) => {
                    wait_for_outcome(rx).await.map_err(CacheError::Init)?;
                }
            }
        }
        arm_auto_refresh(&self.inner).await;
        Ok(())
    }

    /// Re-run ingestion, or wait a bounded time for the run already in
    /// flight. A failed run keeps serving the previous snapshot.
    pub async fn refresh(&self) -> Result<Arc<IngestedSnapshot>, CacheError> {
        match start_flight(&self.inner, FlightKind::Refresh) {
            FlightStart::Ready(snapshot) => Ok(snapshot),
            FlightStart::Started(rx) => match wait_for_outcome(rx).await {
                Ok(snapshot) => Ok(snapshot),
                Err(reason) => self.stale_or(CacheError::Refresh(reason)),
            },
            FlightStart::Joined(rx) => {
                let limit = self.inner.config.refresh_join_timeout;
                match tokio::time::timeout(limit, wait_for_outcome(rx)).await {
                    Ok(Ok(snapshot)) => Ok(snapshot),
                    Ok(Err(reason)) => self.stale_or(CacheError::Refresh(reason)),
                    Err(_) => {
                        warn!(timeout_ms = limit.as_millis() as u64, "gave up waiting for in-flight refresh");
                        self.stale_or(CacheError::RefreshTimeout(limit))
                    }
                }
            }
        }
    }

    /// Drop cached source payloads first so every source is refetched.
    pub async fn refresh_forced(&self) -> Result<Arc<IngestedSnapshot>, CacheError> {
        match self.inner.ingestor.invalidate().await {
            Ok(removed) => info!(removed, "cleared cached source payloads before refresh"),
            Err(err) => warn!(error = %err, "failed to clear cached source payloads"),
        }
        self.refresh().await
    }

    fn stale_or(&self, err: CacheError) -> Result<Arc<IngestedSnapshot>, CacheError> {
        match self.inner.current() {
            Some(snapshot) => {
                warn!(
                    error = %err,
                    last_refresh = %snapshot.last_refresh,
                    "refresh failed; serving previous snapshot"
                );
                Ok(snapshot)
            }
            None => Err(err),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.current().is_some()
    }

    pub fn get_snapshot(&self) -> Result<Arc<IngestedSnapshot>, CacheError> {
        self.inner.current().ok_or(CacheError::NotInitialized)
    }

    pub fn get_tasks(&self) -> Result<Vec<TaskWithStatus>, CacheError> {
        Ok(self.get_snapshot()?.tasks.clone())
    }

    pub fn get_tasks_by_site(&self, site_id: &str) -> Result<Vec<TaskWithStatus>, CacheError> {
        let snapshot = self.get_snapshot()?;
        Ok(snapshot.tasks_for_site(site_id).cloned().collect())
    }

    pub fn get_sites(&self) -> Result<Vec<SiteAggregate>, CacheError> {
        Ok(self.get_snapshot()?.sites.clone())
    }

    pub fn get_filtered_sites(&self, filter: &SiteFilter) -> Result<Vec<SiteAggregate>, CacheError> {
        let snapshot = self.get_snapshot()?;
        Ok(snapshot
            .sites
            .iter()
            .filter(|site| filter.matches(site))
            .cloned()
            .collect())
    }

    pub fn get_package_compliance(&self) -> Result<PackageComplianceMap, CacheError> {
        Ok(self.get_snapshot()?.package_compliance.clone())
    }

    pub fn status(&self) -> CacheStatus {
        let flight = self.inner.flight_kind();
        let snapshot = self.inner.current();
        let lifecycle = match (&snapshot, flight) {
            (None, None) => Lifecycle::Uninitialized,
            (None, Some(_)) => Lifecycle::Initializing,
            (Some(_), None) => Lifecycle::Ready,
            (Some(_), Some(_)) => Lifecycle::Refreshing,
        };
        CacheStatus {
            lifecycle,
            last_refresh: snapshot.as_ref().map(|s| s.last_refresh),
            tasks: snapshot.as_ref().map_or(0, |s| s.tasks.len()),
            sites: snapshot.as_ref().map_or(0, |s| s.sites.len()),
            auto_refresh: self.inner.auto_refresh_armed.load(Ordering::SeqCst),
            source_reports: snapshot
                .map(|s| s.source_reports.clone())
                .unwrap_or_default(),
        }
    }

    /// Cancel the periodic refresh. Idempotent, and the schedule is never
    /// re-armed afterwards.
    pub async fn stop_auto_refresh(&self) {
        self.inner.auto_refresh_stopped.store(true, Ordering::SeqCst);
        let mut slot = self.inner.scheduler.lock().await;
        if let Some(sched) = slot.take() {
            shutdown_scheduler(sched).await;
            info!("auto-refresh stopped");
        }
        self.inner.auto_refresh_armed.store(false, Ordering::SeqCst);
    }
}

/// Dropping the last handle shuts the schedule down.
impl Drop for Inner {
    fn drop(&mut self) {
        let Some(sched) = self.scheduler.get_mut().take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    shutdown_scheduler(sched).await;
                    debug!("auto-refresh stopped with its cache");
                });
            }
            Err(_) => warn!("cache dropped outside a runtime; auto-refresh ends with its runtime"),
        }
    }
}

async fn shutdown_scheduler(mut sched: JobScheduler) {
    if let Err(err) = sched.shutdown().await {
        warn!(error = %err, "auto-refresh scheduler did not shut down cleanly");
    }
}

fn start_flight(inner: &Arc<Inner>, kind: FlightKind) -> FlightStart {
    let mut slot = inner.flight.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(flight) = slot.as_ref() {
        debug!(requested = ?kind, running = ?flight.kind, "joining in-flight ingestion");
        return FlightStart::Joined(flight.outcome.clone());
    }
    if kind == FlightKind::Init {
        if let Some(snapshot) = inner.current() {
            return FlightStart::Ready(snapshot);
        }
    }

    let (tx, rx) = watch::channel(None);
    *slot = Some(Flight {
        kind,
        outcome: rx.clone(),
    });
    drop(slot);

    let span = info_span!("cache_flight", kind = ?kind);
    tokio::spawn(run_flight(Arc::clone(inner), tx).instrument(span));
    FlightStart::Started(rx)
}

/// Owns one ingestion run. Runs detached from every caller so a caller
/// that stops waiting never cancels it.
async fn run_flight(inner: Arc<Inner>, tx: watch::Sender<Option<FlightOutcome>>) {
    let started = Instant::now();
    let ingestor = Arc::clone(&inner.ingestor);
    let outcome: FlightOutcome = match tokio::spawn(async move { ingestor.ingest_all().await }).await {
        Ok(Ok(snapshot)) => Ok(Arc::new(snapshot)),
        Ok(Err(err)) => Err(err.to_string()),
        Err(err) => Err(format!("ingestion task aborted: {err}")),
    };

    match &outcome {
        Ok(snapshot) => {
            inner.publish(Arc::clone(snapshot));
            info!(
                tasks = snapshot.tasks.len(),
                sites = snapshot.sites.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "snapshot published"
            );
        }
        Err(reason) => warn!(%reason, "ingestion failed"),
    }

    *inner.flight.lock().unwrap_or_else(PoisonError::into_inner) = None;
    tx.send_replace(Some(outcome));
}

async fn wait_for_outcome(mut rx: watch::Receiver<Option<FlightOutcome>>) -> FlightOutcome {
    const LOST: &str = "ingestion ended without reporting an outcome";
    match rx.wait_for(Option::is_some).await {
        Ok(value) => (*value).clone().unwrap_or_else(|| Err(LOST.to_string())),
        Err(_) => Err(LOST.to_string()),
    }
}

async fn arm_auto_refresh(inner: &Arc<Inner>) {
    let mut slot = inner.scheduler.lock().await;
    if slot.is_some() || inner.auto_refresh_stopped.load(Ordering::SeqCst) {
        return;
    }
    let Some(trigger) = inner.config.trigger() else {
        return;
    };

    match build_scheduler(Arc::downgrade(inner), &trigger).await {
        Ok(sched) => {
            *slot = Some(sched);
            inner.auto_refresh_armed.store(true, Ordering::SeqCst);
            info!(trigger = ?trigger, "auto-refresh armed");
        }
        Err(err) => warn!(error = %err, "auto-refresh could not be armed"),
    }
}

async fn build_scheduler(cache: Weak<Inner>, trigger: &RefreshTrigger) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = match trigger {
        RefreshTrigger::Every(period) => {
            Job::new_repeated_async(*period, move |_uuid, _l| scheduled_refresh(cache.clone()))
                .with_context(|| format!("creating refresh job every {period:?}"))?
        }
        RefreshTrigger::Cron(expr) => {
            Job::new_async(expr.as_str(), move |_uuid, _l| scheduled_refresh(cache.clone()))
                .with_context(|| format!("creating refresh job for cron {expr}"))?
        }
    };
    sched.add(job).await.context("adding refresh job")?;
    sched.start().await.context("starting scheduler")?;
    Ok(sched)
}

fn scheduled_refresh(cache: Weak<Inner>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let Some(inner) = cache.upgrade() else {
            return;
        };
        let cache = DataCache { inner };
        match cache.refresh().await {
            Ok(snapshot) => debug!(last_refresh = %snapshot.last_refresh, "scheduled refresh finished"),
            Err(err) => warn!(error = %err, "scheduled refresh failed"),
        }
    })
}
