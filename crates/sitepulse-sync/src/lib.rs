//! Ingestion pipeline: parallel fetch/parse/derive per source, merge, normalize, aggregate.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sitepulse_adapters::{RecordParser, TabularParser};
use sitepulse_core::{
    DerivedStatus, IngestedSnapshot, PackageCompliance, PackageComplianceMap, SiteAggregate,
    Source, SourceReport, StatusCounts, TaskWithStatus,
};
use sitepulse_storage::{BlobCache, CachingFetcher, HttpClientConfig, HttpFetcher, SourceFetcher};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sitepulse-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<Source>,
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: SourceRegistry = serde_yaml::from_str(text)?;
        let mut seen = HashSet::new();
        for source in &registry.sources {
            if !seen.insert(source.source_id.as_str()) {
                anyhow::bail!("duplicate source_id {:?}", source.source_id);
            }
        }
        Ok(registry)
    }

    /// Enabled sources in declaration order.
    pub fn enabled(self) -> Vec<Source> {
        self.sources.into_iter().filter(|s| s.enabled).collect()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub sources_file: PathBuf,
    pub blob_cache_dir: Option<PathBuf>,
    pub blob_max_age: Option<Duration>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_parallel_sources: usize,
    pub weight_target: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sources_file: PathBuf::from("./sources.yaml"),
            blob_cache_dir: None,
            blob_max_age: None,
            user_agent: "sitepulse/0.1".to_string(),
            http_timeout_secs: 30,
            max_parallel_sources: 8,
            weight_target: 1.0,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sources_file: std::env::var("SITEPULSE_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_file),
            blob_cache_dir: std::env::var("SITEPULSE_BLOB_CACHE_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            blob_max_age: std::env::var("SITEPULSE_BLOB_MAX_AGE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs),
            user_agent: std::env::var("SITEPULSE_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("SITEPULSE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            max_parallel_sources: std::env::var("SITEPULSE_MAX_PARALLEL_SOURCES")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_parallel_sources),
            weight_target: std::env::var("SITEPULSE_WEIGHT_TARGET")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|t: &f64| t.is_finite() && *t > 0.0)
                .unwrap_or(defaults.weight_target),
        }
    }
}

/// Time source for status derivation and the snapshot stamp.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Rescales task weights per site.
pub trait WeightNormalizer: Send + Sync {
    fn normalize(&self, tasks: &mut [TaskWithStatus]);
}

/// Every site's weights sum to `target`. A site whose weights are all zero
/// splits `target` evenly. Tasks without a site keep their weight.
#[derive(Debug, Clone, Copy)]
pub struct SumToTarget {
    pub target: f64,
}

impl Default for SumToTarget {
    fn default() -> Self {
        Self { target: 1.0 }
    }
}

impl WeightNormalizer for SumToTarget {
    fn normalize(&self, tasks: &mut [TaskWithStatus]) {
        let mut totals: HashMap<String, (f64, usize)> = HashMap::new();
        for item in tasks.iter().filter(|t| t.task.has_site()) {
            let entry = totals.entry(item.task.site_id.clone()).or_default();
            entry.0 += item.task.weight;
            entry.1 += 1;
        }

        for item in tasks.iter_mut().filter(|t| t.task.has_site()) {
            let Some(&(total, count)) = totals.get(&item.task.site_id) else {
                continue;
            };
            item.task.weight = if total > 0.0 {
                item.task.weight / total * self.target
            } else {
                self.target / count as f64
            };
        }
    }
}

/// Leaves weights exactly as parsed.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepWeights;

impl WeightNormalizer for KeepWeights {
    fn normalize(&self, _tasks: &mut [TaskWithStatus]) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub source_id: String,
    pub reason: String,
}

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source_id, self.reason)
    }
}

#[derive(Debug, Clone, Error)]
pub enum IngestionError {
    #[error("no enabled sources configured")]
    NoSources,
    #[error("all {} sources failed ({})", .failures.len(), join_failures(.failures))]
    AllSourcesFailed { failures: Vec<SourceFailure> },
}

fn join_failures(failures: &[SourceFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Produces snapshots on demand; the cache only talks to this seam.
#[async_trait]
pub trait Ingestor: Send + Sync {
    async fn ingest_all(&self) -> Result<IngestedSnapshot, IngestionError>;

    /// Drop locally cached source payloads so the next run refetches them.
    async fn invalidate(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Result of the fetch → parse → derive unit for one source.
#[derive(Debug, Clone)]
pub enum SourceOutcome {
    Loaded {
        source_id: String,
        tasks: Vec<TaskWithStatus>,
        skipped_rows: usize,
    },
    Failed {
        source_id: String,
        reason: String,
    },
}

impl SourceOutcome {
    fn report(&self) -> SourceReport {
        match self {
            SourceOutcome::Loaded {
                source_id,
                tasks,
                skipped_rows,
            } => SourceReport::Loaded {
                source_id: source_id.clone(),
                records: tasks.len(),
                skipped_rows: *skipped_rows,
            },
            SourceOutcome::Failed { source_id, reason } => SourceReport::Failed {
                source_id: source_id.clone(),
                reason: reason.clone(),
            },
        }
    }
}

pub struct IngestionPipeline {
    sources: Vec<Source>,
    fetcher: Arc<dyn SourceFetcher>,
    parser: Arc<dyn RecordParser>,
    normalizer: Box<dyn WeightNormalizer>,
    clock: Arc<dyn Clock>,
    max_parallel_sources: usize,
}

impl IngestionPipeline {
    pub fn new(sources: Vec<Source>, fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self {
            sources: sources.into_iter().filter(|s| s.enabled).collect(),
            fetcher,
            parser: Arc::new(TabularParser),
            normalizer: Box::<SumToTarget>::default(),
            clock: Arc::new(SystemClock),
            max_parallel_sources: SyncConfig::default().max_parallel_sources,
        }
    }

    /// Wire the HTTP fetcher (behind the blob cache when configured) and the
    /// source registry from `config`.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.sources_file).await?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            global_concurrency: config.max_parallel_sources,
            ..Default::default()
        })?;
        let fetcher: Arc<dyn SourceFetcher> = match &config.blob_cache_dir {
            Some(dir) => {
                let blobs = BlobCache::new(dir.clone()).with_max_age(config.blob_max_age);
                Arc::new(CachingFetcher::new(http, blobs))
            }
            None => Arc::new(http),
        };

        Ok(Self::new(registry.enabled(), fetcher)
            .with_normalizer(Box::new(SumToTarget {
                target: config.weight_target,
            }))
            .with_max_parallel_sources(config.max_parallel_sources))
    }

    pub fn with_parser(mut self, parser: Arc<dyn RecordParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_normalizer(mut self, normalizer: Box<dyn WeightNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_max_parallel_sources(mut self, limit: usize) -> Self {
        self.max_parallel_sources = limit.max(1);
        self
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub async fn run_once(&self) -> Result<IngestedSnapshot, IngestionError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_all", %run_id, sources = self.sources.len());
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> Result<IngestedSnapshot, IngestionError> {
        if self.sources.is_empty() {
            return Err(IngestionError::NoSources);
        }

        let started = Instant::now();
        let today = self.clock.now().date_naive();
        let limit = Arc::new(Semaphore::new(self.max_parallel_sources));

        let mut handles = Vec::with_capacity(self.sources.len());
        for source in self.sources.iter().cloned() {
            let fetcher = Arc::clone(&self.fetcher);
            let parser = Arc::clone(&self.parser);
            let limit = Arc::clone(&limit);
            let source_id = source.source_id.clone();
            let span = info_span!("ingest_source", source_id = %source.source_id);
            let handle = tokio::spawn(
                async move {
                    let _permit = limit.acquire_owned().await.ok();
                    load_source(fetcher.as_ref(), parser.as_ref(), &source, today).await
                }
                .instrument(span),
            );
            handles.push((source_id, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (source_id, handle) in handles {
            let outcome = handle.await.unwrap_or_else(|err| SourceOutcome::Failed {
                source_id,
                reason: format!("source task aborted: {err}"),
            });
            outcomes.push(outcome);
        }

        let snapshot = assemble_snapshot(outcomes, self.normalizer.as_ref(), self.clock.now())?;
        info!(
            tasks = snapshot.tasks.len(),
            sites = snapshot.sites.len(),
            packages = snapshot.package_compliance.len(),
            failed_sources = snapshot.source_reports.iter().filter(|r| r.is_failed()).count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ingestion complete"
        );
        Ok(snapshot)
    }
}

#[async_trait]
impl Ingestor for IngestionPipeline {
    async fn ingest_all(&self) -> Result<IngestedSnapshot, IngestionError> {
        self.run_once().await
    }

    async fn invalidate(&self) -> Result<usize> {
        let removed = self.fetcher.invalidate().await?;
        info!(removed, "invalidated cached source payloads");
        Ok(removed)
    }
}

/// One source's isolated unit of work. Never returns an error: failures are
/// folded into [`SourceOutcome::Failed`].
pub async fn load_source(
    fetcher: &dyn SourceFetcher,
    parser: &dyn RecordParser,
    source: &Source,
    today: NaiveDate,
) -> SourceOutcome {
    let raw = match fetcher.fetch(source).await {
        Ok(raw) => raw,
        Err(err) => {
            warn!(source_id = %source.source_id, error = %err, "source fetch failed");
            return SourceOutcome::Failed {
                source_id: source.source_id.clone(),
                reason: err.to_string(),
            };
        }
    };

    match parser.parse(&raw, source) {
        Ok(report) => {
            if !report.skipped.is_empty() {
                warn!(
                    source_id = %source.source_id,
                    skipped = report.skipped.len(),
                    first = %report.skipped[0],
                    "skipped malformed rows"
                );
            }
            SourceOutcome::Loaded {
                source_id: source.source_id.clone(),
                skipped_rows: report.skipped.len(),
                tasks: report
                    .records
                    .into_iter()
                    .map(|record| TaskWithStatus::derive(record, today))
                    .collect(),
            }
        }
        Err(err) => {
            warn!(source_id = %source.source_id, error = %err, "source payload rejected");
            SourceOutcome::Failed {
                source_id: source.source_id.clone(),
                reason: err.to_string(),
            }
        }
    }
}

/// Fold per-source outcomes (in declaration order) into one consistent snapshot.
pub fn assemble_snapshot(
    outcomes: Vec<SourceOutcome>,
    normalizer: &dyn WeightNormalizer,
    completed_at: DateTime<Utc>,
) -> Result<IngestedSnapshot, IngestionError> {
    if outcomes.is_empty() {
        return Err(IngestionError::NoSources);
    }

    let source_reports: Vec<SourceReport> = outcomes.iter().map(SourceOutcome::report).collect();
    let failures: Vec<SourceFailure> = outcomes
        .iter()
        .filter_map(|o| match o {
            SourceOutcome::Failed { source_id, reason } => Some(SourceFailure {
                source_id: source_id.clone(),
                reason: reason.clone(),
            }),
            SourceOutcome::Loaded { .. } => None,
        })
        .collect();
    if failures.len() == outcomes.len() {
        return Err(IngestionError::AllSourcesFailed { failures });
    }

    let merged: Vec<TaskWithStatus> = outcomes
        .into_iter()
        .flat_map(|o| match o {
            SourceOutcome::Loaded { tasks, .. } => tasks,
            SourceOutcome::Failed { .. } => Vec::new(),
        })
        .collect();

    let (mut tasks, duplicates) = dedupe_by_task_id(merged);
    if duplicates > 0 {
        debug!(duplicates, "discarded duplicate task ids");
    }
    normalizer.normalize(&mut tasks);

    let sites = build_site_aggregates(&tasks);
    let package_compliance = build_package_compliance(&sites);

    Ok(IngestedSnapshot {
        tasks,
        sites,
        package_compliance,
        last_refresh: completed_at,
        source_reports,
    })
}

/// Keep the first occurrence of every task id. Returns the survivors and how
/// many later duplicates were dropped.
pub fn dedupe_by_task_id(tasks: Vec<TaskWithStatus>) -> (Vec<TaskWithStatus>, usize) {
    let mut seen = HashSet::with_capacity(tasks.len());
    let mut dropped = 0usize;
    let kept = tasks
        .into_iter()
        .filter(|t| {
            let fresh = seen.insert(t.task.task_id.clone());
            if !fresh {
                dropped += 1;
            }
            fresh
        })
        .collect();
    (kept, dropped)
}

/// Group tasks by site id, in first-seen order. Tasks without a site are not
/// aggregated.
pub fn build_site_aggregates(tasks: &[TaskWithStatus]) -> Vec<SiteAggregate> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut sites: Vec<SiteAggregate> = Vec::new();

    for item in tasks.iter().filter(|t| t.task.has_site()) {
        let task = &item.task;
        let slot = *index.entry(task.site_id.as_str()).or_insert_with(|| {
            sites.push(SiteAggregate {
                site_id: task.site_id.clone(),
                package_id: String::new(),
                district: String::new(),
                task_count: 0,
                status_counts: StatusCounts::default(),
                total_weight: 0.0,
                completed_weight: 0.0,
                progress: 0.0,
                late_tasks: 0,
                compliant: true,
                last_updated: None,
            });
            sites.len() - 1
        });

        let site = &mut sites[slot];
        if site.package_id.is_empty() && !task.package_id.is_empty() {
            site.package_id = task.package_id.clone();
        }
        if site.district.is_empty() && !task.district.is_empty() {
            site.district = task.district.clone();
        }
        site.task_count += 1;
        site.status_counts.record(item.status);
        site.total_weight += task.weight;
        if item.status == DerivedStatus::Completed {
            site.completed_weight += task.weight;
        }
        site.last_updated = site.last_updated.max(task.last_updated);
    }

    for site in &mut sites {
        site.progress = if site.total_weight > 0.0 {
            site.completed_weight / site.total_weight
        } else {
            0.0
        };
        site.late_tasks = site.status_counts.late();
        site.compliant = site.late_tasks == 0;
    }
    sites
}

/// Summarize sites per package. Sites with no package are left out.
pub fn build_package_compliance(sites: &[SiteAggregate]) -> PackageComplianceMap {
    let mut map = PackageComplianceMap::new();
    let mut progress_sums: HashMap<&str, f64> = HashMap::new();

    for site in sites.iter().filter(|s| !s.package_id.is_empty()) {
        let entry = map
            .entry(site.package_id.clone())
            .or_insert_with(|| PackageCompliance {
                package_id: site.package_id.clone(),
                site_count: 0,
                compliant_sites: 0,
                task_count: 0,
                completed_tasks: 0,
                late_tasks: 0,
                compliance_rate: 0.0,
                mean_progress: 0.0,
            });
        entry.site_count += 1;
        if site.compliant {
            entry.compliant_sites += 1;
        }
        entry.task_count += site.task_count;
        entry.completed_tasks += site.status_counts.completed;
        entry.late_tasks += site.late_tasks;
        *progress_sums.entry(site.package_id.as_str()).or_default() += site.progress;
    }

    for (package_id, entry) in &mut map {
        let sites = entry.site_count as f64;
        entry.compliance_rate = entry.compliant_sites as f64 / sites;
        entry.mean_progress = progress_sums.get(package_id.as_str()).copied().unwrap_or(0.0) / sites;
    }
    map
}

/// Compact description of a snapshot for logs and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSummary {
    pub last_refresh: DateTime<Utc>,
    pub tasks: usize,
    pub sites: usize,
    pub packages: usize,
    pub non_compliant_sites: usize,
    pub loaded_sources: Vec<String>,
    pub failed_sources: Vec<String>,
}

impl From<&IngestedSnapshot> for SnapshotSummary {
    fn from(snapshot: &IngestedSnapshot) -> Self {
        let (failed, loaded): (Vec<_>, Vec<_>) =
            snapshot.source_reports.iter().partition(|r| r.is_failed());
        Self {
            last_refresh: snapshot.last_refresh,
            tasks: snapshot.tasks.len(),
            sites: snapshot.sites.len(),
            packages: snapshot.package_compliance.len(),
            non_compliant_sites: snapshot.sites.iter().filter(|s| !s.compliant).count(),
            loaded_sources: loaded.iter().map(|r| r.source_id().to_string()).collect(),
            failed_sources: failed.iter().map(|r| r.source_id().to_string()).collect(),
        }
    }
}

pub async fn ingest_once_from_env() -> Result<SnapshotSummary> {
    let config = SyncConfig::from_env();
    let pipeline = IngestionPipeline::from_config(&config).await?;
    let snapshot = pipeline.run_once().await?;
    Ok(SnapshotSummary::from(&snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sitepulse_core::TaskRecord;
    use sitepulse_storage::FetchError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves canned payloads by source id; unknown ids fail like a dead host.
    #[derive(Default)]
    struct StaticFetcher {
        payloads: HashMap<String, (String, Duration)>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl StaticFetcher {
        fn with(mut self, source_id: &str, csv: &str) -> Self {
            self.payloads
                .insert(source_id.to_string(), (csv.to_string(), Duration::ZERO));
            self
        }

        fn with_delay(mut self, source_id: &str, csv: &str, delay: Duration) -> Self {
            self.payloads
                .insert(source_id.to_string(), (csv.to_string(), delay));
            self
        }
    }

    #[async_trait]
    impl SourceFetcher for StaticFetcher {
        async fn fetch(&self, source: &Source) -> Result<Vec<u8>, FetchError> {
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            let result = match self.payloads.get(&source.source_id) {
                Some((body, delay)) => {
                    tokio::time::sleep(*delay).await;
                    Ok(body.clone().into_bytes())
                }
                None => Err(FetchError::HttpStatus {
                    status: 502,
                    url: source.url.clone(),
                }),
            };
            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn source(id: &str) -> Source {
        Source::new(id, id.to_uppercase(), format!("https://sheets.example.invalid/{id}.csv"))
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock(
            Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().unwrap(),
        ))
    }

    fn pipeline(sources: &[&str], fetcher: StaticFetcher) -> IngestionPipeline {
        IngestionPipeline::new(sources.iter().map(|s| source(s)).collect(), Arc::new(fetcher))
            .with_clock(clock())
    }

    fn task(id: &str, site: &str, weight: f64, status: DerivedStatus) -> TaskWithStatus {
        let mut record = TaskRecord::new(id, site);
        record.weight = weight;
        TaskWithStatus { task: record, status }
    }

    fn site_weight_sum(snapshot: &IngestedSnapshot, site: &str) -> f64 {
        snapshot.tasks_for_site(site).map(|t| t.task.weight).sum()
    }

    #[tokio::test]
    async fn first_source_wins_duplicates_and_weights_normalize() {
        let fetcher = StaticFetcher::default()
            .with("a", "task_id,site_id,weight\nt1,s1,3\n")
            .with("b", "task_id,site_id,weight\nt1,s1,7\nt2,s1,5\n");
        let snapshot = pipeline(&["a", "b"], fetcher).run_once().await.unwrap();

        let ids: Vec<_> = snapshot.tasks.iter().map(|t| t.task.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
        assert_eq!(snapshot.tasks[0].task.source_id, "a");
        assert!((snapshot.tasks[0].task.weight - 3.0 / 8.0).abs() < 1e-9);
        assert!((snapshot.tasks[1].task.weight - 5.0 / 8.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn declaration_order_beats_completion_order() {
        let fetcher = StaticFetcher::default()
            .with_delay("slow", "task_id,site_id,task_name\nt1,s1,from slow\n", Duration::from_millis(80))
            .with("fast", "task_id,site_id,task_name\nt1,s1,from fast\n");
        let snapshot = pipeline(&["slow", "fast"], fetcher).run_once().await.unwrap();

        assert_eq!(snapshot.tasks.len(), 1);
        assert_eq!(snapshot.tasks[0].task.task_name, "from slow");
    }

    #[tokio::test]
    async fn failing_source_contributes_nothing_but_does_not_abort() {
        let fetcher = StaticFetcher::default().with("a", "task_id,site_id\nt1,s1\n");
        let snapshot = pipeline(&["a", "down"], fetcher).run_once().await.unwrap();

        assert_eq!(snapshot.tasks.len(), 1);
        assert!(matches!(
            &snapshot.source_reports[1],
            SourceReport::Failed { source_id, .. } if source_id == "down"
        ));
    }

    #[tokio::test]
    async fn rejected_payload_is_isolated_like_a_fetch_failure() {
        let fetcher = StaticFetcher::default()
            .with("a", "task_id,site_id\nt1,s1\n")
            .with("b", "site_id,weight\ns1,1\n");
        let snapshot = pipeline(&["a", "b"], fetcher).run_once().await.unwrap();

        assert_eq!(snapshot.tasks.len(), 1);
        assert!(snapshot.source_reports[1].is_failed());
    }

    #[tokio::test]
    async fn every_source_failing_is_an_ingestion_error() {
        let err = pipeline(&["x", "y"], StaticFetcher::default())
            .run_once()
            .await
            .unwrap_err();
        match err {
            IngestionError::AllSourcesFailed { failures } => {
                let ids: Vec<_> = failures.iter().map(|f| f.source_id.as_str()).collect();
                assert_eq!(ids, vec!["x", "y"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_enabled_sources_is_an_ingestion_error() {
        let mut disabled = source("a");
        disabled.enabled = false;
        let pipeline = IngestionPipeline::new(vec![disabled], Arc::new(StaticFetcher::default()));
        assert!(matches!(pipeline.run_once().await, Err(IngestionError::NoSources)));
    }

    #[tokio::test]
    async fn sources_are_fetched_concurrently_within_the_limit() {
        let body = "task_id,site_id\nt,s\n";
        let delay = Duration::from_millis(50);
        let fetcher = Arc::new(
            StaticFetcher::default()
                .with_delay("a", body, delay)
                .with_delay("b", body, delay)
                .with_delay("c", body, delay),
        );
        let sources = vec![source("a"), source("b"), source("c")];

        IngestionPipeline::new(sources.clone(), fetcher.clone())
            .run_once()
            .await
            .unwrap();
        assert_eq!(fetcher.max_active.load(Ordering::SeqCst), 3);

        fetcher.max_active.store(0, Ordering::SeqCst);
        IngestionPipeline::new(sources, fetcher.clone())
            .with_max_parallel_sources(2)
            .run_once()
            .await
            .unwrap();
        assert!(fetcher.max_active.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn statuses_are_derived_against_the_pipeline_clock() {
        let fetcher = StaticFetcher::default().with(
            "a",
            "task_id,site_id,planned_start,planned_finish,actual_start,actual_finish\n\
             done,s1,2026-01-01,2026-02-01,2026-01-02,2026-01-30\n\
             late,s1,2026-01-01,2026-03-01,2026-01-02,\n\
             waiting,s1,2026-04-01,2026-05-01,,\n",
        );
        let snapshot = pipeline(&["a"], fetcher).run_once().await.unwrap();

        let statuses: Vec<_> = snapshot.tasks.iter().map(|t| t.status).collect();
        assert_eq!(
            statuses,
            vec![
                DerivedStatus::Completed,
                DerivedStatus::InProgressLate,
                DerivedStatus::NotStarted
            ]
        );
        assert_eq!(snapshot.last_refresh, clock().now());
    }

    #[test]
    fn normalization_hits_target_per_site() {
        let mut tasks = vec![
            task("a", "s1", 2.0, DerivedStatus::NotStarted),
            task("b", "s1", 6.0, DerivedStatus::NotStarted),
            task("c", "s2", 0.5, DerivedStatus::NotStarted),
            task("d", "s3", 0.0, DerivedStatus::NotStarted),
            task("e", "s3", 0.0, DerivedStatus::NotStarted),
            task("f", "", 9.0, DerivedStatus::NotStarted),
        ];
        SumToTarget { target: 100.0 }.normalize(&mut tasks);

        let snapshot = assemble_snapshot(
            vec![SourceOutcome::Loaded {
                source_id: "x".into(),
                tasks,
                skipped_rows: 0,
            }],
            &KeepWeights,
            clock().now(),
        )
        .unwrap();
        for site in ["s1", "s2", "s3"] {
            assert!((site_weight_sum(&snapshot, site) - 100.0).abs() < 1e-9, "site {site}");
        }
        assert_eq!(snapshot.tasks[3].task.weight, 50.0);
        assert_eq!(snapshot.tasks[5].task.weight, 9.0);
    }

    #[test]
    fn site_and_package_aggregates_follow_the_task_list() {
        let mut t1 = task("t1", "s1", 0.25, DerivedStatus::Completed);
        t1.task.package_id = "P1".into();
        t1.task.district = "Harbor".into();
        let t2 = task("t2", "s1", 0.75, DerivedStatus::InProgressLate);
        let mut t3 = task("t3", "s2", 1.0, DerivedStatus::Completed);
        t3.task.package_id = "P1".into();
        let t4 = task("t4", "", 1.0, DerivedStatus::NotStarted);

        let sites = build_site_aggregates(&[t1, t2, t3, t4]);
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].site_id, "s1");
        assert_eq!(sites[0].package_id, "P1");
        assert_eq!(sites[0].district, "Harbor");
        assert_eq!(sites[0].task_count, 2);
        assert!((sites[0].progress - 0.25).abs() < 1e-9);
        assert!(!sites[0].compliant);
        assert!(sites[1].compliant);

        let packages = build_package_compliance(&sites);
        let p1 = &packages["P1"];
        assert_eq!(p1.site_count, 2);
        assert_eq!(p1.compliant_sites, 1);
        assert_eq!(p1.late_tasks, 1);
        assert_eq!(p1.completed_tasks, 2);
        assert!((p1.compliance_rate - 0.5).abs() < 1e-9);
        assert!((p1.mean_progress - 0.625).abs() < 1e-9);
    }

    #[test]
    fn dedupe_reports_dropped_count() {
        let (kept, dropped) = dedupe_by_task_id(vec![
            task("t1", "s1", 1.0, DerivedStatus::NotStarted),
            task("t1", "s2", 2.0, DerivedStatus::NotStarted),
            task("t2", "s1", 1.0, DerivedStatus::NotStarted),
            task("t1", "s3", 3.0, DerivedStatus::NotStarted),
        ]);
        assert_eq!(dropped, 2);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].task.site_id, "s1");
    }

    #[test]
    fn registry_rejects_duplicate_source_ids() {
        let yaml = "sources:\n  - {source_id: a, display_name: A, url: 'https://a'}\n  - {source_id: a, display_name: A2, url: 'https://b'}\n";
        assert!(SourceRegistry::from_yaml(yaml).is_err());
    }

    #[tokio::test]
    async fn registry_loads_and_filters_disabled_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.yaml");
        std::fs::write(
            &path,
            "sources:\n  - source_id: a\n    display_name: A\n    url: https://a\n    format: sheet_values_json\n  - source_id: b\n    display_name: B\n    url: https://b\n    enabled: false\n",
        )
        .unwrap();

        let enabled = SourceRegistry::load(&path).await.unwrap().enabled();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].format, sitepulse_core::PayloadFormat::SheetValuesJson);
    }
}
