//! Core domain model and status derivation for sitepulse.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "sitepulse-core";

/// Wire format of a source's raw payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    /// Spreadsheet CSV export, first row is the header.
    #[default]
    Csv,
    /// Sheets API `values` response: `{"values": [[...], ...]}`.
    SheetValuesJson,
}

/// Immutable descriptor of one remote spreadsheet source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub source_id: String,
    pub display_name: String,
    pub url: String,
    #[serde(default)]
    pub format: PayloadFormat,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Source {
    pub fn new(
        source_id: impl Into<String>,
        display_name: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            display_name: display_name.into(),
            url: url.into(),
            format: PayloadFormat::Csv,
            enabled: true,
        }
    }

    pub fn with_format(mut self, format: PayloadFormat) -> Self {
        self.format = format;
        self
    }
}

/// One row of work as parsed from a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub site_id: String,
    pub package_id: String,
    pub district: String,
    pub source_id: String,
    pub task_name: String,
    pub planned_start: Option<NaiveDate>,
    pub planned_finish: Option<NaiveDate>,
    pub actual_start: Option<NaiveDate>,
    pub actual_finish: Option<NaiveDate>,
    pub last_updated: Option<DateTime<Utc>>,
    pub weight: f64,
    /// Columns without a dedicated field, keyed by normalized header.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl TaskRecord {
    pub fn new(task_id: impl Into<String>, site_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            site_id: site_id.into(),
            package_id: String::new(),
            district: String::new(),
            source_id: String::new(),
            task_name: String::new(),
            planned_start: None,
            planned_finish: None,
            actual_start: None,
            actual_finish: None,
            last_updated: None,
            weight: 0.0,
            extra: BTreeMap::new(),
        }
    }

    pub fn has_site(&self) -> bool {
        !self.site_id.trim().is_empty()
    }
}

/// Lifecycle state derived from a task's dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivedStatus {
    Completed,
    /// Started, planned finish already passed.
    InProgressLate,
    InProgress,
    /// Not started, planned start already passed.
    NotStartedLate,
    NotStarted,
}

impl DerivedStatus {
    pub const ALL: [DerivedStatus; 5] = [
        DerivedStatus::Completed,
        DerivedStatus::InProgressLate,
        DerivedStatus::InProgress,
        DerivedStatus::NotStartedLate,
        DerivedStatus::NotStarted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DerivedStatus::Completed => "completed",
            DerivedStatus::InProgressLate => "in_progress_late",
            DerivedStatus::InProgress => "in_progress",
            DerivedStatus::NotStartedLate => "not_started_late",
            DerivedStatus::NotStarted => "not_started",
        }
    }

    pub fn is_late(self) -> bool {
        matches!(self, DerivedStatus::InProgressLate | DerivedStatus::NotStartedLate)
    }

    pub fn is_started(self) -> bool {
        !matches!(self, DerivedStatus::NotStarted | DerivedStatus::NotStartedLate)
    }
}

/// Derive a task's lifecycle status relative to `today`.
///
/// Total over every combination of present/absent dates; "past" means
/// strictly before `today`.
pub fn derive_status(task: &TaskRecord, today: NaiveDate) -> DerivedStatus {
    let in_past = |date: Option<NaiveDate>| date.is_some_and(|d| d < today);

    if task.actual_finish.is_some() {
        DerivedStatus::Completed
    } else if task.actual_start.is_some() {
        if in_past(task.planned_finish) {
            DerivedStatus::InProgressLate
        } else {
            DerivedStatus::InProgress
        }
    } else if in_past(task.planned_start) {
        DerivedStatus::NotStartedLate
    } else {
        DerivedStatus::NotStarted
    }
}

/// Externally visible task shape: the record plus its derived status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskWithStatus {
    #[serde(flatten)]
    pub task: TaskRecord,
    pub status: DerivedStatus,
}

impl TaskWithStatus {
    pub fn derive(task: TaskRecord, today: NaiveDate) -> Self {
        let status = derive_status(&task, today);
        Self { task, status }
    }
}

/// Per-status task counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub completed: usize,
    pub in_progress_late: usize,
    pub in_progress: usize,
    pub not_started_late: usize,
    pub not_started: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: DerivedStatus) {
        match status {
            DerivedStatus::Completed => self.completed += 1,
            DerivedStatus::InProgressLate => self.in_progress_late += 1,
            DerivedStatus::InProgress => self.in_progress += 1,
            DerivedStatus::NotStartedLate => self.not_started_late += 1,
            DerivedStatus::NotStarted => self.not_started += 1,
        }
    }

    pub fn get(&self, status: DerivedStatus) -> usize {
        match status {
            DerivedStatus::Completed => self.completed,
            DerivedStatus::InProgressLate => self.in_progress_late,
            DerivedStatus::InProgress => self.in_progress,
            DerivedStatus::NotStartedLate => self.not_started_late,
            DerivedStatus::NotStarted => self.not_started,
        }
    }

    pub fn late(&self) -> usize {
        self.in_progress_late + self.not_started_late
    }

    pub fn total(&self) -> usize {
        DerivedStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

/// Summary row for one site, rebuilt from the task list on every ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteAggregate {
    pub site_id: String,
    pub package_id: String,
    pub district: String,
    pub task_count: usize,
    pub status_counts: StatusCounts,
    pub total_weight: f64,
    pub completed_weight: f64,
    /// Completed weight over total weight, 0 when the site carries no weight.
    pub progress: f64,
    pub late_tasks: usize,
    /// True when no task of the site is late.
    pub compliant: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Compliance summary for one package, derived from its sites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageCompliance {
    pub package_id: String,
    pub site_count: usize,
    pub compliant_sites: usize,
    pub task_count: usize,
    pub completed_tasks: usize,
    pub late_tasks: usize,
    pub compliance_rate: f64,
    pub mean_progress: f64,
}

pub type PackageComplianceMap = BTreeMap<String, PackageCompliance>;

/// How one source fared during an ingestion run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SourceReport {
    Loaded {
        source_id: String,
        records: usize,
        skipped_rows: usize,
    },
    Failed {
        source_id: String,
        reason: String,
    },
}

impl SourceReport {
    pub fn source_id(&self) -> &str {
        match self {
            SourceReport::Loaded { source_id, .. } | SourceReport::Failed { source_id, .. } => {
                source_id
            }
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SourceReport::Failed { .. })
    }
}

/// Atomically published ingestion result. Every aggregate was computed from
/// this snapshot's own `tasks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestedSnapshot {
    pub tasks: Vec<TaskWithStatus>,
    pub sites: Vec<SiteAggregate>,
    pub package_compliance: PackageComplianceMap,
    pub last_refresh: DateTime<Utc>,
    #[serde(default)]
    pub source_reports: Vec<SourceReport>,
}

impl IngestedSnapshot {
    pub fn tasks_for_site<'a>(&'a self, site_id: &'a str) -> impl Iterator<Item = &'a TaskWithStatus> {
        self.tasks.iter().filter(move |t| t.task.site_id == site_id)
    }

    pub fn site(&self, site_id: &str) -> Option<&SiteAggregate> {
        self.sites.iter().find(|s| s.site_id == site_id)
    }
}
