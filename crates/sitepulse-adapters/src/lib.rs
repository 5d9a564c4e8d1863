//! Record parsing: raw tabular payloads (CSV exports, Sheets `values` JSON) into task records.

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sitepulse_core::{PayloadFormat, Source, TaskRecord};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "sitepulse-adapters";

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%d.%m.%Y",
    "%d-%b-%Y",
    "%d %b %Y",
    "%d %B %Y",
    "%b %d, %Y",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

/// Spreadsheet serial day numbers count from this epoch.
const SERIAL_EPOCH: (i32, u32, u32) = (1899, 12, 30);
/// Serial numbers outside this window are not treated as dates (1954..2119).
const SERIAL_RANGE: std::ops::RangeInclusive<f64> = 20_000.0..=80_000.0;

/// Payload-level failure: the whole source yields nothing.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("header row is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("payload is not a sheet values document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload has no header row")]
    Empty,
    #[error("header row has no {0} column")]
    MissingColumn(&'static str),
}

/// A skipped row. Absorbed by the parser, surfaced only for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("row {row}: {reason}")]
pub struct RowError {
    pub row: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseReport {
    pub source_id: String,
    pub records: Vec<TaskRecord>,
    pub skipped: Vec<RowError>,
}

pub trait RecordParser: Send + Sync {
    fn parse(&self, raw: &[u8], source: &Source) -> Result<ParseReport, ParseError>;
}

/// Header-driven parser for both supported payload formats.
#[derive(Debug, Clone, Copy, Default)]
pub struct TabularParser;

impl RecordParser for TabularParser {
    fn parse(&self, raw: &[u8], source: &Source) -> Result<ParseReport, ParseError> {
        let grid = match source.format {
            PayloadFormat::Csv => read_csv_grid(raw),
            PayloadFormat::SheetValuesJson => read_sheet_values_grid(raw)?
                .into_iter()
                .map(Ok)
                .collect(),
        };
        parse_grid(grid, &source.source_id)
    }
}

pub fn parse_payload(raw: &[u8], source: &Source) -> Result<ParseReport, ParseError> {
    TabularParser.parse(raw, source)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    TaskId,
    SiteId,
    PackageId,
    District,
    TaskName,
    PlannedStart,
    PlannedFinish,
    ActualStart,
    ActualFinish,
    LastUpdated,
    Weight,
}

fn column_for_header(header: &str) -> Option<Column> {
    let column = match header {
        "task_id" | "id" | "task" | "task_no" | "activity_id" => Column::TaskId,
        "site_id" | "site" | "site_code" => Column::SiteId,
        "package_id" | "package" | "work_package" => Column::PackageId,
        "district" | "region" => Column::District,
        "task_name" | "name" | "description" | "activity" => Column::TaskName,
        "planned_start" | "plan_start" | "baseline_start" => Column::PlannedStart,
        "planned_finish" | "planned_end" | "plan_finish" | "plan_end" | "baseline_finish" => {
            Column::PlannedFinish
        }
        "actual_start" | "started_on" => Column::ActualStart,
        "actual_finish" | "actual_end" | "completed_on" => Column::ActualFinish,
        "last_updated" | "updated_at" | "last_update" | "timestamp" => Column::LastUpdated,
        "weight" | "weightage" | "task_weight" => Column::Weight,
        _ => return None,
    };
    Some(column)
}

pub fn normalize_header(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

struct ColumnMap {
    headers: Vec<String>,
    columns: Vec<Option<Column>>,
}

impl ColumnMap {
    fn from_header_row(row: &[String]) -> Result<Self, ParseError> {
        let headers: Vec<String> = row.iter().map(|h| normalize_header(h)).collect();
        let mut columns = Vec::with_capacity(headers.len());
        for header in &headers {
            let column = column_for_header(header);
            // A repeated alias keeps its first column; later ones land in `extra`.
            let column = column.filter(|c| !columns.contains(&Some(*c)));
            columns.push(column);
        }
        if !columns.contains(&Some(Column::TaskId)) {
            return Err(ParseError::MissingColumn("task id"));
        }
        Ok(Self { headers, columns })
    }

    fn build_record(&self, row_no: usize, row: &[String], source_id: &str) -> Result<TaskRecord, RowError> {
        let row_error = |reason: String| RowError { row: row_no, reason };
        let mut record = TaskRecord::new(String::new(), String::new());
        record.source_id = source_id.to_string();

        for (idx, column) in self.columns.iter().enumerate() {
            let cell = row.get(idx).map(|c| c.trim()).unwrap_or_default();
            match column {
                Some(Column::TaskId) => record.task_id = cell.to_string(),
                Some(Column::SiteId) => record.site_id = cell.to_string(),
                Some(Column::PackageId) => record.package_id = cell.to_string(),
                Some(Column::District) => record.district = cell.to_string(),
                Some(Column::TaskName) => record.task_name = cell.to_string(),
                Some(Column::PlannedStart) => record.planned_start = parse_date(cell),
                Some(Column::PlannedFinish) => record.planned_finish = parse_date(cell),
                Some(Column::ActualStart) => record.actual_start = parse_date(cell),
                Some(Column::ActualFinish) => record.actual_finish = parse_date(cell),
                Some(Column::LastUpdated) => record.last_updated = parse_timestamp(cell),
                Some(Column::Weight) => {
                    record.weight = parse_weight(cell)
                        .ok_or_else(|| row_error(format!("weight {cell:?} is not a non-negative number")))?;
                }
                None => {
                    let header = &self.headers[idx];
                    if !header.is_empty() && !cell.is_empty() {
                        record.extra.insert(header.clone(), cell.to_string());
                    }
                }
            }
        }

        if record.task_id.is_empty() {
            return Err(row_error("missing task id".to_string()));
        }
        Ok(record)
    }
}

/// One CSV record; a row whose bytes are not UTF-8 is kept as the decode error.
pub type CsvRow = Result<Vec<String>, std::str::Utf8Error>;

fn parse_grid(grid: Vec<CsvRow>, source_id: &str) -> Result<ParseReport, ParseError> {
    let mut rows = grid
        .into_iter()
        .enumerate()
        .map(|(idx, row)| (idx + 1, row))
        .filter(|(_, row)| !matches!(row, Ok(cells) if is_blank(cells)));

    let (_, header_row) = rows.next().ok_or(ParseError::Empty)?;
    let column_map = ColumnMap::from_header_row(&header_row?)?;

    let mut records = Vec::new();
    let mut skipped = Vec::new();
    for (row_no, row) in rows {
        let built = row
            .map_err(|err| RowError {
                row: row_no,
                reason: format!("not valid UTF-8: {err}"),
            })
            .and_then(|cells| column_map.build_record(row_no, &cells, source_id));
        match built {
            Ok(record) => records.push(record),
            Err(err) => {
                debug!(source_id, row = err.row, reason = %err.reason, "skipping malformed row");
                skipped.push(err);
            }
        }
    }

    Ok(ParseReport {
        source_id: source_id.to_string(),
        records,
        skipped,
    })
}

fn is_blank(row: &[String]) -> bool {
    row.iter().all(|cell| cell.trim().is_empty())
}

const UTF8_BOM: &[u8] = b"\xef\xbb\xbf";

/// Split a CSV payload into records, then decode each record on its own.
/// Quoted cells may contain commas, newlines and doubled quotes; an
/// unterminated quote runs to end of input. Delimiters are ASCII, so
/// splitting before decoding never cuts a UTF-8 sequence.
pub fn read_csv_grid(raw: &[u8]) -> Vec<CsvRow> {
    let raw = raw.strip_prefix(UTF8_BOM).unwrap_or(raw);
    let mut rows = Vec::new();
    let mut row: Vec<Vec<u8>> = Vec::new();
    let mut field = Vec::new();
    let mut in_quotes = false;
    let mut row_started = false;
    let mut bytes = raw.iter().copied().peekable();

    while let Some(byte) = bytes.next() {
        if in_quotes {
            match byte {
                b'"' if bytes.peek() == Some(&b'"') => {
                    bytes.next();
                    field.push(b'"');
                }
                b'"' => in_quotes = false,
                _ => field.push(byte),
            }
            continue;
        }

        match byte {
            b'"' if field.is_empty() => {
                in_quotes = true;
                row_started = true;
            }
            b',' => {
                row.push(std::mem::take(&mut field));
                row_started = true;
            }
            b'\r' => {}
            b'\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
                row_started = false;
            }
            _ => {
                field.push(byte);
                row_started = true;
            }
        }
    }

    if row_started {
        row.push(field);
        rows.push(row);
    }
    rows.into_iter().map(decode_row).collect()
}

fn decode_row(cells: Vec<Vec<u8>>) -> CsvRow {
    cells
        .into_iter()
        .map(|cell| String::from_utf8(cell).map_err(|err| err.utf8_error()))
        .collect()
}

#[derive(Debug, Deserialize)]
struct SheetValues {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

fn read_sheet_values_grid(raw: &[u8]) -> Result<Vec<Vec<String>>, ParseError> {
    let doc: SheetValues = serde_json::from_slice(raw)?;
    Ok(doc
        .values
        .into_iter()
        .map(|row| row.into_iter().map(json_cell_text).collect())
        .collect())
}

fn json_cell_text(value: JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s,
        other => other.to_string(),
    }
}

/// Coerce a date cell; anything unrecognized is absent rather than an error.
pub fn parse_date(cell: &str) -> Option<NaiveDate> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }

    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(cell, fmt).ok())
        .or_else(|| DateTime::parse_from_rfc3339(cell).ok().map(|dt| dt.date_naive()))
        .or_else(|| parse_naive_datetime(cell).map(|dt| dt.date()))
        .or_else(|| parse_serial_date(cell))
}

pub fn parse_timestamp(cell: &str) -> Option<DateTime<Utc>> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(cell) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Some(naive) = parse_naive_datetime(cell) {
        return Some(Utc.from_utc_datetime(&naive));
    }
    parse_date(cell)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn parse_naive_datetime(cell: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(cell, fmt).ok())
}

fn parse_serial_date(cell: &str) -> Option<NaiveDate> {
    let serial: f64 = cell.parse().ok()?;
    if !SERIAL_RANGE.contains(&serial) {
        return None;
    }
    let (y, m, d) = SERIAL_EPOCH;
    let epoch = NaiveDate::from_ymd_opt(y, m, d)?;
    // Range-checked above, truncation drops the time-of-day fraction.
    epoch.checked_add_days(Days::new(serial.trunc() as u64))
}

/// Empty cells weigh nothing; thousands separators and a `%` suffix are tolerated.
pub fn parse_weight(cell: &str) -> Option<f64> {
    let cleaned: String = cell
        .trim()
        .trim_end_matches('%')
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return Some(0.0);
    }
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|w| w.is_finite() && *w >= 0.0)
}
