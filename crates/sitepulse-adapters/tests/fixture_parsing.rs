use std::path::PathBuf;

use chrono::NaiveDate;
use sitepulse_adapters::parse_payload;
use sitepulse_core::{PayloadFormat, Source};

fn fixture(name: &str) -> Vec<u8> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(name);
    std::fs::read(&path).unwrap_or_else(|err| panic!("reading {}: {err}", path.display()))
}

#[test]
fn north_csv_fixture_parses_with_two_skipped_rows() {
    let source = Source::new("north-tracker", "North", "https://example.invalid/north.csv");
    let report = parse_payload(&fixture("north.csv"), &source).expect("parse north fixture");

    let ids: Vec<_> = report.records.iter().map(|r| r.task_id.as_str()).collect();
    assert_eq!(ids, vec!["N-001", "N-002", "N-003", "N-004"]);
    assert_eq!(report.skipped.len(), 2);

    let tower = &report.records[2];
    assert_eq!(tower.task_name, "Tower erection, phase 1");
    assert_eq!(
        tower.extra.get("contractor").map(String::as_str),
        Some("Northern Steel, Ltd.")
    );
    assert_eq!(tower.actual_start, None);
    assert!(report.records[0].last_updated.is_some());
}

#[test]
fn south_values_fixture_parses_day_first_and_serial_dates() {
    let source = Source::new("south-tracker", "South", "https://example.invalid/south")
        .with_format(PayloadFormat::SheetValuesJson);
    let report = parse_payload(&fixture("south_values.json"), &source).expect("parse south fixture");

    assert_eq!(report.records.len(), 4);
    assert!(report.skipped.is_empty());

    let first = &report.records[0];
    assert_eq!(first.planned_start, NaiveDate::from_ymd_opt(2026, 1, 5));
    assert_eq!(first.actual_finish, NaiveDate::from_ymd_opt(2026, 1, 29));

    let serial = &report.records[3];
    assert_eq!(serial.planned_start, NaiveDate::from_ymd_opt(2026, 3, 1));
    assert_eq!(serial.planned_finish, NaiveDate::from_ymd_opt(2026, 3, 31));
    assert_eq!(serial.weight, 2.0);
}
