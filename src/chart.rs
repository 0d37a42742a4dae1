//! Chart projection: one line series per element, one point per run.

use std::collections::HashSet;

use chrono::{DateTime, NaiveDateTime};

use crate::error::{IngestError, Result};
use crate::types::{
    ChartSet, Dataset, ElementSeries, RunTable, StoredRow, TIMESTAMP_COLUMN, is_reserved_column,
};

const LABEL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const BORDER_COLOR: &str = "rgb(75, 192, 192)";
const TENSION: f64 = 0.1;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y %H:%M:%S%.f",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%Y %H:%M",
    "%d.%m.%Y %H:%M:%S",
];

/// Parse an instrument timestamp. Zoned values keep their wall-clock time.
pub(crate) fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// First stored row of every run, in run-number order.
pub(crate) fn representative_rows(table: &RunTable) -> Vec<&StoredRow> {
    let mut seen = HashSet::new();
    let mut reps: Vec<&StoredRow> = table
        .rows
        .iter()
        .filter(|row| seen.insert(row.run_number))
        .collect();
    // Stable: ties keep insertion order, so the first row seen stays first.
    reps.sort_by_key(|r| r.run_number);
    reps
}

/// Build the chart set. `Ok(None)` means there is nothing stored to chart.
pub(crate) fn project(table: &RunTable) -> Result<Option<ChartSet>> {
    if table.is_empty() {
        return Ok(None);
    }
    let reps = representative_rows(table);
    let ts_idx = table.column_index(TIMESTAMP_COLUMN);

    let mut labels = Vec::with_capacity(reps.len());
    for rep in &reps {
        let raw = ts_idx
            .and_then(|idx| rep.cells[idx].as_deref())
            .unwrap_or("");
        let parsed = parse_timestamp(raw).ok_or_else(|| IngestError::BadTimestamp {
            run_number: rep.run_number,
            value: raw.to_string(),
        })?;
        labels.push(parsed.format(LABEL_FORMAT).to_string());
    }

    let series = table
        .columns
        .iter()
        .enumerate()
        .filter(|(_, name)| !is_reserved_column(name))
        .map(|(idx, name)| {
            let data = reps.iter().map(|rep| rep.cells[idx].clone()).collect();
            let series = ElementSeries {
                labels: labels.clone(),
                datasets: vec![Dataset {
                    label: name.clone(),
                    data,
                    border_color: BORDER_COLOR.to_string(),
                    tension: TENSION,
                }],
            };
            (name.clone(), series)
        })
        .collect();

    tracing::debug!(runs = reps.len(), "projected chart series");
    Ok(Some(ChartSet { series }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(run: u64, cells: &[Option<&str>]) -> StoredRow {
        StoredRow {
            run_number: run,
            cells: cells.iter().map(|c| c.map(str::to_string)).collect(),
        }
    }

    fn table() -> RunTable {
        RunTable {
            columns: vec![
                "Solution Label".into(),
                "Rack:Tube".into(),
                "Timestamp".into(),
                "Na".into(),
                "K".into(),
            ],
            rows: vec![
                row(1, &[Some("QC_MES_5 ppm"), Some("1:1"), Some("2024-01-01 09:00:00"), Some("5.0"), Some("1")]),
                row(1, &[Some("s"), Some("1:2"), Some("2024-01-01 09:05:00"), Some("1.2"), Some("2")]),
                row(2, &[Some("QC_MES_5 ppm"), Some("1:3"), Some("01/02/2024 10:30:00"), Some("5.1"), None]),
                row(2, &[Some("t"), Some("1:4"), Some("garbage"), Some("1.3"), Some("4")]),
            ],
        }
    }

    #[test]
    fn empty_table_is_no_data() {
        assert!(project(&RunTable::default()).unwrap().is_none());
    }

    #[test]
    fn one_point_per_run_from_first_row() {
        let set = project(&table()).unwrap().unwrap();
        let na = set.get("Na").unwrap();
        assert_eq!(na.labels, vec!["2024-01-01 09:00:00", "2024-01-02 10:30:00"]);
        assert_eq!(na.datasets.len(), 1);
        assert_eq!(na.datasets[0].label, "Na");
        assert_eq!(
            na.datasets[0].data,
            vec![Some("5.0".to_string()), Some("5.1".to_string())]
        );
        let k = set.get("K").unwrap();
        assert_eq!(k.datasets[0].data, vec![Some("1".to_string()), None]);
    }

    #[test]
    fn reserved_columns_never_charted() {
        let set = project(&table()).unwrap().unwrap();
        let names: Vec<&str> = set.element_names().collect();
        assert_eq!(names, vec!["Na", "K"]);
    }

    #[test]
    fn bad_representative_timestamp_fails_whole_projection() {
        let mut t = table();
        t.rows[2].cells[2] = Some("not a date".into());
        match project(&t) {
            Err(IngestError::BadTimestamp { run_number, value }) => {
                assert_eq!(run_number, 2);
                assert_eq!(value, "not a date");
            }
            other => panic!("expected BadTimestamp, got {other:?}"),
        }
    }

    #[test]
    fn missing_timestamp_column_is_bad_timestamp() {
        let t = RunTable {
            columns: vec!["Solution Label".into(), "Na".into()],
            rows: vec![row(1, &[Some("QC_MES_5 ppm"), Some("1")])],
        };
        assert!(matches!(
            project(&t),
            Err(IngestError::BadTimestamp { run_number: 1, .. })
        ));
    }

    #[test]
    fn representatives_follow_run_order() {
        let t = RunTable {
            columns: vec!["Timestamp".into(), "Na".into()],
            rows: vec![
                row(3, &[Some("2024-01-03 00:00:00"), Some("c")]),
                row(1, &[Some("2024-01-01 00:00:00"), Some("a")]),
                row(3, &[Some("2024-01-04 00:00:00"), Some("late")]),
            ],
        };
        let reps = representative_rows(&t);
        let runs: Vec<u64> = reps.iter().map(|r| r.run_number).collect();
        assert_eq!(runs, vec![1, 3]);
        assert_eq!(reps[1].cells[1].as_deref(), Some("c"));
    }

    #[test]
    fn timestamp_formats() {
        let expect = |raw: &str, want: &str| {
            let got = parse_timestamp(raw).unwrap().format(LABEL_FORMAT).to_string();
            assert_eq!(got, want, "parsing {raw}");
        };
        expect("2024-05-06 07:08:09", "2024-05-06 07:08:09");
        expect("2024-05-06T07:08:09.250", "2024-05-06 07:08:09");
        expect("2024-05-06T07:08:09+02:00", "2024-05-06 07:08:09");
        expect("2024-05-06 07:08", "2024-05-06 07:08:00");
        expect("05/06/2024 07:08:09", "2024-05-06 07:08:09");
        expect("05/06/2024 7:08:09 PM", "2024-05-06 19:08:09");
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("tuesday").is_none());
    }
}
