//! Run segmentation.
//!
//! A run opens at every QC marker row (`Solution Label == "QC_MES_5 ppm"`) and covers
//! the rows that follow until the next marker. Numbering continues from a seed supplied
//! by the store, so the caller decides whether an upload extends or restarts the
//! sequence.

use crate::error::{IngestError, Result};
use crate::types::{
    QC_MARKER_LABEL, RACK_TUBE_COLUMN, RUN_NUMBER_COLUMN, SOLUTION_LABEL_COLUMN, StampedRow,
    StampedTable, TIMESTAMP_COLUMN, Table,
};

/// Find the solution-label column: exact header first, then a loose match.
pub(crate) fn label_column(columns: &[String]) -> Option<usize> {
    columns
        .iter()
        .position(|c| c == SOLUTION_LABEL_COLUMN)
        .or_else(|| {
            columns.iter().position(|c| {
                let loose = c.trim().to_ascii_lowercase().replace('_', " ");
                loose == "solution label"
            })
        })
}

pub(crate) fn is_qc_marker(label: &str) -> bool {
    label.trim() == QC_MARKER_LABEL
}

/// Assign run numbers to every row of `table`, continuing after `seed`.
///
/// Rows ahead of the first marker are dropped. When the upload has no marker at all it
/// becomes a single run numbered `seed`, or 1 if nothing has been numbered yet.
pub(crate) fn stamp_runs(table: Table, seed: u64) -> Result<StampedTable> {
    let label_idx = label_column(&table.columns).ok_or_else(|| IngestError::SchemaMismatch {
        missing: SOLUTION_LABEL_COLUMN.to_string(),
    })?;

    // A stale run-number column from a previous export would collide with ours.
    let stale_idx = table
        .columns
        .iter()
        .position(|c| c.eq_ignore_ascii_case(RUN_NUMBER_COLUMN));
    let Table { mut columns, rows } = table;
    if let Some(idx) = stale_idx {
        columns.remove(idx);
    }
    let label_idx = match stale_idx {
        Some(stale) if stale < label_idx => label_idx - 1,
        _ => label_idx,
    };
    columns[label_idx] = SOLUTION_LABEL_COLUMN.to_string();
    for canonical in [TIMESTAMP_COLUMN, RACK_TUBE_COLUMN] {
        if let Some(col) = columns.iter_mut().find(|c| c.eq_ignore_ascii_case(canonical)) {
            *col = canonical.to_string();
        }
    }
    let rows: Vec<Vec<String>> = rows
        .into_iter()
        .map(|mut row| {
            if let Some(idx) = stale_idx {
                row.remove(idx);
            }
            row
        })
        .collect();

    let first_marker = rows.iter().position(|row| is_qc_marker(&row[label_idx]));

    let Some(start) = first_marker else {
        let run_number = seed.max(1);
        let rows = rows
            .into_iter()
            .map(|cells| StampedRow { run_number, cells })
            .collect();
        return Ok(StampedTable {
            columns,
            rows,
            dropped_rows: 0,
        });
    };

    let (_, stamped) = rows.into_iter().skip(start).fold(
        (seed, Vec::new()),
        |(counter, mut acc): (u64, Vec<StampedRow>), cells| {
            let counter = if is_qc_marker(&cells[label_idx]) {
                counter + 1
            } else {
                counter
            };
            acc.push(StampedRow {
                run_number: counter,
                cells,
            });
            (counter, acc)
        },
    );

    tracing::debug!(dropped = start, seed, "stamped runs");
    Ok(StampedTable {
        columns,
        rows: stamped,
        dropped_rows: start,
    })
}
