use serde::Serialize;
use serde::ser::SerializeMap;

use crate::config::IngestionPolicy;

// ── Column names ─────────────────────────────────────────────────────────

pub(crate) const RUN_NUMBER_COLUMN: &str = "Run Number";
pub(crate) const TIMESTAMP_COLUMN: &str = "Timestamp";
pub(crate) const RACK_TUBE_COLUMN: &str = "Rack:Tube";
pub(crate) const SOLUTION_LABEL_COLUMN: &str = "Solution Label";

/// Label value of the QC row that opens a new run.
pub(crate) const QC_MARKER_LABEL: &str = "QC_MES_5 ppm";

pub(crate) const RESERVED_COLUMNS: [&str; 4] = [
    RUN_NUMBER_COLUMN,
    TIMESTAMP_COLUMN,
    RACK_TUBE_COLUMN,
    SOLUTION_LABEL_COLUMN,
];

pub(crate) fn is_reserved_column(name: &str) -> bool {
    RESERVED_COLUMNS.contains(&name)
}

// ── Table ────────────────────────────────────────────────────────────────

/// A parsed upload: header plus text cells, every row as wide as the header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Table {
    pub(crate) columns: Vec<String>,
    pub(crate) rows: Vec<Vec<String>>,
}

impl Table {
    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// ── StampedTable ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StampedRow {
    pub(crate) run_number: u64,
    pub(crate) cells: Vec<String>,
}

/// Output of run segmentation: the upload's columns (without `Run Number`) and its
/// surviving rows, each carrying a run number.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct StampedTable {
    pub(crate) columns: Vec<String>,
    pub(crate) rows: Vec<StampedRow>,
    /// Rows discarded ahead of the first QC marker.
    pub(crate) dropped_rows: usize,
}

impl StampedTable {
    pub(crate) fn first_run(&self) -> Option<u64> {
        self.rows.first().map(|r| r.run_number)
    }

    pub(crate) fn last_run(&self) -> Option<u64> {
        self.rows.last().map(|r| r.run_number)
    }
}

// ── RunTable ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StoredRow {
    pub(crate) run_number: u64,
    pub(crate) cells: Vec<Option<String>>,
}

/// The persisted table in insertion order. `columns` lists every stored column except
/// `Run Number`, which lives on each row.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct RunTable {
    pub(crate) columns: Vec<String>,
    pub(crate) rows: Vec<StoredRow>,
}

impl RunTable {
    pub(crate) fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// ── Responses ────────────────────────────────────────────────────────────

/// One preview row: column name to cell text, in header order.
pub(crate) type PreviewRow = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize)]
pub(crate) struct IngestReport {
    pub(crate) policy: IngestionPolicy,
    pub(crate) rows_received: usize,
    pub(crate) rows_dropped: usize,
    pub(crate) rows_written: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) first_run: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) last_run: Option<u64>,
    pub(crate) added_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct UploadResponse {
    pub(crate) message: String,
    pub(crate) preview: Vec<PreviewRow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) report: Option<IngestReport>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct TitlesResponse {
    pub(crate) titles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct MessageResponse {
    pub(crate) message: String,
}

impl MessageResponse {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// ── Chart output ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct Dataset {
    pub(crate) label: String,
    pub(crate) data: Vec<Option<String>>,
    #[serde(rename = "borderColor")]
    pub(crate) border_color: String,
    pub(crate) tension: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct ElementSeries {
    pub(crate) labels: Vec<String>,
    pub(crate) datasets: Vec<Dataset>,
}

/// Element name to series, kept in stored column order. Serializes as a JSON object.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct ChartSet {
    pub(crate) series: Vec<(String, ElementSeries)>,
}

#[cfg(test)]
impl ChartSet {
    pub(crate) fn get(&self, element: &str) -> Option<&ElementSeries> {
        self.series
            .iter()
            .find(|(name, _)| name == element)
            .map(|(_, s)| s)
    }

    pub(crate) fn element_names(&self) -> impl Iterator<Item = &str> {
        self.series.iter().map(|(name, _)| name.as_str())
    }
}

impl Serialize for ChartSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.series.len()))?;
        for (name, series) in &self.series {
            map.serialize_entry(name, series)?;
        }
        map.end()
    }
}
