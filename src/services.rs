use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::chart::project;
use crate::config::AppConfig;
use crate::error::Result;
use crate::normalize::{parse_upload, preview, secure_file_name};
use crate::store::RunStore;
use crate::types::{ChartSet, TitlesResponse, UploadResponse};

pub(crate) const UPLOAD_OK_MESSAGE: &str = "File uploaded successfully";
pub(crate) const NO_DATA_MESSAGE: &str = "No data available";
pub(crate) const NO_DATABASE_MESSAGE: &str = "No database found";

/// Shared state for every request handler.
#[derive(Debug, Clone)]
pub(crate) struct AppState {
    pub(crate) config: AppConfig,
    pub(crate) store: RunStore,
}

impl AppState {
    pub(crate) fn new(config: AppConfig) -> Self {
        let store = RunStore::new(config.db_path.clone());
        Self { config, store }
    }
}

// ── Upload ──────────────────────────────────────────────────────────────

/// Parse, segment and persist one upload, then keep a copy of the raw file.
///
/// Nothing is written anywhere unless the upload parses and carries a label column.
pub(crate) fn process_upload(
    state: &AppState,
    file_name: &str,
    bytes: &[u8],
) -> Result<UploadResponse> {
    let digest = blake3::hash(bytes);
    let table = parse_upload(bytes, &state.config.upload_limits())?;
    let preview = preview(&table, state.config.preview_row_count);
    tracing::info!(
        file = file_name,
        bytes = bytes.len(),
        rows = table.len(),
        columns = table.columns.len(),
        digest = %digest.to_hex(),
        "upload parsed"
    );

    let report = state.store.ingest(table, state.config.ingestion_policy)?;

    match store_raw_upload(&state.config.upload_dir, file_name, &digest, bytes) {
        Ok(path) => tracing::debug!(path = %path.display(), "raw upload saved"),
        // Rows are committed at this point; the archive copy is best-effort.
        Err(err) => tracing::warn!(error = %err, file = file_name, "could not save raw upload"),
    }

    Ok(UploadResponse {
        message: UPLOAD_OK_MESSAGE.to_string(),
        preview,
        report: Some(report),
    })
}

/// Write the raw upload as `<UTC timestamp>-<digest prefix>-<sanitized name>`.
pub(crate) fn store_raw_upload(
    upload_dir: &Path,
    file_name: &str,
    digest: &blake3::Hash,
    bytes: &[u8],
) -> std::io::Result<PathBuf> {
    fs::create_dir_all(upload_dir)?;
    let hex = digest.to_hex();
    let stamp = Utc::now().format("%Y%m%dT%H%M%S");
    let name = format!("{stamp}-{}-{}", &hex.as_str()[..12], secure_file_name(file_name));
    let path = upload_dir.join(name);
    let tmp = path.with_extension("part");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, &path)?;
    Ok(path)
}

// ── Queries ─────────────────────────────────────────────────────────────

/// Chart series for every element, or `None` when nothing is stored.
pub(crate) fn load_graphs(state: &AppState) -> Result<Option<ChartSet>> {
    let table = state.store.read_all()?;
    project(&table)
}

pub(crate) fn load_titles(state: &AppState) -> Result<TitlesResponse> {
    if !state.store.exists() {
        return Ok(TitlesResponse {
            titles: Vec::new(),
            message: Some(NO_DATABASE_MESSAGE.to_string()),
        });
    }
    Ok(TitlesResponse {
        titles: state.store.column_names()?,
        message: None,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::IngestionPolicy;
    use crate::error::IngestError;

    pub(crate) fn test_state(dir: &Path, policy: IngestionPolicy) -> AppState {
        let mut config = AppConfig::default();
        config.db_path = dir.join("db").join("runs.sqlite");
        config.upload_dir = dir.join("uploads");
        config.ingestion_policy = policy;
        AppState::new(config)
    }

    const CSV: &str = "Solution Label,Rack:Tube,Timestamp,Na,K\n\
        Blank,1:1,2024-01-01 08:00:00,0.0,0.0\n\
        QC_MES_5 ppm,1:2,2024-01-01 09:00:00,5.0,5.1\n\
        S1,1:3,2024-01-01 09:10:00,1.0,2.0\n\
        QC_MES_5 ppm,1:4,2024-01-01 10:00:00,4.9,5.0\n";

    #[test]
    fn upload_then_query() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), IngestionPolicy::Replace);

        let response = process_upload(&state, "run 1.csv", CSV.as_bytes()).unwrap();
        assert_eq!(response.message, UPLOAD_OK_MESSAGE);
        assert_eq!(response.preview.len(), 4);
        let report = response.report.unwrap();
        assert_eq!(report.rows_dropped, 1);
        assert_eq!(report.last_run, Some(2));

        let titles = load_titles(&state).unwrap();
        assert_eq!(titles.titles, vec!["Na", "K"]);
        assert!(titles.message.is_none());

        let graphs = load_graphs(&state).unwrap().unwrap();
        let na = graphs.get("Na").unwrap();
        assert_eq!(na.labels, vec!["2024-01-01 09:00:00", "2024-01-01 10:00:00"]);

        let saved: Vec<_> = fs::read_dir(dir.path().join("uploads"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(saved.len(), 1);
        assert!(saved[0].ends_with("-run_1.csv"));
    }

    #[test]
    fn failed_upload_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), IngestionPolicy::Append);
        let err = process_upload(&state, "x.csv", b"Sample,Na\na,1\n").unwrap_err();
        assert!(matches!(err, IngestError::SchemaMismatch { .. }));
        assert!(!dir.path().join("uploads").exists());
        assert!(!state.store.exists());
    }

    #[test]
    fn queries_on_fresh_install() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), IngestionPolicy::Append);
        assert!(load_graphs(&state).unwrap().is_none());
        let titles = load_titles(&state).unwrap();
        assert!(titles.titles.is_empty());
        assert_eq!(titles.message.as_deref(), Some(NO_DATABASE_MESSAGE));
    }
}
