//! Upload parsing: raw CSV bytes to a [`Table`], plus the text-only preview shown to
//! the uploader. Nothing here touches the run store.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::io::Read;
use std::path::Path;

use crate::config::UploadLimits;
use crate::error::{IngestError, Result};
use crate::types::{PreviewRow, Table};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// SQLite allows 2000 columns per table; one is taken by `Run Number`.
const MAX_UPLOAD_COLUMNS: usize = 1999;

/// Names SQLite resolves to the implicit rowid unless a real column shadows them.
const ROWID_ALIASES: [&str; 3] = ["rowid", "oid", "_rowid_"];

/// Parse an upload into a table. Every cell stays text exactly as it appeared.
pub(crate) fn parse_upload(bytes: &[u8], limits: &UploadLimits) -> Result<Table> {
    let size = bytes.len() as u64;
    if size > limits.max_upload_bytes {
        return Err(IngestError::PayloadTooLarge {
            size,
            limit: limits.max_upload_bytes,
        });
    }
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(IngestError::EmptyFile);
    }
    let text = std::str::from_utf8(bytes)
        .map_err(|e| IngestError::malformed(format!("not UTF-8 text: {e}")))?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .trim(csv::Trim::Headers)
        .from_reader(text.as_bytes());

    let header = reader.headers()?.clone();
    if header.is_empty() || header.iter().all(str::is_empty) {
        return Err(IngestError::malformed("missing header row"));
    }
    if header.len() > MAX_UPLOAD_COLUMNS {
        return Err(IngestError::malformed(format!(
            "{} columns, at most {MAX_UPLOAD_COLUMNS} are supported",
            header.len()
        )));
    }
    let columns = dedup_header(header.iter());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect());
    }

    Ok(Table { columns, rows })
}

/// Blank header cells become `Unnamed: <idx>`; repeated names get `.1`, `.2`, ...
/// Names are compared case-insensitively since SQLite column names are. Rowid aliases
/// count as taken so stored rows keep their insertion order.
fn dedup_header<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen: HashSet<String> = ROWID_ALIASES.iter().map(|a| a.to_string()).collect();
    let mut out = Vec::new();
    for (idx, name) in names.enumerate() {
        let base = if name.is_empty() {
            format!("Unnamed: {idx}")
        } else {
            name.to_string()
        };
        let mut candidate = base.clone();
        let mut n = 1;
        while !seen.insert(candidate.to_ascii_lowercase()) {
            candidate = format!("{base}.{n}");
            n += 1;
        }
        out.push(candidate);
    }
    out
}

/// First `n` rows as ordered column-to-text mappings.
pub(crate) fn preview(table: &Table, n: usize) -> Vec<PreviewRow> {
    table
        .rows
        .iter()
        .take(n)
        .map(|row| {
            table
                .columns
                .iter()
                .zip(row)
                .map(|(col, cell)| (col.clone(), serde_json::Value::String(cell.clone())))
                .collect()
        })
        .collect()
}

/// Read at most `limit` bytes; anything longer is rejected rather than truncated.
pub(crate) fn read_capped<R: Read>(reader: R, limit: u64) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader
        .take(limit.saturating_add(1))
        .read_to_end(&mut buf)
        .map_err(|e| IngestError::malformed(format!("read upload: {e}")))?;
    if buf.len() as u64 > limit {
        return Err(IngestError::PayloadTooLarge {
            size: buf.len() as u64,
            limit,
        });
    }
    Ok(buf)
}

pub(crate) fn is_extension_allowed(file_name: &str, allowed: &[String]) -> bool {
    let ext = Path::new(file_name)
        .extension()
        .and_then(OsStr::to_str)
        .unwrap_or("");
    if ext.is_empty() {
        return false;
    }
    allowed
        .iter()
        .any(|a| ext.eq_ignore_ascii_case(a.trim().trim_start_matches('.')))
}

/// Reduce a client-supplied file name to a safe basename for the upload directory.
pub(crate) fn secure_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let mut out = String::with_capacity(base.len());
    for ch in base.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
            out.push(ch);
        } else if ch.is_whitespace() {
            out.push('_');
        }
    }
    let out = out.trim_start_matches('.').trim_matches('_').to_string();
    if out.is_empty() { "upload".to_string() } else { out }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> UploadLimits {
        UploadLimits::default()
    }

    #[test]
    fn parses_header_and_rows_as_text() {
        let csv = "Solution Label,Rack:Tube,Timestamp,Na\nBlank,1:1,2024-01-01 10:00:00,0.010\n";
        let table = parse_upload(csv.as_bytes(), &limits()).unwrap();
        assert_eq!(
            table.columns,
            vec!["Solution Label", "Rack:Tube", "Timestamp", "Na"]
        );
        assert_eq!(table.rows.len(), 1);
        // Trailing zero is kept; nothing is coerced to a number.
        assert_eq!(table.rows[0][3], "0.010");
    }

    #[test]
    fn header_only_file_has_no_rows() {
        let table = parse_upload(b"Solution Label,Na\n", &limits()).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.columns.len(), 2);
    }

    #[test]
    fn empty_and_whitespace_uploads_rejected() {
        assert!(matches!(
            parse_upload(b"", &limits()),
            Err(IngestError::EmptyFile)
        ));
        assert!(matches!(
            parse_upload(b" \n\r\n", &limits()),
            Err(IngestError::EmptyFile)
        ));
    }

    #[test]
    fn ragged_rows_are_malformed() {
        let csv = "a,b,c\n1,2,3\n4,5\n";
        assert!(matches!(
            parse_upload(csv.as_bytes(), &limits()),
            Err(IngestError::MalformedInput { .. })
        ));
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        assert!(matches!(
            parse_upload(b"a,b\n\xff\xfe,1\n", &limits()),
            Err(IngestError::MalformedInput { .. })
        ));
    }

    #[test]
    fn oversized_upload_rejected() {
        let small = UploadLimits {
            max_upload_bytes: 8,
        };
        assert!(matches!(
            parse_upload(b"a,b\n1,2\n3,4\n", &small),
            Err(IngestError::PayloadTooLarge { size: 12, limit: 8 })
        ));
    }

    #[test]
    fn bom_and_padded_headers_are_cleaned() {
        let csv = "\u{feff} Solution Label , Na\nx,1\n";
        let table = parse_upload(csv.as_bytes(), &limits()).unwrap();
        assert_eq!(table.columns, vec!["Solution Label", "Na"]);
    }

    #[test]
    fn duplicate_and_blank_headers_are_renamed() {
        let csv = "Na,Na,,K,NA\n1,2,3,4,5\n";
        let table = parse_upload(csv.as_bytes(), &limits()).unwrap();
        assert_eq!(table.columns, vec!["Na", "Na.1", "Unnamed: 2", "K", "NA.2"]);
    }

    #[test]
    fn rowid_aliases_are_renamed() {
        let csv = "rowid,OID,_rowid_,Na\n1,2,3,4\n";
        let table = parse_upload(csv.as_bytes(), &limits()).unwrap();
        assert_eq!(table.columns, vec!["rowid.1", "OID.1", "_rowid_.1", "Na"]);
    }

    #[test]
    fn too_many_columns_is_malformed() {
        let header = (0..=MAX_UPLOAD_COLUMNS)
            .map(|i| format!("c{i}"))
            .collect::<Vec<_>>()
            .join(",");
        let csv = format!("{header}\n");
        let err = parse_upload(csv.as_bytes(), &limits()).unwrap_err();
        assert!(matches!(err, IngestError::MalformedInput { .. }));
        assert_eq!(err.status_code(), 400);

        let header = (0..MAX_UPLOAD_COLUMNS)
            .map(|i| format!("c{i}"))
            .collect::<Vec<_>>()
            .join(",");
        let table = parse_upload(format!("{header}\n").as_bytes(), &limits()).unwrap();
        assert_eq!(table.columns.len(), MAX_UPLOAD_COLUMNS);
    }

    #[test]
    fn preview_keeps_column_order_and_bounds() {
        let mut csv = String::from("Zn,Al\n");
        for i in 0..20 {
            csv.push_str(&format!("{i},{}\n", i * 2));
        }
        let table = parse_upload(csv.as_bytes(), &limits()).unwrap();
        let rows = preview(&table, 10);
        assert_eq!(rows.len(), 10);
        let keys: Vec<&String> = rows[0].keys().collect();
        assert_eq!(keys, vec!["Zn", "Al"]);
        assert_eq!(rows[3]["Al"], serde_json::json!("6"));
    }

    #[test]
    fn read_capped_rejects_overflow() {
        assert_eq!(read_capped(&b"abcd"[..], 4).unwrap(), b"abcd");
        assert!(matches!(
            read_capped(&b"abcde"[..], 4),
            Err(IngestError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn extension_check_is_case_insensitive() {
        let allowed = vec!["csv".to_string()];
        assert!(is_extension_allowed("run.CSV", &allowed));
        assert!(is_extension_allowed("dir/run.csv", &allowed));
        assert!(!is_extension_allowed("run.txt", &allowed));
        assert!(!is_extension_allowed("csv", &allowed));
    }

    #[test]
    fn secure_file_name_strips_paths() {
        assert_eq!(secure_file_name("../../etc/passwd"), "passwd");
        assert_eq!(secure_file_name("C:\\data\\my run.csv"), "my_run.csv");
        assert_eq!(secure_file_name("..."), "upload");
        assert_eq!(secure_file_name("Na+K.csv"), "NaK.csv");
    }
}
