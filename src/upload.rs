//! Batch-file ingress adapter for `POST /api/v1/trades/upload` (spec.md §6):
//! parses CSV, JSON, JSONL, or XLSX into a flat list of row-level capture
//! bodies. Grounded in the teacher's `csv_io` module (load-rows-into-typed-
//! structs, row-by-row error reporting rather than aborting the whole
//! batch) generalized from the matching engine's fixed order schema to the
//! upload endpoint's generic trade-row shape.

use bytes::Bytes;
use serde::Deserialize;

use crate::api::dto::CaptureRequestBody;
use crate::error::PstppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFormat {
    Csv,
    Json,
    Jsonl,
    Xlsx,
}

impl UploadFormat {
    /// Dispatch on file extension, the same sniff the teacher's own
    /// `csv_io` loader uses (`load_orders` picks a reader by path suffix).
    pub fn from_filename(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".csv") {
            Some(Self::Csv)
        } else if lower.ends_with(".jsonl") || lower.ends_with(".ndjson") {
            Some(Self::Jsonl)
        } else if lower.ends_with(".json") {
            Some(Self::Json)
        } else if lower.ends_with(".xlsx") {
            Some(Self::Xlsx)
        } else {
            None
        }
    }
}

/// One upload row, `CaptureRequestBody`'s own field names (camelCase on the
/// wire, snake_case struct fields via the same serde rename the REST body
/// uses) since both JSON and CSV rows describe the same shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadRow {
    trade_id: String,
    account_id: String,
    book_id: String,
    security_id: String,
    #[serde(default)]
    idempotency_key: Option<String>,
    #[serde(default)]
    sequence_number: Option<u64>,
    #[serde(default)]
    booking_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    /// CSV has no nested objects; a row's payload is carried as a raw JSON
    /// string column and parsed out here. JSON/JSONL rows may supply it
    /// directly as a nested object instead (see [`parse_json_value`]).
    #[serde(default)]
    payload: Option<String>,
}

impl UploadRow {
    fn into_capture_body(self, payload: serde_json::Value) -> CaptureRequestBody {
        CaptureRequestBody {
            trade_id: self.trade_id,
            account_id: self.account_id,
            book_id: self.book_id,
            security_id: self.security_id,
            idempotency_key: self.idempotency_key,
            sequence_number: self.sequence_number,
            booking_timestamp: self.booking_timestamp,
            payload,
        }
    }
}

/// Parse `bytes` as `format`, capping at `max_rows` per spec.md §6's upload
/// limit (default 5000). Returns one `Result` per row: a row that fails to
/// parse does not abort the batch, matching the handler's per-row
/// valid/invalid accounting.
pub fn parse(
    format: UploadFormat,
    bytes: &Bytes,
    max_rows: usize,
) -> Result<Vec<Result<CaptureRequestBody, PstppError>>, PstppError> {
    let rows = match format {
        UploadFormat::Csv => parse_csv(bytes)?,
        UploadFormat::Json => parse_json(bytes)?,
        UploadFormat::Jsonl => parse_jsonl(bytes)?,
        UploadFormat::Xlsx => parse_xlsx(bytes)?,
    };
    if rows.len() > max_rows {
        return Err(PstppError::Validation(format!(
            "upload contains {} trades, exceeding the {max_rows}-row limit",
            rows.len()
        )));
    }
    Ok(rows)
}

fn csv_row_to_capture(row: UploadRow) -> Result<CaptureRequestBody, PstppError> {
    let payload = match &row.payload {
        Some(raw) if !raw.is_empty() => serde_json::from_str(raw)
            .map_err(|e| PstppError::Validation(format!("invalid payload JSON in row {}: {e}", row.trade_id)))?,
        _ => serde_json::json!({}),
    };
    Ok(row.into_capture_body(payload))
}

fn parse_csv(bytes: &Bytes) -> Result<Vec<Result<CaptureRequestBody, PstppError>>, PstppError> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(bytes.as_ref());
    let mut out = Vec::new();
    for record in reader.deserialize::<UploadRow>() {
        out.push(match record {
            Ok(row) => csv_row_to_capture(row),
            Err(e) => Err(PstppError::Validation(format!("malformed CSV row: {e}"))),
        });
    }
    Ok(out)
}

/// A JSON upload is a top-level array of objects shaped like
/// [`UploadRow`], with `payload` as a nested JSON value rather than a
/// string (unlike the CSV column of the same name).
fn parse_json(bytes: &Bytes) -> Result<Vec<Result<CaptureRequestBody, PstppError>>, PstppError> {
    let values: Vec<serde_json::Value> = serde_json::from_slice(bytes)
        .map_err(|e| PstppError::Validation(format!("invalid JSON upload: {e}")))?;
    Ok(values.into_iter().map(json_value_to_capture).collect())
}

fn parse_jsonl(bytes: &Bytes) -> Result<Vec<Result<CaptureRequestBody, PstppError>>, PstppError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| PstppError::Validation(format!("upload is not valid UTF-8: {e}")))?;
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        out.push(match serde_json::from_str::<serde_json::Value>(line) {
            Ok(value) => json_value_to_capture(value),
            Err(e) => Err(PstppError::Validation(format!("malformed JSONL line: {e}"))),
        });
    }
    Ok(out)
}

fn json_value_to_capture(value: serde_json::Value) -> Result<CaptureRequestBody, PstppError> {
    serde_json::from_value(value).map_err(|e| PstppError::Validation(format!("malformed upload row: {e}")))
}

/// XLSX rows follow the same header-named-column shape as the CSV path;
/// `calamine` hands back untyped cell values so each row is first folded
/// into a `serde_json::Value` map keyed by header, then deserialized the
/// same way a JSON upload row would be.
fn parse_xlsx(bytes: &Bytes) -> Result<Vec<Result<CaptureRequestBody, PstppError>>, PstppError> {
    use calamine::{Reader, Xlsx};
    use std::io::Cursor;

    let cursor = Cursor::new(bytes.to_vec());
    let mut workbook: Xlsx<_> = calamine::open_workbook_from_rs(cursor)
        .map_err(|e| PstppError::Validation(format!("invalid XLSX file: {e}")))?;
    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| PstppError::Validation("XLSX file has no sheets".into()))?;
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| PstppError::Validation(format!("failed to read XLSX sheet: {e}")))?;

    let mut rows_iter = range.rows();
    let headers: Vec<String> = match rows_iter.next() {
        Some(header_row) => header_row.iter().map(|c| c.to_string()).collect(),
        None => return Ok(Vec::new()),
    };

    let mut out = Vec::new();
    for row in rows_iter {
        let mut obj = serde_json::Map::new();
        for (header, cell) in headers.iter().zip(row.iter()) {
            obj.insert(header.clone(), cell_to_json(cell));
        }
        out.push(json_value_to_capture(serde_json::Value::Object(obj)));
    }
    Ok(out)
}

fn cell_to_json(cell: &calamine::Data) -> serde_json::Value {
    use calamine::Data;
    match cell {
        Data::Empty => serde_json::Value::Null,
        Data::String(s) => serde_json::Value::String(s.clone()),
        Data::Float(f) => serde_json::json!(f),
        Data::Int(i) => serde_json::json!(i),
        Data::Bool(b) => serde_json::Value::Bool(*b),
        Data::DateTime(dt) => serde_json::json!(dt.as_f64()),
        Data::DateTimeIso(s) => serde_json::Value::String(s.clone()),
        Data::DurationIso(s) => serde_json::Value::String(s.clone()),
        Data::Error(e) => serde_json::Value::String(format!("{e:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_format_by_extension() {
        assert_eq!(UploadFormat::from_filename("trades.csv"), Some(UploadFormat::Csv));
        assert_eq!(UploadFormat::from_filename("trades.JSON"), Some(UploadFormat::Json));
        assert_eq!(UploadFormat::from_filename("trades.jsonl"), Some(UploadFormat::Jsonl));
        assert_eq!(UploadFormat::from_filename("trades.xlsx"), Some(UploadFormat::Xlsx));
        assert_eq!(UploadFormat::from_filename("trades.txt"), None);
    }

    #[test]
    fn parses_csv_rows_with_embedded_payload_json() {
        let csv = "tradeId,accountId,bookId,securityId,payload\nT1,A,B,C,\"{\"\"isin\"\":\"\"US1\"\"}\"\n";
        let rows = parse_csv(&Bytes::from(csv.to_string())).unwrap();
        assert_eq!(rows.len(), 1);
        let body = rows.into_iter().next().unwrap().unwrap();
        assert_eq!(body.trade_id, "T1");
        assert_eq!(body.payload["isin"], "US1");
    }

    #[test]
    fn parses_jsonl_rows() {
        let jsonl = "{\"tradeId\":\"T1\",\"accountId\":\"A\",\"bookId\":\"B\",\"securityId\":\"C\",\"payload\":{\"isin\":\"US1\"}}\n";
        let rows = parse_jsonl(&Bytes::from(jsonl.to_string())).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_ok());
    }

    #[test]
    fn rejects_batch_over_max_rows() {
        let jsonl = "{\"tradeId\":\"T1\",\"accountId\":\"A\",\"bookId\":\"B\",\"securityId\":\"C\",\"payload\":{}}\n{\"tradeId\":\"T2\",\"accountId\":\"A\",\"bookId\":\"B\",\"securityId\":\"C\",\"payload\":{}}\n";
        let err = parse(UploadFormat::Jsonl, &Bytes::from(jsonl.to_string()), 1).unwrap_err();
        assert!(matches!(err, PstppError::Validation(_)));
    }
}
