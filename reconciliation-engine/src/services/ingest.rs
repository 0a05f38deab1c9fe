//! Loading bank and book records from CSV, JSON or Excel files.
//!
//! Column names are matched case-insensitively against a list of aliases so
//! that typical bank exports load without a mapping file. Amounts come from
//! an `amount` column or from `debit`/`credit` columns (credit minus debit).

use crate::error::ReconError;
use crate::models::{Side, TransactionRecord};
use calamine::{open_workbook_auto, Data, Reader};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

const ID_KEYS: &[&str] = &["id", "transaction_id", "txn_id", "record_id"];
const DATE_KEYS: &[&str] = &[
    "date",
    "transaction_date",
    "txn_date",
    "value_date",
    "posting_date",
];
const AMOUNT_KEYS: &[&str] = &["amount", "transaction_amount", "value"];
const DEBIT_KEYS: &[&str] = &["debit", "debit_amount", "withdrawal", "withdrawals"];
const CREDIT_KEYS: &[&str] = &["credit", "credit_amount", "deposit", "deposits"];
const NARRATION_KEYS: &[&str] = &[
    "narration",
    "description",
    "details",
    "particulars",
    "memo",
    "narrative",
];
const REFERENCE_KEYS: &[&str] = &[
    "reference",
    "ref",
    "ref_no",
    "reference_number",
    "cheque_no",
    "check_number",
];

/// Day-first formats are tried before the US month-first one.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%d-%b-%Y", "%d %b %Y",
    "%b %d, %Y", "%m/%d/%Y",
];

/// 9999-12-31.
const MAX_EXCEL_SERIAL: f64 = 2_958_465.0;

type Row = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Csv,
    Json,
    Excel,
}

impl FileFormat {
    /// Files without an extension are read as CSV.
    fn from_path(path: &Path) -> Option<Self> {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return Some(FileFormat::Csv);
        };
        match ext.to_ascii_lowercase().as_str() {
            "csv" | "txt" => Some(FileFormat::Csv),
            "json" => Some(FileFormat::Json),
            "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => Some(FileFormat::Excel),
            _ => None,
        }
    }
}

/// Load one side's records, choosing the format from the file extension.
pub fn load_records(path: &Path, side: Side) -> Result<Vec<TransactionRecord>, ReconError> {
    let source = path.display().to_string();
    let format = FileFormat::from_path(path).ok_or_else(|| {
        ingest_error(
            &source,
            "unsupported file type (expected .csv, .json, .xlsx or .xls)",
        )
    })?;

    let records = match format {
        FileFormat::Excel => parse_excel(path, side, &source)?,
        FileFormat::Csv | FileFormat::Json => {
            let data = std::fs::read_to_string(path).map_err(|e| ingest_error(&source, e))?;
            if format == FileFormat::Json {
                parse_json(&data, side, &source)?
            } else {
                parse_csv(&data, side, &source)?
            }
        }
    };

    tracing::info!(
        path = %source,
        side = %side,
        format = ?format,
        records = records.len(),
        "Loaded records"
    );
    Ok(records)
}

pub fn parse_csv(
    data: &str,
    side: Side,
    source: &str,
) -> Result<Vec<TransactionRecord>, ReconError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(data.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| ingest_error(source, e))?
        .iter()
        .map(normalize_key)
        .collect();

    let mut records = Vec::new();
    for (row_idx, result) in reader.records().enumerate() {
        let record = result.map_err(|e| {
            ingest_error(source, format!("CSV parse error at row {}: {}", row_idx + 1, e))
        })?;

        let row: Row = headers
            .iter()
            .cloned()
            .zip(record.iter().map(str::to_string))
            .collect();
        if let Some(parsed) = record_from_row(&row, side, row_idx + 1, source)? {
            records.push(parsed);
        }
    }

    Ok(records)
}

/// Accepts an array of objects, or an object holding the array under
/// `transactions` / `records`.
pub fn parse_json(
    data: &str,
    side: Side,
    source: &str,
) -> Result<Vec<TransactionRecord>, ReconError> {
    let value: Value = serde_json::from_str(data).map_err(|e| ingest_error(source, e))?;

    let items = match &value {
        Value::Array(items) => items,
        Value::Object(map) => ["transactions", "records", side.as_str()]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
            .ok_or_else(|| ingest_error(source, "expected an array of transactions"))?,
        _ => return Err(ingest_error(source, "expected an array of transactions")),
    };

    let mut records = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        let obj = item
            .as_object()
            .ok_or_else(|| ingest_error(source, format!("entry {} is not an object", idx + 1)))?;
        let row: Row = obj
            .iter()
            .filter_map(|(k, v)| {
                let text = match v {
                    Value::String(s) => s.trim().to_string(),
                    Value::Number(n) => n.to_string(),
                    Value::Null => return None,
                    other => other.to_string(),
                };
                Some((normalize_key(k), text))
            })
            .collect();
        if let Some(parsed) = record_from_row(&row, side, idx + 1, source)? {
            records.push(parsed);
        }
    }

    Ok(records)
}

/// Reads the first worksheet. The first non-blank row holds the headers.
pub fn parse_excel(
    path: &Path,
    side: Side,
    source: &str,
) -> Result<Vec<TransactionRecord>, ReconError> {
    let mut workbook = open_workbook_auto(path).map_err(|e| ingest_error(source, e))?;
    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| ingest_error(source, "workbook contains no sheets"))?;
    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|e| ingest_error(source, format!("cannot read sheet '{}': {}", sheet, e)))?;

    let mut rows = range
        .rows()
        .skip_while(|row| row.iter().all(|cell| cell_text(cell).is_none()));
    let Some(header_row) = rows.next() else {
        return Ok(Vec::new());
    };
    let headers: Vec<String> = header_row
        .iter()
        .map(|cell| cell_text(cell).map(|t| normalize_key(&t)).unwrap_or_default())
        .collect();

    let mut records = Vec::new();
    for (row_idx, cells) in rows.enumerate() {
        let row: Row = headers
            .iter()
            .zip(cells)
            .filter(|(header, _)| !header.is_empty())
            .filter_map(|(header, cell)| cell_text(cell).map(|text| (header.clone(), text)))
            .collect();
        if let Some(parsed) = record_from_row(&row, side, row_idx + 1, source)? {
            records.push(parsed);
        }
    }

    tracing::debug!(path = %source, sheet = %sheet, rows = records.len(), "Read worksheet");
    Ok(records)
}

/// Cell value as text; date cells become ISO dates.
fn cell_text(cell: &Data) -> Option<String> {
    let text = match cell {
        Data::String(s) | Data::DateTimeIso(s) => s.trim().to_string(),
        Data::Float(n) => n.to_string(),
        Data::Int(n) => n.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => excel_serial_date(dt.as_f64())?.format("%Y-%m-%d").to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// Days since 1899-12-30, the 1900 date system used by Excel.
fn excel_serial_date(serial: f64) -> Option<NaiveDate> {
    if !(1.0..=MAX_EXCEL_SERIAL).contains(&serial) {
        return None;
    }
    NaiveDate::from_ymd_opt(1899, 12, 30)?
        .checked_add_signed(chrono::Duration::days(serial.floor() as i64))
}

fn record_from_row(
    row: &Row,
    side: Side,
    row_no: usize,
    source: &str,
) -> Result<Option<TransactionRecord>, ReconError> {
    if row.values().all(|v| v.trim().is_empty()) {
        return Ok(None);
    }

    let date_raw = field(row, DATE_KEYS)
        .ok_or_else(|| ingest_error(source, format!("row {}: missing date", row_no)))?;
    let date = parse_date(date_raw).ok_or_else(|| {
        ingest_error(source, format!("row {}: unrecognized date '{}'", row_no, date_raw))
    })?;

    let amount = match field(row, AMOUNT_KEYS) {
        Some(raw) => parse_amount(raw).ok_or_else(|| {
            ingest_error(source, format!("row {}: invalid amount '{}'", row_no, raw))
        })?,
        None => {
            let debit = field(row, DEBIT_KEYS);
            let credit = field(row, CREDIT_KEYS);
            if debit.is_none() && credit.is_none() {
                return Err(ingest_error(
                    source,
                    format!("row {}: no amount, debit or credit column", row_no),
                ));
            }
            let parse = |raw: Option<&str>| -> Result<Decimal, ReconError> {
                raw.map_or(Ok(Decimal::ZERO), |r| {
                    parse_amount(r).ok_or_else(|| {
                        ingest_error(source, format!("row {}: invalid amount '{}'", row_no, r))
                    })
                })
            };
            parse(credit)?
                .checked_sub(parse(debit)?)
                .ok_or_else(|| {
                    ingest_error(source, format!("row {}: credit minus debit overflows", row_no))
                })?
        }
    };

    let id = field(row, ID_KEYS)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}-{}", side, row_no));

    let mut record = TransactionRecord::new(
        id,
        date,
        amount,
        field(row, NARRATION_KEYS).unwrap_or_default(),
    );
    if let Some(reference) = field(row, REFERENCE_KEYS) {
        record = record.with_reference(reference);
    }
    Ok(Some(record))
}

/// First non-empty value among `keys`.
fn field<'a>(row: &'a Row, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| row.get(*k))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
}

fn normalize_key(key: &str) -> String {
    key.trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' || c == '.' { '_' } else { c })
        .collect()
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    // Timestamps: keep the date part.
    let date_part = raw.split(['T', ' ']).next().filter(|p| p.len() >= 8);
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            date_part.and_then(|p| {
                DATE_FORMATS
                    .iter()
                    .find_map(|fmt| NaiveDate::parse_from_str(p, fmt).ok())
            })
        })
        // Spreadsheet date serials that arrive as plain numbers.
        .or_else(|| raw.parse::<f64>().ok().and_then(excel_serial_date))
}

/// Strips currency symbols and thousands separators; `(12.50)` and a
/// trailing `-` or `DR` mean negative.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let mut text = raw.trim().to_string();
    let mut negative = false;

    if text.starts_with('(') && text.ends_with(')') {
        negative = true;
        text = text[1..text.len() - 1].to_string();
    }
    let upper = text.to_ascii_uppercase();
    if upper.ends_with("DR") {
        negative = true;
        text.truncate(text.len() - 2);
    } else if upper.ends_with("CR") {
        text.truncate(text.len() - 2);
    }
    if text.trim_end().ends_with('-') {
        negative = true;
        text = text.trim_end().trim_end_matches('-').to_string();
    }

    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-' || *c == '+')
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let value = Decimal::from_str(&cleaned).ok()?;
    Some(if negative { -value.abs() } else { value })
}

fn ingest_error(source: &str, message: impl std::fmt::Display) -> ReconError {
    ReconError::IngestError {
        path: source.to_string(),
        message: message.to_string(),
    }
}
