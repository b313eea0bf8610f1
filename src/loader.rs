use std::fmt;
use std::fs;
use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use encoding_rs::{UTF_8, WINDOWS_1252};
use tracing::debug;

use crate::tabular::RawTable;

/// Encodings attempted, in order, by the validation-upload CSV path.
const FALLBACK_ENCODINGS: [&str; 3] = ["cp1252", "latin1", "utf-8"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportKind {
    Caracterizacion,
    Notas,
    Pagos,
    Discapacidad,
}

impl ReportKind {
    pub fn label(&self) -> &'static str {
        match self {
            ReportKind::Caracterizacion => "caracterizacion",
            ReportKind::Notas => "notas",
            ReportKind::Pagos => "pagos",
            ReportKind::Discapacidad => "discapacidad",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("could not read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not decode {path} with any of the attempted encodings ({attempted})")]
    Decode { path: String, attempted: String },
    #[error("could not parse {path} as `;`-delimited CSV: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("could not open spreadsheet {path}: {source}")]
    Spreadsheet {
        path: String,
        #[source]
        source: calamine::Error,
    },
    #[error("spreadsheet {path} has no readable sheet")]
    EmptySheet { path: String },
    #[error("unsupported file type for {path}: expected .csv, .xls or .xlsx")]
    UnsupportedFormat { path: String },
}

/// Loads one of the four batch reports. CSV files are `;`-delimited in the
/// institution's declared legacy encoding (latin1); anything else is handed
/// to the spreadsheet engine, first sheet only. Any read error aborts the
/// batch at the caller.
pub fn load_report(path: &Path, kind: ReportKind) -> Result<RawTable, LoadError> {
    debug!(report = kind.label(), path = %path.display(), "loading report");
    if has_extension(path, "csv") {
        let bytes = read_bytes(path)?;
        parse_csv(path, &decode_latin1(&bytes))
    } else {
        load_spreadsheet(path)
    }
}

/// Loads the validation roster. CSV decoding tries a fixed sequence of
/// candidate encodings and accepts the first clean decode; spreadsheets go
/// through the tabular engine. Other extensions are rejected.
pub fn load_with_fallback(path: &Path) -> Result<RawTable, LoadError> {
    if has_extension(path, "csv") {
        let bytes = read_bytes(path)?;
        for label in FALLBACK_ENCODINGS {
            if let Some(text) = decode_strict(label, &bytes) {
                debug!(encoding = label, path = %path.display(), "roster decoded");
                return parse_csv(path, &text);
            }
            debug!(encoding = label, path = %path.display(), "decode failed, trying next");
        }
        Err(LoadError::Decode {
            path: path.display().to_string(),
            attempted: FALLBACK_ENCODINGS.join(", "),
        })
    } else if has_extension(path, "xls") || has_extension(path, "xlsx") {
        load_spreadsheet(path)
    } else {
        Err(LoadError::UnsupportedFormat {
            path: path.display().to_string(),
        })
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

fn read_bytes(path: &Path) -> Result<Vec<u8>, LoadError> {
    fs::read(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// ISO-8859-1 maps every byte, so this decode is total.
fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Strict decode for the fallback sequence: cp1252 rejects bytes undefined
/// in that code page (they surface as C1 controls under the WHATWG decoder),
/// latin1 is total, utf-8 rejects malformed sequences.
fn decode_strict(label: &str, bytes: &[u8]) -> Option<String> {
    match label {
        "cp1252" => {
            let (text, _, had_errors) = WINDOWS_1252.decode(bytes);
            if had_errors || text.chars().any(|c| ('\u{80}'..='\u{9f}').contains(&c)) {
                None
            } else {
                Some(text.into_owned())
            }
        }
        "latin1" => Some(decode_latin1(bytes)),
        "utf-8" => {
            let (text, _, had_errors) = UTF_8.decode(bytes);
            if had_errors {
                None
            } else {
                Some(text.into_owned())
            }
        }
        _ => None,
    }
}

fn parse_csv(path: &Path, text: &str) -> Result<RawTable, LoadError> {
    let to_err = |source| LoadError::Csv {
        path: path.display().to_string(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .from_reader(text.as_bytes());

    let columns: Vec<String> = reader
        .headers()
        .map_err(to_err)?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(to_err)?;
        rows.push(record.iter().map(|c| c.to_string()).collect());
    }

    Ok(RawTable::new(columns, rows))
}

fn load_spreadsheet(path: &Path) -> Result<RawTable, LoadError> {
    let mut workbook = open_workbook_auto(path).map_err(|source| LoadError::Spreadsheet {
        path: path.display().to_string(),
        source,
    })?;

    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| LoadError::EmptySheet {
            path: path.display().to_string(),
        })?
        .map_err(|source| LoadError::Spreadsheet {
            path: path.display().to_string(),
            source,
        })?;

    let mut rows = range.rows();
    let columns = match rows.next() {
        Some(header) => header.iter().map(cell_to_string).collect(),
        None => Vec::new(),
    };
    let rows = rows
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect();

    Ok(RawTable::new(columns, rows))
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        // Integral floats print without the ".0" numeric-cell artifact.
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Data::Float(f) => f.to_string(),
        Data::Bool(b) => b.to_string(),
        // Dates are rendered in the day/month/year form the pipeline parses.
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|d| d.format("%d/%m/%Y").to_string())
            .unwrap_or_default(),
        other => other.to_string(),
    }
}
