use unicode_normalization::UnicodeNormalization;

/// Canonical name every student-identifier column collapses to.
pub const ID_COLUMN: &str = "id_estudiante";

/// Known aliases for the student-identifier column across the four reports
/// and the validation roster.
const ID_ALIASES: [&str; 4] = [
    "ide_estudiante",
    "cedula",
    "num_identificacion",
    "identificacion",
];

/// In-memory tabular report: ordered column labels plus string-valued rows.
/// Cell typing is deferred to the consumers, which coerce on demand.
#[derive(Debug, Clone, Default)]
pub struct RawTable {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl RawTable {
    /// Builds a table, padding short rows so every row matches the header
    /// width. Extra trailing cells are dropped.
    pub fn new(columns: Vec<String>, mut rows: Vec<Vec<String>>) -> Self {
        let width = columns.len();
        for row in &mut rows {
            row.resize(width, String::new());
        }
        RawTable { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Trimmed cell value; empty and whitespace-only cells read as missing.
    pub fn cell(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        let value = self.rows.get(row)?.get(idx)?.trim();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }

    pub fn rename_column(&mut self, from: &str, to: &str) {
        if let Some(idx) = self.column_index(from) {
            self.columns[idx] = to.to_string();
        }
    }

    pub fn map_column<F: Fn(&str) -> String>(&mut self, column: &str, f: F) {
        if let Some(idx) = self.column_index(column) {
            for row in &mut self.rows {
                row[idx] = f(&row[idx]);
            }
        }
    }
}

/// Lowercases and trims a column label, replaces internal spaces with
/// underscores, and strips diacritics (NFKD decomposition, ASCII retained)
/// so that encoding variants of one logical column collapse to one name.
pub fn normalize_label(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .replace(' ', "_")
        .nfkd()
        .filter(char::is_ascii)
        .collect()
}

/// Applies [`normalize_label`] to every column of the table. Idempotent.
pub fn normalize_columns(table: &mut RawTable) {
    for column in &mut table.columns {
        *column = normalize_label(column);
    }
}

/// Trimmed string form of an identifier value, with the trailing ".0"
/// artifact of numeric-typed spreadsheet cells stripped.
pub fn normalize_id_value(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed.strip_suffix(".0").unwrap_or(trimmed).to_string()
}

/// Collapses any known identifier alias column to [`ID_COLUMN`] and
/// normalizes its values. Expects [`normalize_columns`] to have run first.
/// Idempotent.
pub fn normalize_identity(table: &mut RawTable) {
    if !table.has_column(ID_COLUMN) {
        for alias in ID_ALIASES {
            if table.has_column(alias) {
                table.rename_column(alias, ID_COLUMN);
                break;
            }
        }
    }
    table.map_column(ID_COLUMN, normalize_id_value);
}
