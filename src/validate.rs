use std::collections::HashSet;
use std::path::Path;

use sqlx::SqlitePool;
use tracing::info;

use crate::db;
use crate::loader::{self, LoadError};
use crate::models::{StudentPeriod, ValidationReport};
use crate::tabular::{self, ID_COLUMN};

/// Roster statuses that mean the student did not drop out.
pub const ESTADOS_CONTINUIDAD: [&str; 3] = ["ACTIVO", "EGRESADO", "GRADUADO"];

#[derive(Debug, thiserror::Error)]
pub enum ValidateError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("the roster has no student identifier column (cedula or an equivalent)")]
    MissingIdColumn,
    #[error("the roster has no est_alum status column, required to filter continuing students")]
    MissingStatusColumn,
    #[error("no stored predictions found for period {0}")]
    NoRecords(String),
    #[error("record store failure: {0}")]
    Store(String),
}

/// Parses the uploaded roster and extracts the confirmed-continuing id set.
pub fn load_continuation_set(path: &Path) -> Result<HashSet<String>, ValidateError> {
    let mut table = loader::load_with_fallback(path)?;
    tabular::normalize_columns(&mut table);
    tabular::normalize_identity(&mut table);

    if !table.has_column(ID_COLUMN) {
        return Err(ValidateError::MissingIdColumn);
    }
    if !table.has_column("est_alum") {
        return Err(ValidateError::MissingStatusColumn);
    }

    let mut ids = HashSet::new();
    for row in 0..table.len() {
        let Some(id) = table.cell(row, ID_COLUMN) else {
            continue;
        };
        let Some(estado) = table.cell(row, "est_alum") else {
            continue;
        };
        if ESTADOS_CONTINUIDAD.contains(&estado.to_uppercase().as_str()) {
            ids.insert(id.to_string());
        }
    }
    info!(
        roster = %path.display(),
        continuando = ids.len(),
        "continuation set extracted"
    );
    Ok(ids)
}

/// Compares the stored predictions of a period against the ground-truth
/// continuation set.
pub async fn validate_period(
    pool: &SqlitePool,
    periodo: &str,
    ids_activos: &HashSet<String>,
    umbral: f64,
) -> Result<ValidationReport, ValidateError> {
    let records = db::fetch_period(pool, periodo)
        .await
        .map_err(|e| ValidateError::Store(e.to_string()))?;
    if records.is_empty() {
        return Err(ValidateError::NoRecords(periodo.to_string()));
    }
    Ok(classify(periodo, records, ids_activos, umbral))
}

/// Confusion-matrix classification of every record at threshold `umbral`.
/// A record with no stored probability is never predicted at risk.
pub fn classify(
    periodo: &str,
    records: Vec<StudentPeriod>,
    ids_activos: &HashSet<String>,
    umbral: f64,
) -> ValidationReport {
    let total_evaluados = records.len();
    let mut verdaderos_positivos = Vec::new();
    let mut falsos_positivos = Vec::new();
    let mut falsos_negativos = Vec::new();
    let mut verdaderos_negativos = Vec::new();
    let mut total_deserciones_reales = 0usize;

    for record in records {
        let predijo_riesgo = record
            .ultima_prob_riesgo
            .map_or(false, |p| p >= umbral);
        let continuo = ids_activos.contains(&record.id_estudiante);

        if !continuo {
            total_deserciones_reales += 1;
        }
        match (predijo_riesgo, continuo) {
            (true, false) => verdaderos_positivos.push(record),
            (true, true) => falsos_positivos.push(record),
            (false, false) => falsos_negativos.push(record),
            (false, true) => verdaderos_negativos.push(record),
        }
    }

    let tp = verdaderos_positivos.len();
    let fp = falsos_positivos.len();
    let fal_n = falsos_negativos.len();
    let precision = if tp + fp > 0 {
        tp as f64 / (tp + fp) as f64 * 100.0
    } else {
        0.0
    };
    let recall = if tp + fal_n > 0 {
        tp as f64 / (tp + fal_n) as f64 * 100.0
    } else {
        0.0
    };

    ValidationReport {
        periodo: periodo.to_string(),
        umbral,
        total_evaluados,
        total_deserciones_reales,
        precision,
        recall,
        verdaderos_positivos,
        falsos_positivos,
        falsos_negativos,
        verdaderos_negativos,
    }
}
