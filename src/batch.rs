use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db;
use crate::enrich::{self, ReportSet};
use crate::loader::{self, LoadError, ReportKind};
use crate::models::{IngestionBatch, Periodo};
use crate::scoring::{Scorer, ScoringFeatures};
use crate::tabular::{self, RawTable};

/// The four source files of one upload. Grades and characterization are
/// mandatory; the batch still loads without payments or disability.
#[derive(Debug, Clone)]
pub struct BatchFiles {
    pub caracterizacion: PathBuf,
    pub notas: PathBuf,
    pub pagos: Option<PathBuf>,
    pub discapacidad: Option<PathBuf>,
}

#[derive(Debug)]
pub struct BatchSummary {
    pub periodo: String,
    pub registros: usize,
    pub excluidos: usize,
    pub calificados: usize,
    pub fallos_scoring: usize,
    pub registros_previos_borrados: u64,
}

/// Runs one ingestion batch end to end: load, normalize, enrich, replace the
/// period's records, then score each student against its freshly upserted
/// record. Load and enrichment failures abort the batch (the ingestion row
/// stays unprocessed); a scoring failure only skips that student's
/// probability.
pub async fn run_batch(
    pool: &SqlitePool,
    scorer: &dyn Scorer,
    files: &BatchFiles,
    periodo: &Periodo,
) -> anyhow::Result<BatchSummary> {
    let batch = IngestionBatch {
        id: Uuid::new_v4(),
        periodo: periodo.to_string(),
        fecha_carga: Utc::now().naive_utc(),
        reporte_caracterizacion: files.caracterizacion.display().to_string(),
        reporte_notas: files.notas.display().to_string(),
        reporte_pagos: files.pagos.as_ref().map(|p| p.display().to_string()),
        reporte_discapacidad: files.discapacidad.as_ref().map(|p| p.display().to_string()),
        procesado: false,
    };
    db::insert_batch(pool, &batch)
        .await
        .context("could not register the ingestion batch")?;

    let reports = load_reports(files)?;
    let outcome = enrich::enrich(&reports, periodo)?;

    // Full-replace semantics: stale rows from an earlier run of this period
    // would otherwise accumulate next to the fresh ones.
    let registros_previos_borrados = db::delete_period(pool, &batch.periodo).await?;
    if registros_previos_borrados > 0 {
        info!(
            periodo = %periodo,
            borrados = registros_previos_borrados,
            "cleared previous records before reprocessing"
        );
    }

    let mut calificados = 0usize;
    let mut fallos_scoring = 0usize;
    for record in &outcome.records {
        db::upsert_student_period(pool, record).await?;

        let stored = db::fetch_one(pool, &record.id_estudiante, &batch.periodo)
            .await?
            .context("record vanished between upsert and scoring")?;
        match scorer.score(&ScoringFeatures::from_record(&stored)) {
            Ok(probability) => {
                db::set_probability(pool, &record.id_estudiante, &batch.periodo, probability)
                    .await?;
                calificados += 1;
            }
            Err(err) => {
                warn!(
                    id_estudiante = %record.id_estudiante,
                    error = %err,
                    "scoring failed for one student, probability left unset"
                );
                fallos_scoring += 1;
            }
        }
    }

    db::mark_batch_processed(pool, batch.id).await?;
    info!(
        periodo = %periodo,
        registros = outcome.records.len(),
        calificados,
        fallos_scoring,
        "batch processed"
    );

    Ok(BatchSummary {
        periodo: batch.periodo,
        registros: outcome.records.len(),
        excluidos: outcome.excluded_students,
        calificados,
        fallos_scoring,
        registros_previos_borrados,
    })
}

fn load_reports(files: &BatchFiles) -> Result<ReportSet, LoadError> {
    let load = |path: &Path, kind: ReportKind| -> Result<RawTable, LoadError> {
        let mut table = loader::load_report(path, kind)?;
        tabular::normalize_columns(&mut table);
        tabular::normalize_identity(&mut table);
        Ok(table)
    };

    Ok(ReportSet {
        caracterizacion: Some(load(&files.caracterizacion, ReportKind::Caracterizacion)?),
        notas: Some(load(&files.notas, ReportKind::Notas)?),
        pagos: files
            .pagos
            .as_deref()
            .map(|p| load(p, ReportKind::Pagos))
            .transpose()?,
        discapacidad: files
            .discapacidad
            .as_deref()
            .map(|p| load(p, ReportKind::Discapacidad))
            .transpose()?,
    })
}
