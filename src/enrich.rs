use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::loader::ReportKind;
use crate::models::{Periodo, StudentPeriod};
use crate::tabular::{RawTable, ID_COLUMN};

/// Characterization statuses that take a student out of the batch
/// population: no longer enrolled, nothing to predict.
pub const ESTADOS_EXCLUIDOS: [&str; 4] = ["--", "---", "GRADUADO", "EGRESADO"];

/// Grades below this value count as a failed course.
const NOTA_APROBATORIA: f64 = 3.0;

const FORMATO_FECHA_PAGO: &str = "%d/%m/%Y";

#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    #[error("required report '{0}' was not loaded")]
    MissingReport(ReportKind),
}

/// The normalized tables of one batch. Grades and characterization are
/// required; payments and disability are optional.
#[derive(Debug, Default)]
pub struct ReportSet {
    pub caracterizacion: Option<RawTable>,
    pub notas: Option<RawTable>,
    pub pagos: Option<RawTable>,
    pub discapacidad: Option<RawTable>,
}

/// Failed-coercion reason for a single raw value. Callers degrade to
/// null/zero per the field policy, but every failure is counted.
#[derive(Debug, thiserror::Error)]
#[error("cannot interpret {raw:?} as {expected}")]
pub struct Coercion {
    pub raw: String,
    pub expected: &'static str,
}

pub fn coerce_f64(raw: &str) -> Result<f64, Coercion> {
    raw.trim().parse::<f64>().map_err(|_| Coercion {
        raw: raw.to_string(),
        expected: "a number",
    })
}

pub fn coerce_i64(raw: &str) -> Result<i64, Coercion> {
    // Integer columns come back as "25" from CSV but "25.0" survives in
    // some exports; accept both.
    match raw.trim().parse::<i64>() {
        Ok(v) => Ok(v),
        Err(_) => coerce_f64(raw).map(|v| v as i64).map_err(|_| Coercion {
            raw: raw.to_string(),
            expected: "an integer",
        }),
    }
}

pub fn coerce_fecha(raw: &str) -> Result<NaiveDate, Coercion> {
    NaiveDate::parse_from_str(raw.trim(), FORMATO_FECHA_PAGO).map_err(|_| Coercion {
        raw: raw.to_string(),
        expected: "a d/m/Y date",
    })
}

pub fn coerce_periodo(raw: &str) -> Result<Periodo, Coercion> {
    raw.parse::<Periodo>().map_err(|_| Coercion {
        raw: raw.to_string(),
        expected: "a YYYYA/YYYYB period",
    })
}

/// Count of coercion failures absorbed during one enrichment run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CoercionTally {
    pub grades: usize,
    pub integers: usize,
    pub dates: usize,
    pub periods: usize,
}

impl CoercionTally {
    pub fn total(&self) -> usize {
        self.grades + self.integers + self.dates + self.periods
    }

    fn log(&self) {
        if self.total() > 0 {
            warn!(
                grades = self.grades,
                integers = self.integers,
                dates = self.dates,
                periods = self.periods,
                "values failed coercion and degraded to null/zero"
            );
        }
    }
}

#[derive(Debug)]
pub struct EnrichOutcome {
    pub records: Vec<StudentPeriod>,
    /// Students dropped because every characterization row carried an
    /// excluded status.
    pub excluded_students: usize,
    pub tally: CoercionTally,
}

#[derive(Debug, Clone, Default)]
struct Demografia {
    edad: Option<i64>,
    genero: Option<String>,
    estado_civil: Option<String>,
    etnia: Option<String>,
    programa: Option<String>,
    periodo_ingreso: Option<String>,
    num_est_economico: Option<i64>,
    num_grupo_fam: Option<i64>,
    posicion_hermanos: Option<i64>,
    es_foraneo: i64,
    experiencia_laboral: Option<i64>,
    est_alum: Option<String>,
}

#[derive(Debug, Default)]
struct NotasAgg {
    suma: f64,
    calificadas: usize,
    materias: HashSet<String>,
    reprobadas: i64,
}

/// The core transform: merges the four normalized reports into one feature
/// row per retained student for the target period.
pub fn enrich(reports: &ReportSet, periodo: &Periodo) -> Result<EnrichOutcome, EnrichError> {
    let notas = reports
        .notas
        .as_ref()
        .ok_or(EnrichError::MissingReport(ReportKind::Notas))?;
    let caracterizacion = reports
        .caracterizacion
        .as_ref()
        .ok_or(EnrichError::MissingReport(ReportKind::Caracterizacion))?;

    let mut tally = CoercionTally::default();

    // Characterization pass: drop excluded-status rows, keep the last
    // occurrence per student for everything else.
    let mut vistos: HashSet<String> = HashSet::new();
    let mut demografia: HashMap<String, Demografia> = HashMap::new();
    for row in 0..caracterizacion.len() {
        let Some(id) = caracterizacion.cell(row, ID_COLUMN) else {
            continue;
        };
        vistos.insert(id.to_string());
        let estado = caracterizacion
            .cell(row, "est_alum")
            .map(|s| s.to_uppercase());
        if matches!(&estado, Some(e) if ESTADOS_EXCLUIDOS.contains(&e.as_str())) {
            continue;
        }
        demografia.insert(
            id.to_string(),
            read_demografia(caracterizacion, row, estado, &mut tally),
        );
    }
    // Students whose every characterization row was excluded never produce
    // a record, even when grade rows exist.
    let excluidos: HashSet<&String> = vistos
        .iter()
        .filter(|id| !demografia.contains_key(*id))
        .collect();
    info!(
        poblacion_activa = demografia.len(),
        excluidos = excluidos.len(),
        "characterization filtered"
    );

    // Grade aggregation per student.
    let mut agregados: HashMap<String, NotasAgg> = HashMap::new();
    for row in 0..notas.len() {
        let Some(id) = notas.cell(row, ID_COLUMN) else {
            continue;
        };
        let agg = agregados.entry(id.to_string()).or_default();
        if let Some(raw) = notas.cell(row, "def_historia") {
            match coerce_f64(raw) {
                Ok(nota) => {
                    agg.suma += nota;
                    agg.calificadas += 1;
                    if nota < NOTA_APROBATORIA {
                        agg.reprobadas += 1;
                    }
                }
                Err(_) => tally.grades += 1,
            }
        }
        if let Some(materia) = notas.cell(row, "nom_materia") {
            agg.materias.insert(materia.to_string());
        }
    }

    let discapacidades = read_discapacidades(reports.discapacidad.as_ref());
    let pagos = read_pagos(reports.pagos.as_ref(), &mut tally);

    // Cross-period grade deltas are not implemented; the model was trained
    // with this column constant. TODO: revisit once a prior-period lookup
    // is available.
    warn!("diferencia_promedio_anterior stored as constant 0");

    let mut ids: Vec<&String> = agregados
        .keys()
        .filter(|id| !excluidos.contains(*id))
        .collect();
    ids.sort();

    let ordinal_actual = periodo.ordinal();
    let vencimiento = periodo.fecha_vencimiento();
    let mut records = Vec::with_capacity(ids.len());

    for id in ids {
        let agg = &agregados[id];
        let mut record = StudentPeriod {
            id_estudiante: id.clone(),
            periodo: periodo.to_string(),
            promedio_semestral: (agg.calificadas > 0)
                .then(|| agg.suma / agg.calificadas as f64),
            num_materias_cursadas: Some(agg.materias.len() as i64),
            num_materias_reprobadas: Some(agg.reprobadas),
            diferencia_promedio_anterior: Some(0.0),
            ..Default::default()
        };

        if let Some(demo) = demografia.get(id) {
            record.edad = demo.edad;
            record.genero = demo.genero.clone();
            record.estado_civil = demo.estado_civil.clone();
            record.etnia = demo.etnia.clone();
            record.programa = demo.programa.clone();
            record.periodo_ingreso = demo.periodo_ingreso.clone();
            record.num_est_economico = demo.num_est_economico;
            record.num_grupo_fam = demo.num_grupo_fam;
            record.posicion_hermanos = demo.posicion_hermanos;
            record.es_foraneo = Some(demo.es_foraneo);
            record.experiencia_laboral = demo.experiencia_laboral;
            record.est_alum = demo.est_alum.clone();

            record.antiguedad_estudiante = demo.periodo_ingreso.as_deref().and_then(|raw| {
                match coerce_periodo(raw) {
                    Ok(ingreso) => Some(ordinal_actual - ingreso.ordinal() + 1),
                    Err(_) => {
                        tally.periods += 1;
                        None
                    }
                }
            });
        }

        if let Some(categoria) = discapacidades.get(id) {
            record.discapacidad = categoria.clone();
        }

        if let Some(fecha) = pagos.get(id).copied() {
            record.pago_tardio = Some(i64::from(matches!(fecha, Some(f) if f > vencimiento)));
            record.dias_retraso_pago =
                fecha.map(|f| f.signed_duration_since(vencimiento).num_days().max(0));
        }

        fill_missing_numeric(&mut record);
        records.push(record);
    }

    tally.log();
    info!(
        periodo = %periodo,
        registros = records.len(),
        "enrichment produced feature rows"
    );

    Ok(EnrichOutcome {
        records,
        excluded_students: excluidos.len(),
        tally,
    })
}

fn read_demografia(
    table: &RawTable,
    row: usize,
    estado: Option<String>,
    tally: &mut CoercionTally,
) -> Demografia {
    let mut entero = |column: &str| {
        table.cell(row, column).and_then(|raw| match coerce_i64(raw) {
            Ok(v) => Some(v),
            Err(_) => {
                tally.integers += 1;
                None
            }
        })
    };

    let edad = entero("edad");
    let num_est_economico = entero("num_est_economico");
    let num_grupo_fam = entero("num_grupo_fam");
    let posicion_hermanos = entero("posicion_hermanos");

    let texto = |column: &str| table.cell(row, column).map(|s| s.to_string());

    // Residence outside Cali (or unknown) flags the student as foreign.
    let es_foraneo = match table.cell(row, "lugar_residencia") {
        Some(residencia) if residencia.to_uppercase().contains("CALI") => 0,
        _ => 1,
    };

    // SI/NO map to 1/0; anything else, including blanks, is -1 (not
    // applicable). The column itself may be absent from the report.
    let experiencia_laboral = table.column_index("experiencia_laboral").map(|_| {
        match table
            .cell(row, "experiencia_laboral")
            .map(|s| s.to_uppercase())
            .as_deref()
        {
            Some("SI") => 1,
            Some("NO") => 0,
            _ => -1,
        }
    });

    Demografia {
        edad,
        genero: texto("genero"),
        estado_civil: texto("estado_civil"),
        etnia: texto("etnia"),
        programa: texto("programa"),
        periodo_ingreso: texto("periodo_ingreso"),
        num_est_economico,
        num_grupo_fam,
        posicion_hermanos,
        es_foraneo,
        experiencia_laboral,
        est_alum: estado,
    }
}

/// Last-occurrence disability category per student, if the table is present
/// with both required columns.
fn read_discapacidades(table: Option<&RawTable>) -> HashMap<String, Option<String>> {
    let mut categorias = HashMap::new();
    if let Some(table) = table {
        if table.has_column(ID_COLUMN) && table.has_column("discapacidad") {
            for row in 0..table.len() {
                if let Some(id) = table.cell(row, ID_COLUMN) {
                    let categoria = table.cell(row, "discapacidad").map(|s| s.to_string());
                    categorias.insert(id.to_string(), categoria);
                }
            }
        }
    }
    categorias
}

/// Last payment date per student; unparseable dates degrade to a missing
/// date but the student keeps a payment entry.
fn read_pagos(
    table: Option<&RawTable>,
    tally: &mut CoercionTally,
) -> HashMap<String, Option<NaiveDate>> {
    let mut pagos = HashMap::new();
    if let Some(table) = table {
        if table.has_column(ID_COLUMN) && table.has_column("fecha_pago") {
            for row in 0..table.len() {
                let Some(id) = table.cell(row, ID_COLUMN) else {
                    continue;
                };
                let fecha = table.cell(row, "fecha_pago").and_then(|raw| {
                    match coerce_fecha(raw) {
                        Ok(f) => Some(f),
                        Err(_) => {
                            tally.dates += 1;
                            None
                        }
                    }
                });
                pagos.insert(id.to_string(), fecha);
            }
        }
    }
    pagos
}

/// Missing numeric signals are deliberately treated as "no signal = zero";
/// text fields stay null.
fn fill_missing_numeric(record: &mut StudentPeriod) {
    record.promedio_semestral.get_or_insert(0.0);
    record.num_materias_cursadas.get_or_insert(0);
    record.num_materias_reprobadas.get_or_insert(0);
    record.edad.get_or_insert(0);
    record.num_est_economico.get_or_insert(0);
    record.num_grupo_fam.get_or_insert(0);
    record.posicion_hermanos.get_or_insert(0);
    record.es_foraneo.get_or_insert(0);
    record.experiencia_laboral.get_or_insert(0);
    record.pago_tardio.get_or_insert(0);
    record.dias_retraso_pago.get_or_insert(0);
    record.antiguedad_estudiante.get_or_insert(0);
    record.diferencia_promedio_anterior.get_or_insert(0.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(columns: &[&str], rows: &[&[&str]]) -> RawTable {
        RawTable::new(
            columns.iter().map(|c| c.to_string()).collect(),
            rows.iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
    }

    fn periodo() -> Periodo {
        "2025A".parse().unwrap()
    }

    fn base_reports() -> ReportSet {
        ReportSet {
            caracterizacion: Some(table(
                &[
                    "id_estudiante",
                    "est_alum",
                    "lugar_residencia",
                    "edad",
                    "experiencia_laboral",
                    "periodo_ingreso",
                ],
                &[&["10", "ACTIVO", "Cali Norte", "21", "si", "2023A"]],
            )),
            notas: Some(table(
                &["id_estudiante", "def_historia", "nom_materia"],
                &[
                    &["10", "4.0", "Calculo I"],
                    &["10", "2.5", "Fisica I"],
                    &["10", "3.0", "Programacion"],
                ],
            )),
            pagos: None,
            discapacidad: None,
        }
    }

    #[test]
    fn grade_aggregation_matches_failing_threshold() {
        let outcome = enrich(&base_reports(), &periodo()).unwrap();
        assert_eq!(outcome.records.len(), 1);
        let rec = &outcome.records[0];
        let promedio = rec.promedio_semestral.unwrap();
        assert!((promedio - 9.5 / 3.0).abs() < 1e-9);
        assert_eq!(rec.num_materias_cursadas, Some(3));
        assert_eq!(rec.num_materias_reprobadas, Some(1));
    }

    #[test]
    fn foreign_residence_flag() {
        let mut reports = base_reports();
        reports.caracterizacion = Some(table(
            &["id_estudiante", "est_alum", "lugar_residencia"],
            &[
                &["10", "ACTIVO", "Cali Norte"],
                &["11", "ACTIVO", "Bogotá"],
                &["12", "ACTIVO", ""],
            ],
        ));
        reports.notas = Some(table(
            &["id_estudiante", "def_historia", "nom_materia"],
            &[
                &["10", "4.0", "a"],
                &["11", "4.0", "a"],
                &["12", "4.0", "a"],
            ],
        ));

        let outcome = enrich(&reports, &periodo()).unwrap();
        let flag = |id: &str| {
            outcome
                .records
                .iter()
                .find(|r| r.id_estudiante == id)
                .unwrap()
                .es_foraneo
        };
        assert_eq!(flag("10"), Some(0));
        assert_eq!(flag("11"), Some(1));
        assert_eq!(flag("12"), Some(1));
    }

    #[test]
    fn late_payment_days_against_semester_due_date() {
        let mut reports = base_reports();
        reports.pagos = Some(table(
            &["id_estudiante", "fecha_pago"],
            &[&["10", "15/03/2025"]],
        ));

        let outcome = enrich(&reports, &periodo()).unwrap();
        let rec = &outcome.records[0];
        assert_eq!(rec.pago_tardio, Some(1));
        assert_eq!(rec.dias_retraso_pago, Some(15));
    }

    #[test]
    fn on_time_payment_never_goes_negative() {
        let mut reports = base_reports();
        reports.pagos = Some(table(
            &["id_estudiante", "fecha_pago"],
            &[&["10", "10/01/2025"]],
        ));

        let outcome = enrich(&reports, &periodo()).unwrap();
        let rec = &outcome.records[0];
        assert_eq!(rec.pago_tardio, Some(0));
        assert_eq!(rec.dias_retraso_pago, Some(0));
    }

    #[test]
    fn unparseable_payment_date_degrades_to_zero() {
        let mut reports = base_reports();
        reports.pagos = Some(table(
            &["id_estudiante", "fecha_pago"],
            &[&["10", "marzo 15"]],
        ));

        let outcome = enrich(&reports, &periodo()).unwrap();
        let rec = &outcome.records[0];
        assert_eq!(rec.pago_tardio, Some(0));
        assert_eq!(rec.dias_retraso_pago, Some(0));
        assert_eq!(outcome.tally.dates, 1);
    }

    #[test]
    fn tenure_counts_semesters_inclusive() {
        let outcome = enrich(&base_reports(), &periodo()).unwrap();
        // admitted 2023A, current 2025A
        assert_eq!(outcome.records[0].antiguedad_estudiante, Some(5));
    }

    #[test]
    fn bad_admission_period_fills_tenure_with_zero() {
        let mut reports = base_reports();
        reports.caracterizacion = Some(table(
            &["id_estudiante", "est_alum", "periodo_ingreso"],
            &[&["10", "ACTIVO", "hace tiempo"]],
        ));

        let outcome = enrich(&reports, &periodo()).unwrap();
        assert_eq!(outcome.records[0].antiguedad_estudiante, Some(0));
        assert_eq!(outcome.tally.periods, 1);
    }

    #[test]
    fn graduated_students_never_get_a_record() {
        let mut reports = base_reports();
        reports.caracterizacion = Some(table(
            &["id_estudiante", "est_alum"],
            &[
                &["10", "ACTIVO"],
                &["20", "graduado"],
                &["21", "---"],
            ],
        ));
        reports.notas = Some(table(
            &["id_estudiante", "def_historia", "nom_materia"],
            &[
                &["10", "4.0", "a"],
                &["20", "4.5", "a"],
                &["21", "4.5", "a"],
            ],
        ));

        let outcome = enrich(&reports, &periodo()).unwrap();
        let ids: Vec<&str> = outcome
            .records
            .iter()
            .map(|r| r.id_estudiante.as_str())
            .collect();
        assert_eq!(ids, vec!["10"]);
        assert_eq!(outcome.excluded_students, 2);
    }

    #[test]
    fn student_without_characterization_keeps_null_demographics() {
        let mut reports = base_reports();
        reports.notas = Some(table(
            &["id_estudiante", "def_historia", "nom_materia"],
            &[&["10", "4.0", "a"], &["99", "3.5", "a"]],
        ));

        let outcome = enrich(&reports, &periodo()).unwrap();
        let rec = outcome
            .records
            .iter()
            .find(|r| r.id_estudiante == "99")
            .unwrap();
        assert_eq!(rec.genero, None);
        // numeric gaps are filled with zero
        assert_eq!(rec.edad, Some(0));
        assert_eq!(rec.es_foraneo, Some(0));
    }

    #[test]
    fn work_experience_encoding() {
        let mut reports = base_reports();
        reports.caracterizacion = Some(table(
            &["id_estudiante", "est_alum", "experiencia_laboral"],
            &[
                &["10", "ACTIVO", "si"],
                &["11", "ACTIVO", "NO"],
                &["12", "ACTIVO", "tal vez"],
                &["13", "ACTIVO", ""],
            ],
        ));
        reports.notas = Some(table(
            &["id_estudiante", "def_historia", "nom_materia"],
            &[
                &["10", "4.0", "a"],
                &["11", "4.0", "a"],
                &["12", "4.0", "a"],
                &["13", "4.0", "a"],
            ],
        ));

        let outcome = enrich(&reports, &periodo()).unwrap();
        let exp = |id: &str| {
            outcome
                .records
                .iter()
                .find(|r| r.id_estudiante == id)
                .unwrap()
                .experiencia_laboral
        };
        assert_eq!(exp("10"), Some(1));
        assert_eq!(exp("11"), Some(0));
        assert_eq!(exp("12"), Some(-1));
        assert_eq!(exp("13"), Some(-1));
    }

    #[test]
    fn last_characterization_row_wins() {
        let mut reports = base_reports();
        reports.caracterizacion = Some(table(
            &["id_estudiante", "est_alum", "programa"],
            &[
                &["10", "ACTIVO", "Derecho"],
                &["10", "ACTIVO", "Ingenieria"],
            ],
        ));

        let outcome = enrich(&reports, &periodo()).unwrap();
        assert_eq!(outcome.records[0].programa.as_deref(), Some("Ingenieria"));
    }

    #[test]
    fn disability_joined_by_last_occurrence() {
        let mut reports = base_reports();
        reports.discapacidad = Some(table(
            &["id_estudiante", "discapacidad"],
            &[&["10", "Visual"], &["10", "Auditiva"]],
        ));

        let outcome = enrich(&reports, &periodo()).unwrap();
        assert_eq!(outcome.records[0].discapacidad.as_deref(), Some("Auditiva"));
    }

    #[test]
    fn missing_required_reports_abort() {
        let mut reports = base_reports();
        reports.notas = None;
        assert!(matches!(
            enrich(&reports, &periodo()),
            Err(EnrichError::MissingReport(ReportKind::Notas))
        ));

        let mut reports = base_reports();
        reports.caracterizacion = None;
        assert!(matches!(
            enrich(&reports, &periodo()),
            Err(EnrichError::MissingReport(ReportKind::Caracterizacion))
        ));
    }

    #[test]
    fn non_numeric_grades_are_tallied_not_failed() {
        let mut reports = base_reports();
        reports.notas = Some(table(
            &["id_estudiante", "def_historia", "nom_materia"],
            &[&["10", "aprobado", "a"], &["10", "2.0", "b"]],
        ));

        let outcome = enrich(&reports, &periodo()).unwrap();
        let rec = &outcome.records[0];
        assert_eq!(rec.num_materias_reprobadas, Some(1));
        assert_eq!(rec.promedio_semestral, Some(2.0));
        assert_eq!(outcome.tally.grades, 1);
    }
}
