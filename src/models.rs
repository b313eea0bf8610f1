use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use uuid::Uuid;

/// Academic term token: four-digit year plus semester letter, e.g. "2025A".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Periodo {
    pub year: i32,
    pub semestre: Semestre,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Semestre {
    A,
    B,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid period token {0:?}, expected YYYYA or YYYYB")]
pub struct PeriodoParseError(pub String);

impl FromStr for Periodo {
    type Err = PeriodoParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || PeriodoParseError(s.to_string());
        if s.len() != 5 || !s.is_char_boundary(4) {
            return Err(invalid());
        }
        let year: i32 = s[..4].parse().map_err(|_| invalid())?;
        let semestre = match &s[4..] {
            "A" | "a" => Semestre::A,
            "B" | "b" => Semestre::B,
            _ => return Err(invalid()),
        };
        Ok(Periodo { year, semestre })
    }
}

impl fmt::Display for Periodo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self.semestre {
            Semestre::A => 'A',
            Semestre::B => 'B',
        };
        write!(f, "{}{}", self.year, letter)
    }
}

impl Periodo {
    /// Monotonically increasing semester ordinal: year*2 + 1 for A, +2 for B.
    pub fn ordinal(&self) -> i64 {
        self.year as i64 * 2
            + match self.semestre {
                Semestre::A => 1,
                Semestre::B => 2,
            }
    }

    /// Tuition due date for the term: Feb 28 for A semesters, Aug 31 for B.
    pub fn fecha_vencimiento(&self) -> NaiveDate {
        match self.semestre {
            Semestre::A => NaiveDate::from_ymd_opt(self.year, 2, 28),
            Semestre::B => NaiveDate::from_ymd_opt(self.year, 8, 31),
        }
        .expect("fixed due-date calendar day is always valid")
    }
}

/// One persisted feature row per (student, period). Field names follow the
/// institutional report schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StudentPeriod {
    pub id_estudiante: String,
    pub periodo: String,
    pub promedio_semestral: Option<f64>,
    pub num_materias_cursadas: Option<i64>,
    pub num_materias_reprobadas: Option<i64>,
    pub edad: Option<i64>,
    pub genero: Option<String>,
    pub estado_civil: Option<String>,
    pub etnia: Option<String>,
    pub programa: Option<String>,
    pub periodo_ingreso: Option<String>,
    pub num_est_economico: Option<i64>,
    pub num_grupo_fam: Option<i64>,
    pub posicion_hermanos: Option<i64>,
    pub es_foraneo: Option<i64>,
    pub experiencia_laboral: Option<i64>,
    pub pago_tardio: Option<i64>,
    pub dias_retraso_pago: Option<i64>,
    pub antiguedad_estudiante: Option<i64>,
    pub diferencia_promedio_anterior: Option<f64>,
    pub discapacidad: Option<String>,
    pub est_alum: Option<String>,
    pub ultima_prob_riesgo: Option<f64>,
}

impl StudentPeriod {
    pub fn riesgo_porcentaje(&self) -> Option<f64> {
        self.ultima_prob_riesgo.map(|p| p * 100.0)
    }
}

/// One upload event: the four source files for a single target period.
#[derive(Debug, Clone)]
pub struct IngestionBatch {
    pub id: Uuid,
    pub periodo: String,
    pub fecha_carga: NaiveDateTime,
    pub reporte_caracterizacion: String,
    pub reporte_notas: String,
    pub reporte_pagos: Option<String>,
    pub reporte_discapacidad: Option<String>,
    pub procesado: bool,
}

/// Transient confusion-matrix report produced by the validation engine.
/// Bucket lists keep the full records for drill-down; not persisted.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub periodo: String,
    pub umbral: f64,
    pub total_evaluados: usize,
    pub total_deserciones_reales: usize,
    /// Percentages in [0, 100].
    pub precision: f64,
    pub recall: f64,
    pub verdaderos_positivos: Vec<StudentPeriod>,
    pub falsos_positivos: Vec<StudentPeriod>,
    pub falsos_negativos: Vec<StudentPeriod>,
    pub verdaderos_negativos: Vec<StudentPeriod>,
}
