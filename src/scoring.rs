use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::models::StudentPeriod;

/// Decision boundary above which a probability counts as at-risk. Shared by
/// the scoring read paths and the validation engine; both must agree for
/// validation metrics to be meaningful.
pub const DEFAULT_UMBRAL: f64 = 0.515;

/// Version of the feature layout below. Bumped whenever the set of feature
/// names changes; artifacts trained against another layout are rejected.
pub const FEATURE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ScoreError {
    #[error("could not read model artifact {path}: {source}")]
    Artifact {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse model artifact {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("model artifact has feature schema v{found}, this build supports v{supported}")]
    SchemaVersion { found: u32, supported: u32 },
    #[error("model produced a non-finite probability for student {id_estudiante}")]
    NonFinite { id_estudiante: String },
}

/// The exact feature vector the classifier consumes, mapped explicitly from
/// a stored record rather than reflected off the persistence schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringFeatures {
    pub id_estudiante: String,
    pub promedio_semestral: f64,
    pub num_materias_cursadas: f64,
    pub num_materias_reprobadas: f64,
    pub edad: f64,
    pub es_foraneo: f64,
    pub experiencia_laboral: f64,
    pub pago_tardio: f64,
    pub dias_retraso_pago: f64,
    pub antiguedad_estudiante: f64,
    pub diferencia_promedio_anterior: f64,
    pub num_est_economico: f64,
    pub num_grupo_fam: f64,
    pub posicion_hermanos: f64,
}

impl ScoringFeatures {
    /// Missing numerics read as zero, consistent with the enrichment
    /// fill-zero pass.
    pub fn from_record(record: &StudentPeriod) -> Self {
        let f = |v: Option<f64>| v.unwrap_or(0.0);
        let i = |v: Option<i64>| v.unwrap_or(0) as f64;
        ScoringFeatures {
            id_estudiante: record.id_estudiante.clone(),
            promedio_semestral: f(record.promedio_semestral),
            num_materias_cursadas: i(record.num_materias_cursadas),
            num_materias_reprobadas: i(record.num_materias_reprobadas),
            edad: i(record.edad),
            es_foraneo: i(record.es_foraneo),
            experiencia_laboral: i(record.experiencia_laboral),
            pago_tardio: i(record.pago_tardio),
            dias_retraso_pago: i(record.dias_retraso_pago),
            antiguedad_estudiante: i(record.antiguedad_estudiante),
            diferencia_promedio_anterior: f(record.diferencia_promedio_anterior),
            num_est_economico: i(record.num_est_economico),
            num_grupo_fam: i(record.num_grupo_fam),
            posicion_hermanos: i(record.posicion_hermanos),
        }
    }

    fn value(&self, name: &str) -> Option<f64> {
        match name {
            "promedio_semestral" => Some(self.promedio_semestral),
            "num_materias_cursadas" => Some(self.num_materias_cursadas),
            "num_materias_reprobadas" => Some(self.num_materias_reprobadas),
            "edad" => Some(self.edad),
            "es_foraneo" => Some(self.es_foraneo),
            "experiencia_laboral" => Some(self.experiencia_laboral),
            "pago_tardio" => Some(self.pago_tardio),
            "dias_retraso_pago" => Some(self.dias_retraso_pago),
            "antiguedad_estudiante" => Some(self.antiguedad_estudiante),
            "diferencia_promedio_anterior" => Some(self.diferencia_promedio_anterior),
            "num_est_economico" => Some(self.num_est_economico),
            "num_grupo_fam" => Some(self.num_grupo_fam),
            "posicion_hermanos" => Some(self.posicion_hermanos),
            _ => None,
        }
    }
}

/// The opaque scoring collaborator: features in, dropout probability out.
/// Per-student failures are isolated by the batch driver.
pub trait Scorer {
    fn score(&self, features: &ScoringFeatures) -> Result<f64, ScoreError>;
}

#[derive(Debug, Deserialize)]
struct ModelArtifact {
    schema_version: u32,
    bias: f64,
    weights: HashMap<String, f64>,
}

/// Pre-trained logistic model loaded once at startup from a JSON artifact
/// and passed by reference to every caller.
#[derive(Debug, Clone)]
pub struct LogisticScorer {
    bias: f64,
    weights: HashMap<String, f64>,
}

impl LogisticScorer {
    pub fn from_path(path: &Path) -> Result<Self, ScoreError> {
        let text = fs::read_to_string(path).map_err(|source| ScoreError::Artifact {
            path: path.display().to_string(),
            source,
        })?;
        let artifact: ModelArtifact =
            serde_json::from_str(&text).map_err(|source| ScoreError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        if artifact.schema_version != FEATURE_SCHEMA_VERSION {
            return Err(ScoreError::SchemaVersion {
                found: artifact.schema_version,
                supported: FEATURE_SCHEMA_VERSION,
            });
        }
        info!(
            path = %path.display(),
            weights = artifact.weights.len(),
            "scoring model loaded"
        );
        Ok(LogisticScorer {
            bias: artifact.bias,
            weights: artifact.weights,
        })
    }

    #[cfg(test)]
    pub fn from_parts(bias: f64, weights: HashMap<String, f64>) -> Self {
        LogisticScorer { bias, weights }
    }
}

impl Scorer for LogisticScorer {
    fn score(&self, features: &ScoringFeatures) -> Result<f64, ScoreError> {
        // Features are aligned onto the model's weight names; anything the
        // record lacks contributes zero, extra record fields are ignored.
        let mut z = self.bias;
        for (name, weight) in &self.weights {
            z += weight * features.value(name).unwrap_or(0.0);
        }
        let probability = 1.0 / (1.0 + (-z).exp());
        if !probability.is_finite() {
            return Err(ScoreError::NonFinite {
                id_estudiante: features.id_estudiante.clone(),
            });
        }
        Ok(probability)
    }
}
