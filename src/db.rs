use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{IngestionBatch, StudentPeriod};

pub async fn init_db(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Full overwrite of all non-key fields for (id_estudiante, periodo);
/// re-processing a period replaces rows instead of duplicating them.
pub async fn upsert_student_period(
    pool: &SqlitePool,
    record: &StudentPeriod,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO student_periods (
            id_estudiante, periodo, promedio_semestral, num_materias_cursadas,
            num_materias_reprobadas, edad, genero, estado_civil, etnia,
            programa, periodo_ingreso, num_est_economico, num_grupo_fam,
            posicion_hermanos, es_foraneo, experiencia_laboral, pago_tardio,
            dias_retraso_pago, antiguedad_estudiante,
            diferencia_promedio_anterior, discapacidad, est_alum,
            ultima_prob_riesgo
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21, $22, $23)
        ON CONFLICT (id_estudiante, periodo) DO UPDATE SET
            promedio_semestral = excluded.promedio_semestral,
            num_materias_cursadas = excluded.num_materias_cursadas,
            num_materias_reprobadas = excluded.num_materias_reprobadas,
            edad = excluded.edad,
            genero = excluded.genero,
            estado_civil = excluded.estado_civil,
            etnia = excluded.etnia,
            programa = excluded.programa,
            periodo_ingreso = excluded.periodo_ingreso,
            num_est_economico = excluded.num_est_economico,
            num_grupo_fam = excluded.num_grupo_fam,
            posicion_hermanos = excluded.posicion_hermanos,
            es_foraneo = excluded.es_foraneo,
            experiencia_laboral = excluded.experiencia_laboral,
            pago_tardio = excluded.pago_tardio,
            dias_retraso_pago = excluded.dias_retraso_pago,
            antiguedad_estudiante = excluded.antiguedad_estudiante,
            diferencia_promedio_anterior = excluded.diferencia_promedio_anterior,
            discapacidad = excluded.discapacidad,
            est_alum = excluded.est_alum,
            ultima_prob_riesgo = excluded.ultima_prob_riesgo
        "#,
    )
    .bind(&record.id_estudiante)
    .bind(&record.periodo)
    .bind(record.promedio_semestral)
    .bind(record.num_materias_cursadas)
    .bind(record.num_materias_reprobadas)
    .bind(record.edad)
    .bind(&record.genero)
    .bind(&record.estado_civil)
    .bind(&record.etnia)
    .bind(&record.programa)
    .bind(&record.periodo_ingreso)
    .bind(record.num_est_economico)
    .bind(record.num_grupo_fam)
    .bind(record.posicion_hermanos)
    .bind(record.es_foraneo)
    .bind(record.experiencia_laboral)
    .bind(record.pago_tardio)
    .bind(record.dias_retraso_pago)
    .bind(record.antiguedad_estudiante)
    .bind(record.diferencia_promedio_anterior)
    .bind(&record.discapacidad)
    .bind(&record.est_alum)
    .bind(record.ultima_prob_riesgo)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn set_probability(
    pool: &SqlitePool,
    id_estudiante: &str,
    periodo: &str,
    probability: f64,
) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE student_periods SET ultima_prob_riesgo = $1 \
         WHERE id_estudiante = $2 AND periodo = $3",
    )
    .bind(probability)
    .bind(id_estudiante)
    .bind(periodo)
    .execute(pool)
    .await?;
    Ok(())
}

/// Removes every record of a period ahead of reprocessing.
pub async fn delete_period(pool: &SqlitePool, periodo: &str) -> anyhow::Result<u64> {
    let result = sqlx::query("DELETE FROM student_periods WHERE periodo = $1")
        .bind(periodo)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn fetch_period(
    pool: &SqlitePool,
    periodo: &str,
) -> anyhow::Result<Vec<StudentPeriod>> {
    let rows = sqlx::query(
        "SELECT * FROM student_periods WHERE periodo = $1 ORDER BY id_estudiante",
    )
    .bind(periodo)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_record).collect())
}

pub async fn fetch_one(
    pool: &SqlitePool,
    id_estudiante: &str,
    periodo: &str,
) -> anyhow::Result<Option<StudentPeriod>> {
    let row = sqlx::query(
        "SELECT * FROM student_periods WHERE id_estudiante = $1 AND periodo = $2",
    )
    .bind(id_estudiante)
    .bind(periodo)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(row_to_record))
}

pub async fn fetch_top_risk(
    pool: &SqlitePool,
    periodo: &str,
    limit: i64,
) -> anyhow::Result<Vec<StudentPeriod>> {
    let rows = sqlx::query(
        "SELECT * FROM student_periods WHERE periodo = $1 \
         ORDER BY ultima_prob_riesgo DESC NULLS LAST, id_estudiante LIMIT $2",
    )
    .bind(periodo)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_record).collect())
}

pub async fn count_at_risk(
    pool: &SqlitePool,
    periodo: &str,
    umbral: f64,
) -> anyhow::Result<i64> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS n FROM student_periods \
         WHERE periodo = $1 AND ultima_prob_riesgo >= $2",
    )
    .bind(periodo)
    .bind(umbral)
    .fetch_one(pool)
    .await?;
    Ok(row.get("n"))
}

/// Most recent period present in the store, by token ordering (YYYYS sorts
/// chronologically).
pub async fn latest_period(pool: &SqlitePool) -> anyhow::Result<Option<String>> {
    let row = sqlx::query(
        "SELECT periodo FROM student_periods ORDER BY periodo DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.get("periodo")))
}

pub async fn insert_batch(pool: &SqlitePool, batch: &IngestionBatch) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ingestion_batches
        (id, periodo, fecha_carga, reporte_caracterizacion, reporte_notas,
         reporte_pagos, reporte_discapacidad, procesado)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(batch.id.to_string())
    .bind(&batch.periodo)
    .bind(batch.fecha_carga)
    .bind(&batch.reporte_caracterizacion)
    .bind(&batch.reporte_notas)
    .bind(&batch.reporte_pagos)
    .bind(&batch.reporte_discapacidad)
    .bind(batch.procesado)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_batch_processed(pool: &SqlitePool, id: Uuid) -> anyhow::Result<()> {
    sqlx::query("UPDATE ingestion_batches SET procesado = 1 WHERE id = $1")
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

fn row_to_record(row: &SqliteRow) -> StudentPeriod {
    StudentPeriod {
        id_estudiante: row.get("id_estudiante"),
        periodo: row.get("periodo"),
        promedio_semestral: row.get("promedio_semestral"),
        num_materias_cursadas: row.get("num_materias_cursadas"),
        num_materias_reprobadas: row.get("num_materias_reprobadas"),
        edad: row.get("edad"),
        genero: row.get("genero"),
        estado_civil: row.get("estado_civil"),
        etnia: row.get("etnia"),
        programa: row.get("programa"),
        periodo_ingreso: row.get("periodo_ingreso"),
        num_est_economico: row.get("num_est_economico"),
        num_grupo_fam: row.get("num_grupo_fam"),
        posicion_hermanos: row.get("posicion_hermanos"),
        es_foraneo: row.get("es_foraneo"),
        experiencia_laboral: row.get("experiencia_laboral"),
        pago_tardio: row.get("pago_tardio"),
        dias_retraso_pago: row.get("dias_retraso_pago"),
        antiguedad_estudiante: row.get("antiguedad_estudiante"),
        diferencia_promedio_anterior: row.get("diferencia_promedio_anterior"),
        discapacidad: row.get("discapacidad"),
        est_alum: row.get("est_alum"),
        ultima_prob_riesgo: row.get("ultima_prob_riesgo"),
    }
}

#[cfg(test)]
pub async fn memory_pool() -> SqlitePool {
    use sqlx::sqlite::SqlitePoolOptions;

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    init_db(&pool).await.expect("schema");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: &str, periodo: &str) -> StudentPeriod {
        StudentPeriod {
            id_estudiante: id.to_string(),
            periodo: periodo.to_string(),
            promedio_semestral: Some(3.2),
            num_materias_cursadas: Some(5),
            num_materias_reprobadas: Some(1),
            es_foraneo: Some(0),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn upsert_overwrites_instead_of_duplicating() {
        let pool = memory_pool().await;

        let mut rec = record("10", "2025A");
        upsert_student_period(&pool, &rec).await.unwrap();
        rec.promedio_semestral = Some(2.1);
        rec.ultima_prob_riesgo = Some(0.8);
        upsert_student_period(&pool, &rec).await.unwrap();

        let stored = fetch_period(&pool, "2025A").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].promedio_semestral, Some(2.1));
        assert_eq!(stored[0].ultima_prob_riesgo, Some(0.8));
    }

    #[tokio::test]
    async fn delete_period_only_touches_that_period() {
        let pool = memory_pool().await;
        upsert_student_period(&pool, &record("10", "2025A")).await.unwrap();
        upsert_student_period(&pool, &record("11", "2025A")).await.unwrap();
        upsert_student_period(&pool, &record("10", "2024B")).await.unwrap();

        let deleted = delete_period(&pool, "2025A").await.unwrap();
        assert_eq!(deleted, 2);
        assert!(fetch_period(&pool, "2025A").await.unwrap().is_empty());
        assert_eq!(fetch_period(&pool, "2024B").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn probability_update_reaches_the_same_record() {
        let pool = memory_pool().await;
        upsert_student_period(&pool, &record("10", "2025A")).await.unwrap();

        set_probability(&pool, "10", "2025A", 0.62).await.unwrap();
        let stored = fetch_one(&pool, "10", "2025A").await.unwrap().unwrap();
        assert_eq!(stored.ultima_prob_riesgo, Some(0.62));
    }

    #[tokio::test]
    async fn risk_reads_filter_and_order() {
        let pool = memory_pool().await;
        for (id, prob) in [("10", Some(0.9)), ("11", Some(0.2)), ("12", None)] {
            let mut rec = record(id, "2025A");
            rec.ultima_prob_riesgo = prob;
            upsert_student_period(&pool, &rec).await.unwrap();
        }

        let top = fetch_top_risk(&pool, "2025A", 2).await.unwrap();
        assert_eq!(top[0].id_estudiante, "10");
        assert_eq!(top[1].id_estudiante, "11");

        assert_eq!(count_at_risk(&pool, "2025A", 0.515).await.unwrap(), 1);
        assert_eq!(latest_period(&pool).await.unwrap().as_deref(), Some("2025A"));
    }

    #[tokio::test]
    async fn batch_bookkeeping_round_trip() {
        let pool = memory_pool().await;
        let batch = IngestionBatch {
            id: Uuid::new_v4(),
            periodo: "2025A".to_string(),
            fecha_carga: Utc::now().naive_utc(),
            reporte_caracterizacion: "caracterizacion.csv".to_string(),
            reporte_notas: "notas.csv".to_string(),
            reporte_pagos: None,
            reporte_discapacidad: None,
            procesado: false,
        };
        insert_batch(&pool, &batch).await.unwrap();
        mark_batch_processed(&pool, batch.id).await.unwrap();

        let row = sqlx::query("SELECT procesado FROM ingestion_batches WHERE id = $1")
            .bind(batch.id.to_string())
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("procesado"), 1);
    }
}
