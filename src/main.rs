use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

mod batch;
mod db;
mod enrich;
mod loader;
mod models;
mod report;
mod scoring;
mod tabular;
mod validate;

#[derive(Parser)]
#[command(name = "dropout-warning")]
#[command(
    about = "Student dropout early-warning pipeline: ingest institutional reports, score risk, validate predictions",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Process one period's reports and score every retained student
    Process {
        /// Target period token, e.g. 2025A
        #[arg(long)]
        period: String,
        #[arg(long)]
        caracterizacion: PathBuf,
        #[arg(long)]
        notas: PathBuf,
        #[arg(long)]
        pagos: Option<PathBuf>,
        #[arg(long)]
        discapacidad: Option<PathBuf>,
        /// Pre-trained scoring model artifact (JSON)
        #[arg(long)]
        model: PathBuf,
        #[arg(long, default_value_t = scoring::DEFAULT_UMBRAL)]
        threshold: f64,
    },
    /// Validate stored predictions against a confirmed-continuing roster
    Validate {
        #[arg(long)]
        period: String,
        /// CSV or spreadsheet with cedula and est_alum columns
        #[arg(long)]
        roster: PathBuf,
        #[arg(long, default_value_t = scoring::DEFAULT_UMBRAL)]
        threshold: f64,
        #[arg(long, default_value = "validation-report.md")]
        out: PathBuf,
    },
    /// List the highest-risk students of a period
    Top {
        /// Defaults to the most recent stored period
        #[arg(long)]
        period: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: i64,
        #[arg(long, default_value_t = scoring::DEFAULT_UMBRAL)]
        threshold: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "sqlite://dropout_warning.db?mode=rwc".to_string());
    let options = SqliteConnectOptions::from_str(&database_url)
        .context("DATABASE_URL is not a valid sqlite URL")?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("failed to open the record store")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Process {
            period,
            caracterizacion,
            notas,
            pagos,
            discapacidad,
            model,
            threshold,
        } => {
            let periodo: models::Periodo = period.parse()?;
            let scorer = scoring::LogisticScorer::from_path(&model)?;
            let files = batch::BatchFiles {
                caracterizacion,
                notas,
                pagos,
                discapacidad,
            };
            let summary = batch::run_batch(&pool, &scorer, &files, &periodo).await?;
            println!(
                "Processed period {}: {} records stored ({} stale rows replaced, {} students excluded).",
                summary.periodo,
                summary.registros,
                summary.registros_previos_borrados,
                summary.excluidos
            );
            println!(
                "Scored {} students ({} scoring failures).",
                summary.calificados, summary.fallos_scoring
            );
            let at_risk = db::count_at_risk(&pool, &summary.periodo, threshold).await?;
            println!("At risk at threshold {threshold:.3}: {at_risk}.");
        }
        Commands::Validate {
            period,
            roster,
            threshold,
            out,
        } => {
            let ids_activos = validate::load_continuation_set(&roster)?;
            let result = validate::validate_period(&pool, &period, &ids_activos, threshold).await?;
            println!(
                "Period {}: precision {:.1}%, recall {:.1}% over {} students ({} real attritions).",
                result.periodo,
                result.precision,
                result.recall,
                result.total_evaluados,
                result.total_deserciones_reales
            );
            std::fs::write(&out, report::build_validation_report(&result))?;
            println!("Report written to {}.", out.display());
        }
        Commands::Top {
            period,
            limit,
            threshold,
        } => {
            let period = match period {
                Some(p) => p,
                None => db::latest_period(&pool)
                    .await?
                    .context("the record store has no processed periods yet")?,
            };
            let records = db::fetch_top_risk(&pool, &period, limit).await?;
            if records.is_empty() {
                println!("No records stored for period {period}.");
                return Ok(());
            }
            let at_risk = db::count_at_risk(&pool, &period, threshold).await?;
            println!("Top students by dropout risk for {period} ({at_risk} at or above {threshold:.3}):");
            for record in &records {
                match record.riesgo_porcentaje() {
                    Some(pct) => println!(
                        "- {} risk {:.1}% (avg {:.2}, failed {}, tenure {} semesters)",
                        record.id_estudiante,
                        pct,
                        record.promedio_semestral.unwrap_or(0.0),
                        record.num_materias_reprobadas.unwrap_or(0),
                        record.antiguedad_estudiante.unwrap_or(0)
                    ),
                    None => println!("- {} not scored", record.id_estudiante),
                }
            }
        }
    }

    Ok(())
}
