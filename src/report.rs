use std::fmt::Write;

use crate::models::{StudentPeriod, ValidationReport};

/// Renders a validation run as markdown: aggregate metrics first, then the
/// bucket membership for audit drill-down.
pub fn build_validation_report(report: &ValidationReport) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Validation Report - Period {}", report.periodo);
    let _ = writeln!(
        output,
        "Decision threshold: {:.3} | Students evaluated: {} | Real attritions: {}",
        report.umbral, report.total_evaluados, report.total_deserciones_reales
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Metrics");
    let _ = writeln!(output, "- Precision: {:.1}%", report.precision);
    let _ = writeln!(output, "- Recall: {:.1}%", report.recall);
    let _ = writeln!(
        output,
        "- TP {} / FP {} / FN {} / TN {}",
        report.verdaderos_positivos.len(),
        report.falsos_positivos.len(),
        report.falsos_negativos.len(),
        report.verdaderos_negativos.len()
    );

    write_bucket(
        &mut output,
        "True positives (predicted risk, dropped out)",
        &report.verdaderos_positivos,
    );
    write_bucket(
        &mut output,
        "False positives (predicted risk, continued)",
        &report.falsos_positivos,
    );
    write_bucket(
        &mut output,
        "False negatives (missed, dropped out)",
        &report.falsos_negativos,
    );
    write_bucket(
        &mut output,
        "True negatives (no risk predicted, continued)",
        &report.verdaderos_negativos,
    );

    output
}

fn write_bucket(output: &mut String, title: &str, records: &[StudentPeriod]) {
    let _ = writeln!(output);
    let _ = writeln!(output, "## {title}");
    if records.is_empty() {
        let _ = writeln!(output, "None.");
        return;
    }
    for record in records {
        match record.riesgo_porcentaje() {
            Some(pct) => {
                let _ = writeln!(output, "- {} (risk {:.1}%)", record.id_estudiante, pct);
            }
            None => {
                let _ = writeln!(output, "- {} (not scored)", record.id_estudiante);
            }
        }
    }
}
