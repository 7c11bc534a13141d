//! Run exports: the audit CSV and a PDF report.

mod pdf;

pub use pdf::render_pdf;

use thiserror::Error;

use crate::core::ScenarioResult;
use crate::store::RunRow;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("CSV write error: {0}")]
    Csv(#[from] csv::Error),
    #[error("CSV buffer error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF write error: {0}")]
    Pdf(#[from] lopdf::Error),
}

/// Render the audit CSV for a run. One row per result cell, in stored
/// (evaluation) order; ERROR cells leave the numeric columns empty.
pub fn render_csv(run: &RunRow, results: &[ScenarioResult]) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "adoption_rate",
        "contribution_rate",
        "nhce_acp",
        "hce_acp",
        "threshold",
        "margin",
        "result",
        "limiting_test",
        "seed",
        "run_timestamp",
        "engine_version",
        "error",
    ])?;

    for result in results {
        let metrics = result.metrics.as_ref();
        writer.write_record([
            fmt3(result.adoption_rate),
            fmt3(result.contribution_rate),
            opt3(metrics.map(|m| m.nhce_acp)),
            opt3(metrics.map(|m| m.hce_acp)),
            opt3(metrics.map(|m| m.max_allowed_acp)),
            opt3(metrics.map(|m| m.margin)),
            result.status.as_str().to_string(),
            metrics
                .map(|m| m.binding_rule.as_str().to_string())
                .unwrap_or_default(),
            result.seed.to_string(),
            run.started_at.clone(),
            run.engine_version.clone(),
            result.error.clone().unwrap_or_default(),
        ])?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| ExportError::Io(e.into_error()))?;
    Ok(bytes)
}

/// Rounding to three decimals happens only at export time; engine values
/// stay full precision.
fn fmt3(value: f64) -> String {
    format!("{value:.3}")
}

fn opt3(value: Option<f64>) -> String {
    value.map(fmt3).unwrap_or_default()
}
