use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::metrics::Summary;
use crate::pipeline::PipelineOutput;

pub const FEATURES_FILE: &str = "features.jsonl";
pub const BACKTEST_FILE: &str = "backtest.jsonl";
pub const SUMMARY_FILE: &str = "summary.json";

/// Feature and position columns of a single bar. Missing values serialize as null.
#[derive(Debug, Serialize)]
struct FeatureRow {
    ts: DateTime<Utc>,
    log_y: f64,
    log_x: f64,
    beta: Option<f64>,
    spread: Option<f64>,
    z: Option<f64>,
    coint_p: Option<f64>,
    tradable: bool,
    vol_scale: f64,
    raw_position: i8,
    filtered_position: i8,
    position: i8,
}

fn feature_rows(output: &PipelineOutput) -> impl Iterator<Item = FeatureRow> + '_ {
    let f = &output.features;
    let p = &output.positions;
    (0..f.len()).map(move |t| FeatureRow {
        ts: f.timestamps[t],
        log_y: f.ly[t],
        log_x: f.lx[t],
        beta: f.beta[t],
        spread: f.spread[t],
        z: f.z[t],
        coint_p: f.coint_p[t],
        tradable: f.tradable[t],
        vol_scale: f.vol_scale[t],
        raw_position: p.raw[t].signum(),
        filtered_position: p.filtered[t].signum(),
        position: p.capped[t].signum(),
    })
}

fn write_jsonl<T, I>(path: &Path, rows: I) -> Result<usize>
where
    T: Serialize,
    I: IntoIterator<Item = T>,
{
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut written = 0;
    for row in rows {
        let line = serde_json::to_string(&row)?;
        writeln!(writer, "{line}")?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}

/// Writes run artifacts into one results directory.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    dir: PathBuf,
}

impl ReportWriter {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write(&self, output: &PipelineOutput, summary: &Summary) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let features = write_jsonl(&self.dir.join(FEATURES_FILE), feature_rows(output))?;
        let bars = write_jsonl(&self.dir.join(BACKTEST_FILE), &output.backtest.rows)?;

        let summary_path = self.dir.join(SUMMARY_FILE);
        let payload = serde_json::to_string_pretty(summary)?;
        fs::write(&summary_path, payload)
            .with_context(|| format!("failed to write {}", summary_path.display()))?;

        log::info!(
            "[REPORT] wrote {} feature rows and {} backtest rows to {}",
            features,
            bars,
            self.dir.display()
        );
        Ok(())
    }
}
