//! Per-experiment results table, the ntuple-equivalent record.
//!
//! One CSV row per experiment: fit status, every parameter's final and
//! generated value, and, for parameters free in the fit, error, pull and
//! global correlation, plus every pairwise correlation between free
//! parameters. Columns are fixed once the global parameter set is known;
//! cells that do not apply to a given experiment (a second-stage
//! parameter that was never released, say) stay empty.

use std::fs::File;
use std::path::{Path, PathBuf};

use csv::Writer;

use dfit_core::{DfitError, ErrorInfo, FitParameter, FitStatus};

/// Append-style CSV writer for fit results.
pub struct ResultsWriter {
    path: PathBuf,
    writer: Option<Writer<File>>,
    all_names: Vec<String>,
    table_free: Vec<String>,
    finished: bool,
}

impl ResultsWriter {
    /// Creates a writer targeting `path`. The file is opened and the
    /// header written on [`ResultsWriter::begin`], once the reconciled
    /// parameter set is known.
    pub fn create(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            all_names: Vec::new(),
            table_free: Vec::new(),
            finished: false,
        }
    }

    /// Output path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fixes the column layout from the reconciled global parameter list
    /// and writes the header. Parameters declared fixed get no
    /// error/pull/correlation columns.
    pub fn begin(&mut self, params: &[FitParameter]) -> Result<(), DfitError> {
        if self.writer.is_some() {
            return Ok(());
        }
        self.all_names = params.iter().map(|p| p.name.clone()).collect();
        self.table_free = params
            .iter()
            .filter(|p| !p.fixed)
            .map(|p| p.name.clone())
            .collect();

        let file = File::create(&self.path).map_err(|err| {
            DfitError::Io(
                ErrorInfo::new("results-create", err.to_string())
                    .with_context("path", self.path.display().to_string()),
            )
        })?;
        let mut writer = Writer::from_writer(file);

        let mut header = vec![
            "expt_id".to_string(),
            "quality".to_string(),
            "nll".to_string(),
            "edm".to_string(),
        ];
        for name in &self.all_names {
            header.push(format!("{name}_value"));
            header.push(format!("{name}_gen"));
        }
        for name in &self.table_free {
            header.push(format!("{name}_err"));
            header.push(format!("{name}_neg_err"));
            header.push(format!("{name}_pos_err"));
            header.push(format!("{name}_pull"));
            header.push(format!("{name}_gcc"));
        }
        for (i, a) in self.table_free.iter().enumerate() {
            for b in self.table_free.iter().skip(i + 1) {
                header.push(format!("corr_{a}_{b}"));
            }
        }
        writer
            .write_record(&header)
            .map_err(|err| DfitError::Io(ErrorInfo::new("results-header", err.to_string())))?;
        self.writer = Some(writer);
        Ok(())
    }

    /// Appends one experiment's row. `free_names` lists the parameters
    /// free in this experiment's final fit, in the covariance row order
    /// of `status.covariance`.
    pub fn append_row(
        &mut self,
        expt_id: u32,
        status: &FitStatus,
        params: &[FitParameter],
        free_names: &[String],
    ) -> Result<(), DfitError> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            DfitError::Io(ErrorInfo::new(
                "results-not-begun",
                "append_row called before begin",
            ))
        })?;

        let lookup = |name: &str| params.iter().find(|p| p.name == name);
        let free_slot = |name: &str| free_names.iter().position(|n| n == name);

        let mut row = vec![
            expt_id.to_string(),
            status.quality.as_str().to_string(),
            format!("{:.9}", status.nll),
            format!("{:.3e}", status.edm),
        ];
        for name in &self.all_names {
            let param = lookup(name);
            row.push(param.map_or_else(String::new, |p| format!("{:.9}", p.value)));
            row.push(param.map_or_else(String::new, |p| format!("{:.9}", p.gen_value)));
        }
        for name in &self.table_free {
            match (lookup(name), free_slot(name)) {
                (Some(p), Some(_)) => {
                    row.push(format!("{:.9}", p.error));
                    row.push(format!("{:.9}", p.neg_error));
                    row.push(format!("{:.9}", p.pos_error));
                    row.push(p.pull().map_or_else(String::new, |x| format!("{x:.6}")));
                    row.push(format!("{:.6}", p.global_correlation));
                }
                // Free in the table layout but fixed in this fit.
                _ => row.extend(std::iter::repeat(String::new()).take(5)),
            }
        }
        for (i, a) in self.table_free.iter().enumerate() {
            for b in self.table_free.iter().skip(i + 1) {
                match (free_slot(a), free_slot(b)) {
                    (Some(sa), Some(sb)) => {
                        let denom =
                            (status.covariance[(sa, sa)] * status.covariance[(sb, sb)]).sqrt();
                        if denom > 0.0 {
                            row.push(format!("{:.6}", status.covariance[(sa, sb)] / denom));
                        } else {
                            row.push(String::new());
                        }
                    }
                    _ => row.push(String::new()),
                }
            }
        }
        writer
            .write_record(&row)
            .map_err(|err| DfitError::Io(ErrorInfo::new("results-row", err.to_string())))
    }

    /// Flushes the table. One-shot and idempotent.
    pub fn finish(&mut self) -> Result<(), DfitError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        if let Some(writer) = self.writer.as_mut() {
            writer
                .flush()
                .map_err(|err| DfitError::Io(ErrorInfo::new("results-flush", err.to_string())))?;
        }
        Ok(())
    }
}
