use crate::core::model::{HostModel, ModelError, VarId};
use crate::engine::error::EngineError;
use crate::engine::progress::{Progress, ProgressReporter};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("A sweep needs at least one parameter")]
    NoParameters,
    #[error("Parameter '{parameter}' has no sample values")]
    EmptySamples { parameter: String },
    #[error("Invalid samples for parameter '{parameter}': {reason}")]
    InvalidSamples { parameter: String, reason: String },
    #[error("Host model error: {0}")]
    Model(#[from] ModelError),
    #[error("Failed to write sweep results to '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// How the values of one sweep parameter are generated.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    /// `count` evenly spaced values from `start` to `stop`, both included.
    Linear { start: f64, stop: f64, count: usize },
    Predetermined(Vec<f64>),
    /// `count` values evenly spaced in log space; both ends must share a sign.
    Geometric { start: f64, stop: f64, count: usize },
    /// `count` draws from `[low, high)` with a seeded generator.
    Uniform { low: f64, high: f64, count: usize, seed: u64 },
}

impl Sample {
    pub fn values(&self, parameter: &str) -> Result<Vec<f64>, SweepError> {
        let invalid = |reason: String| SweepError::InvalidSamples {
            parameter: parameter.to_string(),
            reason,
        };
        let values = match self {
            Sample::Linear { start, stop, count } => spaced(*start, *stop, *count),
            Sample::Predetermined(values) => values.clone(),
            Sample::Geometric { start, stop, count } => {
                if !(start * stop > 0.0) {
                    return Err(invalid(format!(
                        "geometric range needs non-zero ends of equal sign, got {start} and {stop}"
                    )));
                }
                let sign = start.signum();
                spaced(start.abs().ln(), stop.abs().ln(), *count)
                    .into_iter()
                    .map(|v| sign * v.exp())
                    .collect()
            }
            Sample::Uniform { low, high, count, seed } => {
                if !(low < high) {
                    return Err(invalid(format!("empty range [{low}, {high})")));
                }
                let mut rng = StdRng::seed_from_u64(*seed);
                (0..*count).map(|_| rng.gen_range(*low..*high)).collect()
            }
        };
        if values.is_empty() {
            return Err(SweepError::EmptySamples {
                parameter: parameter.to_string(),
            });
        }
        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(invalid(format!("non-finite value {bad}")));
        }
        Ok(values)
    }
}

fn spaced(start: f64, stop: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        n => (0..n)
            .map(|i| start + (stop - start) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

/// A fixed host variable stepped through `sample`.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepParameter {
    pub name: String,
    pub variable: VarId,
    pub sample: Sample,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepOutput {
    pub name: String,
    pub variable: VarId,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SweepOptions {
    /// Fill failed rows from converged neighbours instead of leaving NaN.
    pub interpolate_nan_outputs: bool,
    pub csv_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepStatus {
    Converged,
    Failed,
}

impl fmt::Display for SweepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepStatus::Converged => write!(f, "converged"),
            SweepStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepRow {
    pub index: usize,
    pub parameters: Vec<f64>,
    pub outputs: Vec<f64>,
    pub status: SweepStatus,
    pub interpolated: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepResults {
    pub parameter_names: Vec<String>,
    pub output_names: Vec<String>,
    pub rows: Vec<SweepRow>,
}

impl SweepResults {
    pub fn converged(&self) -> usize {
        self.rows
            .iter()
            .filter(|r| r.status == SweepStatus::Converged)
            .count()
    }

    /// Values of one output column, in row order.
    pub fn output(&self, name: &str) -> Option<Vec<f64>> {
        let col = self.output_names.iter().position(|n| n == name)?;
        Some(self.rows.iter().map(|r| r.outputs[col]).collect())
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), SweepError> {
        let csv_error = |source| SweepError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;

        let mut header = vec!["index".to_string()];
        header.extend(self.parameter_names.iter().cloned());
        header.extend(self.output_names.iter().cloned());
        header.extend(["status", "interpolated", "message"].map(String::from));
        writer.write_record(&header).map_err(csv_error)?;

        for row in &self.rows {
            let mut record = vec![row.index.to_string()];
            record.extend(row.parameters.iter().map(f64::to_string));
            record.extend(row.outputs.iter().map(f64::to_string));
            record.push(row.status.to_string());
            record.push(row.interpolated.to_string());
            record.push(row.message.clone().unwrap_or_default());
            writer.write_record(&record).map_err(csv_error)?;
        }
        writer.flush().map_err(|e| csv_error(e.into()))?;
        Ok(())
    }
}

/// Runs `solve` once per point of the full-factorial parameter grid.
///
/// Each sample starts from the last converged state with its parameters
/// fixed to the sample values. A failing sample is recorded with NaN outputs
/// and the model is rolled back, so it never poisons the samples after it.
#[instrument(skip_all, name = "sweep_workflow")]
pub fn run<F>(
    model: &mut HostModel,
    parameters: &[SweepParameter],
    outputs: &[SweepOutput],
    options: &SweepOptions,
    reporter: &ProgressReporter,
    mut solve: F,
) -> Result<SweepResults, SweepError>
where
    F: FnMut(&mut HostModel, usize) -> Result<(), EngineError>,
{
    if parameters.is_empty() {
        return Err(SweepError::NoParameters);
    }
    let axes = parameters
        .iter()
        .map(|p| p.sample.values(&p.name))
        .collect::<Result<Vec<_>, _>>()?;
    let grid = factorial(&axes);
    info!(
        parameters = parameters.len(),
        samples = grid.len(),
        "Starting parameter sweep"
    );

    reporter.report(Progress::PhaseStart { name: "Sweep" });
    reporter.report(Progress::TaskStart {
        total_steps: grid.len() as u64,
    });

    let mut last_good = model.snapshot();
    let mut rows = Vec::with_capacity(grid.len());
    for (index, point) in grid.into_iter().enumerate() {
        model.restore(&last_good);
        for (parameter, value) in parameters.iter().zip(&point) {
            model.fix(parameter.variable, *value)?;
        }

        let row = match solve(&mut *model, index) {
            Ok(()) => {
                let values = outputs
                    .iter()
                    .map(|o| model.value(o.variable))
                    .collect::<Result<Vec<_>, _>>()?;
                last_good = model.snapshot();
                SweepRow {
                    index,
                    parameters: point,
                    outputs: values,
                    status: SweepStatus::Converged,
                    interpolated: false,
                    message: None,
                }
            }
            Err(e) => {
                warn!(index, error = %e, "Sweep sample failed");
                SweepRow {
                    index,
                    parameters: point,
                    outputs: vec![f64::NAN; outputs.len()],
                    status: SweepStatus::Failed,
                    interpolated: false,
                    message: Some(e.to_string()),
                }
            }
        };
        reporter.report(Progress::SampleFinished {
            index,
            converged: row.status == SweepStatus::Converged,
        });
        rows.push(row);
    }
    model.restore(&last_good);
    reporter.report(Progress::TaskFinish);
    reporter.report(Progress::PhaseFinish);

    if options.interpolate_nan_outputs {
        fill_failed_rows(&mut rows, &axes);
    }

    let results = SweepResults {
        parameter_names: parameters.iter().map(|p| p.name.clone()).collect(),
        output_names: outputs.iter().map(|o| o.name.clone()).collect(),
        rows,
    };
    info!(
        converged = results.converged(),
        failed = results.rows.len() - results.converged(),
        "Parameter sweep complete"
    );
    if let Some(path) = &options.csv_path {
        results.write_csv(path)?;
        info!("Sweep results written to {}", path.display());
    }
    Ok(results)
}

/// Cartesian product of the axes; the last axis varies fastest.
fn factorial(axes: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let mut grid = vec![Vec::with_capacity(axes.len())];
    for axis in axes {
        grid = grid
            .into_iter()
            .flat_map(|prefix| {
                axis.iter().map(move |v| {
                    let mut point = prefix.clone();
                    point.push(*v);
                    point
                })
            })
            .collect();
    }
    grid
}

/// Linear interpolation along a single parameter, nearest converged
/// neighbour in range-normalized parameter space otherwise.
fn fill_failed_rows(rows: &mut [SweepRow], axes: &[Vec<f64>]) {
    let good: Vec<usize> = (0..rows.len())
        .filter(|&i| rows[i].status == SweepStatus::Converged)
        .collect();
    if good.is_empty() {
        warn!("No converged samples; failed rows are left as NaN");
        return;
    }
    let spans: Vec<f64> = axes
        .iter()
        .map(|axis| {
            let (lo, hi) = axis
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
            if hi > lo { hi - lo } else { 1.0 }
        })
        .collect();

    let failed: Vec<usize> = (0..rows.len())
        .filter(|&i| rows[i].status == SweepStatus::Failed)
        .collect();
    for i in failed {
        let filled = if axes.len() == 1 {
            interpolate_1d(rows, &good, rows[i].parameters[0])
        } else {
            let target = &rows[i].parameters;
            good.iter()
                .min_by(|&&a, &&b| {
                    let da = distance(&rows[a].parameters, target, &spans);
                    let db = distance(&rows[b].parameters, target, &spans);
                    da.total_cmp(&db)
                })
                .map(|&j| rows[j].outputs.clone())
        };
        if let Some(values) = filled {
            rows[i].outputs = values;
            rows[i].interpolated = true;
        }
    }
}

fn interpolate_1d(rows: &[SweepRow], good: &[usize], x: f64) -> Option<Vec<f64>> {
    let below = good
        .iter()
        .filter(|&&j| rows[j].parameters[0] <= x)
        .max_by(|&&a, &&b| rows[a].parameters[0].total_cmp(&rows[b].parameters[0]));
    let above = good
        .iter()
        .filter(|&&j| rows[j].parameters[0] >= x)
        .min_by(|&&a, &&b| rows[a].parameters[0].total_cmp(&rows[b].parameters[0]));
    match (below, above) {
        (Some(&lo), Some(&hi)) => {
            let (x0, x1) = (rows[lo].parameters[0], rows[hi].parameters[0]);
            let t = if x1 > x0 { (x - x0) / (x1 - x0) } else { 0.0 };
            Some(
                rows[lo]
                    .outputs
                    .iter()
                    .zip(&rows[hi].outputs)
                    .map(|(y0, y1)| y0 + t * (y1 - y0))
                    .collect(),
            )
        }
        (Some(&j), None) | (None, Some(&j)) => Some(rows[j].outputs.clone()),
        (None, None) => None,
    }
}

fn distance(a: &[f64], b: &[f64], spans: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .zip(spans)
        .map(|((x, y), s)| ((x - y) / s).powi(2))
        .sum()
}
