use crate::cli::SweepArgs;
use crate::config::PartialAppConfig;
use crate::error::{CliError, Result};
use crate::utils::progress::CliProgressHandler;
use eqbridge::core::chemistry::AqueousEngine;
use eqbridge::engine::progress::ProgressReporter;
use eqbridge::workflows::scaling::ScalingFlowsheet;
use eqbridge::workflows::sweep::{Sample, SweepOptions};
use tracing::{info, warn};

pub fn run(args: SweepArgs) -> Result<()> {
    info!("Merging configuration from file and CLI arguments...");
    let config = PartialAppConfig::load(&args.flowsheet)?;
    let plan = config.sweep;

    let start = args.start.unwrap_or(plan.start);
    let stop = args.stop.unwrap_or(plan.stop);
    if !(0.0..1.0).contains(&start) || !(0.0..1.0).contains(&stop) {
        return Err(CliError::Argument(format!(
            "Water recovery must lie in [0, 1), got {} to {}",
            start, stop
        )));
    }
    let sample = Sample::Linear {
        start,
        stop,
        count: args.count.unwrap_or(plan.count),
    };
    let options = SweepOptions {
        interpolate_nan_outputs: args.interpolate || plan.interpolate_nan_outputs,
        csv_path: Some(args.output.clone()),
    };

    let progress_handler = CliProgressHandler::new();
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());

    println!("Initializing scaling flowsheet...");
    let mut flowsheet = ScalingFlowsheet::build(&config.scaling, AqueousEngine::new())?;
    flowsheet.initialize()?;

    info!("Invoking the water recovery sweep...");
    let results = flowsheet.run_recovery_sweep(sample, &options, &reporter)?;

    let failed = progress_handler.failed_samples();
    if failed > 0 {
        warn!("{} of {} sample(s) did not converge.", failed, results.rows.len());
    }
    println!(
        "✓ {}/{} sample(s) converged. Results written to: {}",
        results.converged(),
        results.rows.len(),
        args.output.display()
    );

    Ok(())
}
