use crate::cli::AnalyzeArgs;
use crate::config::PartialAppConfig;
use crate::error::{CliError, Result};
use crate::utils::progress::CliProgressHandler;
use eqbridge::core::chemistry::AqueousEngine;
use eqbridge::engine::progress::{Progress, ProgressReporter};
use eqbridge::workflows::scaling::ScalingFlowsheet;
use tracing::info;

pub fn run(args: AnalyzeArgs) -> Result<()> {
    info!("Merging configuration from file and CLI arguments...");
    let config = PartialAppConfig::load(&args.flowsheet)?;

    let progress_handler = CliProgressHandler::new();
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());

    println!("Solving scaling flowsheet...");
    reporter.report(Progress::PhaseStart { name: "Flowsheet" });
    let mut flowsheet = ScalingFlowsheet::build(&config.scaling, AqueousEngine::new())?;
    flowsheet.initialize()?;
    let solve = flowsheet.solve()?;
    reporter.report(Progress::PhaseFinish);
    info!(
        "Flowsheet solved in {} iteration(s), residual {:.3e}.",
        solve.iterations, solve.residual_norm
    );

    let report = flowsheet.report()?;
    println!("{}", report);

    if args.show_bridges {
        let (feed, brine) = flowsheet.bridge_reports();
        println!("{}\n{}", feed, brine);
    }

    if let Some(path) = &args.output {
        let text = report
            .to_toml()
            .map_err(|e| CliError::Other(anyhow::anyhow!("Failed to serialize report: {}", e)))?;
        std::fs::write(path, text)?;
        println!("✓ Report written to: {}", path.display());
    }

    Ok(())
}
