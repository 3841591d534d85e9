use crate::cli::FlowsheetArgs;
use crate::error::{CliError, Result};
use eqbridge::core::chemistry::{ActivityModel, OutputKey};
use eqbridge::core::solver::SolverOptions;
use eqbridge::engine::config::{
    BridgeConfigBuilder, DEFAULT_FD_STEP, DerivativeMode, RelinearizationPolicy,
};
use eqbridge::workflows::scaling::{ScalingConfig, SeawaterFeed};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

const DEFAULT_THRESHOLD: f64 = 1.0e-3;
const DEFAULT_FLOOR: f64 = 1.0e-8;
const DEFAULT_SWEEP_START: f64 = 0.5;
const DEFAULT_SWEEP_STOP: f64 = 0.7;
const DEFAULT_SWEEP_COUNT: usize = 11;

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PartialFeedConfig {
    /// K
    temperature: Option<f64>,
    /// Pa
    pressure: Option<f64>,
    ph: Option<f64>,
    /// kg/s
    water_flow: Option<f64>,
    /// mg/L per host species label; replaces the standard seawater set.
    concentrations: Option<BTreeMap<String, f64>>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PartialBridgeConfig {
    activity_model: Option<String>,
    derivatives: Option<String>,
    fd_step: Option<f64>,
    relinearization: Option<String>,
    threshold: Option<f64>,
    floor: Option<f64>,
    every_n: Option<usize>,
    retry_with_fallback: Option<bool>,
    dissolve_species: Option<bool>,
    /// Characteristic magnitude per output key, e.g. `"scalingTendency[Calcite]" = 1.0`.
    scaling: Option<BTreeMap<String, f64>>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PartialProcessConfig {
    water_recovery: Option<f64>,
    minerals: Option<Vec<String>>,
    phases: Option<Vec<String>>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PartialSolverConfig {
    tolerance: Option<f64>,
    max_iterations: Option<usize>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct PartialSweepConfig {
    start: Option<f64>,
    stop: Option<f64>,
    count: Option<usize>,
    interpolate_nan_outputs: Option<bool>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct PartialAppConfig {
    feed: Option<PartialFeedConfig>,
    bridge: Option<PartialBridgeConfig>,
    process: Option<PartialProcessConfig>,
    solver: Option<PartialSolverConfig>,
    sweep: Option<PartialSweepConfig>,
}

/// Sweep settings from the config file, before command-line overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    pub start: f64,
    pub stop: f64,
    pub count: usize,
    pub interpolate_nan_outputs: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub scaling: ScalingConfig,
    pub sweep: SweepPlan,
}

impl PartialAppConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from file: {:?}", path);
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CliError::FileParsing {
            path: path.to_path_buf(),
            source: e.into(),
        })
    }

    /// Reads the optional config file named in `args` and resolves it against
    /// the command line.
    pub fn load(args: &FlowsheetArgs) -> Result<AppConfig> {
        let partial = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        partial.merge_with_cli(args)
    }

    pub fn merge_with_cli(mut self, args: &FlowsheetArgs) -> Result<AppConfig> {
        self.apply_set_values(&args.set_values)?;

        let feed = Self::merge_feed(self.feed.take().unwrap_or_default());
        let bridge_file = self.bridge.take().unwrap_or_default();
        let process = self.process.take().unwrap_or_default();
        let solver = self.solver.take().unwrap_or_default();
        let sweep = self.sweep.take().unwrap_or_default();

        let defaults = ScalingConfig::default();
        let dissolve_species_in_reaktoro = bridge_file
            .dissolve_species
            .unwrap_or(defaults.dissolve_species_in_reaktoro);
        let activity_model = match args
            .activity_model
            .as_deref()
            .or(bridge_file.activity_model.as_deref())
        {
            Some(name) => {
                ActivityModel::from_str(name).map_err(|e| CliError::Config(e.to_string()))?
            }
            None => ActivityModel::default(),
        };

        let mut builder = BridgeConfigBuilder::new()
            .activity_model(activity_model)
            .relinearization(Self::merge_relinearization(&bridge_file)?)
            .derivatives(Self::merge_derivatives(
                args.finite_difference,
                &bridge_file,
            )?)
            .retry_with_fallback(bridge_file.retry_with_fallback.unwrap_or(true));
        for (key, magnitude) in bridge_file.scaling.unwrap_or_default() {
            let key = key
                .parse::<OutputKey>()
                .map_err(|e| CliError::Config(e.to_string()))?;
            builder = builder.user_scaling(key, magnitude);
        }
        let bridge = builder
            .build()
            .map_err(|e| CliError::Config(e.to_string()))?;

        let solver_defaults = SolverOptions::default();
        let scaling = ScalingConfig {
            feed,
            water_recovery: args
                .water_recovery
                .or(process.water_recovery)
                .unwrap_or(defaults.water_recovery),
            minerals: process.minerals.unwrap_or(defaults.minerals),
            phases: process.phases.unwrap_or(defaults.phases),
            dissolve_species_in_reaktoro,
            bridge,
            solver: SolverOptions {
                tolerance: solver.tolerance.unwrap_or(solver_defaults.tolerance),
                max_iterations: solver
                    .max_iterations
                    .unwrap_or(solver_defaults.max_iterations),
                ..solver_defaults
            },
        };

        let sweep = SweepPlan {
            start: sweep.start.unwrap_or(DEFAULT_SWEEP_START),
            stop: sweep.stop.unwrap_or(DEFAULT_SWEEP_STOP),
            count: sweep.count.unwrap_or(DEFAULT_SWEEP_COUNT),
            interpolate_nan_outputs: sweep.interpolate_nan_outputs.unwrap_or(false),
        };
        Ok(AppConfig { scaling, sweep })
    }

    fn merge_feed(partial: PartialFeedConfig) -> SeawaterFeed {
        let standard = SeawaterFeed::standard();
        SeawaterFeed {
            temperature_k: partial.temperature.unwrap_or(standard.temperature_k),
            pressure_pa: partial.pressure.unwrap_or(standard.pressure_pa),
            ph: partial.ph.unwrap_or(standard.ph),
            water_flow: partial.water_flow.unwrap_or(standard.water_flow),
            concentrations: match partial.concentrations {
                Some(map) => map.into_iter().collect(),
                None => standard.concentrations,
            },
        }
    }

    fn merge_relinearization(partial: &PartialBridgeConfig) -> Result<RelinearizationPolicy> {
        match partial.relinearization.as_deref().unwrap_or("input-delta") {
            "input-delta" => Ok(RelinearizationPolicy::InputDelta {
                threshold: partial.threshold.unwrap_or(DEFAULT_THRESHOLD),
                floor: partial.floor.unwrap_or(DEFAULT_FLOOR),
            }),
            "every-n-iterations" => partial
                .every_n
                .map(RelinearizationPolicy::EveryNIterations)
                .ok_or_else(|| {
                    CliError::Config(
                        "`bridge.relinearization = \"every-n-iterations\"` requires `every-n`"
                            .to_string(),
                    )
                }),
            other => Err(CliError::Config(format!(
                "Unknown relinearization policy '{}', expected 'input-delta' or 'every-n-iterations'",
                other
            ))),
        }
    }

    fn merge_derivatives(
        cli_finite_difference: bool,
        partial: &PartialBridgeConfig,
    ) -> Result<DerivativeMode> {
        let finite_difference = DerivativeMode::FiniteDifference {
            relative_step: partial.fd_step.unwrap_or(DEFAULT_FD_STEP),
        };
        if cli_finite_difference {
            return Ok(finite_difference);
        }
        match partial.derivatives.as_deref().unwrap_or("analytic") {
            "analytic" => Ok(DerivativeMode::Analytic),
            "finite-difference" => Ok(finite_difference),
            other => Err(CliError::Config(format!(
                "Unknown derivative mode '{}', expected 'analytic' or 'finite-difference'",
                other
            ))),
        }
    }

    fn apply_set_values(&mut self, set_values: &[String]) -> Result<()> {
        for kv_pair in set_values {
            let (key, value_str) = kv_pair.split_once('=').ok_or_else(|| {
                CliError::Config(format!(
                    "Invalid --set format: '{}'. Expected KEY=VALUE.",
                    kv_pair
                ))
            })?;

            if let Some(label) = key.strip_prefix("feed.concentrations.") {
                let standard = || SeawaterFeed::standard().concentrations.into_iter().collect();
                self.feed
                    .get_or_insert_with(Default::default)
                    .concentrations
                    .get_or_insert_with(standard)
                    .insert(label.to_string(), parse_value(key, value_str)?);
                continue;
            }

            let feed = || PartialFeedConfig::default();
            match key {
                "feed.temperature" => {
                    self.feed.get_or_insert_with(feed).temperature = Some(parse_value(key, value_str)?)
                }
                "feed.pressure" => {
                    self.feed.get_or_insert_with(feed).pressure = Some(parse_value(key, value_str)?)
                }
                "feed.ph" => {
                    self.feed.get_or_insert_with(feed).ph = Some(parse_value(key, value_str)?)
                }
                "feed.water-flow" => {
                    self.feed.get_or_insert_with(feed).water_flow = Some(parse_value(key, value_str)?)
                }
                "process.water-recovery" => {
                    self.process
                        .get_or_insert_with(Default::default)
                        .water_recovery = Some(parse_value(key, value_str)?)
                }
                "process.minerals" => {
                    self.process.get_or_insert_with(Default::default).minerals =
                        Some(parse_list(value_str))
                }
                "process.phases" => {
                    self.process.get_or_insert_with(Default::default).phases =
                        Some(parse_list(value_str))
                }
                "bridge.activity-model" => {
                    self.bridge.get_or_insert_with(Default::default).activity_model =
                        Some(value_str.to_string())
                }
                "bridge.derivatives" => {
                    self.bridge.get_or_insert_with(Default::default).derivatives =
                        Some(value_str.to_string())
                }
                "bridge.fd-step" => {
                    self.bridge.get_or_insert_with(Default::default).fd_step =
                        Some(parse_value(key, value_str)?)
                }
                "bridge.relinearization" => {
                    self.bridge.get_or_insert_with(Default::default).relinearization =
                        Some(value_str.to_string())
                }
                "bridge.threshold" => {
                    self.bridge.get_or_insert_with(Default::default).threshold =
                        Some(parse_value(key, value_str)?)
                }
                "bridge.floor" => {
                    self.bridge.get_or_insert_with(Default::default).floor =
                        Some(parse_value(key, value_str)?)
                }
                "bridge.every-n" => {
                    self.bridge.get_or_insert_with(Default::default).every_n =
                        Some(parse_value(key, value_str)?)
                }
                "bridge.retry-with-fallback" => {
                    self.bridge
                        .get_or_insert_with(Default::default)
                        .retry_with_fallback = Some(parse_value(key, value_str)?)
                }
                "bridge.dissolve-species" => {
                    self.bridge.get_or_insert_with(Default::default).dissolve_species =
                        Some(parse_value(key, value_str)?)
                }
                "solver.tolerance" => {
                    self.solver.get_or_insert_with(Default::default).tolerance =
                        Some(parse_value(key, value_str)?)
                }
                "solver.max-iterations" => {
                    self.solver.get_or_insert_with(Default::default).max_iterations =
                        Some(parse_value(key, value_str)?)
                }
                "sweep.start" => {
                    self.sweep.get_or_insert_with(Default::default).start =
                        Some(parse_value(key, value_str)?)
                }
                "sweep.stop" => {
                    self.sweep.get_or_insert_with(Default::default).stop =
                        Some(parse_value(key, value_str)?)
                }
                "sweep.count" => {
                    self.sweep.get_or_insert_with(Default::default).count =
                        Some(parse_value(key, value_str)?)
                }
                "sweep.interpolate-nan-outputs" => {
                    self.sweep
                        .get_or_insert_with(Default::default)
                        .interpolate_nan_outputs = Some(parse_value(key, value_str)?)
                }
                _ => {
                    return Err(CliError::Config(format!(
                        "Unsupported configuration key for --set: '{}'",
                        key
                    )));
                }
            }
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(key: &str, value_str: &str) -> Result<T> {
    value_str.trim().parse().map_err(|_| {
        CliError::Config(format!("Invalid value for {}: {}", key, value_str))
    })
}

fn parse_list(value_str: &str) -> Vec<String> {
    value_str
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;
    use once_cell::sync::Lazy;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::{TempDir, tempdir};

    static TEST_DIR: Lazy<TempDir> = Lazy::new(|| tempdir().expect("Failed to create temp dir"));

    fn write_config_file(name: &str, content: &str) -> PathBuf {
        let file_path = TEST_DIR.path().join(name);
        fs::write(&file_path, content).unwrap();
        file_path
    }

    fn analyze_args(extra: &[&str]) -> FlowsheetArgs {
        let mut args = vec!["eqbridge", "analyze"];
        args.extend_from_slice(extra);
        match Cli::parse_from(args).command {
            Commands::Analyze(args) => args.flowsheet,
            _ => panic!("Expected 'analyze' subcommand"),
        }
    }

    #[test]
    fn no_config_file_gives_standard_seawater() {
        let config = PartialAppConfig::load(&analyze_args(&[])).unwrap();
        assert_eq!(config.scaling.feed, SeawaterFeed::standard());
        assert_eq!(config.scaling.water_recovery, 0.5);
        assert_eq!(config.scaling.bridge.activity_model, ActivityModel::Davies);
        assert_eq!(
            config.sweep,
            SweepPlan {
                start: 0.5,
                stop: 0.7,
                count: 11,
                interpolate_nan_outputs: false,
            }
        );
    }

    #[test]
    fn file_values_are_merged_over_defaults() {
        let path = write_config_file(
            "file_values.toml",
            r#"
            [feed]
            temperature = 298.15
            concentrations = { Na = 500.0, Cl = 800.0 }

            [bridge]
            activity-model = "debye-huckel"
            relinearization = "every-n-iterations"
            every-n = 3
            scaling = { "scalingTendency[Calcite]" = 2.0 }

            [process]
            water-recovery = 0.6
            phases = ["Calcite"]
            "#,
        );
        let config = PartialAppConfig::load(&analyze_args(&["-c", path.to_str().unwrap()])).unwrap();
        let scaling = config.scaling;

        assert_eq!(scaling.feed.temperature_k, 298.15);
        assert_eq!(scaling.feed.ph, SeawaterFeed::standard().ph);
        assert_eq!(
            scaling.feed.concentrations,
            vec![("Cl".to_string(), 800.0), ("Na".to_string(), 500.0)]
        );
        assert_eq!(scaling.bridge.activity_model, ActivityModel::DebyeHuckel);
        assert_eq!(
            scaling.bridge.relinearization,
            RelinearizationPolicy::EveryNIterations(3)
        );
        assert_eq!(
            scaling.bridge.user_scaling.get(&OutputKey::indexed("scalingTendency", "Calcite")),
            Some(&2.0)
        );
        assert_eq!(scaling.water_recovery, 0.6);
        assert_eq!(scaling.phases, vec!["Calcite".to_string()]);
        assert_eq!(scaling.minerals, ScalingConfig::default().minerals);
    }

    #[test]
    fn cli_args_override_file_values() {
        let path = write_config_file(
            "override.toml",
            r#"
            [bridge]
            activity-model = "ideal"

            [process]
            water-recovery = 0.6
            "#,
        );
        let config = PartialAppConfig::load(&analyze_args(&[
            "-c",
            path.to_str().unwrap(),
            "--water-recovery",
            "0.65",
            "--activity-model",
            "davies",
            "--finite-difference",
        ]))
        .unwrap();
        assert_eq!(config.scaling.water_recovery, 0.65);
        assert_eq!(config.scaling.bridge.activity_model, ActivityModel::Davies);
        assert_eq!(
            config.scaling.bridge.derivatives,
            DerivativeMode::FiniteDifference {
                relative_step: DEFAULT_FD_STEP
            }
        );
    }

    #[test]
    fn set_values_override_file_and_defaults() {
        let config = PartialAppConfig::load(&analyze_args(&[
            "-S",
            "feed.concentrations.Ca=450",
            "-S",
            "bridge.threshold=1e-4",
            "-S",
            "sweep.count=5",
            "-S",
            "process.minerals=Calcite, Aragonite,Gypsum",
        ]))
        .unwrap();

        let ca = config
            .scaling
            .feed
            .concentrations
            .iter()
            .find(|(label, _)| label == "Ca")
            .map(|(_, c)| *c);
        assert_eq!(ca, Some(450.0));
        assert_eq!(config.scaling.feed.concentrations.len(), 7);
        assert_eq!(
            config.scaling.bridge.relinearization,
            RelinearizationPolicy::InputDelta {
                threshold: 1.0e-4,
                floor: DEFAULT_FLOOR
            }
        );
        assert_eq!(config.sweep.count, 5);
        assert_eq!(config.scaling.minerals.len(), 3);
    }

    #[test]
    fn unknown_file_key_is_a_parse_error() {
        let path = write_config_file("unknown.toml", "[process]\nrecovery = 0.5\n");
        let result = PartialAppConfig::load(&analyze_args(&["-c", path.to_str().unwrap()]));
        assert!(matches!(result, Err(CliError::FileParsing { .. })));
    }

    #[test]
    fn malformed_or_unsupported_set_values_are_rejected() {
        for set in ["process.water-recovery", "feed.colour=blue", "sweep.count=many"] {
            let result = PartialAppConfig::load(&analyze_args(&["-S", set]));
            assert!(matches!(result, Err(CliError::Config(_))), "{set}");
        }
    }

    #[test]
    fn incomplete_relinearization_settings_are_rejected() {
        let result = PartialAppConfig::load(&analyze_args(&[
            "-S",
            "bridge.relinearization=every-n-iterations",
        ]));
        match result {
            Err(CliError::Config(msg)) => assert!(msg.contains("every-n")),
            other => panic!("unexpected result: {other:?}"),
        }
        let result = PartialAppConfig::load(&analyze_args(&["-S", "bridge.activity-model=pitzer"]));
        assert!(matches!(result, Err(CliError::Config(_))));
    }
}
