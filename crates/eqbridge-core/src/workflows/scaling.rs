use super::sweep::{self, Sample, SweepError, SweepOptions, SweepOutput, SweepParameter, SweepResults};
use crate::core::chemistry::{EquilibriumEngine, OutputKey};
use crate::core::model::{HostModel, Relation, VarId, Variable};
use crate::core::solver::{HostSolver, SolveReport, SolverOptions};
use crate::core::units::{AmountUnit, PressureUnit, TemperatureUnit};
use crate::engine::bridge::{BridgeBlock, BridgeReport, BridgeSpec, OutputBinding};
use crate::engine::config::{BridgeConfig, ConfigError};
use crate::engine::error::EngineError;
use crate::engine::mapper::{Composition, PhaseSpec, SystemState};
use crate::engine::progress::ProgressReporter;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{info, instrument};

const INITIAL_DENSITY_GUESS: f64 = 1000.0;
/// Passes of feed initialization and ion-flow update before the host solve.
const FEED_INITIALIZATION_PASSES: usize = 2;

/// Feed water: state, a water mass flow and ion concentrations in mg/L.
#[derive(Debug, Clone, PartialEq)]
pub struct SeawaterFeed {
    pub temperature_k: f64,
    pub pressure_pa: f64,
    pub ph: f64,
    /// kg/s
    pub water_flow: f64,
    /// Host species label and concentration in mg/L.
    pub concentrations: Vec<(String, f64)>,
}

impl SeawaterFeed {
    pub fn standard() -> Self {
        let concentrations = [
            ("Na", 10556.0),
            ("K", 380.0),
            ("Ca", 400.0),
            ("Mg", 1262.0),
            ("Cl", 18977.2),
            ("SO4", 2649.0),
            ("HCO3", 140.0),
        ];
        Self {
            temperature_k: 293.0,
            pressure_pa: 1.0e5,
            ph: 7.56,
            water_flow: 1.0,
            concentrations: concentrations
                .into_iter()
                .map(|(label, c)| (label.to_string(), c))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalingConfig {
    pub feed: SeawaterFeed,
    pub water_recovery: f64,
    /// Minerals whose scaling tendency is reported for the concentrate.
    pub minerals: Vec<String>,
    /// Minerals allowed to precipitate in the concentrate.
    pub phases: Vec<String>,
    pub dissolve_species_in_reaktoro: bool,
    pub bridge: BridgeConfig,
    pub solver: SolverOptions,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            feed: SeawaterFeed::standard(),
            water_recovery: 0.5,
            minerals: vec!["Calcite".to_string(), "Gypsum".to_string()],
            phases: vec!["Calcite".to_string(), "Gypsum".to_string()],
            dissolve_species_in_reaktoro: true,
            bridge: BridgeConfig::default(),
            solver: SolverOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Handles {
    water: VarId,
    feed_density: VarId,
    recovery: VarId,
    brine_water: VarId,
}

/// A feed stream and the concentrate left after removing a fraction of its
/// water, each coupled to the equilibrium engine through its own bridge.
///
/// Ion mass flows follow from the feed concentrations and the feed density,
/// which is itself an engine output, so the feed bridge and the host model
/// are solved together.
#[derive(Debug)]
pub struct ScalingFlowsheet<E> {
    model: HostModel,
    feed: BridgeBlock<E>,
    brine: BridgeBlock<E>,
    solver: HostSolver,
    handles: Handles,
    /// (concentration mg/L, ion mass flow) per feed species.
    ions: Vec<(f64, VarId)>,
    brine_keys: Vec<OutputKey>,
}

impl<E: EquilibriumEngine + Clone> ScalingFlowsheet<E> {
    pub fn build(config: &ScalingConfig, engine: E) -> Result<Self, EngineError> {
        validate_recovery(config.water_recovery)?;
        let feed = &config.feed;
        let mut model = HostModel::new();

        let state = SystemState {
            temperature: model.add_variable(Variable::fixed("feed.temperature", feed.temperature_k)),
            temperature_unit: TemperatureUnit::Kelvin,
            pressure: model.add_variable(Variable::fixed("feed.pressure", feed.pressure_pa)),
            pressure_unit: PressureUnit::Pascal,
            ph: Some(model.add_variable(Variable::fixed("feed.pH", feed.ph))),
        };
        let water = model.add_variable(Variable::fixed("feed.H2O", feed.water_flow));
        let feed_density = model.add_variable(
            Variable::new("feed.density", INITIAL_DENSITY_GUESS).with_bounds(Some(1.0), None),
        );
        let recovery = model.add_variable(Variable::fixed("water_recovery", config.water_recovery));
        let brine_water = model.add_variable(Variable::new("brine.H2O", 0.0).non_negative());

        let mut ions = Vec::with_capacity(feed.concentrations.len());
        for (label, concentration) in &feed.concentrations {
            let flow = model.add_variable(Variable::new(format!("feed.{label}"), 0.0).non_negative());
            let c = *concentration;
            // m · ρ = c · 1e-3 · water, with c in mg/L and ρ in kg/m³
            model.add_relation(Relation::expression(
                format!("feed.{label}.concentration"),
                vec![flow, feed_density, water],
                move |v| v[0] * v[1] - c * 1.0e-3 * v[2],
            ))?;
            ions.push((c, flow));
        }
        model.add_relation(Relation::expression(
            "brine.H2O.recovery",
            vec![brine_water, recovery, water],
            |v| v[0] - (1.0 - v[1]) * v[2],
        ))?;

        let composition = |solvent: VarId| Composition {
            species: std::iter::once(("H2O".to_string(), solvent))
                .chain(
                    feed.concentrations
                        .iter()
                        .zip(&ions)
                        .map(|((label, _), (_, flow))| (label.clone(), *flow)),
                )
                .collect(),
            unit: AmountUnit::KilogramPerSecond,
            convert_to_rkt_species: true,
            dissolve_species_in_reaktoro: config.dissolve_species_in_reaktoro,
        };

        let feed_spec = BridgeSpec {
            state: state.clone(),
            composition: composition(water),
            phases: PhaseSpec::aqueous_only(),
            outputs: vec![OutputBinding::bound(OutputKey::scalar("density"), feed_density)],
        };
        let feed_bridge = BridgeBlock::build("feed", &mut model, feed_spec, engine.clone(), &config.bridge)?;

        let mut brine_keys = vec![OutputKey::scalar("density")];
        brine_keys.extend(config.minerals.iter().map(|m| OutputKey::indexed("scalingTendency", m.as_str())));
        brine_keys.extend(config.phases.iter().map(|p| OutputKey::indexed("speciesAmount", p.as_str())));
        let brine_spec = BridgeSpec {
            state,
            composition: composition(brine_water),
            phases: PhaseSpec::new(config.phases.iter().cloned()),
            outputs: brine_keys.iter().cloned().map(OutputBinding::new).collect(),
        };
        let brine_bridge = BridgeBlock::build("brine", &mut model, brine_spec, engine, &config.bridge)?;

        info!(
            species = ions.len(),
            brine_outputs = brine_keys.len(),
            "Scaling flowsheet built"
        );
        Ok(Self {
            model,
            feed: feed_bridge,
            brine: brine_bridge,
            solver: HostSolver::new(config.solver.clone()),
            handles: Handles {
                water,
                feed_density,
                recovery,
                brine_water,
            },
            ions,
            brine_keys,
        })
    }

    /// Brings every variable close to a solution and initializes both
    /// bridges there.
    #[instrument(skip_all, name = "scaling_initialize")]
    pub fn initialize(&mut self) -> Result<(), EngineError> {
        for _ in 0..FEED_INITIALIZATION_PASSES {
            update_ion_flows(&mut self.model, &self.handles, &self.ions)?;
            self.feed.initialize(&mut self.model)?;
        }
        update_ion_flows(&mut self.model, &self.handles, &self.ions)?;
        update_brine_water(&mut self.model, &self.handles)?;
        self.brine.initialize(&mut self.model)?;
        Ok(())
    }

    #[instrument(skip_all, name = "scaling_solve")]
    pub fn solve(&mut self) -> Result<SolveReport, EngineError> {
        solve_with_bridges(&self.solver, &mut self.model, &mut self.feed, &mut self.brine)
    }

    pub fn set_water_recovery(&mut self, recovery: f64) -> Result<(), EngineError> {
        validate_recovery(recovery)?;
        self.model.fix(self.handles.recovery, recovery)?;
        Ok(())
    }

    pub fn model(&self) -> &HostModel {
        &self.model
    }

    pub fn bridge_reports(&self) -> (BridgeReport, BridgeReport) {
        (self.feed.report(&self.model), self.brine.report(&self.model))
    }

    pub fn report(&self) -> Result<ScalingReport, EngineError> {
        let value = |key: &OutputKey| -> Result<f64, EngineError> {
            let var = self
                .brine
                .output_variable(key)
                .ok_or_else(|| EngineError::Internal(format!("brine bridge has no output '{key}'")))?;
            Ok(self.model.value(var)?)
        };

        let mut scaling_tendency = BTreeMap::new();
        let mut precipitated = BTreeMap::new();
        for key in self.brine_keys.iter().skip(1) {
            let Some(mineral) = key.index.clone() else { continue };
            match key.property.as_str() {
                "scalingTendency" => scaling_tendency.insert(mineral, value(key)?),
                _ => precipitated.insert(mineral, value(key)?),
            };
        }
        Ok(ScalingReport {
            water_recovery: self.model.value(self.handles.recovery)?,
            feed_density: self.model.value(self.handles.feed_density)?,
            brine_density: value(&self.brine_keys[0])?,
            brine_water_flow: self.model.value(self.handles.brine_water)?,
            scaling_tendency,
            precipitated,
        })
    }

    /// Sweeps the water recovery and records the concentrate outputs.
    ///
    /// The concentrate bridge is re-initialized at every sample since a
    /// recovery step is never a small perturbation of its inputs.
    #[instrument(skip_all, name = "recovery_sweep")]
    pub fn run_recovery_sweep(
        &mut self,
        sample: Sample,
        options: &SweepOptions,
        reporter: &ProgressReporter,
    ) -> Result<SweepResults, SweepError> {
        let outputs: Vec<SweepOutput> = self
            .brine_keys
            .iter()
            .filter_map(|key| {
                self.brine.output_variable(key).map(|variable| SweepOutput {
                    name: format!("brine.{key}"),
                    variable,
                })
            })
            .chain(std::iter::once(SweepOutput {
                name: "feed.density".to_string(),
                variable: self.handles.feed_density,
            }))
            .collect();
        let parameters = [SweepParameter {
            name: "water_recovery".to_string(),
            variable: self.handles.recovery,
            sample,
        }];

        let Self {
            model,
            feed,
            brine,
            solver,
            handles,
            ..
        } = self;
        sweep::run(model, &parameters, &outputs, options, reporter, |model, _| {
            validate_recovery(model.value(handles.recovery)?)?;
            update_brine_water(model, handles)?;
            brine.initialize(model)?;
            solve_with_bridges(solver, model, feed, brine)?;
            Ok(())
        })
    }
}

fn validate_recovery(recovery: f64) -> Result<(), ConfigError> {
    if (0.0..1.0).contains(&recovery) {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            parameter: "water_recovery",
            reason: format!("must lie in [0, 1), got {recovery}"),
        })
    }
}

fn update_ion_flows(model: &mut HostModel, handles: &Handles, ions: &[(f64, VarId)]) -> Result<(), EngineError> {
    let water = model.value(handles.water)?;
    let density = model.value(handles.feed_density)?;
    for (concentration, flow) in ions {
        model.set_value(*flow, concentration * 1.0e-3 * water / density)?;
    }
    Ok(())
}

fn update_brine_water(model: &mut HostModel, handles: &Handles) -> Result<(), EngineError> {
    let water = model.value(handles.water)?;
    let recovery = model.value(handles.recovery)?;
    model.set_value(handles.brine_water, (1.0 - recovery) * water)?;
    Ok(())
}

fn solve_with_bridges<E: EquilibriumEngine>(
    solver: &HostSolver,
    model: &mut HostModel,
    feed: &mut BridgeBlock<E>,
    brine: &mut BridgeBlock<E>,
) -> Result<SolveReport, EngineError> {
    let report = solver.solve(model, &mut [&mut *feed, &mut *brine])?;
    feed.mark_converged();
    brine.mark_converged();
    info!(
        iterations = report.iterations,
        relinearizations = feed.stats().relinearizations + brine.stats().relinearizations,
        "Flowsheet converged"
    );
    Ok(report)
}

/// Converged concentrate properties.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingReport {
    pub water_recovery: f64,
    /// kg/m³
    pub feed_density: f64,
    /// kg/m³
    pub brine_density: f64,
    /// kg/s
    pub brine_water_flow: f64,
    pub scaling_tendency: BTreeMap<String, f64>,
    /// mol/s precipitated in the concentrate.
    pub precipitated: BTreeMap<String, f64>,
}

impl ScalingReport {
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }
}

impl fmt::Display for ScalingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Water recovery:    {:.3}", self.water_recovery)?;
        writeln!(f, "Feed density:      {:.3} kg/m3", self.feed_density)?;
        writeln!(f, "Brine density:     {:.3} kg/m3", self.brine_density)?;
        writeln!(f, "Brine water flow:  {:.4} kg/s", self.brine_water_flow)?;
        for (mineral, tendency) in &self.scaling_tendency {
            writeln!(f, "Scaling tendency {mineral:<10} {tendency:.4}")?;
        }
        for (mineral, amount) in &self.precipitated {
            writeln!(f, "Precipitated {mineral:<14} {amount:.4e} mol/s")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chemistry::AqueousEngine;
    use crate::workflows::sweep::SweepStatus;
    use approx::assert_relative_eq;

    fn solved(config: &ScalingConfig) -> ScalingFlowsheet<AqueousEngine> {
        let mut flowsheet = ScalingFlowsheet::build(config, AqueousEngine::new()).unwrap();
        flowsheet.initialize().unwrap();
        flowsheet.solve().unwrap();
        flowsheet
    }

    #[test]
    fn seawater_feed_has_physical_density_and_non_negative_scaling() {
        let flowsheet = solved(&ScalingConfig::default());
        let report = flowsheet.report().unwrap();
        assert!(
            report.feed_density > 1020.0 && report.feed_density < 1030.0,
            "feed density {}",
            report.feed_density
        );
        assert!(report.brine_density > report.feed_density);
        assert_relative_eq!(report.brine_water_flow, 0.5, max_relative = 1e-9);
        assert_eq!(report.scaling_tendency.len(), 2);
        assert!(report.scaling_tendency.values().all(|v| *v >= 0.0));
        assert!(report.precipitated.values().all(|v| *v >= -1e-12));
    }

    #[test]
    fn seawater_bridge_initializes_from_concentrations() {
        let feed = SeawaterFeed::standard();
        let mut model = HostModel::new();
        let state = SystemState {
            temperature: model.add_variable(Variable::fixed("T", feed.temperature_k)),
            temperature_unit: TemperatureUnit::Kelvin,
            pressure: model.add_variable(Variable::fixed("P", feed.pressure_pa)),
            pressure_unit: PressureUnit::Pascal,
            ph: Some(model.add_variable(Variable::fixed("pH", feed.ph))),
        };
        let species = feed
            .concentrations
            .iter()
            .map(|(label, c)| (label.clone(), model.add_variable(Variable::fixed(label.as_str(), *c))))
            .collect();
        let keys = vec![
            OutputKey::scalar("density"),
            OutputKey::indexed("scalingTendency", "Calcite"),
            OutputKey::indexed("scalingTendency", "Gypsum"),
            OutputKey::indexed("speciesAmount", "Calcite"),
            OutputKey::indexed("speciesAmount", "Gypsum"),
        ];
        let spec = BridgeSpec {
            state,
            composition: Composition {
                species,
                unit: AmountUnit::MilligramPerLitre,
                convert_to_rkt_species: true,
                dissolve_species_in_reaktoro: true,
            },
            phases: PhaseSpec::new(["Calcite", "Gypsum"]),
            outputs: keys.iter().cloned().map(OutputBinding::new).collect(),
        };
        let mut bridge =
            BridgeBlock::build("seawater", &mut model, spec, AqueousEngine::new(), &BridgeConfig::default()).unwrap();
        bridge.initialize(&mut model).unwrap();

        let value = |key: &OutputKey| model.value(bridge.output_variable(key).unwrap()).unwrap();
        let density = value(&keys[0]);
        assert!(density > 1020.0 && density < 1030.0, "density {density}");
        for key in &keys[1..] {
            assert!(value(key) >= -1e-12, "{key} = {}", value(key));
        }
    }

    #[test]
    fn ion_flows_are_consistent_with_solved_feed_density() {
        let flowsheet = solved(&ScalingConfig::default());
        let model = flowsheet.model();
        let density = model.value(flowsheet.handles.feed_density).unwrap();
        let (c, na) = flowsheet.ions[0];
        assert_relative_eq!(model.value(na).unwrap(), c * 1.0e-3 / density, max_relative = 1e-8);
    }

    #[test]
    fn zero_recovery_concentrate_matches_the_feed() {
        let config = ScalingConfig {
            water_recovery: 0.0,
            phases: vec![],
            ..ScalingConfig::default()
        };
        let report = solved(&config).report().unwrap();
        assert_relative_eq!(report.brine_density, report.feed_density, max_relative = 1e-6);
    }

    #[test]
    fn explicit_element_balances_give_the_same_flowsheet() {
        let delegate = solved(&ScalingConfig::default()).report().unwrap();
        let explicit = solved(&ScalingConfig {
            dissolve_species_in_reaktoro: false,
            ..ScalingConfig::default()
        })
        .report()
        .unwrap();
        assert_relative_eq!(delegate.brine_density, explicit.brine_density, max_relative = 1e-6);
        assert_relative_eq!(delegate.feed_density, explicit.feed_density, max_relative = 1e-6);
    }

    #[test]
    fn invalid_recovery_is_a_configuration_error() {
        let config = ScalingConfig {
            water_recovery: 1.0,
            ..ScalingConfig::default()
        };
        let err = ScalingFlowsheet::build(&config, AqueousEngine::new()).unwrap_err();
        assert!(matches!(err, EngineError::Config(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn recovery_sweep_produces_one_tagged_row_per_sample() {
        let mut flowsheet = ScalingFlowsheet::build(&ScalingConfig::default(), AqueousEngine::new()).unwrap();
        flowsheet.initialize().unwrap();
        let results = flowsheet
            .run_recovery_sweep(
                Sample::Linear {
                    start: 0.5,
                    stop: 0.7,
                    count: 11,
                },
                &SweepOptions::default(),
                &ProgressReporter::new(),
            )
            .unwrap();

        assert_eq!(results.rows.len(), 11);
        assert_eq!(results.parameter_names, vec!["water_recovery".to_string()]);
        assert_eq!(results.rows[0].status, SweepStatus::Converged);
        for row in &results.rows {
            match row.status {
                SweepStatus::Converged => assert!(row.outputs.iter().all(|v| v.is_finite())),
                SweepStatus::Failed => assert!(row.message.is_some()),
            }
        }
        let density = results.output("brine.density").unwrap();
        assert!(density[0] > 1000.0);
    }

    #[test]
    fn report_serializes_to_toml() {
        let report = solved(&ScalingConfig::default()).report().unwrap();
        let text = report.to_toml().unwrap();
        assert!(text.contains("brine_density"));
        assert!(text.contains("[scaling_tendency]"));
        assert!(report.to_string().contains("Scaling tendency Calcite"));
    }
}
