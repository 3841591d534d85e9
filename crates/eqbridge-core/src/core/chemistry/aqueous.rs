use super::activity::ActivityModel;
use super::water::{pure_water_density, saturation_pressure, seawater_density, sensible_enthalpy};
use super::{
    ChemistryError, EngineResponse, EquilibriumEngine, EquilibriumProblem, InitialGuess, InputId,
    OutputKey,
};
use crate::core::minerals::{GAS_CONSTANT, MineralData, REFERENCE_TEMPERATURE, log_k_at, mineral};
use crate::core::species::{ELEMENTS, element_index, is_solvent, species};
use crate::core::units::WATER_MOLAR_MASS;
use nalgebra::{DMatrix, DVector};
use num_dual::{Dual64, DualNum};
use std::f64::consts::LN_10;
use tracing::{debug, trace};

const NEUTRAL_PH: f64 = 7.0;
const MOLALITY_FLOOR: f64 = 1.0e-30;
const NEGATIVE_AMOUNT_TOLERANCE: f64 = 1.0e-12;
const SATURATION_TOLERANCE: f64 = 1.0e-9;
const PRECIPITATION_TOLERANCE: f64 = 1.0e-10;
const MAX_ACTIVE_SET_PASSES: usize = 20;
/// Extra fixed-point sweeps after the real part settles, so that the
/// derivative parts settle too.
const REFINEMENT_SWEEPS: usize = 3;

const AQUEOUS: [&str; 11] = [
    "Na+", "K+", "Ca+2", "Mg+2", "Sr+2", "Cl-", "Br-", "SO4-2", "HCO3-", "CO3-2", "CO2(aq)",
];
const CHARGES: [i8; 11] = [1, 1, 2, 2, 2, -1, -1, -2, -1, -2, 0];
const HCO3: usize = 8;
const CO3: usize = 9;
const CO2: usize = 10;
/// Elements before carbon map one-to-one onto the free ion at the same index.
const CARBON: usize = 8;
const N_ELEMENTS: usize = ELEMENTS.len();

/// `CO3-2 + H+ = HCO3-`
const HCO3_FORMATION: (f64, f64) = (10.329, -14.9e3);
/// `CO3-2 + 2H+ = CO2(aq) + H2O`
const CO2_FORMATION: (f64, f64) = (16.681, -24.0e3);

/// The built-in aqueous electrolyte engine.
///
/// Solves the speciation of a seawater-type brine at fixed pH and lets the
/// mineral phases named in the problem precipitate until none of them is
/// supersaturated. Derivatives are exact: the speciation is evaluated in dual
/// numbers and precipitated amounts are differentiated through the
/// equilibrium conditions.
#[derive(Debug, Clone, PartialEq)]
pub struct AqueousEngine {
    max_iterations: usize,
    tolerance: f64,
}

impl Default for AqueousEngine {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1.0e-13,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Amount {
    Aqueous(usize),
    Mineral(usize),
    Solvent,
}

#[derive(Debug, Clone, Copy)]
enum Property {
    Density,
    ScalingTendency(MineralData),
    SaturationIndex(MineralData),
    SpeciesAmount(Amount),
    ElementAmount(usize),
    IonicStrength,
    OsmoticPressure,
    VaporPressure,
    Enthalpy,
    Ph,
}

#[derive(Debug, Clone)]
struct Phase {
    data: MineralData,
    stoichiometry: [f64; N_ELEMENTS],
}

#[derive(Debug, Clone)]
struct Conditions<D> {
    temperature: D,
    pressure: D,
    ph: D,
    solvent: D,
    totals: [D; N_ELEMENTS],
}

impl Conditions<f64> {
    fn lift(&self) -> Conditions<Dual64> {
        Conditions {
            temperature: Dual64::from(self.temperature),
            pressure: Dual64::from(self.pressure),
            ph: Dual64::from(self.ph),
            solvent: Dual64::from(self.solvent),
            totals: self.totals.map(Dual64::from),
        }
    }
}

#[derive(Debug, Clone)]
struct Speciation<D> {
    molality: [D; 11],
    log_gamma: [D; 11],
    ionic_strength: D,
    water_activity: D,
}

struct EquilibriumState<'a, D> {
    conditions: &'a Conditions<D>,
    amounts: &'a [D],
    speciation: &'a Speciation<D>,
}

#[derive(Debug, Clone)]
struct Precipitation {
    amounts: Vec<f64>,
    active: Vec<usize>,
    jacobian: Option<DMatrix<f64>>,
}

impl AqueousEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_iterations: usize, tolerance: f64) -> Self {
        Self {
            max_iterations,
            tolerance,
        }
    }

    fn resolve(&self, key: &OutputKey, phases: &[String]) -> Result<Property, ChemistryError> {
        let unknown = || ChemistryError::UnknownOutput {
            key: key.to_string(),
        };
        let property = match (key.property.as_str(), key.index.as_deref()) {
            ("density", None) => Property::Density,
            ("ionicStrength", None) => Property::IonicStrength,
            ("osmoticPressure", None) => Property::OsmoticPressure,
            ("vaporPressure", None) => Property::VaporPressure,
            ("enthalpy", None) => Property::Enthalpy,
            ("pH", None) => Property::Ph,
            ("scalingTendency", Some(name)) => {
                Property::ScalingTendency(*mineral(name).ok_or_else(unknown)?)
            }
            ("saturationIndex", Some(name)) => {
                Property::SaturationIndex(*mineral(name).ok_or_else(unknown)?)
            }
            ("elementAmount", Some(name)) => Property::ElementAmount(element_index(name).ok_or_else(unknown)?),
            ("speciesAmount", Some(name)) => {
                if is_solvent(name) {
                    Property::SpeciesAmount(Amount::Solvent)
                } else if let Some(i) = aqueous_index(name) {
                    Property::SpeciesAmount(Amount::Aqueous(i))
                } else if mineral(name).is_some() {
                    let position = phases.iter().position(|p| p == name).ok_or_else(|| {
                        ChemistryError::PhaseNotPresent {
                            key: key.to_string(),
                            phase: name.to_string(),
                        }
                    })?;
                    Property::SpeciesAmount(Amount::Mineral(position))
                } else {
                    return Err(unknown());
                }
            }
            _ => return Err(unknown()),
        };
        Ok(property)
    }

    fn resolve_phases(&self, phases: &[String]) -> Result<Vec<Phase>, ChemistryError> {
        phases
            .iter()
            .map(|name| {
                let data = *mineral(name).ok_or_else(|| ChemistryError::UnknownPhase(name.clone()))?;
                Ok::<_, ChemistryError>(Phase {
                    stoichiometry: data.element_stoichiometry(),
                    data,
                })
            })
            .collect()
    }

    fn conditions<D: DualNum<f64> + Copy>(
        &self,
        problem: &EquilibriumProblem,
        x: &[D],
    ) -> Result<Conditions<D>, ChemistryError> {
        let mut temperature = None;
        let mut pressure = None;
        let mut ph = None;
        let mut solvent = D::from(0.0);
        let mut totals = [D::from(0.0); N_ELEMENTS];

        for ((id, _), value) in problem.inputs.iter().zip(x) {
            match id {
                InputId::Temperature => temperature = Some(*value),
                InputId::Pressure => pressure = Some(*value),
                InputId::Ph => ph = Some(*value),
                InputId::Solvent => solvent = solvent + *value,
                InputId::Species(name) if is_solvent(name) => {
                    solvent = solvent + *value * (WATER_MOLAR_MASS * 1.0e-3)
                }
                InputId::Species(name) => {
                    let data = species(name).ok_or_else(|| ChemistryError::UnknownSpecies(name.clone()))?;
                    for (element, count) in data.elements {
                        if let Some(e) = element_index(element) {
                            totals[e] = totals[e] + *value * *count;
                        }
                    }
                }
                InputId::Element(name) => {
                    let e = element_index(name).ok_or_else(|| ChemistryError::UnknownElement(name.clone()))?;
                    totals[e] = totals[e] + *value;
                }
            }
        }

        let temperature = temperature.ok_or(ChemistryError::MissingInput("temperature"))?;
        let pressure = pressure.ok_or(ChemistryError::MissingInput("pressure"))?;
        let ph = ph.unwrap_or(D::from(NEUTRAL_PH));

        if temperature.re() <= 0.0 || pressure.re() <= 0.0 {
            return Err(diverged(format!(
                "non-positive state (T = {} K, P = {} Pa)",
                temperature.re(),
                pressure.re()
            )));
        }
        if solvent.re() <= 0.0 {
            return Err(diverged(format!("non-positive solvent mass {} kg", solvent.re())));
        }
        for (e, total) in totals.iter_mut().enumerate() {
            if total.re() < -NEGATIVE_AMOUNT_TOLERANCE {
                return Err(diverged(format!(
                    "negative amount of {} ({} mol) after aggregation",
                    ELEMENTS[e],
                    total.re()
                )));
            }
            if total.re() < 0.0 {
                *total = D::from(0.0);
            }
        }

        Ok(Conditions {
            temperature,
            pressure,
            ph,
            solvent,
            totals,
        })
    }

    fn speciate<D: DualNum<f64> + Copy>(
        &self,
        model: ActivityModel,
        conditions: &Conditions<D>,
        dissolved: &[D; N_ELEMENTS],
        guess: InitialGuess,
    ) -> Result<Speciation<D>, ChemistryError> {
        let w = conditions.solvent;
        let mut molality = [D::from(0.0); 11];
        for e in 0..CARBON {
            molality[e] = dissolved[e] / w;
        }
        let carbon = dissolved[CARBON] / w;
        let log_k_hco3 = log_k_at(HCO3_FORMATION.0, HCO3_FORMATION.1, conditions.temperature);
        let log_k_co2 = log_k_at(CO2_FORMATION.0, CO2_FORMATION.1, conditions.temperature);

        let (mut ionic, damping) = match guess {
            InitialGuess::Default => {
                molality[HCO3] = carbon;
                (ionic_strength(&molality), 1.0)
            }
            InitialGuess::Fallback => (D::from(0.0), 0.5),
        };
        let mut water_activity = D::from(1.0);
        let mut settle_at: Option<usize> = None;

        for iteration in 0..self.max_iterations {
            let mut log_gamma = [D::from(0.0); 11];
            for (i, lg) in log_gamma.iter_mut().enumerate() {
                *lg = model.log10_gamma(CHARGES[i], ionic, conditions.temperature);
            }

            let hco3_ratio = ((log_k_hco3 + log_gamma[CO3] - log_gamma[HCO3] - conditions.ph) * LN_10).exp();
            let co2_ratio =
                ((log_k_co2 + log_gamma[CO3] - conditions.ph * 2.0 - water_activity.log10()) * LN_10).exp();
            let co3 = carbon / (hco3_ratio + co2_ratio + 1.0);
            molality[CO3] = co3;
            molality[HCO3] = co3 * hco3_ratio;
            molality[CO2] = co3 * co2_ratio;

            let total_molality = molality.iter().fold(D::from(0.0), |acc, m| acc + *m);
            water_activity = (-total_molality * (WATER_MOLAR_MASS * 1.0e-3)).exp();

            let target = ionic_strength(&molality);
            let change = (target.re() - ionic.re()).abs();
            ionic = ionic + (target - ionic) * damping;

            match settle_at {
                Some(last) if iteration >= last => {
                    trace!(iterations = iteration + 1, ionic_strength = ionic.re(), "Speciation converged");
                    return Ok(Speciation {
                        molality,
                        log_gamma,
                        ionic_strength: ionic,
                        water_activity,
                    });
                }
                None if change <= self.tolerance * ionic.re().max(1.0) => {
                    settle_at = Some(iteration + REFINEMENT_SWEEPS);
                }
                _ => {}
            }
        }

        Err(diverged(format!(
            "activity coefficient iteration did not converge in {} iterations",
            self.max_iterations
        )))
    }

    fn log10_saturation<D: DualNum<f64> + Copy>(
        &self,
        mineral: &MineralData,
        speciation: &Speciation<D>,
        conditions: &Conditions<D>,
    ) -> D {
        let mut log_iap = D::from(0.0);
        for (ion, nu) in mineral.ions {
            if let Some(i) = aqueous_index(ion) {
                let m = floored(speciation.molality[i]);
                log_iap = log_iap + (m.log10() + speciation.log_gamma[i]) * *nu;
            }
        }
        log_iap = log_iap + speciation.water_activity.log10() * mineral.water - conditions.ph * mineral.proton;
        log_iap - log_k_at(mineral.log_k25, mineral.delta_h, conditions.temperature)
    }

    fn precipitate(
        &self,
        model: ActivityModel,
        conditions: &Conditions<f64>,
        phases: &[Phase],
        guess: InitialGuess,
    ) -> Result<Precipitation, ChemistryError> {
        let mut amounts = vec![0.0; phases.len()];
        let mut active: Vec<bool> = vec![false; phases.len()];
        if phases.is_empty() {
            return Ok(Precipitation {
                amounts,
                active: Vec::new(),
                jacobian: None,
            });
        }

        for pass in 0..MAX_ACTIVE_SET_PASSES {
            let indices: Vec<usize> = (0..phases.len()).filter(|k| active[*k]).collect();
            if !indices.is_empty() {
                if let Some(dropped) = self.newton_on_active(model, conditions, phases, &indices, &mut amounts, guess)? {
                    debug!(phase = dropped, "Mineral dissolved completely; leaving active set");
                    active[dropped] = false;
                    amounts[dropped] = 0.0;
                    continue;
                }
            }

            let dissolved = dissolved_totals(&conditions.totals, phases, &amounts);
            let speciation = self.speciate(model, conditions, &dissolved, guess)?;
            let mut candidates: Vec<(usize, f64)> = (0..phases.len())
                .filter(|k| !active[*k])
                .map(|k| (k, self.log10_saturation(&phases[k].data, &speciation, conditions)))
                .filter(|(_, si)| *si > SATURATION_TOLERANCE)
                .collect();
            candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

            let mut added = false;
            for (k, _) in candidates {
                // Polymorphs and hydrates compete for the same ions; only the
                // most supersaturated of them may precipitate.
                let competing = (0..phases.len()).any(|j| active[j] && phases[j].data.ions == phases[k].data.ions);
                if !competing {
                    active[k] = true;
                    added = true;
                }
            }

            if !added {
                trace!(passes = pass + 1, "Active set settled");
                let jacobian = if indices.is_empty() {
                    None
                } else {
                    Some(self.active_system(model, conditions, phases, &indices, &amounts, guess)?.1)
                };
                return Ok(Precipitation {
                    amounts,
                    active: indices,
                    jacobian,
                });
            }
        }

        Err(diverged("precipitation active set did not settle".to_string()))
    }

    /// Newton iteration on `log10 Ω = 0` for the active phases.
    ///
    /// # Return
    ///
    /// `Some(k)` when phase `k` had to be dissolved completely and must leave
    /// the active set, `None` once converged.
    fn newton_on_active(
        &self,
        model: ActivityModel,
        conditions: &Conditions<f64>,
        phases: &[Phase],
        indices: &[usize],
        amounts: &mut [f64],
        guess: InitialGuess,
    ) -> Result<Option<usize>, ChemistryError> {
        let max_step = match guess {
            InitialGuess::Default => 1.0,
            InitialGuess::Fallback => 0.5,
        };

        for _ in 0..self.max_iterations {
            let (residual, jacobian) = self.active_system(model, conditions, phases, indices, amounts, guess)?;
            if residual.amax() < PRECIPITATION_TOLERANCE {
                return Ok(None);
            }
            let step = jacobian
                .lu()
                .solve(&(-&residual))
                .ok_or_else(|| diverged("singular precipitation Jacobian".to_string()))?;

            let current = dissolved_totals(&conditions.totals, phases, amounts);
            let mut alpha: f64 = max_step;
            for (e, available) in current.iter().enumerate() {
                let change: f64 = indices
                    .iter()
                    .enumerate()
                    .map(|(j, k)| -step[j] * phases[*k].stoichiometry[e])
                    .sum();
                if change < 0.0 && available + alpha * change <= 0.0 {
                    alpha = alpha.min(0.9 * available / -change);
                }
            }
            for (j, k) in indices.iter().enumerate() {
                amounts[*k] += alpha * step[j];
            }

            let most_negative = indices
                .iter()
                .copied()
                .filter(|k| amounts[*k] < 0.0)
                .min_by(|a, b| amounts[*a].total_cmp(&amounts[*b]));
            if most_negative.is_some() {
                return Ok(most_negative);
            }
        }

        Err(diverged(format!(
            "precipitation Newton did not converge in {} iterations",
            self.max_iterations
        )))
    }

    /// Residuals and Jacobian of `log10 Ω` for the active phases with
    /// respect to their precipitated amounts.
    fn active_system(
        &self,
        model: ActivityModel,
        conditions: &Conditions<f64>,
        phases: &[Phase],
        indices: &[usize],
        amounts: &[f64],
        guess: InitialGuess,
    ) -> Result<(DVector<f64>, DMatrix<f64>), ChemistryError> {
        let lifted = conditions.lift();
        let mut residual = DVector::zeros(indices.len());
        let mut jacobian = DMatrix::zeros(indices.len(), indices.len());
        for (col, seed) in indices.iter().enumerate() {
            let seeded: Vec<Dual64> = amounts
                .iter()
                .enumerate()
                .map(|(k, a)| if k == *seed { Dual64::new(*a, 1.0) } else { Dual64::from(*a) })
                .collect();
            let dissolved = dissolved_totals(&lifted.totals, phases, &seeded);
            let speciation = self.speciate(model, &lifted, &dissolved, guess)?;
            for (row, k) in indices.iter().enumerate() {
                let f = self.log10_saturation(&phases[*k].data, &speciation, &lifted);
                residual[row] = f.re;
                jacobian[(row, col)] = f.eps;
            }
        }
        Ok((residual, jacobian))
    }

    /// Precipitated amounts as dual numbers, differentiated through the
    /// active equilibrium conditions: `dn = -J⁻¹ ∂F/∂x`.
    fn implicit_amounts(
        &self,
        model: ActivityModel,
        conditions: &Conditions<Dual64>,
        phases: &[Phase],
        precipitation: &Precipitation,
        guess: InitialGuess,
    ) -> Result<Vec<Dual64>, ChemistryError> {
        let mut amounts: Vec<Dual64> = precipitation.amounts.iter().map(|a| Dual64::from(*a)).collect();
        let Some(jacobian) = &precipitation.jacobian else {
            return Ok(amounts);
        };
        let dissolved = dissolved_totals(&conditions.totals, phases, &amounts);
        let speciation = self.speciate(model, conditions, &dissolved, guess)?;
        let rhs = DVector::from_iterator(
            precipitation.active.len(),
            precipitation
                .active
                .iter()
                .map(|k| -self.log10_saturation(&phases[*k].data, &speciation, conditions).eps),
        );
        let dn = jacobian
            .clone()
            .lu()
            .solve(&rhs)
            .ok_or_else(|| diverged("singular precipitation Jacobian".to_string()))?;
        for (j, k) in precipitation.active.iter().enumerate() {
            amounts[*k] = Dual64::new(precipitation.amounts[*k], dn[j]);
        }
        Ok(amounts)
    }

    fn property<D: DualNum<f64> + Copy>(&self, property: &Property, state: &EquilibriumState<'_, D>) -> D {
        let conditions = state.conditions;
        let speciation = state.speciation;
        let w = conditions.solvent;
        match property {
            Property::Density => {
                let (_, salinity) = solution_mass(&speciation.molality, w);
                seawater_density(conditions.temperature, conditions.pressure, salinity)
            }
            Property::ScalingTendency(mineral) => {
                (self.log10_saturation(mineral, speciation, conditions) * LN_10).exp()
            }
            Property::SaturationIndex(mineral) => self.log10_saturation(mineral, speciation, conditions),
            Property::SpeciesAmount(Amount::Aqueous(i)) => speciation.molality[*i] * w,
            Property::SpeciesAmount(Amount::Mineral(k)) => state.amounts[*k],
            Property::SpeciesAmount(Amount::Solvent) => w / (WATER_MOLAR_MASS * 1.0e-3),
            Property::ElementAmount(e) => conditions.totals[*e],
            Property::IonicStrength => speciation.ionic_strength,
            Property::OsmoticPressure => {
                let total = speciation.molality.iter().fold(D::from(0.0), |acc, m| acc + *m);
                total * pure_water_density(conditions.temperature) * conditions.temperature * GAS_CONSTANT
            }
            Property::VaporPressure => saturation_pressure(conditions.temperature) * speciation.water_activity,
            Property::Enthalpy => {
                let (mass, salinity) = solution_mass(&speciation.molality, w);
                sensible_enthalpy(mass, conditions.temperature, salinity, REFERENCE_TEMPERATURE)
            }
            Property::Ph => conditions.ph,
        }
    }

    fn sensitivities(
        &self,
        problem: &EquilibriumProblem,
        phases: &[Phase],
        properties: &[Property],
        precipitation: &Precipitation,
    ) -> Result<DMatrix<f64>, ChemistryError> {
        let x = problem.values();
        let mut jacobian = DMatrix::zeros(properties.len(), x.len());
        for col in 0..x.len() {
            let seeded: Vec<Dual64> = x
                .iter()
                .enumerate()
                .map(|(i, v)| if i == col { Dual64::new(*v, 1.0) } else { Dual64::from(*v) })
                .collect();
            let conditions = self.conditions(problem, &seeded)?;
            let amounts = self.implicit_amounts(
                problem.activity_model,
                &conditions,
                phases,
                precipitation,
                problem.initial_guess,
            )?;
            let dissolved = dissolved_totals(&conditions.totals, phases, &amounts);
            let speciation = self.speciate(problem.activity_model, &conditions, &dissolved, problem.initial_guess)?;
            let state = EquilibriumState {
                conditions: &conditions,
                amounts: &amounts,
                speciation: &speciation,
            };
            for (row, property) in properties.iter().enumerate() {
                jacobian[(row, col)] = self.property(property, &state).eps;
            }
        }
        Ok(jacobian)
    }
}

impl EquilibriumEngine for AqueousEngine {
    fn name(&self) -> &str {
        "aqueous"
    }

    fn check_output(&self, key: &OutputKey, phases: &[String]) -> Result<(), ChemistryError> {
        self.resolve(key, phases).map(|_| ())
    }

    fn solve(
        &self,
        problem: &EquilibriumProblem,
        outputs: &[OutputKey],
        with_derivatives: bool,
    ) -> Result<EngineResponse, ChemistryError> {
        let phases = self.resolve_phases(&problem.phases)?;
        let properties = outputs
            .iter()
            .map(|key| self.resolve(key, &problem.phases))
            .collect::<Result<Vec<_>, _>>()?;

        let x = problem.values();
        let conditions = self.conditions(problem, &x)?;
        let precipitation = self.precipitate(problem.activity_model, &conditions, &phases, problem.initial_guess)?;
        let dissolved = dissolved_totals(&conditions.totals, &phases, &precipitation.amounts);
        let speciation = self.speciate(problem.activity_model, &conditions, &dissolved, problem.initial_guess)?;
        let state = EquilibriumState {
            conditions: &conditions,
            amounts: &precipitation.amounts,
            speciation: &speciation,
        };

        let mut values = Vec::with_capacity(outputs.len());
        for (key, property) in outputs.iter().zip(&properties) {
            let value = self.property(property, &state);
            if !value.is_finite() {
                return Err(diverged(format!("non-finite value for '{key}'")));
            }
            values.push(value);
        }
        debug!(
            ionic_strength = speciation.ionic_strength,
            precipitating = precipitation.active.len(),
            "Equilibrium solved"
        );

        let jacobian = if with_derivatives {
            Some(self.sensitivities(problem, &phases, &properties, &precipitation)?)
        } else {
            None
        };
        Ok(EngineResponse { values, jacobian })
    }
}

fn diverged(reason: String) -> ChemistryError {
    ChemistryError::Diverged { reason }
}

fn aqueous_index(name: &str) -> Option<usize> {
    AQUEOUS.iter().position(|s| *s == name)
}

fn molar_mass(name: &str) -> f64 {
    species(name).map_or(0.0, |s| s.molar_mass)
}

/// Mass of the aqueous solution in kg and its salinity in g/kg.
fn solution_mass<D: DualNum<f64> + Copy>(molality: &[D; 11], solvent: D) -> (D, D) {
    let solute = AQUEOUS
        .iter()
        .zip(molality.iter())
        .fold(D::from(0.0), |acc, (name, m)| acc + *m * (molar_mass(name) * 1.0e-3));
    let solute_mass = solute * solvent;
    let mass = solute_mass + solvent;
    (mass, solute_mass / mass * 1.0e3)
}

fn floored<D: DualNum<f64> + Copy>(m: D) -> D {
    if m.re() < MOLALITY_FLOOR { D::from(MOLALITY_FLOOR) } else { m }
}

fn ionic_strength<D: DualNum<f64> + Copy>(molality: &[D; 11]) -> D {
    molality
        .iter()
        .zip(CHARGES)
        .fold(D::from(0.0), |acc, (m, z)| acc + *m * f64::from(z * z))
        * 0.5
}

fn dissolved_totals<D: DualNum<f64> + Copy>(totals: &[D; N_ELEMENTS], phases: &[Phase], amounts: &[D]) -> [D; N_ELEMENTS] {
    let mut dissolved = *totals;
    for (phase, n) in phases.iter().zip(amounts) {
        for (e, nu) in phase.stoichiometry.iter().enumerate() {
            if *nu != 0.0 {
                dissolved[e] = dissolved[e] - *n * *nu;
            }
        }
    }
    dissolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Standard seawater in mol per kg of water, roughly.
    fn seawater(phases: &[&str]) -> EquilibriumProblem {
        let mg_per_l = [
            ("Na+", 10556.0),
            ("K+", 380.0),
            ("Ca+2", 400.0),
            ("Mg+2", 1262.0),
            ("Cl-", 18977.2),
            ("SO4-2", 2649.0),
            ("HCO3-", 140.0),
        ];
        let mut inputs = vec![
            (InputId::Temperature, 293.0),
            (InputId::Pressure, 1.0e5),
            (InputId::Ph, 7.56),
            (InputId::Solvent, 1.0),
        ];
        for (name, c) in mg_per_l {
            inputs.push((InputId::Species(name.to_string()), c * 1.0e-3 / molar_mass(name)));
        }
        EquilibriumProblem {
            inputs,
            phases: phases.iter().map(|p| p.to_string()).collect(),
            activity_model: ActivityModel::Davies,
            initial_guess: InitialGuess::Default,
        }
    }

    fn keys(names: &[&str]) -> Vec<OutputKey> {
        names.iter().map(|n| n.parse().unwrap()).collect()
    }

    #[test]
    fn seawater_density_and_scaling_are_physical() {
        let engine = AqueousEngine::new();
        let outputs = keys(&[
            "density",
            "scalingTendency[Calcite]",
            "scalingTendency[Gypsum]",
            "speciesAmount[Calcite]",
            "speciesAmount[Gypsum]",
        ]);
        let response = engine.solve(&seawater(&["Calcite", "Gypsum"]), &outputs, false).unwrap();
        let v = &response.values;
        assert!(v[0] > 1020.0 && v[0] < 1030.0, "density {}", v[0]);
        assert!(v[1] >= 0.0 && v[1] <= 1.0 + 1e-6);
        assert!(v[2] >= 0.0 && v[2] <= 1.0 + 1e-6);
        assert!(v[3] >= 0.0);
        assert!(v[4] >= 0.0);
        assert!(response.jacobian.is_none());
    }

    #[test]
    fn calcite_is_supersaturated_without_precipitation() {
        let engine = AqueousEngine::new();
        let outputs = keys(&["scalingTendency[Calcite]", "saturationIndex[Calcite]"]);
        let response = engine.solve(&seawater(&[]), &outputs, false).unwrap();
        assert!(response.values[0] > 1.0);
        assert_relative_eq!(response.values[1], response.values[0].log10(), epsilon = 1e-12);
    }

    #[test]
    fn precipitation_brings_calcite_to_saturation() {
        let engine = AqueousEngine::new();
        let outputs = keys(&["scalingTendency[Calcite]", "speciesAmount[Calcite]"]);
        let response = engine.solve(&seawater(&["Calcite"]), &outputs, false).unwrap();
        assert_relative_eq!(response.values[0], 1.0, epsilon = 1e-8);
        assert!(response.values[1] > 0.0);
    }

    #[test]
    fn analytic_jacobian_matches_central_differences() {
        let engine = AqueousEngine::new();
        let problem = seawater(&["Calcite"]);
        let outputs = keys(&["density", "speciesAmount[Calcite]", "osmoticPressure"]);
        let response = engine.solve(&problem, &outputs, true).unwrap();
        let jacobian = response.jacobian.unwrap();

        for col in [0, 4, 6] {
            let x = problem.inputs[col].1;
            let h = 1.0e-4 * x.abs();
            let up = engine.solve(&problem.with_input(col, x + h), &outputs, false).unwrap();
            let down = engine.solve(&problem.with_input(col, x - h), &outputs, false).unwrap();
            for row in 0..outputs.len() {
                let fd = (up.values[row] - down.values[row]) / (2.0 * h);
                assert_relative_eq!(jacobian[(row, col)], fd, max_relative = 1e-4, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn species_and_element_inputs_give_identical_results() {
        let engine = AqueousEngine::new();
        let by_species = seawater(&["Calcite"]);
        let mut by_element = by_species.clone();
        for (id, _) in by_element.inputs.iter_mut() {
            if let InputId::Species(name) = id {
                let element = species(name).unwrap().elements[0].0;
                *id = InputId::Element(element.to_string());
            }
        }
        let outputs = keys(&["density", "elementAmount[Ca]", "scalingTendency[Gypsum]"]);
        let a = engine.solve(&by_species, &outputs, false).unwrap();
        let b = engine.solve(&by_element, &outputs, false).unwrap();
        for (x, y) in a.values.iter().zip(&b.values) {
            assert_relative_eq!(x, y, max_relative = 1e-12);
        }
    }

    #[test]
    fn unknown_output_is_reported_by_name() {
        let engine = AqueousEngine::new();
        let err = engine
            .check_output(&OutputKey::scalar("enthalpyOfMixing"), &[])
            .unwrap_err();
        assert_eq!(
            err,
            ChemistryError::UnknownOutput {
                key: "enthalpyOfMixing".to_string()
            }
        );
        assert!(err.to_string().contains("Unknown output"));
        assert!(engine.check_output(&OutputKey::indexed("scalingTendency", "Kryptonite"), &[]).is_err());
    }

    #[test]
    fn mineral_amount_requires_phase_to_be_present() {
        let engine = AqueousEngine::new();
        let err = engine
            .check_output(&OutputKey::indexed("speciesAmount", "Gypsum"), &["Calcite".to_string()])
            .unwrap_err();
        assert!(matches!(err, ChemistryError::PhaseNotPresent { .. }));
    }

    #[test]
    fn non_positive_solvent_diverges() {
        let engine = AqueousEngine::new();
        let problem = seawater(&[]).with_input(3, 0.0);
        let err = engine.solve(&problem, &keys(&["density"]), false).unwrap_err();
        assert!(matches!(err, ChemistryError::Diverged { .. }));
    }

    #[test]
    fn starved_activity_iteration_diverges_but_fallback_converges() {
        let starved = AqueousEngine::with_limits(2, 1.0e-13);
        let problem = seawater(&[]);
        assert!(matches!(
            starved.solve(&problem, &keys(&["density"]), false),
            Err(ChemistryError::Diverged { .. })
        ));

        let engine = AqueousEngine::new();
        let mut fallback = problem.clone();
        fallback.initial_guess = InitialGuess::Fallback;
        let a = engine.solve(&problem, &keys(&["ionicStrength"]), false).unwrap();
        let b = engine.solve(&fallback, &keys(&["ionicStrength"]), false).unwrap();
        assert_relative_eq!(a.values[0], b.values[0], max_relative = 1e-9);
    }

    #[test]
    fn missing_temperature_is_reported() {
        let engine = AqueousEngine::new();
        let mut problem = seawater(&[]);
        problem.inputs.remove(0);
        assert_eq!(
            engine.solve(&problem, &keys(&["density"]), false).unwrap_err(),
            ChemistryError::MissingInput("temperature")
        );
    }

    #[test]
    fn enthalpy_jacobian_matches_central_differences_above_reference() {
        let engine = AqueousEngine::new();
        let problem = seawater(&["Calcite"]).with_input(0, 313.15);
        let outputs = keys(&["enthalpy", "density"]);
        let response = engine.solve(&problem, &outputs, true).unwrap();
        assert!(response.values[0] > 0.0);
        let jacobian = response.jacobian.unwrap();

        for col in [0, 3, 4, 6] {
            let x = problem.inputs[col].1;
            let h = 1.0e-4 * x.abs();
            let up = engine.solve(&problem.with_input(col, x + h), &outputs, false).unwrap();
            let down = engine.solve(&problem.with_input(col, x - h), &outputs, false).unwrap();
            let fd = (up.values[0] - down.values[0]) / (2.0 * h);
            assert_relative_eq!(jacobian[(0, col)], fd, max_relative = 1e-4, epsilon = 1e-6);
        }
    }

    #[test]
    fn enthalpy_is_zero_at_reference_temperature() {
        let engine = AqueousEngine::new();
        let problem = seawater(&[]).with_input(0, REFERENCE_TEMPERATURE);
        let response = engine.solve(&problem, &keys(&["enthalpy"]), false).unwrap();
        assert_relative_eq!(response.values[0], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn vapor_pressure_is_lowered_by_salt() {
        let engine = AqueousEngine::new();
        let response = engine.solve(&seawater(&[]), &keys(&["vaporPressure", "ionicStrength"]), false).unwrap();
        assert!(response.values[0] < saturation_pressure(293.0));
        assert!(response.values[1] > 0.5 && response.values[1] < 0.9);
    }
}
