use crate::core::chemistry::InputId;
use crate::core::minerals::mineral;
use crate::core::model::{HostModel, ModelError, VarId};
use crate::core::species::{ELEMENTS, SPECIES, element_index, host_alias, is_solvent, species};
use crate::core::units::{AmountUnit, CompositionBasis, PressureUnit, TemperatureUnit, UnitMap};
use thiserror::Error;
use tracing::debug;

/// Solvent assumed per litre when a concentration-based composition does
/// not list water.
const DEFAULT_SOLVENT_KG: f64 = 1.0;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum MapperError {
    #[error("Species '{species}' has no counterpart in the equilibrium species tables")]
    UnmappedSpecies { species: String },
    #[error("Species '{0}' appears more than once in the composition")]
    DuplicateSpecies(String),
    #[error("Mineral phase '{0}' is not known to the equilibrium tables")]
    UnknownPhase(String),
    #[error("A composition given as {unit} must include water ('H2O')")]
    MissingSolvent { unit: AmountUnit },
    #[error("Temperature must be positive, got {0} K")]
    NonPositiveTemperature(f64),
    #[error("Pressure must be positive, got {0} Pa")]
    NonPositivePressure(f64),
    #[error("Host model error: {0}")]
    Model(#[from] ModelError),
}

/// Host variables describing the thermodynamic state.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemState {
    pub temperature: VarId,
    pub temperature_unit: TemperatureUnit,
    pub pressure: VarId,
    pub pressure_unit: PressureUnit,
    /// Without a pH variable the solution is treated as neutral.
    pub ph: Option<VarId>,
}

/// Host variables holding per-species amounts, all in the same unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Composition {
    pub species: Vec<(String, VarId)>,
    pub unit: AmountUnit,
    /// Translate host labels ("HCO3", "NaCl") into canonical species.
    pub convert_to_rkt_species: bool,
    /// Pass species amounts through and let the engine aggregate them into
    /// elements; otherwise element balances are built in the host model.
    pub dissolve_species_in_reaktoro: bool,
}

/// Ordered set of mineral phases that may form; empty means aqueous only.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PhaseSpec(Vec<String>);

impl PhaseSpec {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut phases: Vec<String> = Vec::new();
        for name in names {
            let name = name.into();
            if !phases.contains(&name) {
                phases.push(name);
            }
        }
        Self(phases)
    }

    pub fn aqueous_only() -> Self {
        Self::default()
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One oracle input expressed as `offset + Σ coefficient · host value`.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedInput {
    pub id: InputId,
    pub terms: Vec<(VarId, f64)>,
    pub offset: f64,
}

impl MappedInput {
    fn evaluate(&self, model: &HostModel) -> Result<f64, ModelError> {
        let mut value = self.offset;
        for (var, coeff) in &self.terms {
            value += coeff * model.value(*var)?;
        }
        Ok(value)
    }
}

/// Moles of `element` per unit of each contributing host variable.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementBalance {
    pub element: &'static str,
    pub terms: Vec<(VarId, f64)>,
}

/// How species amounts reach the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum MassBalance {
    /// Species amounts are passed through; the engine aggregates them.
    Delegate,
    /// Element totals are passed; the caller owns the balance constraints.
    Explicit(Vec<ElementBalance>),
}

/// Mapped state, ready to be turned into an equilibrium problem.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleInput {
    pub inputs: Vec<(InputId, f64)>,
    pub phases: Vec<String>,
}

/// Translates host variables into oracle inputs.
///
/// All alias and unit lookups happen once, at construction; [`StateMapper::map`]
/// only evaluates the resulting linear maps, so the Jacobian with respect to
/// host variables follows from the oracle Jacobian by the chain rule through
/// [`MappedInput::terms`].
#[derive(Debug, Clone, PartialEq)]
pub struct StateMapper {
    inputs: Vec<MappedInput>,
    balance: MassBalance,
    phases: Vec<String>,
}

impl StateMapper {
    pub fn new(state: &SystemState, composition: &Composition, phases: &PhaseSpec) -> Result<Self, MapperError> {
        for phase in phases.names() {
            if mineral(phase).is_none() {
                return Err(MapperError::UnknownPhase(phase.clone()));
            }
        }

        let mut inputs = vec![
            linear_input(InputId::Temperature, state.temperature, state.temperature_unit.to_kelvin()),
            linear_input(InputId::Pressure, state.pressure, state.pressure_unit.to_pascal()),
        ];
        if let Some(ph) = state.ph {
            inputs.push(linear_input(InputId::Ph, ph, UnitMap::IDENTITY));
        }

        let unit = composition.unit;
        let mut solvent_terms: Vec<(VarId, f64)> = Vec::new();
        let mut species_terms: Vec<(&'static str, Vec<(VarId, f64)>)> = Vec::new();
        let mut seen: Vec<&str> = Vec::new();

        for (label, var) in &composition.species {
            if seen.contains(&label.as_str()) {
                return Err(MapperError::DuplicateSpecies(label.clone()));
            }
            seen.push(label);

            let (molar_mass, expansion) = resolve_label(label, composition.convert_to_rkt_species)?;
            for (name, coeff) in expansion {
                if is_solvent(name) {
                    solvent_terms.push((*var, coeff * unit.kilograms_per_unit(molar_mass)));
                    continue;
                }
                let per_unit = coeff * unit.moles_per_unit(molar_mass);
                match species_terms.iter_mut().find(|(s, _)| *s == name) {
                    Some((_, terms)) => terms.push((*var, per_unit)),
                    None => species_terms.push((name, vec![(*var, per_unit)])),
                }
            }
        }

        let solvent = if !solvent_terms.is_empty() {
            MappedInput {
                id: InputId::Solvent,
                terms: solvent_terms,
                offset: 0.0,
            }
        } else if unit.basis() == CompositionBasis::Concentration {
            MappedInput {
                id: InputId::Solvent,
                terms: Vec::new(),
                offset: DEFAULT_SOLVENT_KG,
            }
        } else {
            return Err(MapperError::MissingSolvent { unit });
        };
        inputs.push(solvent);

        let balance = if composition.dissolve_species_in_reaktoro {
            for (name, terms) in species_terms {
                inputs.push(MappedInput {
                    id: InputId::Species(name.to_string()),
                    terms,
                    offset: 0.0,
                });
            }
            MassBalance::Delegate
        } else {
            let rows = element_rows(&species_terms);
            for row in &rows {
                inputs.push(MappedInput {
                    id: InputId::Element(row.element.to_string()),
                    terms: row.terms.clone(),
                    offset: 0.0,
                });
            }
            MassBalance::Explicit(rows)
        };

        debug!(
            inputs = inputs.len(),
            explicit = matches!(balance, MassBalance::Explicit(_)),
            "State mapper built"
        );
        Ok(Self {
            inputs,
            balance,
            phases: phases.names().to_vec(),
        })
    }

    /// Evaluates every mapped input at the current host values.
    pub fn map(&self, model: &HostModel) -> Result<OracleInput, MapperError> {
        let mut inputs = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            let value = input.evaluate(model)?;
            match input.id {
                InputId::Temperature if value <= 0.0 => return Err(MapperError::NonPositiveTemperature(value)),
                InputId::Pressure if value <= 0.0 => return Err(MapperError::NonPositivePressure(value)),
                _ => {}
            }
            inputs.push((input.id.clone(), value));
        }
        Ok(OracleInput {
            inputs,
            phases: self.phases.clone(),
        })
    }

    pub fn inputs(&self) -> &[MappedInput] {
        &self.inputs
    }

    pub fn mass_balance(&self) -> &MassBalance {
        &self.balance
    }

    pub fn phases(&self) -> &[String] {
        &self.phases
    }

    /// Routes element inputs through dedicated host variables, one per
    /// element, so that the oracle sees `element[e] = 1 · var_e`.
    pub fn route_elements(&mut self, element_vars: &[(&'static str, VarId)]) {
        for input in &mut self.inputs {
            if let InputId::Element(name) = &input.id {
                if let Some((_, var)) = element_vars.iter().find(|(e, _)| *e == name.as_str()) {
                    input.terms = vec![(*var, 1.0)];
                }
            }
        }
    }

    /// Host variables the mapped inputs depend on, in first-use order.
    pub fn host_variables(&self) -> Vec<VarId> {
        let mut vars: Vec<VarId> = Vec::new();
        for (var, _) in self.inputs.iter().flat_map(|input| input.terms.iter()) {
            if !vars.contains(var) {
                vars.push(*var);
            }
        }
        vars
    }
}

fn linear_input(id: InputId, var: VarId, map: UnitMap) -> MappedInput {
    MappedInput {
        id,
        terms: vec![(var, map.scale)],
        offset: map.offset,
    }
}

/// Molar mass of the host label and the canonical species it expands into.
fn resolve_label(label: &str, convert: bool) -> Result<(f64, Vec<(&'static str, f64)>), MapperError> {
    let unmapped = || MapperError::UnmappedSpecies {
        species: label.to_string(),
    };
    if convert {
        let alias = host_alias(label).ok_or_else(unmapped)?;
        Ok((alias.molar_mass, alias.species.to_vec()))
    } else {
        let (name, data) = SPECIES.get_entry(label).ok_or_else(unmapped)?;
        Ok((data.molar_mass, vec![(*name, 1.0)]))
    }
}

fn element_rows(species_terms: &[(&'static str, Vec<(VarId, f64)>)]) -> Vec<ElementBalance> {
    let mut rows: Vec<ElementBalance> = ELEMENTS
        .iter()
        .map(|e| ElementBalance {
            element: *e,
            terms: Vec::new(),
        })
        .collect();
    for (name, terms) in species_terms {
        let Some(data) = species(name) else { continue };
        for (element, count) in data.elements {
            if let Some(e) = element_index(element) {
                for (var, per_unit) in terms {
                    rows[e].terms.push((*var, per_unit * count));
                }
            }
        }
    }
    rows.retain(|row| !row.terms.is_empty());
    rows
}
