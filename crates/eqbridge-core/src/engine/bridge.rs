use super::config::{BridgeConfig, RelinearizationPolicy};
use super::error::EngineError;
use super::mapper::{Composition, MassBalance, PhaseSpec, StateMapper, SystemState};
use super::oracle::OracleAdapter;
use super::state::{BridgeState, BridgeStats};
use super::surrogate::{self, ConditioningWarning, JacobianEntry, ReferenceInput};
use crate::core::chemistry::{EquilibriumEngine, OutputKey};
use crate::core::model::{HostModel, ModelError, Relation, RelationId, VarId, Variable};
use crate::core::solver::{ObserverError, SolveObserver};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

/// An output to expose, either as a new host variable or bound to an
/// existing one.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputBinding {
    pub key: OutputKey,
    pub variable: Option<VarId>,
}

impl OutputBinding {
    pub fn new(key: OutputKey) -> Self {
        Self { key, variable: None }
    }

    pub fn bound(key: OutputKey, variable: VarId) -> Self {
        Self {
            key,
            variable: Some(variable),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeSpec {
    pub state: SystemState,
    pub composition: Composition,
    pub phases: PhaseSpec,
    pub outputs: Vec<OutputBinding>,
}

/// Couples a host model to an equilibrium engine.
///
/// The block owns one output variable and one surrogate relation per
/// [`OutputKey`]. Relations are linearizations around a reference point and
/// are only refreshed on [`BridgeBlock::initialize`] or when the host solver
/// has moved the inputs past the configured [`RelinearizationPolicy`].
#[derive(Debug)]
pub struct BridgeBlock<E> {
    name: String,
    mapper: StateMapper,
    oracle: OracleAdapter<E>,
    keys: Vec<OutputKey>,
    outputs: Vec<VarId>,
    created_variables: Vec<VarId>,
    element_variables: Vec<(&'static str, VarId)>,
    balance_relations: Vec<RelationId>,
    surrogate_relations: Vec<RelationId>,
    entries: Vec<JacobianEntry>,
    reference: Vec<ReferenceInput>,
    warnings: Vec<ConditioningWarning>,
    user_scaling: HashMap<OutputKey, f64>,
    policy: RelinearizationPolicy,
    state: BridgeState,
    stats: BridgeStats,
    last_refresh: usize,
}

impl<E: EquilibriumEngine> BridgeBlock<E> {
    /// Validates the requested outputs and adds the block's variables and
    /// (in explicit aggregation mode) element-balance relations to `model`.
    pub fn build(
        name: impl Into<String>,
        model: &mut HostModel,
        spec: BridgeSpec,
        engine: E,
        config: &BridgeConfig,
    ) -> Result<Self, EngineError> {
        let name = name.into();
        let mut mapper = StateMapper::new(&spec.state, &spec.composition, &spec.phases)?;

        let mut keys: Vec<OutputKey> = Vec::with_capacity(spec.outputs.len());
        for binding in &spec.outputs {
            if keys.contains(&binding.key) {
                return Err(EngineError::DuplicateOutput(binding.key.clone()));
            }
            keys.push(binding.key.clone());
        }
        let oracle = OracleAdapter::new(engine, config);
        oracle.check_outputs(&keys, mapper.phases())?;

        let mut outputs = Vec::with_capacity(keys.len());
        let mut created_variables = Vec::new();
        for binding in &spec.outputs {
            let var = match binding.variable {
                Some(var) => {
                    model.variable(var).ok_or(ModelError::UnknownVariable(var))?;
                    var
                }
                None => {
                    let var = model.add_variable(Variable::new(format!("{name}.{}", binding.key), 0.0));
                    created_variables.push(var);
                    var
                }
            };
            if outputs.contains(&var) {
                return Err(EngineError::Internal(format!(
                    "output '{}' is bound to a variable used by another output",
                    binding.key
                )));
            }
            outputs.push(var);
        }

        let mut element_variables = Vec::new();
        let mut balance_relations = Vec::new();
        let rows = match mapper.mass_balance() {
            MassBalance::Explicit(rows) => rows.clone(),
            MassBalance::Delegate => Vec::new(),
        };
        for row in rows {
            let total = Variable::new(format!("{name}.element[{}]", row.element), 0.0).non_negative();
            let total = model.add_variable(total);
            let mut terms = row.terms;
            terms.push((total, -1.0));
            let relation = Relation::linear(format!("{name}.balance[{}]", row.element), terms, 0.0);
            balance_relations.push(model.add_relation(relation)?);
            element_variables.push((row.element, total));
            created_variables.push(total);
        }
        if !element_variables.is_empty() {
            mapper.route_elements(&element_variables);
        }

        info!(
            bridge = %name,
            outputs = keys.len(),
            element_balances = balance_relations.len(),
            "Bridge block built"
        );
        Ok(Self {
            name,
            mapper,
            oracle,
            keys,
            outputs,
            created_variables,
            element_variables,
            balance_relations,
            surrogate_relations: Vec::new(),
            entries: Vec::new(),
            reference: Vec::new(),
            warnings: Vec::new(),
            user_scaling: config.user_scaling.clone(),
            policy: config.relinearization,
            state: BridgeState::Unbuilt,
            stats: BridgeStats::default(),
            last_refresh: 0,
        })
    }

    /// Evaluates the oracle at the current host values, installs the
    /// surrogate relations and sets every output variable to its computed
    /// value. May be called again to re-anchor the block at a new point.
    pub fn initialize(&mut self, model: &mut HostModel) -> Result<(), EngineError> {
        self.initialize_inner(model)
            .map_err(|source| EngineError::Initialization {
                bridge: self.name.clone(),
                source: Box::new(source),
            })?;
        self.state = BridgeState::Initialized;
        self.last_refresh = 0;
        info!(bridge = %self.name, "Bridge block initialized");
        Ok(())
    }

    fn initialize_inner(&mut self, model: &mut HostModel) -> Result<(), EngineError> {
        self.sync_element_totals(model)?;
        self.refresh(model)?;
        for (var, entry) in self.outputs.iter().zip(&self.entries) {
            model.set_value(*var, entry.value_ref)?;
        }
        Ok(())
    }

    /// Re-linearizes if the host inputs drifted past the policy. Returns
    /// whether the relations changed.
    pub fn update(&mut self, model: &mut HostModel, iteration: usize) -> Result<bool, EngineError> {
        if self.state == BridgeState::Unbuilt {
            return Err(EngineError::NotInitialized {
                bridge: self.name.clone(),
            });
        }
        if iteration == 0 {
            self.last_refresh = 0;
        }
        if !self.is_stale(model, iteration)? {
            return Ok(false);
        }

        self.state = BridgeState::Stale;
        debug!(bridge = %self.name, iteration, "Reference point is stale; re-evaluating");
        self.refresh(model).map_err(|source| EngineError::ReEvaluation {
            bridge: self.name.clone(),
            iteration,
            source: Box::new(source),
        })?;
        self.stats.relinearizations += 1;
        self.last_refresh = iteration;
        self.state = BridgeState::Converged;
        Ok(true)
    }

    /// Records that the host solve finished with the current relations.
    pub fn mark_converged(&mut self) {
        if self.state.is_linearized() {
            self.state = BridgeState::Converged;
        }
    }

    /// Removes every variable and relation the block added and releases the
    /// engine. Bound output variables stay in the model.
    pub fn teardown(mut self, model: &mut HostModel) -> BridgeStats {
        for id in self.surrogate_relations.drain(..).chain(self.balance_relations.drain(..)) {
            model.remove_relation(id);
        }
        for var in self.created_variables.drain(..) {
            model.remove_variable(var);
        }
        self.oracle.release();
        info!(bridge = %self.name, oracle_calls = self.stats.oracle_calls, "Bridge block torn down");
        self.stats
    }

    pub fn report(&self, model: &HostModel) -> BridgeReport {
        let rows = self
            .keys
            .iter()
            .zip(&self.outputs)
            .enumerate()
            .map(|(i, (key, var))| ReportRow {
                key: key.clone(),
                value: model.value(*var).unwrap_or(f64::NAN),
                reference: self.entries.get(i).map_or(f64::NAN, |e| e.value_ref),
            })
            .collect();
        BridgeReport {
            name: self.name.clone(),
            state: self.state,
            stats: self.stats,
            rows,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    pub fn keys(&self) -> &[OutputKey] {
        &self.keys
    }

    /// Reference values and partials from the latest oracle evaluation.
    pub fn jacobian(&self) -> &[JacobianEntry] {
        &self.entries
    }

    pub fn reference_point(&self) -> &[ReferenceInput] {
        &self.reference
    }

    pub fn warnings(&self) -> &[ConditioningWarning] {
        &self.warnings
    }

    pub fn output_variable(&self, key: &OutputKey) -> Option<VarId> {
        self.keys.iter().position(|k| k == key).map(|i| self.outputs[i])
    }

    pub fn element_variables(&self) -> &[(&'static str, VarId)] {
        &self.element_variables
    }

    pub fn engine(&self) -> &E {
        self.oracle.engine()
    }

    fn sync_element_totals(&self, model: &mut HostModel) -> Result<(), ModelError> {
        let MassBalance::Explicit(rows) = self.mapper.mass_balance() else {
            return Ok(());
        };
        for (row, (_, total)) in rows.iter().zip(&self.element_variables) {
            let mut value = 0.0;
            for (var, coeff) in &row.terms {
                value += coeff * model.value(*var)?;
            }
            model.set_value(*total, value)?;
        }
        Ok(())
    }

    fn is_stale(&self, model: &HostModel, iteration: usize) -> Result<bool, ModelError> {
        match self.policy {
            RelinearizationPolicy::InputDelta { threshold, floor } => {
                let mut drift: f64 = 0.0;
                for point in &self.reference {
                    let value = model.value(point.variable)?;
                    drift = drift.max((value - point.value).abs() / point.value.abs().max(floor));
                }
                Ok(drift > threshold)
            }
            RelinearizationPolicy::EveryNIterations(n) => Ok(iteration >= self.last_refresh + n),
        }
    }

    /// One mapper, oracle and surrogate cycle at the current host values.
    fn refresh(&mut self, model: &mut HostModel) -> Result<(), EngineError> {
        let input = self.mapper.map(model)?;
        let evaluation = self.oracle.evaluate(&input, &self.keys)?;
        self.stats.oracle_calls += 1;
        self.stats.engine_solves = self.oracle.engine_solves();
        self.stats.fallback_retries = self.oracle.fallback_retries();

        let variables = self.mapper.host_variables();
        let mut reference = Vec::with_capacity(variables.len());
        for var in &variables {
            reference.push(ReferenceInput {
                variable: *var,
                value: model.value(*var)?,
                fixed: model.is_fixed(*var)?,
            });
        }

        let entries: Vec<JacobianEntry> = evaluation
            .keys
            .iter()
            .enumerate()
            .map(|(row, key)| {
                let mut partials: Vec<(VarId, f64)> = variables.iter().map(|v| (*v, 0.0)).collect();
                for (col, input) in self.mapper.inputs().iter().enumerate() {
                    let derivative = evaluation.jacobian[(row, col)];
                    for (var, coeff) in &input.terms {
                        if let Some((_, d)) = partials.iter_mut().find(|(v, _)| v == var) {
                            *d += derivative * coeff;
                        }
                    }
                }
                JacobianEntry {
                    key: key.clone(),
                    value_ref: evaluation.values[row],
                    partials,
                }
            })
            .collect();

        let set = surrogate::build(&entries, &self.outputs, &reference, &self.user_scaling);
        if self.surrogate_relations.is_empty() {
            for relation in &set.relations {
                let id = model.add_relation(relation.to_relation(self.relation_name(&relation.key)))?;
                self.surrogate_relations.push(id);
            }
        } else {
            for (id, relation) in self.surrogate_relations.iter().zip(&set.relations) {
                model.replace_relation(*id, relation.to_relation(self.relation_name(&relation.key)))?;
            }
        }

        self.entries = entries;
        self.reference = reference;
        self.warnings = set.warnings;
        Ok(())
    }

    fn relation_name(&self, key: &OutputKey) -> String {
        format!("{}.surrogate[{}]", self.name, key)
    }
}

impl<E: EquilibriumEngine> SolveObserver for BridgeBlock<E> {
    fn after_iteration(&mut self, model: &mut HostModel, iteration: usize) -> Result<bool, ObserverError> {
        self.update(model, iteration).map_err(|e| Box::new(e) as ObserverError)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub key: OutputKey,
    pub value: f64,
    pub reference: f64,
}

/// Snapshot of a bridge block for display.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeReport {
    pub name: String,
    pub state: BridgeState,
    pub stats: BridgeStats,
    pub rows: Vec<ReportRow>,
}

impl fmt::Display for BridgeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Bridge '{}' ({}): {} oracle calls, {} re-linearizations",
            self.name, self.state, self.stats.oracle_calls, self.stats.relinearizations
        )?;
        let width = self.rows.iter().map(|r| r.key.to_string().len()).max().unwrap_or(0);
        for row in &self.rows {
            writeln!(
                f,
                "  {:<width$}  {:>14.6e}  (reference {:.6e})",
                row.key.to_string(),
                row.value,
                row.reference
            )?;
        }
        Ok(())
    }
}
