use super::ids::{RelationId, VarId};
use super::relation::{Relation, RelationKind};
use super::variable::Variable;
use slotmap::SlotMap;
use thiserror::Error;

const GRADIENT_RELATIVE_STEP: f64 = 1.0e-7;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ModelError {
    #[error("Variable {0:?} does not exist in the host model")]
    UnknownVariable(VarId),
    #[error("Relation {0:?} does not exist in the host model")]
    UnknownRelation(RelationId),
    #[error("Relation '{relation}' references variable {variable:?} which does not exist")]
    DanglingReference { relation: String, variable: VarId },
}

/// A snapshot of every variable value, used to roll a model back.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueSnapshot(Vec<(VarId, f64)>);

/// The algebraic host model: named scalar variables and equality relations.
///
/// Variables and relations live in slot maps, so ids stay valid while other
/// entries are added or removed.
#[derive(Debug, Default)]
pub struct HostModel {
    variables: SlotMap<VarId, Variable>,
    relations: SlotMap<RelationId, Relation>,
}

impl HostModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_variable(&mut self, variable: Variable) -> VarId {
        self.variables.insert(variable)
    }

    pub fn variable(&self, id: VarId) -> Option<&Variable> {
        self.variables.get(id)
    }

    pub fn variable_mut(&mut self, id: VarId) -> Option<&mut Variable> {
        self.variables.get_mut(id)
    }

    pub fn variables_iter(&self) -> impl Iterator<Item = (VarId, &Variable)> {
        self.variables.iter()
    }

    pub fn find_variable(&self, name: &str) -> Option<VarId> {
        self.variables
            .iter()
            .find(|(_, v)| v.name == name)
            .map(|(id, _)| id)
    }

    /// Removes a variable.
    ///
    /// # Return
    ///
    /// The removed variable, or `None` if the id was stale. Relations that still
    /// reference it will fail on their next evaluation.
    pub fn remove_variable(&mut self, id: VarId) -> Option<Variable> {
        self.variables.remove(id)
    }

    pub fn value(&self, id: VarId) -> Result<f64, ModelError> {
        self.variables
            .get(id)
            .map(|v| v.value)
            .ok_or(ModelError::UnknownVariable(id))
    }

    pub fn set_value(&mut self, id: VarId, value: f64) -> Result<(), ModelError> {
        let var = self
            .variables
            .get_mut(id)
            .ok_or(ModelError::UnknownVariable(id))?;
        var.value = value;
        Ok(())
    }

    /// Fixes a variable at `value`, turning it into a parameter of the solve.
    pub fn fix(&mut self, id: VarId, value: f64) -> Result<(), ModelError> {
        let var = self
            .variables
            .get_mut(id)
            .ok_or(ModelError::UnknownVariable(id))?;
        var.value = value;
        var.fixed = true;
        Ok(())
    }

    pub fn unfix(&mut self, id: VarId) -> Result<(), ModelError> {
        let var = self
            .variables
            .get_mut(id)
            .ok_or(ModelError::UnknownVariable(id))?;
        var.fixed = false;
        Ok(())
    }

    pub fn is_fixed(&self, id: VarId) -> Result<bool, ModelError> {
        self.variables
            .get(id)
            .map(|v| v.fixed)
            .ok_or(ModelError::UnknownVariable(id))
    }

    /// Free (non-fixed) variables in storage order.
    pub fn free_variables(&self) -> Vec<VarId> {
        self.variables
            .iter()
            .filter(|(_, v)| !v.fixed)
            .map(|(id, _)| id)
            .collect()
    }

    /// Adds a relation after checking that every referenced variable exists.
    pub fn add_relation(&mut self, relation: Relation) -> Result<RelationId, ModelError> {
        self.check_references(&relation)?;
        Ok(self.relations.insert(relation))
    }

    /// Replaces a relation in place, keeping its id.
    pub fn replace_relation(&mut self, id: RelationId, relation: Relation) -> Result<(), ModelError> {
        self.check_references(&relation)?;
        let slot = self
            .relations
            .get_mut(id)
            .ok_or(ModelError::UnknownRelation(id))?;
        *slot = relation;
        Ok(())
    }

    pub fn remove_relation(&mut self, id: RelationId) -> Option<Relation> {
        self.relations.remove(id)
    }

    pub fn relation(&self, id: RelationId) -> Option<&Relation> {
        self.relations.get(id)
    }

    pub fn relation_ids(&self) -> Vec<RelationId> {
        self.relations.keys().collect()
    }

    pub fn relation_count(&self) -> usize {
        self.relations.len()
    }

    /// Free variables minus relations; a well-posed square solve needs zero.
    pub fn degrees_of_freedom(&self) -> isize {
        self.free_variables().len() as isize - self.relations.len() as isize
    }

    /// Evaluates the scaled residual of a relation at the current values.
    pub fn residual(&self, id: RelationId) -> Result<f64, ModelError> {
        let relation = self
            .relations
            .get(id)
            .ok_or(ModelError::UnknownRelation(id))?;
        Ok(relation.scaling * self.raw_residual(relation, None)?)
    }

    /// Partial derivatives of a relation's scaled residual with respect to
    /// the variables it references. Linear relations are exact; expression
    /// relations use central differences.
    pub fn gradient(&self, id: RelationId) -> Result<Vec<(VarId, f64)>, ModelError> {
        let relation = self
            .relations
            .get(id)
            .ok_or(ModelError::UnknownRelation(id))?;
        match &relation.kind {
            RelationKind::Linear { terms, .. } => Ok(terms
                .iter()
                .map(|(var, coeff)| (*var, coeff * relation.scaling))
                .collect()),
            RelationKind::Expression { variables, .. } => {
                let mut gradient = Vec::with_capacity(variables.len());
                for (position, var) in variables.iter().enumerate() {
                    let x = self.value(*var)?;
                    let h = GRADIENT_RELATIVE_STEP * x.abs().max(1.0);
                    let forward = self.raw_residual(relation, Some((position, x + h)))?;
                    let backward = self.raw_residual(relation, Some((position, x - h)))?;
                    gradient.push((*var, relation.scaling * (forward - backward) / (2.0 * h)));
                }
                Ok(gradient)
            }
        }
    }

    pub fn snapshot(&self) -> ValueSnapshot {
        ValueSnapshot(self.variables.iter().map(|(id, v)| (id, v.value)).collect())
    }

    /// Restores values from a snapshot. Variables removed since the snapshot
    /// was taken are skipped.
    pub fn restore(&mut self, snapshot: &ValueSnapshot) {
        for (id, value) in &snapshot.0 {
            if let Some(var) = self.variables.get_mut(*id) {
                var.value = *value;
            }
        }
    }

    fn check_references(&self, relation: &Relation) -> Result<(), ModelError> {
        for var in relation.variables() {
            if !self.variables.contains_key(var) {
                return Err(ModelError::DanglingReference {
                    relation: relation.name.clone(),
                    variable: var,
                });
            }
        }
        Ok(())
    }

    fn raw_residual(&self, relation: &Relation, overridden: Option<(usize, f64)>) -> Result<f64, ModelError> {
        match &relation.kind {
            RelationKind::Linear { terms, constant } => {
                let mut sum = *constant;
                for (var, coeff) in terms {
                    sum += coeff * self.value(*var)?;
                }
                Ok(sum)
            }
            RelationKind::Expression { variables, residual } => {
                let mut values = variables
                    .iter()
                    .map(|var| self.value(*var))
                    .collect::<Result<Vec<_>, _>>()?;
                if let Some((position, value)) = overridden {
                    values[position] = value;
                }
                Ok(residual(&values))
            }
        }
    }
}
