//! # Host Model
//!
//! The algebraic model the bridge couples into: scalar [`Variable`]s and
//! equality [`Relation`]s, addressed by slot-map ids so that blocks can add
//! and remove their own entries without invalidating anyone else's handles.
//!
//! - [`ids`] - `VarId` and `RelationId` key types
//! - [`variable`] - values, fixed flags and bounds
//! - [`relation`] - linear and closure-based residuals
//! - [`host`] - the [`HostModel`] container with residual and gradient evaluation

pub mod host;
pub mod ids;
pub mod relation;
pub mod variable;

pub use host::{HostModel, ModelError, ValueSnapshot};
pub use ids::{RelationId, VarId};
pub use relation::{Relation, RelationKind};
pub use variable::Variable;
