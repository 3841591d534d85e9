//! # eqbridge Core Library
//!
//! Couples an algebraic process model to a chemical-equilibrium engine. Host
//! variables (temperature, pressure, pH, per-species flows) are mapped into an
//! equilibrium problem, the engine computes properties such as density and
//! mineral scaling tendencies together with their derivatives, and the results
//! come back as first-order surrogate relations that a Newton solver can
//! consume like any other constraint.
//!
//! ## Architectural Philosophy
//!
//! The library follows a strict three-layer architecture:
//!
//! - **[`core`]: The Foundation.** Stateless data tables (units, species,
//!   minerals), the host model and its solver, and the equilibrium engine
//!   boundary with a built-in aqueous implementation.
//!
//! - **[`engine`]: The Logic Core.** The stateful bridge: the state mapper,
//!   the oracle adapter, the Jacobian surrogate builder and the bridge block
//!   with its initialize/update lifecycle.
//!
//! - **[`workflows`]: The Public API.** Ready-made flowsheets and the
//!   parameter sweep driver.

pub mod core;
pub mod engine;
pub mod workflows;
