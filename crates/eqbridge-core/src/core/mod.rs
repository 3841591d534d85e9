//! # Core Module
//!
//! Stateless foundations of the equilibrium bridge: static data tables, the
//! algebraic host model with its Newton solver, and the chemistry oracle.
//!
//! ## Architecture
//!
//! - **Units** ([`units`]) - Temperature, pressure and composition unit maps to K, Pa, kg and mol
//! - **Species** ([`species`]) - Canonical aqueous species, tracked elements and host-name aliases
//! - **Minerals** ([`minerals`]) - Dissolution constants and stoichiometry of scaling minerals
//! - **Host Model** ([`model`]) - Variables and relations addressed by slot-map ids
//! - **Host Solver** ([`solver`]) - Damped Newton with bound handling and iteration observers
//! - **Chemistry** ([`chemistry`]) - The [`chemistry::EquilibriumEngine`] boundary and the built-in aqueous engine
//!
//! All tables are process-wide, read-only `phf` maps.

pub mod chemistry;
pub mod minerals;
pub mod model;
pub mod solver;
pub mod species;
pub mod units;
