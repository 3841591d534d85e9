//! # Workflows Module
//!
//! High-level entry points that drive host models coupled to equilibrium engines.
//!
//! ## Overview
//!
//! Workflows assemble a host model and its bridges, initialize them, solve, and
//! organize the results. Each one reports progress through a
//! [`ProgressReporter`](crate::engine::progress::ProgressReporter) so callers can
//! attach their own display.
//!
//! ## Architecture
//!
//! - **Parameter Sweeps** ([`sweep`]) - Factorial sampling of fixed host variables
//!   with per-sample failure isolation, optional gap filling and CSV export
//! - **Scaling Analysis** ([`scaling`]) - A seawater feed and its concentrate after
//!   water removal, reporting densities and mineral scaling tendencies

pub mod scaling;
pub mod sweep;
