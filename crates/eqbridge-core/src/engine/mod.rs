//! # Engine Module
//!
//! The stateful bridge between a host model and an equilibrium engine.
//!
//! ## Overview
//!
//! A [`bridge::BridgeBlock`] maps host variables into an equilibrium problem,
//! asks the engine for property values and derivatives, and turns the answer
//! into linear surrogate relations the host solver can consume. The block keeps
//! those relations until the host inputs drift away from the point they were
//! built at, then re-evaluates the engine there.
//!
//! ## Architecture
//!
//! - **State Mapping** ([`mapper`]) - Unit conversion, species aliasing and
//!   element aggregation from host variables to engine inputs
//! - **Oracle Access** ([`oracle`]) - One evaluation per call, with a
//!   fallback-guess retry and finite-difference derivatives when needed
//! - **Surrogates** ([`surrogate`]) - First-order relations and conditioning checks
//! - **Lifecycle** ([`bridge`], [`state`]) - Initialize, drift detection,
//!   re-linearization and teardown
//! - **Configuration** ([`config`]) - Bridge settings and their builder
//! - **Progress Monitoring** ([`progress`]) - Callback-based progress reporting
//! - **Error Handling** ([`error`]) - Engine-level error types

pub mod bridge;
pub mod config;
pub mod error;
pub mod mapper;
pub mod oracle;
pub mod progress;
pub mod state;
pub mod surrogate;
