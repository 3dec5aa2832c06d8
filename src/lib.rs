//! Layertar library exports.
//!
//! This module exposes the layer engine and the CLI glue for integration
//! testing.

pub mod cli;
pub mod layer;
