//! Core library for the propeller wake stand.
//!
//! The library drives a two-axis probe traverse behind a spinning propeller,
//! bins the probe and load cell telemetry into a spatial trace, and reduces
//! that trace into blade-section aerodynamics and rotor performance figures.
//! It is used by the `propstand` binary and by the integration tests.

pub mod adapters;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod messages;
pub mod protocol;
pub mod reduction;
pub mod sequencer;
pub mod session;
pub mod trajectory;
