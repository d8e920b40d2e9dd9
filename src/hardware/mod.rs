//! Hardware stand-ins.
//!
//! The real rig is reached through `adapters::SerialAdapter`; this module
//! holds the in-process simulation used by tests and `propstand sweep --simulate`.

pub mod mock;
