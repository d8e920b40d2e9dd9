//! Telemetry frames, spatial binning and the persisted trace.

pub mod aggregator;
pub mod frame;
pub mod storage;
pub mod trace;

pub use aggregator::SpatialAggregator;
pub use frame::TelemetryFrame;
pub use storage::TraceWriter;
pub use trace::{read_trace, TraceRow, TraceTable};
