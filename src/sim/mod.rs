//! In-process stand-ins for the hardware-facing seams.
//!
//! Nothing here talks to a device. The simulation layer lets the demo binary,
//! the integration tests and the benchmarks drive a real [`Pipeline`] end to
//! end:
//!
//! - [`SimNodeFactory`] / [`SimNode`] - scriptable nodes that record every call
//! - [`SimDeviceGroup`] - a device group whose messages are injected by hand
//! - [`SimWorkers`] - threads that execute scheduled work and report completion
//!
//! [`Pipeline`]: crate::pipeline::orchestrator::Pipeline

pub mod device;
pub mod node;
pub mod worker;

pub use device::{DeviceCall, SimDeviceGroup};
pub use node::{SimBehavior, SimEvent, SimLog, SimNode, SimNodeFactory};
pub use worker::{run_work, SimWorkers};
