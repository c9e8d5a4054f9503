//! Weight registry: lazy GPU-resident tensor lifecycle (C4).

pub mod registry;

pub use registry::{WeightHandle, WeightRegistry, WeightState};
