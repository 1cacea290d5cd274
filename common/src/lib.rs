//! Types shared between the plantcam appliance and the tools that drive it.

pub mod config;
pub mod protocol;
