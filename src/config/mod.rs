#[allow(clippy::module_inception)]
mod config;

pub use config::{DecodeConfig, DynamicsConfig, ModelConfig, TrainConfig};
