//! Masked-token dynamics model over discrete video latents.
//!
//! A causal spatio-temporal transformer scores every cell of a `[B, T, P, L]` latent
//! grid against a finite scalar codebook. Training hides cells behind a learned mask
//! token; inference unmasks future frames a few confident cells at a time.

pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod tasks;

pub use config::{DecodeConfig, DynamicsConfig, ModelConfig, TrainConfig};
pub use error::{DynamicsError, Result};
pub use model::{
    DecodeOptions, DecodeOutput, DynamicsModel, FiniteScalarQuantizer, ForwardOutput,
    IndexToLatents, MaskState, MaskingPolicy, SequenceTransformer, SpatioTemporalTransformer,
};
