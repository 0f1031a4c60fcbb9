#[allow(clippy::module_inception)]
pub mod data;

pub use data::{save_tensors, ClipBatch, TokenClips, ACTIONS_KEY, LATENTS_KEY, TOKENS_KEY};
