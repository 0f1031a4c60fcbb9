use candle_core::{DType, Device, IndexOp, Tensor};
use rand::Rng;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{DynamicsError, Result};

pub const TOKENS_KEY: &str = "tokens";
pub const ACTIONS_KEY: &str = "actions";
pub const LATENTS_KEY: &str = "latents";

/// Pre-tokenized clips: `tokens` `[N, T, P]` u32 and optional per-transition
/// `actions` `[N, T-1, A]` f32. Kept on the host; batches are moved to the device.
#[derive(Debug, Clone)]
pub struct TokenClips {
    tokens: Tensor,
    actions: Option<Tensor>,
}

/// One training batch: `tokens` `[B, ctx, P]` and, if present, `actions` `[B, ctx-1, A]`.
#[derive(Debug, Clone)]
pub struct ClipBatch {
    pub tokens: Tensor,
    pub actions: Option<Tensor>,
}

impl TokenClips {
    pub fn new(tokens: Tensor, actions: Option<Tensor>) -> Result<Self> {
        let tokens = tokens.to_dtype(DType::U32)?.to_device(&Device::Cpu)?;
        let (n, t, _) = tokens.dims3()?;
        if n == 0 || t == 0 {
            return Err(DynamicsError::InvalidArgument(
                "clip store holds no frames".into(),
            ));
        }
        let actions = match actions {
            Some(a) => {
                let a = a.to_dtype(DType::F32)?.to_device(&Device::Cpu)?;
                match a.dims() {
                    [an, at, _] if *an == n && *at + 1 == t => Some(a),
                    got => {
                        return Err(DynamicsError::shape(
                            "clip actions [N, T-1, A]",
                            &[n, t - 1],
                            got,
                        ))
                    }
                }
            }
            None => None,
        };
        Ok(Self { tokens, actions })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        let tokens = tensors.remove(TOKENS_KEY).ok_or_else(|| {
            DynamicsError::InvalidArgument(format!(
                "{} has no `{TOKENS_KEY}` tensor",
                path.display()
            ))
        })?;
        Self::new(tokens, tensors.remove(ACTIONS_KEY))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut tensors = HashMap::new();
        tensors.insert(TOKENS_KEY.to_string(), self.tokens.clone());
        if let Some(a) = &self.actions {
            tensors.insert(ACTIONS_KEY.to_string(), a.clone());
        }
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tokens.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_frames(&self) -> usize {
        self.tokens.dims()[1]
    }

    pub fn num_positions(&self) -> usize {
        self.tokens.dims()[2]
    }

    pub fn action_dim(&self) -> Option<usize> {
        self.actions.as_ref().map(|a| a.dims()[2])
    }

    pub fn tokens(&self) -> &Tensor {
        &self.tokens
    }

    /// Random clips, each cut to a random window of `context_length` frames.
    pub fn sample_batch<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        context_length: usize,
        rng: &mut R,
        device: &Device,
    ) -> Result<ClipBatch> {
        let frames = self.num_frames();
        if context_length == 0 || context_length > frames {
            return Err(DynamicsError::InvalidArgument(format!(
                "context_length {context_length} does not fit clips of {frames} frames"
            )));
        }
        let mut token_rows = Vec::with_capacity(batch_size);
        let mut action_rows = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            let clip = rng.gen_range(0..self.len());
            let start = rng.gen_range(0..=frames - context_length);
            token_rows.push(self.tokens.i(clip)?.narrow(0, start, context_length)?);
            if let Some(a) = &self.actions {
                action_rows.push(a.i(clip)?.narrow(0, start, context_length - 1)?);
            }
        }
        let tokens = Tensor::stack(&token_rows, 0)?.to_device(device)?;
        let actions = if self.actions.is_some() {
            Some(Tensor::stack(&action_rows, 0)?.to_device(device)?)
        } else {
            None
        };
        Ok(ClipBatch { tokens, actions })
    }
}

/// Write named tensors to one safetensors file.
pub fn save_tensors(path: impl AsRef<Path>, tensors: &[(&str, &Tensor)]) -> Result<()> {
    let map: HashMap<String, Tensor> = tensors
        .iter()
        .map(|(name, t)| (name.to_string(), (*t).clone()))
        .collect();
    candle_core::safetensors::save(&map, path)?;
    Ok(())
}
