//! Scoring backbone: a sequence-to-sequence transformer that is causal in time.

use candle_core::{Module, Tensor};
use candle_nn::{self as nn, VarBuilder};

use super::attention::{causal_mask, SpatioTemporalBlock};
use super::norm::{layer_norm, LayerNorm};
use super::positional::temporal_positional_encoding;
use crate::config::ModelConfig;
use crate::error::{DynamicsError, Result};

/// Contract for the scoring backbone.
///
/// Output has the input's `[B, T, P, E]` shape. Outputs at time `t` may only depend on
/// inputs at times `<= t`; attention across positions of a frame is unrestricted.
/// `conditioning` is `[B, T, A]` or `[B, T-1, A]` and acts as additive context; `None`
/// means no bias at all.
pub trait SequenceTransformer {
    fn transform(&self, x: &Tensor, conditioning: Option<&Tensor>) -> Result<Tensor>;
}

/// Default backbone: stacked spatial + causal-temporal attention blocks.
pub struct SpatioTemporalTransformer {
    blocks: Vec<SpatioTemporalBlock>,
    cond_proj: Option<nn::Linear>,
    ln_final: LayerNorm,
    embed_dim: usize,
}

impl SpatioTemporalTransformer {
    pub fn new(vb: VarBuilder<'_>, cfg: &ModelConfig) -> Result<Self> {
        let mut blocks = Vec::with_capacity(cfg.num_blocks);
        for i in 0..cfg.num_blocks {
            blocks.push(SpatioTemporalBlock::new(
                vb.pp(format!("block_{}", i)),
                cfg.embed_dim,
                cfg.num_heads,
                cfg.hidden_dim,
            )?);
        }
        let cond_proj = if cfg.conditioning_dim > 0 {
            // No bias: a zero conditioning row must leave the frame untouched.
            Some(nn::linear_no_bias(
                cfg.conditioning_dim,
                cfg.embed_dim,
                vb.pp("cond_proj"),
            )?)
        } else {
            None
        };
        let ln_final = layer_norm(cfg.embed_dim, 1e-5, vb.pp("ln_final"))?;
        Ok(Self {
            blocks,
            cond_proj,
            ln_final,
            embed_dim: cfg.embed_dim,
        })
    }

    /// Conditioning bias `[B, T, 1, E]`.
    fn conditioning_bias(&self, conditioning: &Tensor, batch: usize, time: usize) -> Result<Tensor> {
        let proj = self.cond_proj.as_ref().ok_or_else(|| {
            DynamicsError::InvalidArgument(
                "conditioning given to a backbone built with conditioning_dim = 0".into(),
            )
        })?;
        let aligned = align_conditioning(conditioning, batch, time)?;
        Ok(proj.forward(&aligned)?.unsqueeze(2)?)
    }
}

impl SequenceTransformer for SpatioTemporalTransformer {
    fn transform(&self, x: &Tensor, conditioning: Option<&Tensor>) -> Result<Tensor> {
        let (b, t, _, e) = x.dims4()?;
        if e != self.embed_dim {
            return Err(DynamicsError::shape(
                "backbone input width",
                &[self.embed_dim],
                &[e],
            ));
        }
        let mut h = x.broadcast_add(&temporal_positional_encoding(t, e, x.device())?)?;
        if let Some(c) = conditioning {
            h = h.broadcast_add(&self.conditioning_bias(c, b, t)?)?;
        }
        let mask = causal_mask(t, x.device())?;
        for block in &self.blocks {
            h = block.forward(&h, &mask)?;
        }
        Ok(self.ln_final.forward(&h)?)
    }
}

/// Bring conditioning to `[B, T, A]`.
///
/// A `T-1` sequence holds one vector per frame transition; it is left-padded with a
/// zero row so the vector between frames `t-1` and `t` lands on frame `t`.
pub fn align_conditioning(conditioning: &Tensor, batch: usize, time: usize) -> Result<Tensor> {
    let (cb, ct, ca) = conditioning.dims3()?;
    if cb != batch {
        return Err(DynamicsError::shape(
            "conditioning batch",
            &[batch],
            &[cb],
        ));
    }
    if ct == time {
        Ok(conditioning.clone())
    } else if ct + 1 == time {
        let pad = Tensor::zeros((cb, 1, ca), conditioning.dtype(), conditioning.device())?;
        Ok(Tensor::cat(&[&pad, conditioning], 1)?)
    } else {
        Err(DynamicsError::shape(
            "conditioning (time may also be T-1)",
            &[batch, time, ca],
            conditioning.dims(),
        ))
    }
}
