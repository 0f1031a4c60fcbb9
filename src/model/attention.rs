use candle_core::{Device, Module, Tensor, D};
use candle_nn::{self as nn, VarBuilder};

use super::norm::{layer_norm, LayerNorm};
use crate::error::{DynamicsError, Result};

/// Multi-head self-attention over `[N, S, D]` sequences with an optional additive mask.
pub struct MultiHeadAttention {
    num_heads: usize,
    head_dim: usize,
    scale: f64,
    q_proj: nn::Linear,
    k_proj: nn::Linear,
    v_proj: nn::Linear,
    out_proj: nn::Linear,
}

impl MultiHeadAttention {
    pub fn new(vb: VarBuilder<'_>, dim: usize, num_heads: usize) -> Result<Self> {
        if num_heads == 0 || dim % num_heads != 0 {
            return Err(DynamicsError::InvalidConfig(format!(
                "dim {dim} must be divisible by num_heads {num_heads}"
            )));
        }
        let head_dim = dim / num_heads;
        let scale = (head_dim as f64).sqrt();

        let q_proj = nn::linear(dim, dim, vb.pp("q_proj"))?;
        let k_proj = nn::linear(dim, dim, vb.pp("k_proj"))?;
        let v_proj = nn::linear(dim, dim, vb.pp("v_proj"))?;
        let out_proj = nn::linear(dim, dim, vb.pp("out_proj"))?;

        Ok(Self {
            num_heads,
            head_dim,
            scale,
            q_proj,
            k_proj,
            v_proj,
            out_proj,
        })
    }

    /// `attn_mask` is `[S, S]`, added to the scores before softmax.
    pub fn forward(&self, x: &Tensor, attn_mask: Option<&Tensor>) -> Result<Tensor> {
        let (n, s, _) = x.dims3()?;

        let q = self.q_proj.forward(x)?;
        let k = self.k_proj.forward(x)?;
        let v = self.v_proj.forward(x)?;

        // [N, S, D] -> [N, heads, S, head_dim]
        let split = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((n, s, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let (q, k, v) = (split(q)?, split(k)?, split(v)?);

        let k_t = k.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        let mut scores = (q.matmul(&k_t)? / self.scale)?;
        if let Some(mask) = attn_mask {
            scores = scores.broadcast_add(mask)?;
        }
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let out = weights.matmul(&v)?;

        let out = out
            .transpose(1, 2)?
            .contiguous()?
            .reshape((n, s, self.num_heads * self.head_dim))?;
        Ok(self.out_proj.forward(&out)?)
    }
}

/// `[S, S]` mask with 0 where `j <= i` and -inf above the diagonal.
pub fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mut mask = vec![0f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in i + 1..seq_len {
            mask[i * seq_len + j] = f32::NEG_INFINITY;
        }
    }
    Ok(Tensor::from_vec(mask, (seq_len, seq_len), device)?)
}

/// Pre-norm block: spatial attention within each frame, causal temporal attention per
/// position, then a GELU feed-forward.
pub struct SpatioTemporalBlock {
    spatial_attn: MultiHeadAttention,
    temporal_attn: MultiHeadAttention,
    ln_spatial: LayerNorm,
    ln_temporal: LayerNorm,
    ln_ff: LayerNorm,
    ff1: nn::Linear,
    ff2: nn::Linear,
}

impl SpatioTemporalBlock {
    pub fn new(vb: VarBuilder<'_>, dim: usize, num_heads: usize, ff_dim: usize) -> Result<Self> {
        Ok(Self {
            spatial_attn: MultiHeadAttention::new(vb.pp("spatial_attn"), dim, num_heads)?,
            temporal_attn: MultiHeadAttention::new(vb.pp("temporal_attn"), dim, num_heads)?,
            ln_spatial: layer_norm(dim, 1e-5, vb.pp("ln_spatial"))?,
            ln_temporal: layer_norm(dim, 1e-5, vb.pp("ln_temporal"))?,
            ln_ff: layer_norm(dim, 1e-5, vb.pp("ln_ff"))?,
            ff1: nn::linear(dim, ff_dim, vb.pp("ff1"))?,
            ff2: nn::linear(ff_dim, dim, vb.pp("ff2"))?,
        })
    }

    /// `x`: `[B, T, P, E]`; `temporal_mask`: `[T, T]` causal mask.
    pub fn forward(&self, x: &Tensor, temporal_mask: &Tensor) -> Result<Tensor> {
        let (b, t, p, e) = x.dims4()?;

        // Space: every frame is an independent sequence of P patches.
        let normed = self.ln_spatial.forward(x)?.reshape((b * t, p, e))?;
        let spatial = self.spatial_attn.forward(&normed, None)?.reshape((b, t, p, e))?;
        let x = (x + spatial)?;

        // Time: every patch position is an independent sequence of T steps.
        let normed = self
            .ln_temporal
            .forward(&x)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b * p, t, e))?;
        let temporal = self
            .temporal_attn
            .forward(&normed, Some(temporal_mask))?
            .reshape((b, p, t, e))?
            .transpose(1, 2)?
            .contiguous()?;
        let x = (x + temporal)?;

        let normed = self.ln_ff.forward(&x)?;
        let ff = self.ff2.forward(&self.ff1.forward(&normed)?.gelu()?)?;
        Ok((x + ff)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;

    #[test]
    fn causal_mask_blocks_future() {
        let mask: Vec<Vec<f32>> = causal_mask(3, &Device::Cpu).unwrap().to_vec2().unwrap();
        assert_eq!(mask[0], vec![0.0, f32::NEG_INFINITY, f32::NEG_INFINITY]);
        assert_eq!(mask[1], vec![0.0, 0.0, f32::NEG_INFINITY]);
        assert_eq!(mask[2], vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn attention_rejects_indivisible_heads() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(MultiHeadAttention::new(vb, 10, 3).is_err());
    }

    #[test]
    fn block_preserves_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = SpatioTemporalBlock::new(vb, 8, 2, 16).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 3, 4, 8), &device).unwrap();
        let mask = causal_mask(3, &device).unwrap();
        let y = block.forward(&x, &mask).unwrap();
        assert_eq!(y.dims(), &[2, 3, 4, 8]);
    }
}
