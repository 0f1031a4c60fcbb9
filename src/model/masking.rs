//! Training-time corruption of a latent grid (MaskGit-style).

use candle_core::{DType, Device, Tensor};
use rand::distributions::{Bernoulli, Distribution};
use rand::Rng;

use crate::error::{DynamicsError, Result};

/// Boolean grid over (batch, time, position); `true` means the value is hidden.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskState {
    batch: usize,
    time: usize,
    positions: usize,
    bits: Vec<bool>,
    /// Bernoulli rate the mask was drawn with, if it was sampled.
    ratio: Option<f64>,
}

impl MaskState {
    /// All-false mask.
    pub fn visible(batch: usize, time: usize, positions: usize) -> Self {
        Self {
            batch,
            time,
            positions,
            bits: vec![false; batch * time * positions],
            ratio: None,
        }
    }

    pub fn from_bits(batch: usize, time: usize, positions: usize, bits: Vec<bool>) -> Result<Self> {
        if bits.len() != batch * time * positions {
            return Err(DynamicsError::shape(
                "mask bits",
                &[batch * time * positions],
                &[bits.len()],
            ));
        }
        Ok(Self {
            batch,
            time,
            positions,
            bits,
            ratio: None,
        })
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        (self.batch, self.time, self.positions)
    }

    fn offset(&self, b: usize, t: usize, p: usize) -> usize {
        (b * self.time + t) * self.positions + p
    }

    pub fn get(&self, b: usize, t: usize, p: usize) -> bool {
        self.bits[self.offset(b, t, p)]
    }

    pub fn set(&mut self, b: usize, t: usize, p: usize, masked: bool) {
        let i = self.offset(b, t, p);
        self.bits[i] = masked;
    }

    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    pub fn ratio(&self) -> Option<f64> {
        self.ratio
    }

    /// Number of hidden cells.
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|&&m| m).count()
    }

    /// True if every (batch, position) column keeps at least one visible timestep.
    pub fn has_anchor_everywhere(&self) -> bool {
        (0..self.batch).all(|b| {
            (0..self.positions).all(|p| (0..self.time).any(|t| !self.get(b, t, p)))
        })
    }

    /// `[B, T, P]` tensor of 0/1 weights.
    pub fn to_weights(&self, device: &Device) -> Result<Tensor> {
        let data: Vec<f32> = self.bits.iter().map(|&m| if m { 1.0 } else { 0.0 }).collect();
        Ok(Tensor::from_vec(
            data,
            (self.batch, self.time, self.positions),
            device,
        )?)
    }

    /// `[B, T, P, 1]` u8 tensor, usable as a `where_cond` predicate.
    pub fn to_predicate(&self, device: &Device) -> Result<Tensor> {
        let data: Vec<u8> = self.bits.iter().map(|&m| m as u8).collect();
        Ok(Tensor::from_vec(
            data,
            (self.batch, self.time, self.positions, 1),
            device,
        )?)
    }
}

/// Samples which cells get replaced by the mask token during training.
///
/// One ratio per batch (not per example), then an independent Bernoulli draw per
/// cell, then one forced-visible anchor timestep per (batch, position).
#[derive(Debug, Clone, Copy)]
pub struct MaskingPolicy {
    pub min_ratio: f64,
    pub max_ratio: f64,
}

impl Default for MaskingPolicy {
    fn default() -> Self {
        Self {
            min_ratio: 0.5,
            max_ratio: 1.0,
        }
    }
}

impl MaskingPolicy {
    pub fn sample<R: Rng + ?Sized>(
        &self,
        batch: usize,
        time: usize,
        positions: usize,
        rng: &mut R,
    ) -> Result<MaskState> {
        if time == 0 {
            return Err(DynamicsError::InvalidArgument(
                "cannot mask a grid with zero timesteps".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_ratio) || self.max_ratio < self.min_ratio {
            return Err(DynamicsError::InvalidConfig(format!(
                "mask ratio range [{}, {}) is not inside [0, 1]",
                self.min_ratio, self.max_ratio
            )));
        }
        let ratio = if self.max_ratio > self.min_ratio {
            rng.gen_range(self.min_ratio..self.max_ratio).min(1.0)
        } else {
            self.min_ratio
        };
        let bernoulli =
            Bernoulli::new(ratio).map_err(|e| DynamicsError::Sampling(e.to_string()))?;

        let bits: Vec<bool> = (0..batch * time * positions)
            .map(|_| bernoulli.sample(rng))
            .collect();
        let mut mask = MaskState {
            batch,
            time,
            positions,
            bits,
            ratio: Some(ratio),
        };
        for b in 0..batch {
            for p in 0..positions {
                let anchor = rng.gen_range(0..time);
                mask.set(b, anchor, p, false);
            }
        }
        Ok(mask)
    }

    /// Replace masked cells of `latents` [B, T, P, L] with `mask_token` [L].
    pub fn apply(&self, latents: &Tensor, mask_token: &Tensor, mask: &MaskState) -> Result<Tensor> {
        apply_mask(latents, mask_token, mask)
    }
}

/// Substitute the mask token wherever `mask` is set; other cells are untouched.
pub fn apply_mask(latents: &Tensor, mask_token: &Tensor, mask: &MaskState) -> Result<Tensor> {
    let (b, t, p, l) = latents.dims4()?;
    if mask.dims() != (b, t, p) {
        let (mb, mt, mp) = mask.dims();
        return Err(DynamicsError::shape("mask state", &[b, t, p], &[mb, mt, mp]));
    }
    if mask_token.elem_count() != l {
        return Err(DynamicsError::shape("mask token", &[l], mask_token.dims()));
    }
    let shape = (b, t, p, l);
    let token = mask_token
        .to_dtype(latents.dtype())?
        .reshape((1, 1, 1, l))?
        .broadcast_as(shape)?;
    let predicate = mask.to_predicate(latents.device())?.broadcast_as(shape)?;
    Ok(predicate.where_cond(&token, latents)?)
}

/// Host-side copy of a mask token for grids assembled outside the tensor graph.
pub(crate) fn mask_token_values(mask_token: &Tensor) -> Result<Vec<f32>> {
    Ok(mask_token.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
}
