//! Iterative masked-token decoding (MaskGit-style progressive unmasking).

use std::collections::{BTreeMap, BTreeSet};

use candle_core::{DType, Device, IndexOp, Tensor, D};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use super::backbone::SequenceTransformer;
use super::dynamics::DynamicsModel;
use super::masking::mask_token_values;
use super::quantizer::IndexToLatents;
use super::schedule::{commit_count, commit_floor, schedule_target, DEFAULT_SCHEDULE_K};
use crate::error::{DynamicsError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeOptions {
    /// Step budget; the last step always reaches full coverage.
    pub num_steps: usize,
    /// Steepness of the exponential unmask schedule.
    pub schedule_k: f64,
    /// 0 picks the argmax class, > 0 samples from the scaled distribution.
    pub temperature: f64,
    /// Fail with `UnresolvedPositions` if anything is still masked at the end.
    pub verify: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            num_steps: 8,
            schedule_k: DEFAULT_SCHEDULE_K,
            temperature: 0.0,
            verify: false,
        }
    }
}

#[derive(Debug)]
pub struct DecodeOutput {
    /// `[B, T_ctx + H, P, L]`, fully resolved.
    pub latents: Tensor,
    /// Per executed step, the masked horizon cells left in each batch element.
    pub trace: Vec<Vec<usize>>,
    /// Whether the argmax backstop pass had to run.
    pub finalized: bool,
}

/// Host-side working grid plus the unresolved horizon cells of each batch element.
///
/// A horizon cell is addressed as `h * P + p`; the set only ever shrinks.
struct WorkingGrid {
    data: Vec<f32>,
    batch: usize,
    time: usize,
    positions: usize,
    latent_dim: usize,
    context_len: usize,
    masked: Vec<BTreeSet<usize>>,
}

impl WorkingGrid {
    fn new(context: &Tensor, horizon: usize, mask_token: &[f32]) -> Result<Self> {
        let (batch, context_len, positions, latent_dim) = context.dims4()?;
        let ctx: Vec<f32> = context.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        let time = context_len + horizon;
        let span = context_len * positions * latent_dim;
        let mut data = Vec::with_capacity(batch * time * positions * latent_dim);
        for b in 0..batch {
            data.extend_from_slice(&ctx[b * span..(b + 1) * span]);
            for _ in 0..horizon * positions {
                data.extend_from_slice(mask_token);
            }
        }
        let masked = (0..batch)
            .map(|_| (0..horizon * positions).collect())
            .collect();
        Ok(Self {
            data,
            batch,
            time,
            positions,
            latent_dim,
            context_len,
            masked,
        })
    }

    fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(
            &self.data,
            (self.batch, self.time, self.positions, self.latent_dim),
            device,
        )?)
    }

    /// The generated frames only, `[B, H, P, L]`.
    fn horizon_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(self
            .to_tensor(device)?
            .narrow(1, self.context_len, self.time - self.context_len)?)
    }

    fn remaining(&self) -> usize {
        self.masked.iter().map(BTreeSet::len).sum()
    }

    fn counts(&self) -> Vec<usize> {
        self.masked.iter().map(BTreeSet::len).collect()
    }

    /// Write the chosen classes of one batch element, one conversion call per timestep.
    fn commit<C: IndexToLatents + ?Sized>(
        &mut self,
        b: usize,
        writes: BTreeMap<usize, Vec<(usize, u32)>>,
        codebook: &C,
        device: &Device,
    ) -> Result<()> {
        let l = self.latent_dim;
        for (h, cells) in writes {
            let classes: Vec<u32> = cells.iter().map(|&(_, c)| c).collect();
            let n = classes.len();
            let indices = Tensor::from_vec(classes, n, device)?;
            let latents = codebook.indices_to_latents(&indices)?;
            if latents.dims() != [n, l] {
                return Err(DynamicsError::shape("converted latents", &[n, l], latents.dims()));
            }
            let values: Vec<f32> = latents.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
            let t = self.context_len + h;
            for (&(p, _), vector) in cells.iter().zip(values.chunks(l)) {
                let offset = ((b * self.time + t) * self.positions + p) * l;
                self.data[offset..offset + l].copy_from_slice(vector);
                self.masked[b].remove(&(h * self.positions + p));
            }
        }
        Ok(())
    }

    /// Resolve every still-masked cell with its argmax class. `argmax` is `[B][H * P]`.
    fn commit_leftovers<C: IndexToLatents + ?Sized>(
        &mut self,
        argmax: &[Vec<u32>],
        codebook: &C,
        device: &Device,
    ) -> Result<()> {
        for b in 0..self.batch {
            let chosen: Vec<(usize, u32)> = self.masked[b]
                .iter()
                .map(|&cell| (cell, argmax[b][cell]))
                .collect();
            let writes = group_by_timestep(&chosen, self.positions);
            self.commit(b, writes, codebook, device)?;
        }
        Ok(())
    }

    fn ensure_resolved(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            remaining => Err(DynamicsError::UnresolvedPositions { remaining }),
        }
    }
}

/// Temperature-scaled class probabilities over the last dimension.
///
/// Logits are shifted by their row maximum before scaling, and the inverse
/// temperature is clamped to the f32 range, so a tiny temperature degrades to a
/// one-hot on the top class instead of overflowing into NaN.
fn tempered_softmax(logits: &Tensor, temperature: f64) -> Result<Tensor> {
    let shifted = logits.broadcast_sub(&logits.max_keepdim(D::Minus1)?)?;
    let inv = (1.0 / temperature).min(f32::MAX as f64);
    Ok(candle_nn::ops::softmax(&shifted.affine(inv, 0.0)?, D::Minus1)?)
}

fn group_by_timestep(cells: &[(usize, u32)], positions: usize) -> BTreeMap<usize, Vec<(usize, u32)>> {
    let mut writes: BTreeMap<usize, Vec<(usize, u32)>> = BTreeMap::new();
    for &(cell, class) in cells {
        writes
            .entry(cell / positions)
            .or_default()
            .push((cell % positions, class));
    }
    writes
}

impl<B: SequenceTransformer> DynamicsModel<B> {
    /// Generate `horizon` frames after `context` `[B, T_ctx, P, L]`.
    ///
    /// `conditioning`, when given, must cover all `T_ctx + H` frames (or their
    /// `T_ctx + H - 1` transitions). `rng` is only drawn from when `temperature > 0`.
    pub fn decode<C, R>(
        &self,
        context: &Tensor,
        horizon: usize,
        codebook: &C,
        conditioning: Option<&Tensor>,
        options: &DecodeOptions,
        rng: &mut R,
    ) -> Result<Tensor>
    where
        C: IndexToLatents + ?Sized,
        R: Rng + ?Sized,
    {
        Ok(self
            .decode_traced(context, horizon, codebook, conditioning, options, rng)?
            .latents)
    }

    /// [`Self::decode`] that also reports the per-step masked counts.
    pub fn decode_traced<C, R>(
        &self,
        context: &Tensor,
        horizon: usize,
        codebook: &C,
        conditioning: Option<&Tensor>,
        options: &DecodeOptions,
        rng: &mut R,
    ) -> Result<DecodeOutput>
    where
        C: IndexToLatents + ?Sized,
        R: Rng + ?Sized,
    {
        if horizon == 0 {
            return Err(DynamicsError::InvalidArgument("horizon must be at least 1".into()));
        }
        if options.num_steps == 0 {
            return Err(DynamicsError::InvalidArgument("num_steps must be at least 1".into()));
        }
        if !(options.temperature >= 0.0 && options.temperature.is_finite()) {
            return Err(DynamicsError::InvalidArgument(format!(
                "temperature must be finite and >= 0, got {}",
                options.temperature
            )));
        }
        let (batch, context_len) = self.check_latents(context)?;
        self.check_conditioning(conditioning, batch, context_len + horizon)?;

        let device = context.device();
        let positions = self.config().num_positions();
        let total = horizon * positions;
        let floor = commit_floor(total);
        let mut grid = WorkingGrid::new(context, horizon, &mask_token_values(self.mask_token())?)?;
        let mut trace = Vec::with_capacity(options.num_steps);

        for step in 0..options.num_steps {
            let logits = self.horizon_logits(&grid, conditioning, device)?;
            let probs = if options.temperature > 0.0 {
                tempered_softmax(&logits, options.temperature)?
            } else {
                candle_nn::ops::softmax(&logits, D::Minus1)?
            };
            let confidence: Vec<Vec<f32>> = probs.max(D::Minus1)?.to_vec2()?;
            let argmax: Vec<Vec<u32>> = logits.argmax(D::Minus1)?.to_vec2()?;
            let target = schedule_target(step, options.num_steps, total, options.schedule_k);

            for b in 0..batch {
                let num_masked = grid.masked[b].len();
                if num_masked == 0 {
                    continue;
                }
                let k = commit_count(target, total - num_masked, num_masked, floor);
                let mut candidates: Vec<usize> = grid.masked[b].iter().copied().collect();
                let conf = &confidence[b];
                candidates.sort_by(|&x, &y| conf[y].total_cmp(&conf[x]));

                let mut chosen = Vec::with_capacity(k);
                for &cell in &candidates[..k] {
                    let class = if options.temperature > 0.0 {
                        let row: Vec<f32> = probs.i((b, cell))?.to_vec1()?;
                        let dist = WeightedIndex::new(&row)
                            .map_err(|e| DynamicsError::Sampling(e.to_string()))?;
                        dist.sample(rng) as u32
                    } else {
                        argmax[b][cell]
                    };
                    chosen.push((cell, class));
                }
                grid.commit(b, group_by_timestep(&chosen, positions), codebook, device)?;
            }

            let counts = grid.counts();
            tracing::debug!(step, target, masked = ?counts, "decode step");
            trace.push(counts);
            if grid.remaining() == 0 {
                break;
            }
        }

        let finalized = grid.remaining() > 0;
        if finalized {
            tracing::debug!(remaining = grid.remaining(), "committing leftovers by argmax");
            let argmax: Vec<Vec<u32>> = self
                .horizon_logits(&grid, conditioning, device)?
                .argmax(D::Minus1)?
                .to_vec2()?;
            grid.commit_leftovers(&argmax, codebook, device)?;
        }
        if options.verify {
            grid.ensure_resolved()?;
        }

        // context frames are passed through untouched, in the caller's dtype
        let generated = grid.horizon_tensor(device)?.to_dtype(context.dtype())?;
        let latents = if context_len == 0 {
            generated
        } else {
            Tensor::cat(&[context, &generated], 1)?
        };
        Ok(DecodeOutput {
            latents,
            trace,
            finalized,
        })
    }

    /// Score the whole working grid and keep the horizon: `[B, H * P, K]`.
    fn horizon_logits(
        &self,
        grid: &WorkingGrid,
        conditioning: Option<&Tensor>,
        device: &Device,
    ) -> Result<Tensor> {
        let horizon = grid.time - grid.context_len;
        let logits = self.score(&grid.to_tensor(device)?, conditioning)?;
        Ok(logits
            .narrow(1, grid.context_len, horizon)?
            .reshape((grid.batch, horizon * grid.positions, self.codebook_size()))?)
    }
}
