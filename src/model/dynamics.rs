use candle_core::{DType, Module, Tensor};
use candle_nn::{self as nn, VarBuilder};
use rand::Rng;

use super::backbone::{SequenceTransformer, SpatioTemporalTransformer};
use super::loss::masked_cross_entropy;
use super::masking::{MaskState, MaskingPolicy};
use super::positional::spatial_positional_encoding;
use crate::config::ModelConfig;
use crate::error::{DynamicsError, Result};

/// Output of one forward pass.
pub struct ForwardOutput {
    /// `[B, T, P, K]`
    pub logits: Tensor,
    /// Cells hidden behind the mask token; only set in training mode.
    pub mask: Option<MaskState>,
    /// Masked cross-entropy; only set in training mode.
    pub loss: Option<Tensor>,
}

/// Predicts a categorical distribution over the codebook for every cell of a latent grid
/// `[B, T, P, L]`, with masked-token training and iterative decoding on top.
pub struct DynamicsModel<B: SequenceTransformer = SpatioTemporalTransformer> {
    latent_embed: nn::Linear,
    /// `[1, 1, P, E]`, not a parameter.
    pos_spatial: Tensor,
    backbone: B,
    output_head: nn::Linear,
    /// Learned placeholder latent `[L]`.
    mask_token: Tensor,
    masking: MaskingPolicy,
    cfg: ModelConfig,
    codebook_size: usize,
}

impl DynamicsModel<SpatioTemporalTransformer> {
    pub fn new(vb: VarBuilder<'_>, cfg: &ModelConfig) -> Result<Self> {
        cfg.validate()?;
        let backbone = SpatioTemporalTransformer::new(vb.pp("transformer"), cfg)?;
        Self::with_backbone(vb, cfg, backbone)
    }
}

impl<B: SequenceTransformer> DynamicsModel<B> {
    /// Build around a custom backbone; it must map `[B, T, P, E]` to the same shape.
    pub fn with_backbone(vb: VarBuilder<'_>, cfg: &ModelConfig, backbone: B) -> Result<Self> {
        cfg.validate()?;
        let codebook_size = cfg.codebook_size()?;
        let latent_embed = nn::linear(cfg.latent_dim, cfg.embed_dim, vb.pp("latent_embed"))?;
        let pos_spatial = spatial_positional_encoding(
            cfg.frame_size,
            cfg.patch_size,
            cfg.embed_dim,
            vb.device(),
        )?;
        let output_head = nn::linear(cfg.embed_dim, codebook_size, vb.pp("output_head"))?;
        let mask_token = vb.get_with_hints(
            cfg.latent_dim,
            "mask_token",
            nn::Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        Ok(Self {
            latent_embed,
            pos_spatial,
            backbone,
            output_head,
            mask_token,
            masking: MaskingPolicy::default(),
            cfg: cfg.clone(),
            codebook_size,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.cfg
    }

    pub fn codebook_size(&self) -> usize {
        self.codebook_size
    }

    pub fn mask_token(&self) -> &Tensor {
        &self.mask_token
    }

    pub fn set_masking_policy(&mut self, policy: MaskingPolicy) {
        self.masking = policy;
    }

    /// Check `[B, T, P, L]` against the model and return `(B, T)`. `T` may be 0.
    pub(crate) fn check_latents(&self, latents: &Tensor) -> Result<(usize, usize)> {
        let dims = latents.dims();
        let (p, l) = (self.cfg.num_positions(), self.cfg.latent_dim);
        match dims {
            [b, t, dp, dl] if *dp == p && *dl == l => Ok((*b, *t)),
            [b, t, _, _] => Err(DynamicsError::shape(
                "latent grid [B, T, P, L]",
                &[*b, *t, p, l],
                dims,
            )),
            _ => Err(DynamicsError::shape("latent grid rank", &[4], &[dims.len()])),
        }
    }

    /// Like [`Self::check_latents`], for grids that are scored directly and need frames.
    fn check_scored_latents(&self, latents: &Tensor) -> Result<(usize, usize)> {
        let (b, t) = self.check_latents(latents)?;
        if t == 0 {
            return Err(DynamicsError::InvalidArgument(
                "latent grid has no timesteps to score".into(),
            ));
        }
        Ok((b, t))
    }

    /// Conditioning must be `[B, T, A]` or `[B, T-1, A]` with `A = conditioning_dim`.
    pub(crate) fn check_conditioning(
        &self,
        conditioning: Option<&Tensor>,
        batch: usize,
        time: usize,
    ) -> Result<()> {
        let Some(c) = conditioning else {
            return Ok(());
        };
        let a = self.cfg.conditioning_dim;
        if a == 0 {
            return Err(DynamicsError::InvalidArgument(
                "conditioning given to a model with conditioning_dim = 0".into(),
            ));
        }
        match c.dims() {
            [cb, ct, ca] if *cb == batch && *ca == a && (*ct == time || *ct + 1 == time) => Ok(()),
            got => Err(DynamicsError::shape(
                "conditioning [B, T or T-1, A]",
                &[batch, time, a],
                got,
            )),
        }
    }

    fn check_targets(&self, targets: &Tensor, batch: usize, time: usize) -> Result<()> {
        let p = self.cfg.num_positions();
        if targets.dims() != [batch, time, p] {
            return Err(DynamicsError::shape("targets", &[batch, time, p], targets.dims()));
        }
        let max = targets
            .to_dtype(DType::U32)?
            .flatten_all()?
            .max(0)?
            .to_scalar::<u32>()? as usize;
        if max >= self.codebook_size {
            return Err(DynamicsError::InvalidArgument(format!(
                "target index {max} outside codebook of size {}",
                self.codebook_size
            )));
        }
        Ok(())
    }

    /// Latent projection plus the spatial encoding: `[B, T, P, L]` -> `[B, T, P, E]`.
    pub fn embed(&self, latents: &Tensor) -> Result<Tensor> {
        let h = self.latent_embed.forward(latents)?;
        Ok(h.broadcast_add(&self.pos_spatial)?)
    }

    /// Logits `[B, T, P, K]` for an already-prepared grid, no masking.
    pub fn score(&self, latents: &Tensor, conditioning: Option<&Tensor>) -> Result<Tensor> {
        let (b, t) = self.check_scored_latents(latents)?;
        self.check_conditioning(conditioning, b, t)?;
        let latents = latents.to_dtype(DType::F32)?;
        self.score_unchecked(&latents, conditioning)
    }

    fn score_unchecked(&self, latents: &Tensor, conditioning: Option<&Tensor>) -> Result<Tensor> {
        let embedded = self.embed(latents)?;
        let transformed = self.backbone.transform(&embedded, conditioning)?;
        Ok(self.output_head.forward(&transformed)?)
    }

    /// Forward pass.
    ///
    /// In training mode a fresh mask is sampled from `rng`, masked cells are replaced by
    /// the mask token, and the masked cross-entropy against `targets` is returned; missing
    /// targets are refused. Otherwise this is [`Self::score`] and `rng` is untouched.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        latents: &Tensor,
        training: bool,
        conditioning: Option<&Tensor>,
        targets: Option<&Tensor>,
        rng: &mut R,
    ) -> Result<ForwardOutput> {
        if !training {
            return Ok(ForwardOutput {
                logits: self.score(latents, conditioning)?,
                mask: None,
                loss: None,
            });
        }
        let targets = targets.ok_or(DynamicsError::MissingTargets)?;
        let (b, t) = self.check_scored_latents(latents)?;
        self.check_conditioning(conditioning, b, t)?;
        self.check_targets(targets, b, t)?;

        let latents = latents.to_dtype(DType::F32)?;
        let mask = self
            .masking
            .sample(b, t, self.cfg.num_positions(), rng)?;
        let corrupted = self.masking.apply(&latents, &self.mask_token, &mask)?;
        let logits = self.score_unchecked(&corrupted, conditioning)?;
        let loss = masked_cross_entropy(&logits, targets, &mask)?;
        Ok(ForwardOutput {
            logits,
            mask: Some(mask),
            loss: Some(loss),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    pub(crate) fn tiny_config(conditioning_dim: usize) -> ModelConfig {
        ModelConfig {
            frame_size: 8,
            patch_size: 4,
            embed_dim: 12,
            num_heads: 2,
            hidden_dim: 16,
            num_blocks: 1,
            num_bins: 2,
            latent_dim: 3,
            conditioning_dim,
        }
    }

    fn grid(b: usize, t: usize, cfg: &ModelConfig) -> (Tensor, Tensor) {
        let device = Device::Cpu;
        let q = cfg.quantizer().unwrap();
        let p = cfg.num_positions();
        let k = q.codebook_size() as u32;
        let idx: Vec<u32> = (0..(b * t * p) as u32).map(|i| (i * 3 + 1) % k).collect();
        let targets = Tensor::from_vec(idx, (b, t, p), &device).unwrap();
        let latents = q.latents_from_indices(&targets).unwrap();
        (latents, targets)
    }

    #[test]
    fn training_forward_returns_logits_mask_and_loss() {
        let cfg = tiny_config(0);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = DynamicsModel::new(vb, &cfg).unwrap();
        let (latents, targets) = grid(2, 3, &cfg);
        let mut rng = StdRng::seed_from_u64(11);

        let out = model
            .forward(&latents, true, None, Some(&targets), &mut rng)
            .unwrap();
        assert_eq!(out.logits.dims(), &[2, 3, 4, 8]);
        let mask = out.mask.unwrap();
        assert!(mask.has_anchor_everywhere());
        let loss = out.loss.unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.is_finite() && loss > 0.0);
    }

    #[test]
    fn training_without_targets_is_refused() {
        let cfg = tiny_config(0);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = DynamicsModel::new(vb, &cfg).unwrap();
        let (latents, _) = grid(1, 2, &cfg);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            model.forward(&latents, true, None, None, &mut rng),
            Err(DynamicsError::MissingTargets)
        ));
    }

    #[test]
    fn eval_forward_has_no_mask_or_loss() {
        let cfg = tiny_config(0);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = DynamicsModel::new(vb, &cfg).unwrap();
        let (latents, _) = grid(1, 2, &cfg);
        let mut rng = StdRng::seed_from_u64(0);
        let out = model.forward(&latents, false, None, None, &mut rng).unwrap();
        assert!(out.mask.is_none() && out.loss.is_none());
        let again = model.score(&latents, None).unwrap();
        let diff = (out.logits - again)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn all_visible_policy_gives_zero_loss() {
        let cfg = tiny_config(0);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut model = DynamicsModel::new(vb, &cfg).unwrap();
        model.set_masking_policy(MaskingPolicy {
            min_ratio: 0.0,
            max_ratio: 0.0,
        });
        let (latents, targets) = grid(2, 2, &cfg);
        let mut rng = StdRng::seed_from_u64(5);
        let out = model
            .forward(&latents, true, None, Some(&targets), &mut rng)
            .unwrap();
        assert_eq!(out.mask.unwrap().count(), 0);
        let loss = out.loss.unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.is_finite());
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn shape_mismatches_fail_fast() {
        let cfg = tiny_config(2);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = DynamicsModel::new(vb, &cfg).unwrap();
        let device = Device::Cpu;
        let (latents, targets) = grid(2, 3, &cfg);
        let mut rng = StdRng::seed_from_u64(0);

        // wrong latent width
        let wide = Tensor::zeros((2, 3, 4, 4), DType::F32, &device).unwrap();
        assert!(matches!(
            model.score(&wide, None),
            Err(DynamicsError::ShapeMismatch { .. })
        ));
        // wrong number of positions
        let narrow = Tensor::zeros((2, 3, 5, 3), DType::F32, &device).unwrap();
        assert!(model.score(&narrow, None).is_err());
        // conditioning with the wrong batch
        let cond = Tensor::zeros((1, 3, 2), DType::F32, &device).unwrap();
        assert!(matches!(
            model.score(&latents, Some(&cond)),
            Err(DynamicsError::ShapeMismatch { .. })
        ));
        // targets with the wrong time
        let short = targets.narrow(1, 0, 2).unwrap();
        assert!(matches!(
            model.forward(&latents, true, None, Some(&short), &mut rng),
            Err(DynamicsError::ShapeMismatch { .. })
        ));
        // transitions-only conditioning is accepted
        let transitions = Tensor::zeros((2, 2, 2), DType::F32, &device).unwrap();
        model.score(&latents, Some(&transitions)).unwrap();
    }

    #[test]
    fn out_of_codebook_targets_are_rejected() {
        let cfg = tiny_config(0);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = DynamicsModel::new(vb, &cfg).unwrap();
        let (latents, _) = grid(1, 2, &cfg);
        let bad = Tensor::full(8u32, (1, 2, 4), &Device::Cpu).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(
            model.forward(&latents, true, None, Some(&bad), &mut rng),
            Err(DynamicsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn empty_grids_are_refused_for_scoring() {
        let cfg = tiny_config(0);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = DynamicsModel::new(vb, &cfg).unwrap();
        let empty = Tensor::zeros((2, 0, 4, 3), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(model.check_latents(&empty).unwrap(), (2, 0));
        assert!(matches!(
            model.score(&empty, None),
            Err(DynamicsError::InvalidArgument(_))
        ));
        let mut rng = StdRng::seed_from_u64(0);
        let targets = Tensor::zeros((2, 0, 4), DType::U32, &Device::Cpu).unwrap();
        assert!(matches!(
            model.forward(&empty, true, None, Some(&targets), &mut rng),
            Err(DynamicsError::InvalidArgument(_))
        ));

        let narrow = Tensor::zeros((2, 3, 5, 3), DType::F32, &Device::Cpu).unwrap();
        match model.score(&narrow, None) {
            Err(DynamicsError::ShapeMismatch { expected, got, .. }) => {
                assert_eq!(expected, vec![2, 3, 4, 3]);
                assert_eq!(got, vec![2, 3, 5, 3]);
            }
            other => panic!("expected a shape mismatch, got {other:?}"),
        }
    }

    #[test]
    fn loss_reaches_every_parameter() {
        let cfg = tiny_config(2);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = DynamicsModel::new(vb, &cfg).unwrap();
        let (latents, targets) = grid(2, 3, &cfg);
        let cond = Tensor::ones((2, 3, 2), DType::F32, &Device::Cpu).unwrap();
        let mut rng = StdRng::seed_from_u64(21);
        let out = model
            .forward(&latents, true, Some(&cond), Some(&targets), &mut rng)
            .unwrap();
        assert!(out.mask.unwrap().count() > 0);
        let grads = out.loss.unwrap().backward().unwrap();
        assert!(grads.get(model.mask_token()).is_some());

        let data = varmap.data().lock().unwrap();
        for name in [
            "latent_embed.weight",
            "transformer.block_0.spatial_attn.q_proj.weight",
            "transformer.block_0.temporal_attn.v_proj.weight",
            "transformer.block_0.ln_ff.weight",
            "transformer.cond_proj.weight",
            "transformer.ln_final.bias",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
        let mut names: Vec<&String> = data.keys().collect();
        names.sort();
        for name in names {
            assert!(grads.get(data[name].as_tensor()).is_some(), "no gradient for {name}");
        }
    }
}
