use anyhow::{anyhow, bail, Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use crate::config::DynamicsConfig;
use crate::data::TokenClips;
use crate::model::{masked_accuracy, DynamicsModel};

/// What a finished run leaves behind.
#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub final_checkpoint: PathBuf,
    pub steps: usize,
    pub last_loss: f32,
}

/// `train <config.toml> [--flag value ...]`
pub fn try_run_train(args: &[String]) -> Result<bool> {
    if args.len() < 2 || (args[1] != "train" && args[1] != "--train") {
        return Ok(false);
    }
    let Some(config_path) = args.get(2) else {
        bail!("usage: {} train <config.toml> [--data <path>] [--steps <n>] [--lr <float>] [--init-checkpoint <path>] ...", args[0]);
    };
    let mut cfg = DynamicsConfig::from_file(config_path)
        .with_context(|| format!("loading config {config_path}"))?;
    let rest = cfg.apply_overrides(&args[3..])?;
    if !rest.is_empty() {
        bail!("unexpected arguments: {rest:?}");
    }
    run_training(&cfg, &select_device())?;
    Ok(true)
}

pub(crate) fn select_device() -> Device {
    match Device::new_cuda(0) {
        Ok(d) => {
            info!("using device: CUDA(0)");
            d
        }
        Err(e) => {
            info!("CUDA not available ({e}), using CPU");
            Device::Cpu
        }
    }
}

/// Learning rate: linear warmup to `base_lr`, then cosine decay to `min_lr`.
pub fn scheduled_lr(step: usize, total_steps: usize, warmup: usize, base_lr: f64, min_lr: f64) -> f64 {
    if warmup > 0 && step <= warmup {
        return base_lr * (step as f64 / warmup as f64);
    }
    let progress = (step.saturating_sub(warmup)) as f64 / total_steps.saturating_sub(warmup).max(1) as f64;
    let cos = (std::f64::consts::PI * progress.clamp(0.0, 1.0)).cos();
    min_lr + 0.5 * (base_lr - min_lr) * (1.0 + cos)
}

/// Scale all gradients so their global L2 norm is at most `max_norm`; returns the norm
/// before clipping. `max_norm <= 0` only measures.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut sq = 0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            sq += g.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let norm = sq.sqrt();
    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(g) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), (g * scale)?);
            }
        }
    }
    Ok(norm)
}

/// Weight decay applies to matrices only; biases, norms and the mask token go undecayed.
fn split_decay_groups(varmap: &VarMap) -> Result<(Vec<Var>, Vec<Var>)> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow!("parameter map lock poisoned"))?;
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();
    let (mut decay, mut plain) = (Vec::new(), Vec::new());
    for name in names {
        let var = data[name].clone();
        let is_norm = name.split('.').any(|part| part.starts_with("ln_"));
        if var.rank() >= 2 && !is_norm {
            decay.push(var);
        } else {
            plain.push(var);
        }
    }
    Ok((decay, plain))
}

fn checkpoint_path(out_dir: &Path, step: usize) -> PathBuf {
    out_dir.join(format!("dynamics_step_{step}.safetensors"))
}

pub fn run_training(cfg: &DynamicsConfig, device: &Device) -> Result<TrainSummary> {
    cfg.validate()?;
    let train = &cfg.train;
    let quantizer = cfg.model.quantizer()?;

    let clips = TokenClips::load(&train.data_path)
        .with_context(|| format!("loading clips from {}", train.data_path.display()))?;
    if clips.num_positions() != cfg.model.num_positions() {
        bail!(
            "clips have {} positions per frame, model expects {}",
            clips.num_positions(),
            cfg.model.num_positions()
        );
    }
    if train.use_actions && clips.action_dim() != Some(cfg.model.conditioning_dim) {
        bail!(
            "use_actions needs clip actions of width {}, found {:?}",
            cfg.model.conditioning_dim,
            clips.action_dim()
        );
    }

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = DynamicsModel::new(vb, &cfg.model)?;
    if let Some(init) = &train.init_checkpoint {
        varmap
            .load(init)
            .with_context(|| format!("warm start from {}", init.display()))?;
        info!(path = %init.display(), "loaded initial weights");
    }

    let all_vars = varmap.all_vars();
    let param_count: usize = all_vars.iter().map(|v| v.elem_count()).sum();
    let (decay_vars, plain_vars) = split_decay_groups(&varmap)?;
    let mut opt_decay = AdamW::new(
        decay_vars,
        ParamsAdamW {
            lr: train.lr,
            weight_decay: train.weight_decay,
            ..ParamsAdamW::default()
        },
    )?;
    let mut opt_plain = AdamW::new(
        plain_vars,
        ParamsAdamW {
            lr: train.lr,
            weight_decay: 0.0,
            ..ParamsAdamW::default()
        },
    )?;

    fs::create_dir_all(&train.out_dir)?;
    fs::write(train.out_dir.join("config.toml"), cfg.to_toml_string()?)?;
    info!(
        clips = clips.len(),
        frames = clips.num_frames(),
        positions = clips.num_positions(),
        codebook = model.codebook_size(),
        params = param_count,
        "training dynamics model"
    );

    let mut rng = StdRng::seed_from_u64(train.seed);
    let mut last_loss = f32::NAN;
    let started = Instant::now();
    for step in 1..=train.steps {
        let batch = clips.sample_batch(train.batch_size, train.context_length, &mut rng, device)?;
        let latents = quantizer.latents_from_indices(&batch.tokens)?;
        let conditioning = if train.use_actions {
            batch.actions.as_ref()
        } else {
            None
        };
        let out = model.forward(&latents, true, conditioning, Some(&batch.tokens), &mut rng)?;
        let loss = out
            .loss
            .ok_or_else(|| anyhow!("training forward produced no loss"))?;

        let lr = scheduled_lr(step, train.steps, train.warmup_steps, train.lr, train.min_lr);
        opt_decay.set_learning_rate(lr);
        opt_plain.set_learning_rate(lr);
        let mut grads = loss.backward()?;
        let grad_norm = clip_grad_norm(&mut grads, &all_vars, train.grad_clip)?;
        opt_decay.step(&grads)?;
        opt_plain.step(&grads)?;

        last_loss = loss.to_scalar::<f32>()?;
        if !last_loss.is_finite() {
            warn!(step, "non-finite loss");
        }
        if step % train.log_every.max(1) == 0 || step == train.steps {
            let mask = out.mask.as_ref();
            let acc = match mask {
                Some(m) => masked_accuracy(&out.logits, &batch.tokens, m)?,
                None => None,
            };
            info!(
                step,
                loss = last_loss,
                masked_acc = acc.unwrap_or(f32::NAN),
                mask_ratio = mask.and_then(|m| m.ratio()).unwrap_or(0.0),
                masked = mask.map(|m| m.count()).unwrap_or(0),
                grad_norm,
                lr,
                elapsed_s = started.elapsed().as_secs_f32(),
                "train"
            );
        }
        if train.checkpoint_every > 0 && step % train.checkpoint_every == 0 && step != train.steps {
            let path = checkpoint_path(&train.out_dir, step);
            varmap.save(&path)?;
            info!(path = %path.display(), "checkpoint");
        }
    }

    let final_checkpoint = train.out_dir.join("dynamics_final.safetensors");
    varmap.save(&final_checkpoint)?;
    info!(path = %final_checkpoint.display(), loss = last_loss, "training finished");
    Ok(TrainSummary {
        final_checkpoint,
        steps: train.steps,
        last_loss,
    })
}
