use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use crate::config::DynamicsConfig;
use crate::data::{save_tensors, ACTIONS_KEY, LATENTS_KEY, TOKENS_KEY};
use crate::model::DynamicsModel;

use super::train::select_device;

/// Setting this to `1` turns on the decode postcondition check from the command line.
pub const VERIFY_ENV: &str = "DYNAMICS_VERIFY_MASK";

#[derive(Debug, Clone)]
pub struct RolloutSummary {
    /// `[B, T_ctx + H, P]`
    pub tokens: Tensor,
    pub steps_run: usize,
    pub finalized: bool,
}

/// `rollout <config.toml> <checkpoint> <context.safetensors> <out.safetensors> [--flag value ...]`
pub fn try_run_rollout(args: &[String]) -> Result<bool> {
    if args.len() < 2 || (args[1] != "rollout" && args[1] != "--rollout") {
        return Ok(false);
    }
    if args.len() < 6 {
        bail!(
            "usage: {} rollout <config.toml> <checkpoint> <context.safetensors> <out.safetensors> [--horizon <n>] [--decode-steps <n>] [--temperature <float>] [--seed <n>] [--verify]",
            args[0]
        );
    }
    let mut cfg = DynamicsConfig::from_file(&args[2])
        .with_context(|| format!("loading config {}", args[2]))?;
    let rest = cfg.apply_overrides(&args[6..])?;
    if !rest.is_empty() {
        bail!("unexpected arguments: {rest:?}");
    }
    if std::env::var(VERIFY_ENV).map(|v| v == "1").unwrap_or(false) {
        cfg.decode.verify = true;
    }
    let summary = run_rollout(
        &cfg,
        &PathBuf::from(&args[3]),
        &PathBuf::from(&args[4]),
        &PathBuf::from(&args[5]),
        &select_device(),
    )?;
    info!(
        shape = ?summary.tokens.dims(),
        steps = summary.steps_run,
        finalized = summary.finalized,
        out = %args[5],
        "rollout saved"
    );
    Ok(true)
}

/// Decode `cfg.decode.horizon` frames after every clip in `context_path` and write
/// `tokens` `[B, T_ctx + H, P]` and `latents` `[B, T_ctx + H, P, L]` to `out_path`.
///
/// Conditioning is read from an `actions` tensor when the model takes it; it must
/// cover the generated frames too (`T_ctx + H` or `T_ctx + H - 1` rows).
pub fn run_rollout(
    cfg: &DynamicsConfig,
    checkpoint: &Path,
    context_path: &Path,
    out_path: &Path,
    device: &Device,
) -> Result<RolloutSummary> {
    cfg.validate()?;
    let quantizer = cfg.model.quantizer()?;

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = DynamicsModel::new(vb, &cfg.model)?;
    varmap
        .load(checkpoint)
        .with_context(|| format!("loading checkpoint {}", checkpoint.display()))?;

    let mut inputs = candle_core::safetensors::load(context_path, device)
        .with_context(|| format!("reading context {}", context_path.display()))?;
    let Some(tokens) = inputs.remove(TOKENS_KEY) else {
        bail!("{} has no `{TOKENS_KEY}` tensor", context_path.display());
    };
    let tokens = tokens.to_dtype(DType::U32)?;
    let conditioning = match inputs.remove(ACTIONS_KEY) {
        Some(a) if cfg.model.conditioning_dim > 0 => Some(a.to_dtype(DType::F32)?),
        Some(_) => {
            warn!("ignoring `{ACTIONS_KEY}`: model was built without conditioning");
            None
        }
        None => None,
    };
    let context = quantizer.latents_from_indices(&tokens)?;

    let options = cfg.decode.options();
    let mut rng = StdRng::seed_from_u64(cfg.decode.seed);
    let started = Instant::now();
    let out = model.decode_traced(
        &context,
        cfg.decode.horizon,
        &quantizer,
        conditioning.as_ref(),
        &options,
        &mut rng,
    )?;
    info!(
        context = ?tokens.dims(),
        horizon = cfg.decode.horizon,
        steps = out.trace.len(),
        elapsed_s = started.elapsed().as_secs_f32(),
        "decoded"
    );

    let resolved = quantizer.indices_from_latents(&out.latents)?;
    save_tensors(
        out_path,
        &[(TOKENS_KEY, &resolved), (LATENTS_KEY, &out.latents)],
    )?;
    Ok(RolloutSummary {
        tokens: resolved,
        steps_run: out.trace.len(),
        finalized: out.finalized,
    })
}
