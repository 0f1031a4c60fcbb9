use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DynamicsError, Result};
use crate::model::{DecodeOptions, FiniteScalarQuantizer};

/// Architecture of the dynamics model. Fixed at construction; a checkpoint is only
/// loadable with the config it was trained with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Side length of the (square) source frames in pixels.
    pub frame_size: usize,
    pub patch_size: usize,
    pub embed_dim: usize,
    pub num_heads: usize,
    /// Feed-forward width inside each transformer block.
    pub hidden_dim: usize,
    pub num_blocks: usize,
    /// Quantization levels per latent coordinate.
    pub num_bins: usize,
    pub latent_dim: usize,
    /// Width of the per-timestep conditioning vector; 0 disables conditioning.
    pub conditioning_dim: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            frame_size: 128,
            patch_size: 4,
            embed_dim: 128,
            num_heads: 8,
            hidden_dim: 128,
            num_blocks: 4,
            num_bins: 4,
            latent_dim: 5,
            conditioning_dim: 0,
        }
    }
}

impl ModelConfig {
    /// Patches per side of a frame.
    pub fn grid_side(&self) -> usize {
        self.frame_size / self.patch_size.max(1)
    }

    /// Spatial positions per frame (P).
    pub fn num_positions(&self) -> usize {
        self.grid_side() * self.grid_side()
    }

    /// `num_bins ^ latent_dim`, the width of the classification head.
    pub fn codebook_size(&self) -> Result<usize> {
        Ok(self.quantizer()?.codebook_size())
    }

    /// Codebook shared by the tokenizer side and the classification head.
    pub fn quantizer(&self) -> Result<FiniteScalarQuantizer> {
        FiniteScalarQuantizer::new(self.num_bins, self.latent_dim)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(DynamicsError::InvalidConfig(msg));
        if self.patch_size == 0 || self.frame_size == 0 {
            return invalid("frame_size and patch_size must be positive".into());
        }
        if self.frame_size % self.patch_size != 0 {
            return invalid(format!(
                "frame_size {} is not a multiple of patch_size {}",
                self.frame_size, self.patch_size
            ));
        }
        if self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            return invalid(format!(
                "embed_dim {} must be divisible by num_heads {}",
                self.embed_dim, self.num_heads
            ));
        }
        if self.embed_dim < 3 {
            return invalid("embed_dim must leave room for spatial and temporal channels".into());
        }
        if self.latent_dim == 0 || self.num_bins == 0 {
            return invalid("latent_dim and num_bins must be positive".into());
        }
        if self.hidden_dim == 0 {
            return invalid("hidden_dim must be positive".into());
        }
        self.codebook_size()?;
        Ok(())
    }
}

/// Training loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Safetensors clip store with `tokens` [N, T, P] and optional `actions` [N, T-1, A].
    pub data_path: PathBuf,
    pub out_dir: PathBuf,
    pub steps: usize,
    pub batch_size: usize,
    /// Frames per training window.
    pub context_length: usize,
    pub lr: f64,
    pub min_lr: f64,
    pub warmup_steps: usize,
    pub weight_decay: f64,
    /// Max global gradient L2 norm; 0 disables clipping.
    pub grad_clip: f64,
    pub log_every: usize,
    pub checkpoint_every: usize,
    pub seed: u64,
    pub use_actions: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_checkpoint: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data/tokens.safetensors"),
            out_dir: PathBuf::from("runs/dynamics"),
            steps: 20_000,
            batch_size: 32,
            context_length: 16,
            lr: 3e-4,
            min_lr: 1e-5,
            warmup_steps: 1_000,
            weight_decay: 0.01,
            grad_clip: 1.0,
            log_every: 100,
            checkpoint_every: 1_000,
            seed: 0,
            use_actions: false,
            init_checkpoint: None,
        }
    }
}

/// Rollout settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    /// Future frames to generate.
    pub horizon: usize,
    pub num_steps: usize,
    pub schedule_k: f64,
    pub temperature: f64,
    pub verify: bool,
    pub seed: u64,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        let options = DecodeOptions::default();
        Self {
            horizon: 1,
            num_steps: options.num_steps,
            schedule_k: options.schedule_k,
            temperature: options.temperature,
            verify: options.verify,
            seed: 0,
        }
    }
}

impl DecodeConfig {
    pub fn options(&self) -> DecodeOptions {
        DecodeOptions {
            num_steps: self.num_steps,
            schedule_k: self.schedule_k,
            temperature: self.temperature,
            verify: self.verify,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicsConfig {
    pub model: ModelConfig,
    pub train: TrainConfig,
    pub decode: DecodeConfig,
}

impl DynamicsConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DynamicsError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DynamicsError::InvalidConfig(format!("serialize config: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        let t = &self.train;
        if t.batch_size == 0 || t.context_length == 0 {
            return Err(DynamicsError::InvalidConfig(
                "batch_size and context_length must be positive".into(),
            ));
        }
        if t.use_actions && self.model.conditioning_dim == 0 {
            return Err(DynamicsError::InvalidConfig(
                "use_actions requires model.conditioning_dim > 0".into(),
            ));
        }
        if self.decode.horizon == 0 || self.decode.num_steps == 0 {
            return Err(DynamicsError::InvalidConfig(
                "decode horizon and num_steps must be at least 1".into(),
            ));
        }
        if self.decode.temperature < 0.0 {
            return Err(DynamicsError::InvalidConfig(
                "decode temperature must be >= 0".into(),
            ));
        }
        Ok(())
    }

    /// Apply `--flag value` overrides; returns the arguments that were not flags.
    pub fn apply_overrides(&mut self, args: &[String]) -> Result<Vec<String>> {
        let mut positional = Vec::new();
        let mut i = 0usize;
        while i < args.len() {
            let flag = args[i].as_str();
            if !flag.starts_with("--") {
                positional.push(args[i].clone());
                i += 1;
                continue;
            }
            // Boolean switches take no value.
            match flag {
                "--use-actions" => {
                    self.train.use_actions = true;
                    i += 1;
                    continue;
                }
                "--verify" => {
                    self.decode.verify = true;
                    i += 1;
                    continue;
                }
                _ => {}
            }
            let value = args.get(i + 1).ok_or_else(|| {
                DynamicsError::InvalidArgument(format!("{flag} requires a value"))
            })?;
            match flag {
                "--data" => self.train.data_path = PathBuf::from(value),
                "--out-dir" => self.train.out_dir = PathBuf::from(value),
                "--init-checkpoint" => self.train.init_checkpoint = Some(PathBuf::from(value)),
                "--steps" => self.train.steps = parse_flag(flag, value)?,
                "--batch-size" => self.train.batch_size = parse_flag(flag, value)?,
                "--context-length" => self.train.context_length = parse_flag(flag, value)?,
                "--lr" => self.train.lr = parse_flag(flag, value)?,
                "--seed" => {
                    let seed = parse_flag(flag, value)?;
                    self.train.seed = seed;
                    self.decode.seed = seed;
                }
                "--horizon" => self.decode.horizon = parse_flag(flag, value)?,
                "--decode-steps" => self.decode.num_steps = parse_flag(flag, value)?,
                "--schedule-k" => self.decode.schedule_k = parse_flag(flag, value)?,
                "--temperature" => self.decode.temperature = parse_flag(flag, value)?,
                other => {
                    return Err(DynamicsError::InvalidArgument(format!(
                        "unknown flag {other}"
                    )))
                }
            }
            i += 2;
        }
        Ok(positional)
    }
}

fn parse_flag<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        DynamicsError::InvalidArgument(format!("{flag} got unparsable value {value:?}"))
    })
}
