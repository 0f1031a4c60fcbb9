use anyhow::{bail, Result};
use tracing_subscriber::EnvFilter;

use latent_dynamics::tasks;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if tasks::train::try_run_train(&args)? {
        return Ok(());
    }
    if tasks::rollout::try_run_rollout(&args)? {
        return Ok(());
    }

    eprintln!("usage (choose one):");
    eprintln!("  Training:");
    eprintln!(
        "    {} train <config.toml> [--data <tokens.safetensors>] [--steps <n>] [--batch-size <n>] [--lr <float>] [--init-checkpoint <path>] [--use-actions]",
        args[0]
    );
    eprintln!("  Inference:");
    eprintln!(
        "    {} rollout <config.toml> <checkpoint> <context.safetensors> <out.safetensors> [--horizon <n>] [--decode-steps <n>] [--temperature <float>] [--verify]",
        args[0]
    );
    eprintln!("  Set {}=1 to fail when decoding leaves cells masked.", tasks::rollout::VERIFY_ENV);
    bail!("missing or unknown command");
}
