use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::callbacks::{Callback, CheckpointCallback};
use crate::config::{TrainConfig, TrainMode};
use crate::log_sink::LogSink;
use crate::policy::{Learner, Policy, PolicyBackend};
use crate::vec_env::{DummyVecEnv, EnvFn, VecEnv};

#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutcome {
    pub prefix: String,
    pub log_path: PathBuf,
    pub final_model: PathBuf,
}

/// Builds `num_envs` instances (instance `i` seeded with `i`), constructs or
/// loads the model, learns with periodic checkpoints while logging to the run
/// log file, then saves the final model.
pub fn run_training<B, F>(config: &TrainConfig, backend: &B, make_env: F) -> Result<TrainOutcome>
where
    B: PolicyBackend,
    F: Fn(u64) -> EnvFn,
{
    config.validate()?;
    let prefix = config.state_id().save_name_prefix()?;
    let final_model = config.final_model_path(&prefix);
    let log_path = config.log_path(&prefix);
    eprintln!("save model as {}", final_model.display());

    let env_fns = (0..config.num_envs as u64).map(make_env).collect();
    let mut env = DummyVecEnv::new(env_fns)?;

    let mut model = match &config.mode {
        TrainMode::New => {
            backend.construct(env.observation_shape(), config.new_model_hyperparameters()?)?
        }
        TrainMode::FineTune(path) => backend
            .load(path, &config.fine_tune_overrides()?)
            .with_context(|| format!("Failed to load model for fine-tuning: {}", path.display()))?,
    };

    std::fs::create_dir_all(&config.save_dir)?;
    let checkpoint =
        CheckpointCallback::new(config.checkpoint_interval, &config.save_dir, &prefix)?;
    let mut callbacks: Vec<Box<dyn Callback>> = vec![Box::new(checkpoint)];

    tracing::info!(
        prefix = %prefix,
        num_envs = config.num_envs,
        total_timesteps = config.total_timesteps,
        log = %log_path.display(),
        "starting training"
    );
    let learned = {
        let _sink = LogSink::to_file(&log_path)?;
        model.learn(&mut env, config.total_timesteps, &mut callbacks)
    };
    env.close()?;
    learned?;

    model.save(&final_model)?;
    eprintln!("✅ Run finished. Final model saved: {}", final_model.display());

    Ok(TrainOutcome {
        prefix,
        log_path,
        final_model,
    })
}
