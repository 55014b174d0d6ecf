use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::policy::Policy;

/// Hook invoked by a learner once per vectorized environment step.
pub trait Callback {
    fn on_step(&mut self, num_timesteps: u64, policy: &dyn Policy) -> Result<()>;
}

/// Saves the policy every `save_freq` calls as
/// `{save_path}/{name_prefix}_{num_timesteps}_steps.safetensors`.
///
/// One call covers one step of every instance, so with N instances a
/// checkpoint is written every `save_freq * N` timesteps.
pub struct CheckpointCallback {
    save_freq: u64,
    save_path: PathBuf,
    name_prefix: String,
    n_calls: u64,
}

impl CheckpointCallback {
    pub fn new(
        save_freq: u64,
        save_path: impl Into<PathBuf>,
        name_prefix: impl Into<String>,
    ) -> Result<Self> {
        anyhow::ensure!(save_freq > 0, "checkpoint interval must be > 0");
        let save_path = save_path.into();
        std::fs::create_dir_all(&save_path)?;
        Ok(Self {
            save_freq,
            save_path,
            name_prefix: name_prefix.into(),
            n_calls: 0,
        })
    }

    pub fn checkpoint_path(&self, num_timesteps: u64) -> PathBuf {
        checkpoint_path(&self.save_path, &self.name_prefix, num_timesteps)
    }
}

pub fn checkpoint_path(dir: &Path, prefix: &str, num_timesteps: u64) -> PathBuf {
    dir.join(format!("{prefix}_{num_timesteps}_steps.safetensors"))
}

impl Callback for CheckpointCallback {
    fn on_step(&mut self, num_timesteps: u64, policy: &dyn Policy) -> Result<()> {
        self.n_calls += 1;
        if self.n_calls % self.save_freq == 0 {
            let path = self.checkpoint_path(num_timesteps);
            policy.save(&path)?;
            tracing::info!("Saving model checkpoint to {}", path.display());
        }
        Ok(())
    }
}
