use std::path::PathBuf;

use crate::env::GameSpec;
use crate::policy::{Hyperparameters, Overrides, PolicyKind};
use crate::schedule::{LinearSchedule, ScheduleError};
use crate::snapshot::NEXT_ROUND_STATE;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum StateIdError {
    #[error("state id '{0}' needs at least three dot-separated parts, e.g. Champion.Level3.Chunli")]
    TooFewParts(String),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Dotted start-state identifier such as `Champion.Level3.Chunli`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateId(String);

impl StateId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Second and third components joined by `_`: `Champion.Level3.Chunli`
    /// becomes `Level3_Chunli`.
    pub fn save_name_prefix(&self) -> Result<String, StateIdError> {
        let parts: Vec<&str> = self.0.split('.').collect();
        if parts.len() < 3 {
            return Err(StateIdError::TooFewParts(self.0.clone()));
        }
        Ok(format!("{}_{}", parts[1], parts[2]))
    }
}

// =============================================================================
// Training
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum TrainMode {
    New,
    /// Continue training from a saved model.
    FineTune(PathBuf),
}

#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub game: GameSpec,
    pub num_envs: usize,
    pub mode: TrainMode,
    pub policy: PolicyKind,
    pub save_dir: PathBuf,
    pub checkpoint_interval: u64,
    pub total_timesteps: u64,
}

impl TrainConfig {
    pub fn new(game: GameSpec) -> Self {
        Self {
            game,
            num_envs: 16,
            mode: TrainMode::New,
            policy: PolicyKind::Cnn,
            save_dir: PathBuf::from("trained_models"),
            checkpoint_interval: 31_250,
            total_timesteps: 7_000_000,
        }
    }

    pub fn state_id(&self) -> StateId {
        StateId::new(&self.game.state)
    }

    pub fn new_model_hyperparameters(&self) -> Result<Hyperparameters, ScheduleError> {
        Ok(Hyperparameters {
            policy: self.policy,
            gamma: 0.94,
            n_steps: 512,
            batch_size: 512,
            n_epochs: 4,
            learning_rate: LinearSchedule::new(2.5e-4, 2.5e-6)?,
            clip_range: LinearSchedule::new(0.15, 0.025)?,
        })
    }

    pub fn fine_tune_overrides(&self) -> Result<Overrides, ScheduleError> {
        Ok(Overrides {
            learning_rate: Some(LinearSchedule::new(5.0e-5, 2.5e-6)?),
            clip_range: Some(LinearSchedule::new(0.075, 0.025)?),
            n_steps: Some(512),
        })
    }

    pub fn log_path(&self, prefix: &str) -> PathBuf {
        self.save_dir.join(format!("training_log_{prefix}.txt"))
    }

    pub fn final_model_path(&self, prefix: &str) -> PathBuf {
        self.save_dir.join(format!("ppo_sf2_{prefix}.safetensors"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_envs == 0 {
            return Err(ConfigError::Validation("num_envs must be > 0".into()));
        }
        if self.checkpoint_interval == 0 {
            return Err(ConfigError::Validation("checkpoint_interval must be > 0".into()));
        }
        if self.total_timesteps == 0 {
            return Err(ConfigError::Validation("total_timesteps must be > 0".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Evaluation
// =============================================================================

#[derive(Debug, Clone)]
pub struct EvalConfig {
    pub game: GameSpec,
    pub reset_round: bool,
    pub rendering: bool,
    pub model_name: String,
    pub model_dir: PathBuf,
    pub random_action: bool,
    pub num_episodes: u32,
    pub save_state: bool,
    pub snapshot_path: PathBuf,
}

impl EvalConfig {
    pub fn new(game: GameSpec) -> Self {
        Self {
            game,
            reset_round: false,
            rendering: true,
            model_name: "Level2_RyuVsKen_6500000_steps".into(),
            model_dir: PathBuf::from("trained_models"),
            random_action: false,
            num_episodes: 4,
            save_state: true,
            snapshot_path: PathBuf::from(NEXT_ROUND_STATE),
        }
    }

    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(format!("{}.safetensors", self.model_name))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_episodes == 0 {
            return Err(ConfigError::Validation("num_episodes must be > 0".into()));
        }
        if !self.random_action && self.model_name.is_empty() {
            return Err(ConfigError::Validation(
                "model_name is required unless playing random actions".into(),
            ));
        }
        Ok(())
    }
}
