pub mod callbacks;
pub mod config;
pub mod env;
pub mod eval;
pub mod log_sink;
pub mod monitor;
pub mod policy;
pub mod schedule;
pub mod snapshot;
pub mod train;
pub mod vec_env;
pub mod wrapper;

pub use callbacks::{Callback, CheckpointCallback};
pub use config::{ConfigError, EvalConfig, StateId, StateIdError, TrainConfig, TrainMode};
pub use env::{Action, Environment, GameSpec, Info, NesEnv, ObsShape, Observation, Step, ram};
pub use eval::{ActionSource, EvalStats, Milestone, milestone_qualifies, run_evaluation};
pub use log_sink::LogSink;
pub use monitor::{EpisodeSummary, Monitor};
pub use policy::{
    ActorCritic, CandleBackend, Hyperparameters, Learner, Overrides, Policy, PolicyBackend,
    PolicyKind,
};
pub use schedule::{LinearSchedule, ScheduleError};
pub use snapshot::{NEXT_ROUND_STATE, load_game_state, save_game_state};
pub use train::{TrainOutcome, run_training};
pub use vec_env::{DummyVecEnv, EnvFn, VecEnv, make_env};
pub use wrapper::{FighterWrapper, RewardConfig, WrapperConfig};
