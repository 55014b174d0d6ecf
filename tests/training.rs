mod common;

use anyhow::{Result, ensure};
use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use common::FlatEnv;
use fighter_rl::{
    Action, Callback, EnvFn, Environment, GameSpec, Hyperparameters, Learner, ObsShape,
    Observation, Overrides, Policy, PolicyBackend, PolicyKind, TrainConfig, TrainMode, VecEnv,
    run_training,
};

// =============================================================================
// Recording stub backend
// =============================================================================

struct StubModel {
    hp: Hyperparameters,
}

impl Policy for StubModel {
    fn predict(&mut self, _obs: &Observation) -> Result<Action> {
        Ok(Action::Noop)
    }

    fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, b"stub")?;
        Ok(())
    }
}

impl Learner for StubModel {
    fn hyperparameters(&self) -> &Hyperparameters {
        &self.hp
    }

    fn learn(
        &mut self,
        env: &mut dyn VecEnv,
        total_timesteps: u64,
        callbacks: &mut [Box<dyn Callback>],
    ) -> Result<()> {
        let n = env.num_envs();
        env.reset()?;
        let mut timesteps = 0u64;
        while timesteps < total_timesteps {
            env.step(&vec![Action::Noop; n])?;
            timesteps += n as u64;
            for cb in callbacks.iter_mut() {
                cb.on_step(timesteps, &*self)?;
            }
        }
        tracing::info!(timesteps, "stub rollout done");
        Ok(())
    }
}

#[derive(Default)]
struct StubBackend {
    constructed: RefCell<Option<(ObsShape, Hyperparameters)>>,
    loaded: RefCell<Option<(PathBuf, Overrides)>>,
}

impl PolicyBackend for StubBackend {
    type Model = StubModel;

    fn construct(
        &self,
        obs_shape: ObsShape,
        hyperparameters: Hyperparameters,
    ) -> Result<StubModel> {
        *self.constructed.borrow_mut() = Some((obs_shape, hyperparameters.clone()));
        Ok(StubModel {
            hp: hyperparameters,
        })
    }

    fn load(&self, path: &Path, overrides: &Overrides) -> Result<StubModel> {
        ensure!(path.exists(), "no model at {}", path.display());
        *self.loaded.borrow_mut() = Some((path.to_path_buf(), overrides.clone()));
        let mut hp = TrainConfig::new(game("Champion.Level1.RyuVsGuile"))
            .new_model_hyperparameters()?;
        overrides.apply(&mut hp);
        Ok(StubModel { hp })
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn game(state: &str) -> GameSpec {
    GameSpec {
        game: "StreetFighter".into(),
        state: state.into(),
        rom_dir: PathBuf::from("roms"),
        states_dir: PathBuf::from("states"),
    }
}

fn config(dir: &Path) -> TrainConfig {
    let mut cfg = TrainConfig::new(game("Champion.Level3.Chunli"));
    cfg.num_envs = 2;
    cfg.save_dir = dir.join("trained_models");
    cfg.checkpoint_interval = 5;
    cfg.total_timesteps = 40;
    cfg
}

#[derive(Clone, Default)]
struct Probe {
    seeds: Rc<RefCell<Vec<u64>>>,
    closes: Rc<Cell<u32>>,
}

impl Probe {
    fn factory(&self) -> impl Fn(u64) -> EnvFn + '_ {
        move |seed| -> EnvFn {
            let seeds = self.seeds.clone();
            let closes = self.closes.clone();
            Box::new(move || {
                let mut env = FlatEnv { seeds, closes };
                env.seed(seed);
                Ok(Box::new(env) as Box<dyn Environment>)
            })
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[test]
fn new_model_gets_reference_hyperparameters_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let backend = StubBackend::default();
    let probe = Probe::default();
    run_training(&cfg, &backend, probe.factory()).unwrap();

    let (shape, hp) = backend.constructed.borrow().clone().unwrap();
    assert_eq!(shape, common::SHAPE);
    assert_eq!(hp, cfg.new_model_hyperparameters().unwrap());
    assert_eq!(hp.policy, PolicyKind::Cnn);
    assert_eq!(hp.gamma, 0.94);
    assert_eq!((hp.n_steps, hp.batch_size, hp.n_epochs), (512, 512, 4));
    assert!(backend.loaded.borrow().is_none());
}

#[test]
fn instances_are_seeded_by_index_and_closed() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.num_envs = 4;
    let probe = Probe::default();
    run_training(&cfg, &StubBackend::default(), probe.factory()).unwrap();
    assert_eq!(*probe.seeds.borrow(), vec![0, 1, 2, 3]);
    assert_eq!(probe.closes.get(), 4);
}

#[test]
fn checkpoints_every_interval_of_vectorized_steps() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let probe = Probe::default();
    run_training(&cfg, &StubBackend::default(), probe.factory()).unwrap();

    // 40 timesteps over 2 instances is 20 calls, a checkpoint every 5 calls.
    for steps in [10, 20, 30, 40] {
        let path = cfg
            .save_dir
            .join(format!("Level3_Chunli_{steps}_steps.safetensors"));
        assert!(path.exists(), "missing {}", path.display());
    }
    assert!(!cfg.save_dir.join("Level3_Chunli_5_steps.safetensors").exists());
}

#[test]
fn learn_output_goes_to_run_log_and_final_model_is_saved() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let probe = Probe::default();
    let outcome = run_training(&cfg, &StubBackend::default(), probe.factory()).unwrap();

    assert_eq!(outcome.prefix, "Level3_Chunli");
    assert_eq!(
        outcome.log_path,
        cfg.save_dir.join("training_log_Level3_Chunli.txt")
    );
    let log = std::fs::read_to_string(&outcome.log_path).unwrap();
    assert!(log.contains("stub rollout done"));
    assert!(log.contains("Saving model checkpoint"));
    assert_eq!(
        outcome.final_model,
        cfg.save_dir.join("ppo_sf2_Level3_Chunli.safetensors")
    );
    assert!(outcome.final_model.exists());
}

#[test]
fn fine_tune_loads_with_schedule_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("Level1_RyuVsGuile_4000000_steps.safetensors");
    std::fs::write(&source, b"weights").unwrap();
    let mut cfg = config(dir.path());
    cfg.mode = TrainMode::FineTune(source.clone());
    let backend = StubBackend::default();
    let probe = Probe::default();
    run_training(&cfg, &backend, probe.factory()).unwrap();

    let (path, overrides) = backend.loaded.borrow().clone().unwrap();
    assert_eq!(path, source);
    let lr = overrides.learning_rate.unwrap();
    let clip = overrides.clip_range.unwrap();
    assert_eq!((lr.initial(), lr.final_value()), (5.0e-5, 2.5e-6));
    assert_eq!((clip.initial(), clip.final_value()), (0.075, 0.025));
    assert_eq!(overrides.n_steps, Some(512));
    assert!(backend.constructed.borrow().is_none());
}

#[test]
fn missing_fine_tune_model_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.mode = TrainMode::FineTune(dir.path().join("nope.safetensors"));
    let probe = Probe::default();
    let err = run_training(&cfg, &StubBackend::default(), probe.factory()).unwrap_err();
    assert!(format!("{err:#}").contains("fine-tuning"));
    assert!(!cfg.save_dir.join("ppo_sf2_Level3_Chunli.safetensors").exists());
}

#[test]
fn malformed_state_id_fails_before_building_envs() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.game = game("next_game_round");
    let probe = Probe::default();
    assert!(run_training(&cfg, &StubBackend::default(), probe.factory()).is_err());
    assert!(probe.seeds.borrow().is_empty());
}
