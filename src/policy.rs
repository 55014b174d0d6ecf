use anyhow::{Context, Result, ensure};
use candle_core::{D, DType, Device, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Linear, Module, VarBuilder, VarMap};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::callbacks::Callback;
use crate::env::{Action, ObsShape, Observation};
use crate::monitor::EpisodeSummary;
use crate::schedule::LinearSchedule;
use crate::vec_env::VecEnv;

// =============================================================================
// Hyperparameters
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Cnn,
    Mlp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub policy: PolicyKind,
    pub gamma: f64,
    pub n_steps: usize,
    pub batch_size: usize,
    pub n_epochs: usize,
    pub learning_rate: LinearSchedule,
    pub clip_range: LinearSchedule,
}

/// Values replacing the persisted hyperparameters when a model is reloaded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub learning_rate: Option<LinearSchedule>,
    pub clip_range: Option<LinearSchedule>,
    pub n_steps: Option<usize>,
}

impl Overrides {
    pub fn apply(&self, hp: &mut Hyperparameters) {
        if let Some(lr) = self.learning_rate {
            hp.learning_rate = lr;
        }
        if let Some(clip) = self.clip_range {
            hp.clip_range = clip;
        }
        if let Some(n_steps) = self.n_steps {
            hp.n_steps = n_steps;
        }
    }
}

// =============================================================================
// Policy Boundary
// =============================================================================

pub trait Policy {
    /// Action for one observation, drawn from the policy's action distribution.
    fn predict(&mut self, obs: &Observation) -> Result<Action>;
    fn save(&self, path: &Path) -> Result<()>;
}

pub trait Learner: Policy {
    fn hyperparameters(&self) -> &Hyperparameters;

    fn learn(
        &mut self,
        env: &mut dyn VecEnv,
        total_timesteps: u64,
        callbacks: &mut [Box<dyn Callback>],
    ) -> Result<()>;
}

/// Builds and restores learners for one compute backend.
pub trait PolicyBackend {
    type Model: Learner;

    fn construct(
        &self,
        obs_shape: ObsShape,
        hyperparameters: Hyperparameters,
    ) -> Result<Self::Model>;
    fn load(&self, path: &Path, overrides: &Overrides) -> Result<Self::Model>;
}

// =============================================================================
// Actor-Critic Network (candle)
// =============================================================================

enum Trunk {
    /// Nature DQN convolution stack followed by a 512-unit layer.
    Cnn {
        conv1: Conv2d,
        conv2: Conv2d,
        conv3: Conv2d,
        fc: Linear,
    },
    Mlp {
        fc1: Linear,
        fc2: Linear,
    },
}

fn conv_out(size: usize, kernel: usize, stride: usize) -> usize {
    (size - kernel) / stride + 1
}

fn conv(
    in_c: usize,
    out_c: usize,
    kernel: usize,
    stride: usize,
    vs: VarBuilder,
) -> candle_core::Result<Conv2d> {
    let cfg = Conv2dConfig {
        stride,
        ..Default::default()
    };
    candle_nn::conv2d(in_c, out_c, kernel, cfg, vs)
}

/// Shared trunk with an action-logit head and a state-value head.
pub struct ActorCriticNet {
    trunk: Trunk,
    policy_head: Linear,
    value_head: Linear,
}

impl ActorCriticNet {
    pub fn new(vs: VarBuilder, kind: PolicyKind, shape: ObsShape) -> Result<Self> {
        let (trunk, features) = match kind {
            PolicyKind::Cnn => {
                ensure!(
                    shape.height >= 36 && shape.width >= 36,
                    "observation {}x{} is too small for the convolution stack",
                    shape.height,
                    shape.width
                );
                let h = conv_out(conv_out(conv_out(shape.height, 8, 4), 4, 2), 3, 1);
                let w = conv_out(conv_out(conv_out(shape.width, 8, 4), 4, 2), 3, 1);
                let trunk = Trunk::Cnn {
                    conv1: conv(shape.channels, 32, 8, 4, vs.pp("conv1"))?,
                    conv2: conv(32, 64, 4, 2, vs.pp("conv2"))?,
                    conv3: conv(64, 64, 3, 1, vs.pp("conv3"))?,
                    fc: candle_nn::linear(64 * h * w, 512, vs.pp("fc"))?,
                };
                (trunk, 512)
            }
            PolicyKind::Mlp => {
                let trunk = Trunk::Mlp {
                    fc1: candle_nn::linear(shape.len(), 64, vs.pp("fc1"))?,
                    fc2: candle_nn::linear(64, 64, vs.pp("fc2"))?,
                };
                (trunk, 64)
            }
        };
        Ok(Self {
            trunk,
            policy_head: candle_nn::linear(features, Action::COUNT, vs.pp("pi"))?,
            value_head: candle_nn::linear(features, 1, vs.pp("vf"))?,
        })
    }

    /// Forward pass: batch of inputs → (action logits, state values)
    pub fn forward(&self, x: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        let h = match &self.trunk {
            Trunk::Cnn {
                conv1,
                conv2,
                conv3,
                fc,
            } => {
                let h = conv1.forward(x)?.relu()?;
                let h = conv2.forward(&h)?.relu()?;
                let h = conv3.forward(&h)?.relu()?;
                fc.forward(&h.flatten_from(1)?)?.relu()?
            }
            Trunk::Mlp { fc1, fc2 } => {
                let h = fc1.forward(x)?.tanh()?;
                fc2.forward(&h)?.tanh()?
            }
        };
        let logits = self.policy_head.forward(&h)?;
        let values = self.value_head.forward(&h)?.squeeze(D::Minus1)?;
        Ok((logits, values))
    }
}

// =============================================================================
// Actor-Critic Policy
// =============================================================================

#[derive(Serialize, Deserialize)]
struct ModelMeta {
    hyperparameters: Hyperparameters,
    observation_shape: ObsShape,
    num_timesteps: u64,
}

/// JSON sidecar stored next to the weights file.
pub fn meta_path(path: &Path) -> PathBuf {
    path.with_extension("json")
}

const EP_INFO_WINDOW: usize = 100;

pub struct ActorCritic {
    varmap: VarMap,
    net: ActorCriticNet,
    device: Device,
    hp: Hyperparameters,
    shape: ObsShape,
    num_timesteps: u64,
    rng: SmallRng,
}

impl ActorCritic {
    pub fn new(device: &Device, shape: ObsShape, hp: Hyperparameters) -> Result<Self> {
        ensure!(hp.n_steps > 0, "n_steps must be > 0");
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let net = ActorCriticNet::new(vs, hp.policy, shape)?;
        Ok(Self {
            varmap,
            net,
            device: device.clone(),
            hp,
            shape,
            num_timesteps: 0,
            rng: SmallRng::from_os_rng(),
        })
    }

    pub fn load(path: &Path, device: &Device, overrides: &Overrides) -> Result<Self> {
        let meta_path = meta_path(path);
        let file = File::open(&meta_path)
            .with_context(|| format!("Failed to open model metadata: {}", meta_path.display()))?;
        let meta: ModelMeta = serde_json::from_reader(BufReader::new(file))
            .context("Failed to parse model metadata")?;

        let mut hp = meta.hyperparameters;
        overrides.apply(&mut hp);
        let mut model = Self::new(device, meta.observation_shape, hp)?;
        model
            .varmap
            .load(path)
            .with_context(|| format!("Failed to load model weights: {}", path.display()))?;
        model.num_timesteps = meta.num_timesteps;
        eprintln!("📂 Model loaded from {}", path.display());
        Ok(model)
    }

    pub fn seed(&mut self, seed: u64) {
        self.rng = SmallRng::seed_from_u64(seed);
    }

    pub fn observation_shape(&self) -> ObsShape {
        self.shape
    }

    pub fn num_timesteps(&self) -> u64 {
        self.num_timesteps
    }

    /// Stacks observations into a batch tensor scaled to `[0, 1]`.
    fn batch(&self, obs: &[Observation]) -> Result<Tensor> {
        let s = self.shape;
        let mut data = Vec::with_capacity(obs.len() * s.len());
        for o in obs {
            ensure!(o.shape == s, "observation shape {:?} != {:?}", o.shape, s);
            data.extend(o.pixels.iter().map(|&p| p as f32 / 255.0));
        }
        let x = match self.hp.policy {
            PolicyKind::Cnn => {
                let shape = (obs.len(), s.height, s.width, s.channels);
                Tensor::from_vec(data, shape, &self.device)?
                    .permute((0, 3, 1, 2))?
                    .contiguous()?
            }
            PolicyKind::Mlp => Tensor::from_vec(data, (obs.len(), s.len()), &self.device)?,
        };
        Ok(x)
    }

    /// Samples one action per observation from the policy distribution and
    /// returns the value estimates alongside.
    fn sample_actions(&mut self, obs: &[Observation]) -> Result<(Vec<Action>, Vec<f32>)> {
        let (logits, values) = self.net.forward(&self.batch(obs)?)?;
        let probs = candle_nn::ops::softmax(&logits, D::Minus1)?.to_vec2::<f32>()?;
        let actions = probs
            .iter()
            .map(|p| {
                let mut u = self.rng.random::<f32>();
                for (i, &pi) in p.iter().enumerate() {
                    if u < pi {
                        return Action::from_index(i);
                    }
                    u -= pi;
                }
                Action::from_index(Action::COUNT - 1)
            })
            .collect();
        Ok((actions, values.to_vec1::<f32>()?))
    }

    /// Highest-scoring action for one observation.
    pub fn predict_deterministic(&mut self, obs: &Observation) -> Result<Action> {
        let (logits, _) = self.net.forward(&self.batch(std::slice::from_ref(obs))?)?;
        let action = logits.argmax(D::Minus1)?.squeeze(0)?.to_scalar::<u32>()? as usize;
        Ok(Action::from_index(action))
    }
}

impl Policy for ActorCritic {
    fn predict(&mut self, obs: &Observation) -> Result<Action> {
        let (actions, _) = self.sample_actions(std::slice::from_ref(obs))?;
        Ok(actions[0])
    }

    fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        self.varmap.save(path)?;
        let meta = ModelMeta {
            hyperparameters: self.hp.clone(),
            observation_shape: self.shape,
            num_timesteps: self.num_timesteps,
        };
        let file = File::create(meta_path(path))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &meta)?;
        tracing::info!("💾 Model saved to {}", path.display());
        Ok(())
    }
}

impl Learner for ActorCritic {
    fn hyperparameters(&self) -> &Hyperparameters {
        &self.hp
    }

    /// Collects `n_steps` transitions per instance per rollout until
    /// `total_timesteps` is reached, calling every callback once per
    /// vectorized step. Rollout statistics are logged with the schedule
    /// values at the current progress. No optimisation step runs here, so the
    /// weights leave exactly as they came in.
    fn learn(
        &mut self,
        env: &mut dyn VecEnv,
        total_timesteps: u64,
        callbacks: &mut [Box<dyn Callback>],
    ) -> Result<()> {
        ensure!(
            env.observation_shape() == self.shape,
            "environment observation {:?} does not match the model's {:?}",
            env.observation_shape(),
            self.shape
        );
        let n_envs = env.num_envs() as u64;
        self.num_timesteps = 0;
        let t_start = Instant::now();
        let mut ep_info: VecDeque<EpisodeSummary> = VecDeque::with_capacity(EP_INFO_WINDOW);
        let mut obs = env.reset()?;
        let mut iteration = 0u64;

        while self.num_timesteps < total_timesteps {
            let progress_remaining = 1.0 - self.num_timesteps as f64 / total_timesteps as f64;
            let learning_rate = self.hp.learning_rate.value(progress_remaining);
            let clip_range = self.hp.clip_range.value(progress_remaining);
            let mut value_sum = 0.0f64;

            for _ in 0..self.hp.n_steps {
                let (actions, values) = self.sample_actions(&obs)?;
                value_sum += values.iter().map(|&v| v as f64).sum::<f64>();
                let steps = env.step(&actions)?;
                self.num_timesteps += n_envs;

                obs = Vec::with_capacity(steps.len());
                for step in steps {
                    if let Some(ep) = step.info.episode {
                        if ep_info.len() == EP_INFO_WINDOW {
                            ep_info.pop_front();
                        }
                        ep_info.push_back(ep);
                    }
                    obs.push(step.obs);
                }

                for cb in callbacks.iter_mut() {
                    cb.on_step(self.num_timesteps, &*self)?;
                }
            }

            iteration += 1;
            let (ep_rew_mean, ep_len_mean) = if ep_info.is_empty() {
                (f64::NAN, f64::NAN)
            } else {
                let n = ep_info.len() as f64;
                (
                    ep_info.iter().map(|e| e.reward).sum::<f64>() / n,
                    ep_info.iter().map(|e| e.length as f64).sum::<f64>() / n,
                )
            };
            let elapsed = t_start.elapsed().as_secs_f64().max(1e-9);
            tracing::info!(
                iteration,
                total_timesteps = self.num_timesteps,
                ep_rew_mean,
                ep_len_mean,
                fps = (self.num_timesteps as f64 / elapsed) as u64,
                learning_rate,
                clip_range,
                value_mean = value_sum / (self.hp.n_steps as f64 * n_envs as f64),
                "rollout"
            );
        }
        Ok(())
    }
}

// =============================================================================
// Backend
// =============================================================================

/// CUDA when built with it and not disabled, CPU otherwise.
pub fn select_device(cpu: bool) -> Device {
    if cpu {
        Device::Cpu
    } else {
        Device::new_cuda(0).unwrap_or(Device::Cpu)
    }
}

pub struct CandleBackend {
    pub device: Device,
}

impl CandleBackend {
    pub fn new(cpu: bool) -> Self {
        Self {
            device: select_device(cpu),
        }
    }
}

impl PolicyBackend for CandleBackend {
    type Model = ActorCritic;

    fn construct(
        &self,
        obs_shape: ObsShape,
        hyperparameters: Hyperparameters,
    ) -> Result<ActorCritic> {
        ActorCritic::new(&self.device, obs_shape, hyperparameters)
    }

    fn load(&self, path: &Path, overrides: &Overrides) -> Result<ActorCritic> {
        ActorCritic::load(path, &self.device, overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{Environment, Info, Step};
    use crate::vec_env::{DummyVecEnv, EnvFn};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn hp(policy: PolicyKind) -> Hyperparameters {
        Hyperparameters {
            policy,
            gamma: 0.94,
            n_steps: 4,
            batch_size: 8,
            n_epochs: 4,
            learning_rate: LinearSchedule::new(2.5e-4, 2.5e-6).unwrap(),
            clip_range: LinearSchedule::new(0.15, 0.025).unwrap(),
        }
    }

    const TINY: ObsShape = ObsShape {
        height: 2,
        width: 2,
        channels: 3,
    };

    struct Flat;

    impl Environment for Flat {
        fn reset(&mut self) -> Result<Observation> {
            Ok(Observation::zeros(TINY))
        }

        fn step(&mut self, _action: Action) -> Result<Step> {
            Ok(Step {
                obs: Observation::zeros(TINY),
                reward: 0.0,
                done: false,
                info: Info::new(1, 1),
            })
        }

        fn render(&mut self) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }

        fn seed(&mut self, _seed: u64) {}

        fn sample_action(&mut self) -> Action {
            Action::Noop
        }

        fn observation_shape(&self) -> ObsShape {
            TINY
        }

        fn emulator_state(&self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    struct CountCalls(Rc<RefCell<Vec<u64>>>);

    impl Callback for CountCalls {
        fn on_step(&mut self, num_timesteps: u64, _policy: &dyn Policy) -> Result<()> {
            self.0.borrow_mut().push(num_timesteps);
            Ok(())
        }
    }

    #[test]
    fn overrides_replace_only_given_fields() {
        let mut h = hp(PolicyKind::Mlp);
        Overrides {
            learning_rate: Some(LinearSchedule::new(5e-5, 2.5e-6).unwrap()),
            n_steps: Some(512),
            ..Default::default()
        }
        .apply(&mut h);
        assert_eq!(h.learning_rate.initial(), 5e-5);
        assert_eq!(h.n_steps, 512);
        assert_eq!(h.clip_range.initial(), 0.15);
        assert_eq!(h.gamma, 0.94);
    }

    #[test]
    fn cnn_rejects_tiny_frames() {
        assert!(ActorCritic::new(&Device::Cpu, TINY, hp(PolicyKind::Cnn)).is_err());
    }

    #[test]
    fn cnn_predicts_on_downsampled_frames() {
        let shape = ObsShape {
            height: 120,
            width: 128,
            channels: 3,
        };
        let mut model = ActorCritic::new(&Device::Cpu, shape, hp(PolicyKind::Cnn)).unwrap();
        let action = model.predict(&Observation::zeros(shape)).unwrap();
        assert!(action.index() < Action::COUNT);
    }

    #[test]
    fn save_then_load_keeps_predictions_and_applies_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let mut model = ActorCritic::new(&Device::Cpu, TINY, hp(PolicyKind::Mlp)).unwrap();
        let obs = Observation {
            shape: TINY,
            pixels: (0..12).map(|i| i * 20).collect(),
        };
        let before = model.predict_deterministic(&obs).unwrap();
        model.save(&path).unwrap();
        assert!(meta_path(&path).exists());

        let overrides = Overrides {
            n_steps: Some(7),
            ..Default::default()
        };
        let mut loaded = ActorCritic::load(&path, &Device::Cpu, &overrides).unwrap();
        assert_eq!(loaded.predict_deterministic(&obs).unwrap(), before);
        assert_eq!(loaded.hyperparameters().n_steps, 7);
        assert_eq!(loaded.observation_shape(), TINY);
    }

    #[test]
    fn predict_samples_from_the_action_distribution() {
        let mut model = ActorCritic::new(&Device::Cpu, TINY, hp(PolicyKind::Mlp)).unwrap();
        model.seed(7);
        let obs = Observation::zeros(TINY);
        let picked: std::collections::HashSet<Action> =
            (0..200).map(|_| model.predict(&obs).unwrap()).collect();
        assert!(picked.len() > 1, "always picked {picked:?}");

        let greedy = model.predict_deterministic(&obs).unwrap();
        for _ in 0..10 {
            assert_eq!(model.predict_deterministic(&obs).unwrap(), greedy);
        }
    }

    #[test]
    fn load_without_sidecar_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.safetensors");
        assert!(ActorCritic::load(&path, &Device::Cpu, &Overrides::default()).is_err());
    }

    #[test]
    fn learn_calls_back_once_per_vectorized_step() {
        let fns: Vec<EnvFn> = (0..2)
            .map(|_| Box::new(|| Ok(Box::new(Flat) as Box<dyn Environment>)) as EnvFn)
            .collect();
        let mut venv = DummyVecEnv::new(fns).unwrap();
        let mut model = ActorCritic::new(&Device::Cpu, TINY, hp(PolicyKind::Mlp)).unwrap();
        model.seed(0);

        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut callbacks: Vec<Box<dyn Callback>> = vec![Box::new(CountCalls(calls.clone()))];
        model.learn(&mut venv, 10, &mut callbacks).unwrap();
        // Two envs, four steps per rollout: 8 timesteps per rollout, two rollouts.
        assert_eq!(model.num_timesteps(), 16);
        assert_eq!(*calls.borrow(), vec![2, 4, 6, 8, 10, 12, 14, 16]);
    }
}
