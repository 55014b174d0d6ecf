use anyhow::{Result, ensure};

use crate::env::{Action, Environment, GameSpec, NesEnv, ObsShape, Observation, Step};
use crate::monitor::Monitor;
use crate::wrapper::{FighterWrapper, WrapperConfig};

/// Zero-argument constructor for one environment instance.
pub type EnvFn = Box<dyn FnOnce() -> Result<Box<dyn Environment>>>;

/// Builds the constructor for one wrapped emulator instance. Each call of the
/// returned closure owns its own emulator, so vector slots share nothing.
pub fn make_env(
    spec: GameSpec,
    wrapper: WrapperConfig,
    seed: Option<u64>,
    monitor: bool,
) -> EnvFn {
    Box::new(move || {
        let env = NesEnv::new(&spec, wrapper.rendering)?;
        let env = FighterWrapper::new(env, wrapper);
        let mut env: Box<dyn Environment> = if monitor {
            Box::new(Monitor::new(env))
        } else {
            Box::new(env)
        };
        if let Some(seed) = seed {
            env.seed(seed);
        }
        Ok(env)
    })
}

/// Batched view over several environment instances.
pub trait VecEnv {
    fn num_envs(&self) -> usize;
    fn observation_shape(&self) -> ObsShape;
    fn reset(&mut self) -> Result<Vec<Observation>>;
    /// Steps every instance with its action. Finished instances are reset and
    /// the returned observation is the first one of the new episode.
    fn step(&mut self, actions: &[Action]) -> Result<Vec<Step>>;
    fn close(&mut self) -> Result<()>;
}

/// Steps its instances one after another on the calling thread.
pub struct DummyVecEnv {
    envs: Vec<Box<dyn Environment>>,
    closed: bool,
}

impl DummyVecEnv {
    pub fn new(env_fns: Vec<EnvFn>) -> Result<Self> {
        ensure!(!env_fns.is_empty(), "vectorized env needs at least one instance");
        let envs = env_fns
            .into_iter()
            .map(|make| make())
            .collect::<Result<Vec<_>>>()?;
        let shape = envs[0].observation_shape();
        ensure!(
            envs.iter().all(|e| e.observation_shape() == shape),
            "all instances must share one observation shape"
        );
        Ok(Self {
            envs,
            closed: false,
        })
    }
}

impl VecEnv for DummyVecEnv {
    fn num_envs(&self) -> usize {
        self.envs.len()
    }

    fn observation_shape(&self) -> ObsShape {
        self.envs[0].observation_shape()
    }

    fn reset(&mut self) -> Result<Vec<Observation>> {
        self.envs.iter_mut().map(|env| env.reset()).collect()
    }

    fn step(&mut self, actions: &[Action]) -> Result<Vec<Step>> {
        ensure!(
            actions.len() == self.envs.len(),
            "expected {} actions, got {}",
            self.envs.len(),
            actions.len()
        );
        let mut steps = Vec::with_capacity(self.envs.len());
        for (env, &action) in self.envs.iter_mut().zip(actions) {
            let mut step = env.step(action)?;
            if step.done {
                step.obs = env.reset()?;
            }
            steps.push(step);
        }
        Ok(steps)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        for env in &mut self.envs {
            env.close()?;
        }
        Ok(())
    }
}
