use anyhow::Result;
use std::collections::VecDeque;
use std::time::Duration;

use crate::env::{Action, Environment, Info, ObsShape, Observation, Step};

// =============================================================================
// Reward Tuning Knobs
// =============================================================================

pub struct RewardConfig {
    pub full_hp: i32,
    pub reward_coeff: f64,
    pub reward_scale: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            full_hp: 176,
            reward_coeff: 3.0,
            reward_scale: 0.001,
        }
    }
}

impl RewardConfig {
    /// Reward for one agent step given the previous and current health
    /// readings. Returns the unscaled reward and whether the round ended.
    pub fn shape(&self, prev: (i32, i32), cur: &Info) -> (f64, bool) {
        let full = self.full_hp as f64;
        let (prev_agent, prev_enemy) = prev;
        if cur.agent_hp < 0 {
            let exp = (cur.enemy_hp + 1) as f64 / (full + 1.0);
            (-full.powf(exp), true)
        } else if cur.enemy_hp < 0 {
            let exp = (cur.agent_hp + 1) as f64 / (full + 1.0);
            (full.powf(exp) * self.reward_coeff, true)
        } else {
            let dealt = (prev_enemy - cur.enemy_hp) as f64;
            let taken = (prev_agent - cur.agent_hp) as f64;
            (self.reward_coeff * dealt - taken, false)
        }
    }
}

// =============================================================================
// Environment Constants
// =============================================================================

pub struct WrapperConfig {
    pub reset_round: bool,
    pub rendering: bool,
    pub num_frames: usize,
    pub num_step_frames: usize,
    pub downsample: usize,
    pub render_delay: Duration,
    pub reward: RewardConfig,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            reset_round: true,
            rendering: false,
            num_frames: 9,
            num_step_frames: 6,
            downsample: 2,
            render_delay: Duration::from_millis(10),
            reward: RewardConfig::default(),
        }
    }
}

// =============================================================================
// Fighter Wrapper
// =============================================================================

/// Repeats each action for several emulator frames, stacks downsampled frames
/// into a three-channel observation and replaces the game's reward with one
/// shaped on both fighters' health.
pub struct FighterWrapper<E> {
    env: E,
    config: WrapperConfig,
    frame_stack: VecDeque<Observation>,
    prev_agent_hp: i32,
    prev_enemy_hp: i32,
}

impl<E: Environment> FighterWrapper<E> {
    pub fn new(env: E, config: WrapperConfig) -> Self {
        let full_hp = config.reward.full_hp;
        Self {
            env,
            frame_stack: VecDeque::with_capacity(config.num_frames),
            config,
            prev_agent_hp: full_hp,
            prev_enemy_hp: full_hp,
        }
    }

    fn push_frame(&mut self, obs: &Observation) {
        if self.frame_stack.len() == self.config.num_frames {
            self.frame_stack.pop_front();
        }
        self.frame_stack.push_back(obs.downsample(self.config.downsample));
    }

    /// Channel `i` of the output comes from channel `i` of stacked frame
    /// `3 * i + 2`.
    fn stacked_observation(&self) -> Observation {
        let shape = self.observation_shape();
        let mut pixels = vec![0u8; shape.len()];
        for c in 0..shape.channels {
            let frame = &self.frame_stack[c * 3 + 2];
            let src_channels = frame.shape.channels;
            for (px, dst) in pixels.chunks_exact_mut(shape.channels).enumerate() {
                dst[c] = frame.pixels[px * src_channels + c];
            }
        }
        Observation { shape, pixels }
    }

    fn inner_frame(&mut self, action: Action) -> Result<Info> {
        let step = self.env.step(action)?;
        self.push_frame(&step.obs);
        if self.config.rendering {
            self.env.render()?;
            std::thread::sleep(self.config.render_delay);
        }
        Ok(step.info)
    }
}

impl<E: Environment> Environment for FighterWrapper<E> {
    fn reset(&mut self) -> Result<Observation> {
        let obs = self.env.reset()?;
        self.prev_agent_hp = self.config.reward.full_hp;
        self.prev_enemy_hp = self.config.reward.full_hp;
        self.frame_stack.clear();
        for _ in 0..self.config.num_frames {
            self.push_frame(&obs);
        }
        Ok(self.stacked_observation())
    }

    fn step(&mut self, action: Action) -> Result<Step> {
        let mut info = self.inner_frame(action)?;
        for _ in 1..self.config.num_step_frames {
            info = self.inner_frame(action)?;
        }

        let (reward, round_over) = self
            .config
            .reward
            .shape((self.prev_agent_hp, self.prev_enemy_hp), &info);
        if !round_over {
            self.prev_agent_hp = info.agent_hp;
            self.prev_enemy_hp = info.enemy_hp;
        }

        Ok(Step {
            obs: self.stacked_observation(),
            reward: reward * self.config.reward.reward_scale,
            done: round_over && self.config.reset_round,
            info,
        })
    }

    fn render(&mut self) -> Result<()> {
        self.env.render()
    }

    fn close(&mut self) -> Result<()> {
        self.env.close()
    }

    fn seed(&mut self, seed: u64) {
        self.env.seed(seed)
    }

    fn sample_action(&mut self) -> Action {
        self.env.sample_action()
    }

    fn observation_shape(&self) -> ObsShape {
        let inner = self.env.observation_shape();
        let factor = self.config.downsample;
        ObsShape {
            height: inner.height.div_ceil(factor),
            width: inner.width.div_ceil(factor),
            channels: 3,
        }
    }

    fn emulator_state(&self) -> Result<Vec<u8>> {
        self.env.emulator_state()
    }
}
