use anyhow::Result;
use std::time::Instant;

use crate::env::{Action, Environment, ObsShape, Observation, Step};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpisodeSummary {
    pub reward: f64,
    pub length: u64,
    pub elapsed_secs: f64,
}

/// Tracks per-episode reward and length and reports them on the step that
/// ends the episode.
pub struct Monitor<E> {
    env: E,
    episode_reward: f64,
    episode_len: u64,
    episodes: u64,
    t_start: Instant,
}

impl<E: Environment> Monitor<E> {
    pub fn new(env: E) -> Self {
        Self {
            env,
            episode_reward: 0.0,
            episode_len: 0,
            episodes: 0,
            t_start: Instant::now(),
        }
    }

    #[cfg(test)]
    pub fn episodes(&self) -> u64 {
        self.episodes
    }
}

impl<E: Environment> Environment for Monitor<E> {
    fn reset(&mut self) -> Result<Observation> {
        self.episode_reward = 0.0;
        self.episode_len = 0;
        self.env.reset()
    }

    fn step(&mut self, action: Action) -> Result<Step> {
        let mut step = self.env.step(action)?;
        self.episode_reward += step.reward;
        self.episode_len += 1;
        if step.done {
            self.episodes += 1;
            let summary = EpisodeSummary {
                reward: self.episode_reward,
                length: self.episode_len,
                elapsed_secs: self.t_start.elapsed().as_secs_f64(),
            };
            tracing::debug!(
                episode = self.episodes,
                reward = summary.reward,
                length = summary.length,
                "episode finished"
            );
            step.info.episode = Some(summary);
            self.episode_reward = 0.0;
            self.episode_len = 0;
        }
        Ok(step)
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
        self.env.observation_shape()
    }

    fn emulator_state(&self) -> Result<Vec<u8>> {
        self.env.emulator_state()
    }
}
