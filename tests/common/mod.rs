#![allow(dead_code)]

use anyhow::Result;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use fighter_rl::{Action, Environment, Info, ObsShape, Observation, Step};

pub const SHAPE: ObsShape = ObsShape {
    height: 2,
    width: 2,
    channels: 3,
};

/// Replays `(reward, agent_hp, enemy_hp)` triples, one per step. Once the
/// script runs out both fighters stay at full health with zero reward.
pub struct ScriptedEnv {
    script: VecDeque<(f64, i32, i32)>,
    pub actions: Vec<Action>,
    pub resets: u32,
    pub closed: bool,
    pub ram: Vec<u8>,
}

impl ScriptedEnv {
    pub fn new(script: &[(f64, i32, i32)]) -> Self {
        Self {
            script: script.iter().copied().collect(),
            actions: Vec::new(),
            resets: 0,
            closed: false,
            ram: (0..64).collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }

    pub fn noops(&self) -> usize {
        self.actions.iter().filter(|&&a| a == Action::Noop).count()
    }
}

impl Environment for ScriptedEnv {
    fn reset(&mut self) -> Result<Observation> {
        self.resets += 1;
        Ok(Observation::zeros(SHAPE))
    }

    fn step(&mut self, action: Action) -> Result<Step> {
        self.actions.push(action);
        let (reward, agent, enemy) = self.script.pop_front().unwrap_or((0.0, 176, 176));
        let info = Info::new(agent, enemy);
        Ok(Step {
            obs: Observation::zeros(SHAPE),
            reward,
            done: info.either_down(),
            info,
        })
    }

    fn render(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    fn seed(&mut self, _seed: u64) {}

    fn sample_action(&mut self) -> Action {
        Action::Punch
    }

    fn observation_shape(&self) -> ObsShape {
        SHAPE
    }

    fn emulator_state(&self) -> Result<Vec<u8>> {
        Ok(self.ram.clone())
    }
}

/// Endless flat environment that records its seed and whether it was closed.
pub struct FlatEnv {
    pub seeds: Rc<RefCell<Vec<u64>>>,
    pub closes: Rc<Cell<u32>>,
}

impl Environment for FlatEnv {
    fn reset(&mut self) -> Result<Observation> {
        Ok(Observation::zeros(SHAPE))
    }

    fn step(&mut self, _action: Action) -> Result<Step> {
        Ok(Step {
            obs: Observation::zeros(SHAPE),
            reward: 0.0,
            done: false,
            info: Info::new(176, 176),
        })
    }

    fn render(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closes.set(self.closes.get() + 1);
        Ok(())
    }

    fn seed(&mut self, seed: u64) {
        self.seeds.borrow_mut().push(seed);
    }

    fn sample_action(&mut self) -> Action {
        Action::Noop
    }

    fn observation_shape(&self) -> ObsShape {
        SHAPE
    }

    fn emulator_state(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}
