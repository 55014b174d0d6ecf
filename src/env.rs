use anyhow::{Context, Result};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tetanes_core::mem::Read;
use tetanes_core::prelude::*;

use crate::monitor::EpisodeSummary;
use crate::snapshot::load_game_state;

pub const FRAME_WIDTH: usize = 256;
pub const FRAME_HEIGHT: usize = 240;

// =============================================================================
// RAM Addresses
// =============================================================================

pub mod ram {
    pub const AGENT_HP: u16 = 0x0530;
    pub const ENEMY_HP: u16 = 0x0531;

    /// Health byte written by the game once a fighter is knocked out.
    pub const KO_SENTINEL: u8 = 0xFF;
}

/// Converts a raw health byte into the signed reading used everywhere else:
/// a knocked-out fighter reads as -1.
pub fn hp_from_raw(raw: u8) -> i32 {
    if raw == ram::KO_SENTINEL {
        -1
    } else {
        raw as i32
    }
}

// =============================================================================
// Action Space
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Action {
    Noop = 0,
    Right = 1,
    Left = 2,
    Crouch = 3,
    Jump = 4,
    Punch = 5,
    Kick = 6,
    CrouchPunch = 7,
    CrouchKick = 8,
    JumpPunch = 9,
    JumpKick = 10,
    JumpRight = 11,
    JumpLeft = 12,
}

impl Action {
    pub const COUNT: usize = 13;

    pub const ALL: [Action; Self::COUNT] = [
        Action::Noop,
        Action::Right,
        Action::Left,
        Action::Crouch,
        Action::Jump,
        Action::Punch,
        Action::Kick,
        Action::CrouchPunch,
        Action::CrouchKick,
        Action::JumpPunch,
        Action::JumpKick,
        Action::JumpRight,
        Action::JumpLeft,
    ];

    pub fn from_index(i: usize) -> Self {
        assert!(i < Self::COUNT);
        Self::ALL[i]
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn to_joypad(self) -> tetanes_core::input::JoypadBtnState {
        use tetanes_core::input::{JoypadBtn, JoypadBtnState};
        let mut state = JoypadBtnState::empty();
        let buttons: &[JoypadBtn] = match self {
            Action::Noop => &[],
            Action::Right => &[JoypadBtn::Right],
            Action::Left => &[JoypadBtn::Left],
            Action::Crouch => &[JoypadBtn::Down],
            Action::Jump => &[JoypadBtn::Up],
            Action::Punch => &[JoypadBtn::B],
            Action::Kick => &[JoypadBtn::A],
            Action::CrouchPunch => &[JoypadBtn::Down, JoypadBtn::B],
            Action::CrouchKick => &[JoypadBtn::Down, JoypadBtn::A],
            Action::JumpPunch => &[JoypadBtn::Up, JoypadBtn::B],
            Action::JumpKick => &[JoypadBtn::Up, JoypadBtn::A],
            Action::JumpRight => &[JoypadBtn::Up, JoypadBtn::Right],
            Action::JumpLeft => &[JoypadBtn::Up, JoypadBtn::Left],
        };
        for &btn in buttons {
            state.set(btn.into(), true);
        }
        state
    }
}

// =============================================================================
// Observations and Step Results
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObsShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ObsShape {
    pub fn len(&self) -> usize {
        self.height * self.width * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Row-major `height x width x channels` image.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub shape: ObsShape,
    pub pixels: Vec<u8>,
}

impl Observation {
    pub fn zeros(shape: ObsShape) -> Self {
        Self {
            shape,
            pixels: vec![0; shape.len()],
        }
    }

    #[cfg(test)]
    pub fn get(&self, y: usize, x: usize, c: usize) -> u8 {
        let s = self.shape;
        self.pixels[(y * s.width + x) * s.channels + c]
    }

    /// Keeps every `factor`-th row and column.
    pub fn downsample(&self, factor: usize) -> Observation {
        let s = self.shape;
        let shape = ObsShape {
            height: s.height.div_ceil(factor),
            width: s.width.div_ceil(factor),
            channels: s.channels,
        };
        let mut pixels = Vec::with_capacity(shape.len());
        for y in (0..s.height).step_by(factor) {
            for x in (0..s.width).step_by(factor) {
                let start = (y * s.width + x) * s.channels;
                pixels.extend_from_slice(&self.pixels[start..start + s.channels]);
            }
        }
        Observation { shape, pixels }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Info {
    pub agent_hp: i32,
    pub enemy_hp: i32,
    /// Set by the monitor on the step that finishes an episode.
    pub episode: Option<EpisodeSummary>,
}

impl Info {
    pub fn new(agent_hp: i32, enemy_hp: i32) -> Self {
        Self {
            agent_hp,
            enemy_hp,
            episode: None,
        }
    }

    pub fn either_down(&self) -> bool {
        self.agent_hp < 0 || self.enemy_hp < 0
    }

    pub fn enemy_down(&self) -> bool {
        self.enemy_hp < 0
    }
}

#[derive(Debug, Clone)]
pub struct Step {
    pub obs: Observation,
    pub reward: f64,
    pub done: bool,
    pub info: Info,
}

// =============================================================================
// Environment Boundary
// =============================================================================

pub trait Environment {
    fn reset(&mut self) -> Result<Observation>;
    fn step(&mut self, action: Action) -> Result<Step>;
    fn render(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn seed(&mut self, seed: u64);
    fn sample_action(&mut self) -> Action;
    fn observation_shape(&self) -> ObsShape;
    /// Serialized console state, as written to game state snapshots.
    fn emulator_state(&self) -> Result<Vec<u8>>;
}

impl<E: Environment + ?Sized> Environment for Box<E> {
    fn reset(&mut self) -> Result<Observation> {
        (**self).reset()
    }

    fn step(&mut self, action: Action) -> Result<Step> {
        (**self).step(action)
    }

    fn render(&mut self) -> Result<()> {
        (**self).render()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn seed(&mut self, seed: u64) {
        (**self).seed(seed)
    }

    fn sample_action(&mut self) -> Action {
        (**self).sample_action()
    }

    fn observation_shape(&self) -> ObsShape {
        (**self).observation_shape()
    }

    fn emulator_state(&self) -> Result<Vec<u8>> {
        (**self).emulator_state()
    }
}

// =============================================================================
// Game Selection
// =============================================================================

/// Which ROM to boot and which saved state to start every episode from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSpec {
    pub game: String,
    pub state: String,
    pub rom_dir: PathBuf,
    pub states_dir: PathBuf,
}

impl GameSpec {
    pub fn rom_path(&self) -> PathBuf {
        self.rom_dir.join(format!("{}.nes", self.game))
    }

    pub fn state_path(&self) -> PathBuf {
        self.states_dir.join(format!("{}.state", self.state))
    }
}

// =============================================================================
// NES Environment
// =============================================================================

/// Serializes the whole console: CPU registers, PPU, APU, mapper and RAM.
pub fn capture_state(deck: &ControlDeck) -> Result<Vec<u8>> {
    bincode::serialize(deck.cpu()).context("Failed to serialize emulator state")
}

/// Replaces the running console with a state from [`capture_state`].
/// Controller input held at capture time is discarded.
pub fn restore_state(deck: &mut ControlDeck, bytes: &[u8]) -> Result<()> {
    let mut cpu: Cpu = bincode::deserialize(bytes).context("Failed to decode emulator state")?;
    cpu.bus.input.clear();
    deck.load_cpu(cpu);
    Ok(())
}

pub struct NesEnv {
    deck: ControlDeck,
    start_state: Vec<u8>,
    window: Option<minifb::Window>,
    window_buf: Vec<u32>,
    noop_range: std::ops::Range<u32>,
    rng: SmallRng,
}

impl NesEnv {
    pub fn new(spec: &GameSpec, rendering: bool) -> Result<Self> {
        let mut deck = ControlDeck::new();
        deck.set_headless_mode(tetanes_core::control_deck::HeadlessMode::NO_AUDIO);
        let rom_path = spec.rom_path();
        deck.load_rom_path(&rom_path)
            .with_context(|| format!("Failed to load ROM: {}", rom_path.display()))?;

        let state_path = spec.state_path();
        let start_state = load_game_state(&state_path)
            .with_context(|| format!("Failed to load game state: {}", state_path.display()))?;

        let window = if rendering {
            Some(minifb::Window::new(
                &format!("{} - {}", spec.game, spec.state),
                FRAME_WIDTH,
                FRAME_HEIGHT,
                minifb::WindowOptions {
                    resize: true,
                    scale: minifb::Scale::X2,
                    ..Default::default()
                },
            )?)
        } else {
            None
        };

        Ok(Self {
            deck,
            start_state,
            window,
            window_buf: vec![0u32; FRAME_WIDTH * FRAME_HEIGHT],
            noop_range: 0..30,
            rng: SmallRng::from_os_rng(),
        })
    }

    pub fn clock_frame(&mut self) -> Result<()> {
        self.deck.clock_frame()?;
        Ok(())
    }

    pub fn peek(&self, addr: u16) -> u8 {
        self.deck.bus().peek(addr)
    }

    pub fn read_info(&self) -> Info {
        Info::new(
            hp_from_raw(self.peek(ram::AGENT_HP)),
            hp_from_raw(self.peek(ram::ENEMY_HP)),
        )
    }

    pub fn window(&self) -> Option<&minifb::Window> {
        self.window.as_ref()
    }

    pub fn set_input_state(&mut self, btn_state: tetanes_core::input::JoypadBtnState) {
        use tetanes_core::input::JoypadBtnState;
        let joypad = self.deck.joypad_mut(Player::One);
        for button in [
            JoypadBtnState::LEFT,
            JoypadBtnState::RIGHT,
            JoypadBtnState::UP,
            JoypadBtnState::DOWN,
            JoypadBtnState::A,
            JoypadBtnState::B,
            JoypadBtnState::TURBO_A,
            JoypadBtnState::TURBO_B,
            JoypadBtnState::START,
            JoypadBtnState::SELECT,
        ] {
            joypad.set_button(button, btn_state.contains(button));
        }
    }

    fn observe(&mut self) -> Observation {
        let shape = self.observation_shape();
        let fb = self.deck.frame_buffer();
        let mut pixels = Vec::with_capacity(shape.len());
        for px in fb.chunks_exact(4) {
            pixels.extend_from_slice(&px[..3]);
        }
        Observation { shape, pixels }
    }
}

fn blit_rgba_to_u32(fb: &[u8], out: &mut [u32]) {
    for (dst, src) in out.iter_mut().zip(fb.chunks_exact(4)) {
        *dst = ((src[0] as u32) << 16) | ((src[1] as u32) << 8) | (src[2] as u32);
    }
}

impl Environment for NesEnv {
    fn reset(&mut self) -> Result<Observation> {
        restore_state(&mut self.deck, &self.start_state)?;

        self.set_input_state(tetanes_core::input::JoypadBtnState::empty());
        let noops = self.rng.random_range(self.noop_range.clone());
        for _ in 0..noops {
            self.clock_frame()?;
        }
        Ok(self.observe())
    }

    fn step(&mut self, action: Action) -> Result<Step> {
        self.set_input_state(action.to_joypad());
        self.clock_frame()?;
        let info = self.read_info();

        // Rewards are shaped from health by the wrapper.
        Ok(Step {
            obs: self.observe(),
            reward: 0.0,
            done: info.either_down(),
            info,
        })
    }

    fn render(&mut self) -> Result<()> {
        let Some(window) = self.window.as_mut() else {
            return Ok(());
        };
        blit_rgba_to_u32(self.deck.frame_buffer(), &mut self.window_buf);
        window.update_with_buffer(&self.window_buf, FRAME_WIDTH, FRAME_HEIGHT)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.window = None;
        Ok(())
    }

    fn seed(&mut self, seed: u64) {
        self.rng = SmallRng::seed_from_u64(seed);
    }

    fn sample_action(&mut self) -> Action {
        Action::from_index(self.rng.random_range(0..Action::COUNT))
    }

    fn observation_shape(&self) -> ObsShape {
        ObsShape {
            height: FRAME_HEIGHT,
            width: FRAME_WIDTH,
            channels: 3,
        }
    }

    fn emulator_state(&self) -> Result<Vec<u8>> {
        capture_state(&self.deck)
    }
}
