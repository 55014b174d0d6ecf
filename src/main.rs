// =============================================================================
// Fighting game NES: rollout/checkpoint orchestration and evaluation in Rust
// =============================================================================
// Build & Run:
//   cargo build --release
//   cargo run --release -- train --rom-dir roms --states-dir states --state Champion.Level3.Chunli
//   cargo run --release -- play  --model-name Level3_Chunli_7000000_steps
//   cargo run --release -- manual --capture Champion.Level4.Custom

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tetanes_core::input::JoypadBtnState;

use fighter_rl::config::{EvalConfig, TrainConfig, TrainMode};
use fighter_rl::env::{Environment, GameSpec, NesEnv};
use fighter_rl::eval::{ActionSource, run_evaluation};
use fighter_rl::policy::{CandleBackend, Overrides, PolicyBackend, PolicyKind};
use fighter_rl::snapshot::{NEXT_ROUND_STATE, save_game_state};
use fighter_rl::train::run_training;
use fighter_rl::vec_env::make_env;
use fighter_rl::wrapper::WrapperConfig;

// =============================================================================
// Training
// =============================================================================

fn train(args: &TrainArgs) -> Result<()> {
    eprintln!("═══════════════════════════════════════════════════════════");
    eprintln!("  TRAINING — {} ({})", args.game.game, args.game.state);
    eprintln!("═══════════════════════════════════════════════════════════");

    let backend = CandleBackend::new(args.cpu);
    eprintln!("Device: {:?}", backend.device);

    let spec = args.game.game_spec();
    let mut config = TrainConfig::new(spec.clone());
    config.num_envs = args.num_envs;
    config.policy = args.policy;
    config.save_dir = args.save_dir.clone();
    config.checkpoint_interval = args.checkpoint_interval;
    config.total_timesteps = args.timesteps;
    if let Some(path) = &args.fine_tune {
        config.mode = TrainMode::FineTune(path.clone());
    }

    let outcome = run_training(&config, &backend, |seed| {
        make_env(spec.clone(), WrapperConfig::default(), Some(seed), true)
    })?;
    eprintln!("Training log: {}", outcome.log_path.display());
    Ok(())
}

// =============================================================================
// Evaluation
// =============================================================================

fn play(args: &PlayArgs) -> Result<()> {
    eprintln!("═══════════════════════════════════════════════════════════");
    eprintln!("  PLAYING — {} ({})", args.game.game, args.game.state);
    eprintln!("═══════════════════════════════════════════════════════════");

    let mut config = EvalConfig::new(args.game.game_spec());
    config.reset_round = args.reset_round;
    config.rendering = !args.no_render;
    config.model_name = args.model_name.clone();
    config.model_dir = args.model_dir.clone();
    config.random_action = args.random_action;
    config.num_episodes = args.episodes;
    config.save_state = !args.no_save_state;
    config.snapshot_path = args.snapshot.clone();
    config.validate()?;

    let wrapper = WrapperConfig {
        reset_round: config.reset_round,
        rendering: config.rendering,
        ..Default::default()
    };
    let mut env = make_env(config.game.clone(), wrapper, None, false)()?;

    let mut model = if config.random_action {
        None
    } else {
        let backend = CandleBackend::new(args.cpu);
        Some(backend.load(&config.model_path(), &Overrides::default())?)
    };
    let source = match model.as_mut() {
        Some(model) => ActionSource::Model(model),
        None => ActionSource::Random,
    };

    let stdout = std::io::stdout();
    let stats = run_evaluation(&config, &mut env, source, &mut stdout.lock())?;
    if let Some(path) = stats.snapshot {
        eprintln!("💾 Next-round state written to {}", path.display());
    }
    Ok(())
}

// =============================================================================
// Manual Play (Keyboard)
// =============================================================================

fn keyboard_buttons(window: &minifb::Window) -> JoypadBtnState {
    use minifb::Key;
    let mut btn_state = JoypadBtnState::empty();
    for (key, button) in [
        (Key::Left, JoypadBtnState::LEFT),
        (Key::Right, JoypadBtnState::RIGHT),
        (Key::Up, JoypadBtnState::UP),
        (Key::Down, JoypadBtnState::DOWN),
        (Key::Z, JoypadBtnState::B),
        (Key::X, JoypadBtnState::A),
        (Key::A, JoypadBtnState::SELECT),
        (Key::S, JoypadBtnState::START),
    ] {
        if window.is_key_down(key) {
            btn_state.set(button, true);
        }
    }
    btn_state
}

fn manual(args: &ManualArgs) -> Result<()> {
    eprintln!("═══════════════════════════════════════════════════════════");
    eprintln!("  MANUAL — {} (Keyboard)", args.game.game);
    eprintln!("═══════════════════════════════════════════════════════════");
    eprintln!("Arrows: Move | Z: B (Punch) | X: A (Kick) | A: Select | S: Start");
    eprintln!("F5: Save state | Esc: Quit");

    let spec = args.game.game_spec();
    let capture_path = spec.states_dir.join(format!("{}.state", args.capture));
    let mut env = NesEnv::new(&spec, true)?;
    env.reset()?;

    loop {
        let Some(window) = env.window() else {
            break;
        };
        if !window.is_open() || window.is_key_pressed(minifb::Key::Escape, minifb::KeyRepeat::No) {
            break;
        }
        let capture = window.is_key_pressed(minifb::Key::F5, minifb::KeyRepeat::No);
        let btn_state = keyboard_buttons(window);

        if capture {
            save_game_state(&env, &capture_path)?;
            eprintln!("💾 State saved to {}", capture_path.display());
        }
        env.set_input_state(btn_state);
        env.clock_frame()?;
        env.render()?;
    }

    env.close()
}

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "fighter-rl", about = "Fighting game NES — RL training and evaluation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a policy on N parallel instances
    Train(TrainArgs),
    /// Watch a trained (or random) agent play
    Play(PlayArgs),
    /// Play manually with keyboard and capture start states
    Manual(ManualArgs),
}

#[derive(Args, Clone)]
struct GameArgs {
    #[arg(long, default_value = "roms")]
    rom_dir: PathBuf,
    #[arg(long, default_value = "states")]
    states_dir: PathBuf,
    #[arg(long, default_value = "StreetFighter")]
    game: String,
    #[arg(long, default_value = "Champion.Level3.Chunli")]
    state: String,
}

impl GameArgs {
    fn game_spec(&self) -> GameSpec {
        GameSpec {
            game: self.game.clone(),
            state: self.state.clone(),
            rom_dir: self.rom_dir.clone(),
            states_dir: self.states_dir.clone(),
        }
    }
}

#[derive(Parser)]
struct TrainArgs {
    #[command(flatten)]
    game: GameArgs,
    #[arg(long, default_value = "16")]
    num_envs: usize,
    /// Continue training this model instead of starting a new one
    #[arg(long)]
    fine_tune: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = PolicyKind::Cnn)]
    policy: PolicyKind,
    #[arg(long, default_value = "trained_models")]
    save_dir: PathBuf,
    #[arg(long, default_value = "31250")]
    checkpoint_interval: u64,
    #[arg(long, default_value = "7000000")]
    timesteps: u64,
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

#[derive(Parser)]
struct PlayArgs {
    #[command(flatten)]
    game: GameArgs,
    #[arg(long, default_value = "Level2_RyuVsKen_6500000_steps")]
    model_name: String,
    #[arg(long, default_value = "trained_models")]
    model_dir: PathBuf,
    #[arg(long, default_value = "4")]
    episodes: u32,
    #[arg(long, default_value_t = false)]
    random_action: bool,
    #[arg(long, default_value_t = false)]
    no_render: bool,
    #[arg(long, default_value_t = false)]
    reset_round: bool,
    #[arg(long, default_value_t = false)]
    no_save_state: bool,
    #[arg(long, default_value = NEXT_ROUND_STATE)]
    snapshot: PathBuf,
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

#[derive(Parser)]
struct ManualArgs {
    #[command(flatten)]
    game: GameArgs,
    /// Name of the state file F5 writes into the states directory
    #[arg(long, default_value = "next_game_round")]
    capture: String,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Train(args) => train(args),
        Commands::Play(args) => play(args),
        Commands::Manual(args) => manual(args),
    }
}
