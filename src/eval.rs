use anyhow::Result;
use std::io::Write;
use std::path::PathBuf;

use crate::config::EvalConfig;
use crate::env::{Action, Environment, Info};
use crate::policy::Policy;
use crate::snapshot::save_game_state;

/// Victories needed before the final rounds for the run to count as an advance.
const ADVANCE_VICTORIES: u32 = 2;
const ADVANCE_EPISODES: [u32; 2] = [3, 4];

/// Whether episode `episode` (1-indexed) should capture a save-point for the
/// next stage.
pub fn milestone_qualifies(episode: u32, prior_victories: u32, save_state: bool) -> bool {
    save_state && ADVANCE_EPISODES.contains(&episode) && prior_victories == ADVANCE_VICTORIES
}

/// Save-point capture for one episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    Disarmed,
    Armed,
    Captured,
}

impl Milestone {
    pub fn for_episode(episode: u32, prior_victories: u32, save_state: bool) -> Self {
        if milestone_qualifies(episode, prior_victories, save_state) {
            Milestone::Armed
        } else {
            Milestone::Disarmed
        }
    }

    /// Fed once per step that produced a non-zero reward. Returns true when
    /// the snapshot should be taken now.
    pub fn on_reward(&mut self) -> bool {
        if *self == Milestone::Armed {
            *self = Milestone::Captured;
            true
        } else {
            false
        }
    }
}

pub enum ActionSource<'a> {
    Model(&'a mut dyn Policy),
    Random,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalStats {
    pub episodes: u32,
    pub victories: u32,
    pub reward_sum: f64,
    /// Where the save-point was written, if the milestone fired.
    pub snapshot: Option<PathBuf>,
}

impl EvalStats {
    pub fn win_rate(&self) -> f64 {
        if self.episodes == 0 {
            return 0.0;
        }
        self.victories as f64 / self.episodes as f64
    }

    pub fn average_reward(&self) -> f64 {
        if self.episodes == 0 {
            return 0.0;
        }
        self.reward_sum / self.episodes as f64
    }
}

/// Plays `config.num_episodes` episodes and writes the match report to `out`.
///
/// Without round resets the environment is only reset once up front; between
/// episodes `Noop` is stepped until both health readings are back to normal.
/// The environment is closed before the summary lines are written.
pub fn run_evaluation<E: Environment + ?Sized>(
    config: &EvalConfig,
    env: &mut E,
    mut actions: ActionSource<'_>,
    out: &mut dyn Write,
) -> Result<EvalStats> {
    config.validate()?;
    let n = config.num_episodes;
    let mut stats = EvalStats::default();
    let mut obs = env.reset()?;
    let mut info = Info::default();

    writeln!(out, "\nFighting Begins!\n")?;

    for episode in 1..=n {
        let mut milestone = Milestone::for_episode(episode, stats.victories, config.save_state);
        writeln!(out, "Episode {episode}/{n}")?;

        if config.reset_round {
            obs = env.reset()?;
        }

        // Stays `None` until a non-zero reward lands, so an empty episode reports `0`.
        let mut total_reward: Option<f64> = None;
        let mut done = false;
        while !done {
            let action = match &mut actions {
                ActionSource::Model(policy) => policy.predict(&obs)?,
                ActionSource::Random => env.sample_action(),
            };
            let step = env.step(action)?;
            obs = step.obs;
            info = step.info;
            done = step.done;

            if step.reward != 0.0 {
                *total_reward.get_or_insert(0.0) += step.reward;
                writeln!(
                    out,
                    "Reward: {:.3}, playerHP: {}, enemyHP:{}",
                    step.reward, info.agent_hp, info.enemy_hp
                )?;
                if milestone.on_reward() {
                    writeln!(out, "advanced to next level\nsaving game state and exit")?;
                    save_game_state(&*env, &config.snapshot_path)?;
                    let path = config.snapshot_path.display();
                    tracing::info!(path = %path, episode, "saved next-round state");
                    stats.snapshot = Some(config.snapshot_path.clone());
                    break;
                }
            }

            if info.either_down() {
                done = true;
            }
        }

        if info.enemy_down() {
            writeln!(out, "Victory!")?;
            stats.victories += 1;
        } else {
            writeln!(out, "Defeat!")?;
        }
        match total_reward {
            Some(total) => writeln!(out, "Total reward: {total:?}\n")?,
            None => writeln!(out, "Total reward: 0\n")?,
        }
        stats.reward_sum += total_reward.unwrap_or_default();
        stats.episodes += 1;

        if !config.reset_round {
            while info.either_down() {
                let step = env.step(Action::Noop)?;
                obs = step.obs;
                info = step.info;
                if config.rendering {
                    env.render()?;
                }
            }
        }
    }

    env.close()?;
    writeln!(out, "Winning rate: {:?}", stats.win_rate())?;
    if config.random_action {
        writeln!(out, "Average reward for random action: {:?}", stats.average_reward())?;
    } else {
        writeln!(
            out,
            "Average reward for {}: {:?}",
            config.model_name,
            stats.average_reward()
        )?;
    }
    Ok(stats)
}
