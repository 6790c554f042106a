use anyhow::{Context, Result, bail};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::HISTORY_LEN;
use crate::frame::{FrameRingBuffer, Preprocessor};
use crate::simulator::{ActionId, NOOP, Simulator, SimulatorFactory};
use crate::state::StateWindow;

// =============================================================================
// Environment Constants
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub frame_skip: u32,
    /// Upper bound (inclusive) of random no-op ticks at episode start.
    pub max_start_nullops: u32,
    /// Seed handed to the simulator on construction.
    pub seed: u64,
    /// Seed of the environment's own RNG (start no-ops).
    pub rng_seed: u64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            frame_skip: 4,
            max_start_nullops: 30,
            seed: 123,
            rng_seed: 123_456,
        }
    }
}

impl EnvConfig {
    pub fn validate(&self) -> Result<()> {
        if self.frame_skip == 0 {
            bail!("frame_skip must be at least 1");
        }
        Ok(())
    }
}

// =============================================================================
// Episode State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Ready,
    InEpisode,
    Terminal,
}

#[derive(Debug, Clone, Default)]
pub struct EpisodeState {
    pub start_lives: u32,
    pub lives: u32,
    pub game_over: bool,
    pub terminal: bool,
    /// Unclipped reward collected so far.
    pub reward: f64,
    pub steps: u64,
}

/// Result of one agent step. `state` borrows the environment's window until
/// the next call that mutates it.
pub struct StepOutcome<'a> {
    pub reward: f64,
    pub state: &'a StateWindow,
    pub terminal: bool,
}

struct Loaded<S> {
    sim: S,
    frames: FrameRingBuffer,
    preprocessor: Preprocessor,
    legal: Vec<ActionId>,
}

// =============================================================================
// Episode Environment
// =============================================================================

/// One worker's game: simulator, raw-frame ring and stacked state window.
pub struct Environment<S: Simulator> {
    config: EnvConfig,
    loaded: Option<Loaded<S>>,
    window: StateWindow,
    episode: EpisodeState,
    phase: Phase,
    rng: SmallRng,
}

/// Hold `action` for one tick and capture the resulting screen.
fn tick<S: Simulator>(loaded: &mut Loaded<S>, action: ActionId) -> Result<f64> {
    let reward = loaded.sim.act(loaded.legal[action])?;
    let sim = &mut loaded.sim;
    loaded.frames.capture_with(|frame| sim.capture_grayscale(frame))?;
    Ok(reward)
}

/// Preprocess the latest captures straight into the window's next slot.
fn observe<S: Simulator>(loaded: &mut Loaded<S>, window: &mut StateWindow) {
    let Loaded {
        frames,
        preprocessor,
        ..
    } = loaded;
    window.push_with(|slot| preprocessor.apply(frames, slot));
}

impl<S: Simulator> Environment<S> {
    pub fn new(config: EnvConfig) -> Self {
        let rng = SmallRng::seed_from_u64(config.rng_seed);
        Self {
            config,
            loaded: None,
            window: StateWindow::new(),
            episode: EpisodeState::default(),
            phase: Phase::Uninitialized,
            rng,
        }
    }

    /// Construct the simulator while holding `lock`; the lock is released
    /// before this returns.
    pub fn initialize<F>(&mut self, lock: &Mutex<()>, factory: &F) -> Result<()>
    where
        F: SimulatorFactory<Sim = S>,
    {
        self.config.validate()?;
        let sim = {
            // The guard protects no data, so a poisoned lock is still usable.
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            factory
                .construct(self.config.seed)
                .context("simulator construction failed")?
        };

        let legal = sim.legal_actions().to_vec();
        if legal.is_empty() {
            bail!("simulator reports no legal actions");
        }
        let (width, height) = sim.screen_dims();
        self.loaded = Some(Loaded {
            sim,
            frames: FrameRingBuffer::new(width, height),
            preprocessor: Preprocessor::new(width, height),
            legal,
        });
        self.phase = Phase::Ready;
        Ok(())
    }

    pub fn num_actions(&self) -> usize {
        self.loaded.as_ref().map_or(0, |l| l.legal.len())
    }

    /// Simulator resolution; `(0, 0)` before `initialize`.
    pub fn screen_dims(&self) -> (usize, usize) {
        self.loaded.as_ref().map_or((0, 0), |l| {
            let frame = l.frames.current();
            (frame.width(), frame.height())
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn episode(&self) -> &EpisodeState {
        &self.episode
    }

    pub fn state(&self) -> &StateWindow {
        &self.window
    }

    pub fn start_episode(&mut self) -> Result<&StateWindow> {
        let Some(loaded) = self.loaded.as_mut() else {
            bail!("start_episode called before initialize");
        };

        loaded.sim.reset_episode().context("simulator reset failed")?;
        let start_lives = loaded.sim.lives();
        self.window.clear();
        loaded.frames.clear();
        // The reset screen seeds the ring so the first preprocess sees two captures.
        let sim = &mut loaded.sim;
        loaded.frames.capture_with(|frame| sim.capture_grayscale(frame))?;

        let mut nullops = 0;
        if self.config.max_start_nullops > 0 {
            nullops = self.rng.random_range(0..=self.config.max_start_nullops);
            for _ in 0..nullops {
                tick(loaded, NOOP)?;
            }
        }

        for _ in 0..HISTORY_LEN - 1 {
            tick(loaded, NOOP)?;
            observe(loaded, &mut self.window);
        }
        // Current observation completes the window.
        observe(loaded, &mut self.window);

        self.episode = EpisodeState {
            start_lives,
            lives: start_lives,
            ..Default::default()
        };
        self.phase = Phase::InEpisode;
        debug!(start_lives, nullops, "episode started");
        Ok(&self.window)
    }

    pub fn step(&mut self, action: ActionId) -> Result<StepOutcome<'_>> {
        if self.phase != Phase::InEpisode {
            bail!("step called outside an episode (phase {:?})", self.phase);
        }
        let Some(loaded) = self.loaded.as_mut() else {
            bail!("step called before initialize");
        };
        if action >= loaded.legal.len() {
            bail!(
                "action {action} out of range for {} legal actions",
                loaded.legal.len()
            );
        }

        // Frame-skip always runs its full count, even past a lost life.
        let mut reward = 0.0;
        for _ in 0..self.config.frame_skip {
            reward += tick(loaded, action)?;
        }
        observe(loaded, &mut self.window);

        let lives = loaded.sim.lives();
        let game_over = loaded.sim.is_game_over();
        let terminal = game_over || lives < self.episode.start_lives;

        self.episode.lives = lives;
        self.episode.game_over = game_over;
        self.episode.terminal = terminal;
        self.episode.reward += reward;
        self.episode.steps += 1;
        if terminal {
            self.phase = Phase::Terminal;
        }

        Ok(StepOutcome {
            reward,
            state: &self.window,
            terminal,
        })
    }
}
