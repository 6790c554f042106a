use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, trace};

use crate::env::Environment;
use crate::error::{TrainError, TrainResult};
use crate::exploration::{EpsilonGreedy, ExplorationConfig};
use crate::params::GradientAccumulator;
use crate::shared::SharedParameters;
use crate::simulator::Simulator;
use crate::state::StateWindow;
use crate::value_fn::ValueFunction;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub id: usize,
    /// Iterations before the worker stops on its own.
    pub steps: u64,
    pub flush_frequency: u64,
    pub target_sync_frequency: u64,
    pub discount: f64,
    pub exploration: ExplorationConfig,
    pub seed: u64,
}

/// Live counters published for progress logging.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub episodes: u64,
    pub steps: u64,
    pub flushes: u64,
    pub last_episode_reward: f64,
    pub epsilon: f64,
}

/// What a worker did before it stopped.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub id: usize,
    pub steps: u64,
    pub episodes: u64,
    pub flushes: u64,
    /// Target syncs this worker triggered.
    pub target_syncs: u64,
    pub final_epsilon: f64,
}

/// One actor-learner: acts in its own environment and feeds gradients into
/// the shared parameters.
pub struct ActorLearner<S: Simulator, M: ValueFunction> {
    config: WorkerConfig,
    env: Environment<S>,
    online: M,
    target: M,
    online_version: u64,
    target_version: u64,
    accumulator: GradientAccumulator,
    policy: EpsilonGreedy,
    rng: SmallRng,
    shared: Arc<SharedParameters>,
    state: StateWindow,
    steps: u64,
    episodes: u64,
    flushes: u64,
    target_syncs: u64,
    stats: Arc<RwLock<WorkerStats>>,
}

impl<S: Simulator, M: ValueFunction> ActorLearner<S, M> {
    /// Takes an initialized environment, loads both replicas from the shared
    /// snapshots and starts the first episode.
    pub fn new(
        config: WorkerConfig,
        mut env: Environment<S>,
        mut online: M,
        mut target: M,
        shared: Arc<SharedParameters>,
        stats: Arc<RwLock<WorkerStats>>,
    ) -> TrainResult<Self> {
        let id = config.id;
        let vf_err = |cause: anyhow::Error| TrainError::ValueFunction {
            worker: id,
            step: 0,
            cause,
        };

        let online_snap = shared.online_snapshot()?;
        online.load_parameters(&online_snap.params).map_err(vf_err)?;
        let target_snap = shared.target_snapshot()?;
        target.load_parameters(&target_snap.params).map_err(vf_err)?;

        let mut rng = SmallRng::seed_from_u64(config.seed);
        let policy = config.exploration.for_worker(&mut rng);
        let mut state = StateWindow::new();
        state.copy_from(env.start_episode().map_err(|cause| TrainError::Env {
            worker: id,
            step: 0,
            cause,
        })?);

        Ok(Self {
            accumulator: GradientAccumulator::new(&online_snap.params),
            online_version: online_snap.version,
            target_version: target_snap.version,
            config,
            env,
            online,
            target,
            policy,
            rng,
            shared,
            state,
            steps: 0,
            episodes: 0,
            flushes: 0,
            target_syncs: 0,
            stats,
        })
    }

    pub fn id(&self) -> usize {
        self.config.id
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn state(&self) -> &StateWindow {
        &self.state
    }

    pub fn accumulator(&self) -> &GradientAccumulator {
        &self.accumulator
    }

    pub fn environment(&self) -> &Environment<S> {
        &self.env
    }

    /// Shared `(online, target)` versions the local replicas were loaded from.
    pub fn replica_versions(&self) -> (u64, u64) {
        (self.online_version, self.target_version)
    }

    fn vf_err(&self, cause: anyhow::Error) -> TrainError {
        TrainError::ValueFunction {
            worker: self.config.id,
            step: self.steps,
            cause,
        }
    }

    /// One iteration: act, bootstrap, accumulate, and flush or sync on cadence.
    pub fn step_once(&mut self) -> TrainResult<()> {
        let num_actions = self.env.num_actions();
        let values = self
            .online
            .forward(&[&self.state])
            .map_err(|e| self.vf_err(e))?
            .pop()
            .unwrap_or_default();
        if values.len() != num_actions {
            return Err(self.vf_err(anyhow::anyhow!(
                "got {} action values for {num_actions} actions",
                values.len()
            )));
        }

        let action = self.policy.select(&values, self.steps, &mut self.rng);
        let (id, step) = (self.config.id, self.steps);
        let env_err = |cause| TrainError::Env {
            worker: id,
            step,
            cause,
        };
        let outcome = self.env.step(action).map_err(env_err)?;
        let reward = outcome.reward.clamp(-1.0, 1.0);
        let terminal = outcome.terminal;

        let target = if terminal {
            reward
        } else {
            self.refresh_target()?;
            let next = self
                .target
                .forward(&[self.env.state()])
                .map_err(|e| self.vf_err(e))?;
            let best = match next.first() {
                Some(q) if q.len() == num_actions => {
                    q.iter().copied().fold(f32::NEG_INFINITY, f32::max)
                }
                _ => {
                    return Err(self.vf_err(anyhow::anyhow!(
                        "target replica returned no values for the next state"
                    )));
                }
            };
            reward + self.config.discount * best as f64
        };

        let mut one_hot = vec![0.0f32; num_actions];
        one_hot[action] = 1.0;
        let grads = self
            .online
            .compute_gradient(&self.state, &one_hot, target as f32)
            .map_err(|e| self.vf_err(e))?;
        self.accumulator.add(&grads)?;
        self.steps += 1;

        if self.steps.is_multiple_of(self.config.flush_frequency) {
            self.flush()?;
        }

        let global = self.shared.record_step();
        if global.is_multiple_of(self.config.target_sync_frequency) {
            let version = self.shared.sync_target()?;
            self.target_syncs += 1;
            debug!(worker = self.config.id, global, version, "target synced");
        }

        if terminal {
            self.episodes += 1;
            let episode = self.env.episode();
            debug!(
                worker = self.config.id,
                episode = self.episodes,
                reward = episode.reward,
                length = episode.steps,
                game_over = episode.game_over,
                "episode finished"
            );
            let last_reward = episode.reward;
            let fresh = self.env.start_episode().map_err(env_err)?;
            self.state.copy_from(fresh);
            self.publish_stats(Some(last_reward));
        } else {
            self.state.copy_from(self.env.state());
            self.publish_stats(None);
        }
        Ok(())
    }

    /// Apply pending gradients to the shared parameters and reload the online
    /// replica from the result. No-op when nothing is pending.
    pub fn flush(&mut self) -> TrainResult<()> {
        if self.accumulator.pending() == 0 {
            return Ok(());
        }
        let version = self.shared.apply_gradient(self.accumulator.gradients())?;
        self.accumulator.reset();
        self.flushes += 1;
        trace!(worker = self.config.id, version, "flushed gradients");

        let snapshot = self.shared.online_snapshot()?;
        self.online
            .load_parameters(&snapshot.params)
            .map_err(|e| self.vf_err(e))?;
        self.online_version = snapshot.version;
        Ok(())
    }

    fn refresh_target(&mut self) -> TrainResult<()> {
        if self.shared.target_version() == self.target_version {
            return Ok(());
        }
        let snapshot = self.shared.target_snapshot()?;
        self.target
            .load_parameters(&snapshot.params)
            .map_err(|e| self.vf_err(e))?;
        self.target_version = snapshot.version;
        Ok(())
    }

    fn publish_stats(&self, last_reward: Option<f64>) {
        if let Ok(mut stats) = self.stats.write() {
            stats.episodes = self.episodes;
            stats.steps = self.steps;
            stats.flushes = self.flushes;
            stats.epsilon = self.policy.epsilon(self.steps);
            if let Some(reward) = last_reward {
                stats.last_episode_reward = reward;
            }
        }
    }

    /// Run until the step budget is spent or `stop` is raised, then flush
    /// whatever is still pending.
    ///
    /// The exit flush is the one apply that does not land on a multiple of
    /// `flush_frequency`: it carries the partial sum of fewer than F steps.
    /// It also runs after a worker-local error, in which case it applies only
    /// gradients of steps that completed before the failure; the failing step
    /// never reaches the accumulator. Fatal-global errors skip it.
    pub fn run(mut self, stop: &AtomicBool) -> TrainResult<WorkerReport> {
        let id = self.config.id;
        info!(worker = id, steps = self.config.steps, "worker started");

        let mut outcome = Ok(());
        while self.steps < self.config.steps && !stop.load(Ordering::Relaxed) {
            if let Err(err) = self.step_once() {
                outcome = Err(err);
                break;
            }
        }
        // Gradients computed before a recoverable failure are still valid.
        let outcome = match outcome {
            Ok(()) => self.flush(),
            Err(err) if err.is_fatal_global() => Err(err),
            Err(err) => match self.flush() {
                Err(flush_err) if flush_err.is_fatal_global() => Err(flush_err),
                _ => Err(err),
            },
        };

        if let Err(err) = outcome {
            let step = self.steps;
            if err.is_fatal_global() {
                stop.store(true, Ordering::SeqCst);
                error!(worker = id, step, "aborting run: {err}");
                return Err(TrainError::Aborted {
                    worker: id,
                    step,
                    cause: Box::new(err),
                });
            }
            error!(worker = id, step, "worker failed: {err}");
            return Err(err);
        }

        info!(
            worker = id,
            steps = self.steps,
            episodes = self.episodes,
            flushes = self.flushes,
            "worker finished"
        );
        Ok(WorkerReport {
            id,
            steps: self.steps,
            episodes: self.episodes,
            flushes: self.flushes,
            target_syncs: self.target_syncs,
            final_epsilon: self.policy.epsilon(self.steps),
        })
    }
}
