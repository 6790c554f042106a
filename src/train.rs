use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::env::{EnvConfig, Environment};
use crate::error::{TrainError, TrainResult};
use crate::exploration::ExplorationConfig;
use crate::optim::Optimizer;
use crate::shared::SharedParameters;
use crate::simulator::SimulatorFactory;
use crate::value_fn::{ValueFunction, ValueFunctionFactory};
use crate::worker::{ActorLearner, WorkerConfig, WorkerReport, WorkerStats};

// =============================================================================
// Training Hyperparameters
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub num_workers: usize,
    pub steps_per_worker: u64,
    /// Worker iterations between gradient flushes.
    pub flush_frequency: u64,
    /// Global worker steps between target syncs.
    pub target_sync_frequency: u64,
    pub discount: f64,
    pub exploration: ExplorationConfig,
    pub env: EnvConfig,
    pub log_interval_ms: u64,
    /// Worker `i` seeds its RNG with `worker_seed + i`.
    pub worker_seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            steps_per_worker: 1_000_000,
            flush_frequency: 5,
            target_sync_frequency: 10_000,
            discount: 0.99,
            exploration: ExplorationConfig::default(),
            env: EnvConfig::default(),
            log_interval_ms: 5000,
            worker_seed: 123_456,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> TrainResult<()> {
        let invalid = |msg: String| Err(TrainError::InvalidConfig(msg));
        if self.num_workers == 0 {
            return invalid("num_workers must be at least 1".into());
        }
        if self.flush_frequency == 0 {
            return invalid("flush_frequency must be at least 1".into());
        }
        if self.target_sync_frequency == 0 {
            return invalid("target_sync_frequency must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.discount) {
            return invalid(format!("discount {} outside [0, 1]", self.discount));
        }
        self.exploration.validate().or_else(invalid)?;
        self.env
            .validate()
            .map_err(|e| TrainError::InvalidConfig(e.to_string()))
    }

    fn worker_config(&self, id: usize) -> WorkerConfig {
        WorkerConfig {
            id,
            steps: self.steps_per_worker,
            flush_frequency: self.flush_frequency,
            target_sync_frequency: self.target_sync_frequency,
            discount: self.discount,
            exploration: self.exploration.clone(),
            seed: self.worker_seed.wrapping_add(id as u64),
        }
    }
}

/// Outcome of a finished run.
#[derive(Debug)]
pub struct TrainSummary {
    pub reports: Vec<WorkerReport>,
    /// Workers that stopped on a recoverable error, by id. At least one
    /// worker always completes when `train` returns a summary.
    pub failures: Vec<(usize, TrainError)>,
    pub apply_count: u64,
    pub sync_count: u64,
    pub global_steps: u64,
    pub elapsed: Duration,
}

impl TrainSummary {
    pub fn total_steps(&self) -> u64 {
        self.reports.iter().map(|r| r.steps).sum()
    }

    pub fn total_episodes(&self) -> u64 {
        self.reports.iter().map(|r| r.episodes).sum()
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Owns the shared parameters and drives the worker threads.
pub struct Orchestrator<F, V> {
    config: TrainConfig,
    sim_factory: Arc<F>,
    model_factory: Arc<V>,
    shared: Arc<SharedParameters>,
    init_lock: Arc<Mutex<()>>,
    stop: Arc<AtomicBool>,
}

impl<F, V> Orchestrator<F, V>
where
    F: SimulatorFactory + 'static,
    V: ValueFunctionFactory + 'static,
{
    /// Builds one model to seed the shared online and target parameters.
    pub fn new(
        config: TrainConfig,
        sim_factory: F,
        model_factory: V,
        optimizer: Box<dyn Optimizer>,
    ) -> TrainResult<Self> {
        config.validate()?;
        let num_actions = sim_factory.action_count();
        let initial = model_factory
            .build(num_actions)
            .and_then(|m| m.parameters())
            .context("failed to build initial value function")?;
        info!(
            num_actions,
            tensors = initial.len(),
            numel = initial.numel(),
            "initial parameters ready"
        );

        Ok(Self {
            config,
            sim_factory: Arc::new(sim_factory),
            model_factory: Arc::new(model_factory),
            shared: Arc::new(SharedParameters::new(initial, optimizer)),
            init_lock: Arc::new(Mutex::new(())),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn shared(&self) -> &Arc<SharedParameters> {
        &self.shared
    }

    /// Flag checked by every worker between steps.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn train(&self) -> TrainResult<TrainSummary> {
        let num_workers = self.config.num_workers;
        info!(
            num_workers,
            steps_per_worker = self.config.steps_per_worker,
            flush_frequency = self.config.flush_frequency,
            target_sync_frequency = self.config.target_sync_frequency,
            "starting asynchronous training"
        );

        let t_start = Instant::now();
        let mut worker_stats: Vec<Arc<RwLock<WorkerStats>>> = Vec::new();
        let mut handles: Vec<JoinHandle<TrainResult<WorkerReport>>> = Vec::new();

        for i in 0..num_workers {
            let stats = Arc::new(RwLock::new(WorkerStats::default()));
            worker_stats.push(stats.clone());

            let worker_config = self.config.worker_config(i);
            let env_config = EnvConfig {
                rng_seed: self.config.env.rng_seed.wrapping_add(i as u64),
                ..self.config.env.clone()
            };
            let sims = self.sim_factory.clone();
            let models = self.model_factory.clone();
            let shared = self.shared.clone();
            let lock = self.init_lock.clone();
            let stop = self.stop.clone();

            let spawned = std::thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || {
                    worker_thread(
                        worker_config,
                        env_config,
                        &*sims,
                        &*models,
                        shared,
                        &lock,
                        &stop,
                        stats,
                    )
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.stop.store(true, Ordering::SeqCst);
                    for h in handles {
                        let _ = h.join();
                    }
                    return Err(anyhow::Error::new(e)
                        .context(format!("failed to spawn worker {i}"))
                        .into());
                }
            }
        }

        let log_interval = Duration::from_millis(self.config.log_interval_ms.max(1));
        let mut last_log = Instant::now();
        while !handles.iter().all(|h| h.is_finished()) {
            std::thread::sleep(Duration::from_millis(10));
            if last_log.elapsed() >= log_interval {
                self.log_progress(&worker_stats, t_start);
                last_log = Instant::now();
            }
        }

        let mut reports = Vec::new();
        let mut failures = Vec::new();
        let mut abort = None;
        for (i, h) in handles.into_iter().enumerate() {
            match h.join() {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(err)) if err.is_fatal_global() => {
                    abort.get_or_insert(err);
                }
                Ok(Err(err)) => failures.push((i, err)),
                Err(_) => {
                    error!(worker = i, "worker panicked");
                    failures.push((i, anyhow::anyhow!("worker {i} panicked").into()));
                }
            }
        }
        if let Some(err) = abort {
            return Err(err);
        }

        if reports.is_empty() {
            error!(failed = failures.len(), "no worker completed");
            return Err(TrainError::NoWorkers { failures });
        }
        if !failures.is_empty() {
            warn!(failed = failures.len(), "some workers stopped early");
        }

        self.shared.sync_target()?;
        self.shared.verify_target()?;

        let summary = TrainSummary {
            reports,
            failures,
            apply_count: self.shared.apply_count(),
            sync_count: self.shared.sync_count(),
            global_steps: self.shared.global_steps(),
            elapsed: t_start.elapsed(),
        };
        let secs = summary.elapsed.as_secs_f64().max(1e-9);
        info!(
            steps = summary.global_steps,
            episodes = summary.total_episodes(),
            applies = summary.apply_count,
            syncs = summary.sync_count,
            fps = (summary.global_steps as f64 / secs).round(),
            "training complete"
        );
        Ok(summary)
    }

    fn log_progress(&self, worker_stats: &[Arc<RwLock<WorkerStats>>], t_start: Instant) {
        let mut episodes = 0u64;
        let mut flushes = 0u64;
        let mut reward_sum = 0.0f64;
        let mut reward_samples = 0u64;
        for ws in worker_stats {
            if let Ok(s) = ws.read() {
                episodes += s.episodes;
                flushes += s.flushes;
                if s.episodes > 0 {
                    reward_sum += s.last_episode_reward;
                    reward_samples += 1;
                }
            }
        }
        let avg_reward = if reward_samples > 0 {
            reward_sum / reward_samples as f64
        } else {
            0.0
        };
        let steps = self.shared.global_steps();
        let fps = steps as f64 / t_start.elapsed().as_secs_f64().max(1e-9);
        info!(
            steps,
            episodes,
            flushes,
            applies = self.shared.apply_count(),
            target_version = self.shared.target_version(),
            avg_reward,
            fps = fps.round(),
            "progress"
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_thread<F, V>(
    config: WorkerConfig,
    env_config: EnvConfig,
    sims: &F,
    models: &V,
    shared: Arc<SharedParameters>,
    lock: &Mutex<()>,
    stop: &AtomicBool,
    stats: Arc<RwLock<WorkerStats>>,
) -> TrainResult<WorkerReport>
where
    F: SimulatorFactory,
    V: ValueFunctionFactory,
{
    let id = config.id;
    let init_err = |cause: anyhow::Error| TrainError::EnvInit { worker: id, cause };

    let mut env = Environment::new(env_config);
    let initialized = env.initialize(lock, sims).and_then(|()| {
        let expected = sims.action_count();
        if env.num_actions() == expected {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "simulator exposes {} actions, factory promised {expected}",
                env.num_actions()
            ))
        }
    });
    if let Err(cause) = initialized {
        let err = init_err(cause);
        error!(worker = id, "{err}");
        return Err(err);
    }

    let num_actions = env.num_actions();
    let build = || {
        models
            .build(num_actions)
            .map_err(|cause| TrainError::ValueFunction {
                worker: id,
                step: 0,
                cause,
            })
    };
    let (online, target) = (build()?, build()?);

    ActorLearner::new(config, env, online, target, shared, stats)?.run(stop)
}
