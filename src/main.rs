#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_nes_rl::{
    EnvConfig, Environment, GameProfile, NesFactory, Orchestrator, OptimizerConfig,
    QNetworkFactory, SimulatorFactory, TrainConfig, run_eval,
};

// =============================================================================
// Run Configuration
// =============================================================================

/// Contents of the `--config` JSON file. Missing sections fall back to defaults.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct RunConfig {
    train: TrainConfig,
    optimizer: OptimizerConfig,
}

impl RunConfig {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let file = File::open(path)
            .with_context(|| format!("Failed to open config {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }
}

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(
    name = "async-nes-rl",
    about = "Asynchronous one-step Q-learning on NES games"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train with several asynchronous actor-learners
    Train(TrainArgs),
    /// Load the ROM and play one random episode
    Probe(ProbeArgs),
}

#[derive(Parser)]
struct TrainArgs {
    #[arg(long)]
    rom: PathBuf,
    #[arg(long, default_value = "kung-fu")]
    profile: String,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    workers: Option<usize>,
    /// Steps per worker
    #[arg(long)]
    steps: Option<u64>,
    #[arg(long)]
    flush_every: Option<u64>,
    #[arg(long)]
    target_sync_every: Option<u64>,
    #[arg(long)]
    gamma: Option<f64>,
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long, default_value_t = false)]
    cpu: bool,
    /// Greedy episodes played with the final parameters
    #[arg(long, default_value = "0")]
    eval_episodes: usize,
}

#[derive(Parser)]
struct ProbeArgs {
    #[arg(long)]
    rom: PathBuf,
    #[arg(long, default_value = "kung-fu")]
    profile: String,
    #[arg(long, default_value = "10000")]
    max_steps: u64,
}

// =============================================================================
// Commands
// =============================================================================

fn train(args: &TrainArgs) -> Result<()> {
    let RunConfig {
        train: mut config,
        mut optimizer,
    } = RunConfig::load(args.config.as_deref())?;
    if let Some(workers) = args.workers {
        config.num_workers = workers;
    }
    if let Some(steps) = args.steps {
        config.steps_per_worker = steps;
    }
    if let Some(flush) = args.flush_every {
        config.flush_frequency = flush;
    }
    if let Some(sync) = args.target_sync_every {
        config.target_sync_frequency = sync;
    }
    if let Some(gamma) = args.gamma {
        config.discount = gamma;
    }
    if let Some(lr) = args.lr {
        optimizer = optimizer.with_learning_rate(lr);
    }

    let profile = GameProfile::by_name(&args.profile)?;
    let sims = NesFactory::new(args.rom.clone(), profile);
    let models = QNetworkFactory::with_default_device(args.cpu);
    eprintln!("Device: {:?}", models.device());
    eprintln!(
        "Training {} with {} workers x {} steps",
        args.rom.display(),
        config.num_workers,
        config.steps_per_worker
    );

    let env_config = config.env.clone();
    let orchestrator = Orchestrator::new(config, sims.clone(), models.clone(), optimizer.build())?;
    let summary = orchestrator.train()?;

    eprintln!(
        "\nTraining complete. {} steps, {} episodes, {} applies, {} target syncs in {:.1}s",
        summary.global_steps,
        summary.total_episodes(),
        summary.apply_count,
        summary.sync_count,
        summary.elapsed.as_secs_f64()
    );
    for (id, err) in &summary.failures {
        eprintln!("  worker {id} stopped early: {err}");
    }

    if args.eval_episodes > 0 {
        let params = orchestrator.shared().online_snapshot()?.params;
        let stats = run_eval(
            &sims,
            &models,
            &params,
            env_config,
            args.eval_episodes,
            10_000,
        )?;
        eprintln!(
            "Eval | avgR {:.2} | bestR {:.2} | avgLen {:.1} | n={}",
            stats.avg_reward, stats.best_reward, stats.avg_steps, stats.episodes
        );
    }
    Ok(())
}

fn probe(args: &ProbeArgs) -> Result<()> {
    let profile = GameProfile::by_name(&args.profile)?;
    let sims = NesFactory::new(args.rom.clone(), profile);
    let mut env = Environment::new(EnvConfig::default());
    env.initialize(&Mutex::new(()), &sims)?;
    let (width, height) = env.screen_dims();
    eprintln!(
        "ROM {} | profile {} | {} actions | screen {width}x{height}",
        args.rom.display(),
        sims.profile.name,
        sims.action_count()
    );

    let mut rng = SmallRng::from_os_rng();
    env.start_episode()?;
    eprintln!("Start lives: {}", env.episode().start_lives);
    let mut steps = 0u64;
    while steps < args.max_steps {
        let result = env.step(rng.random_range(0..env.num_actions()))?;
        steps += 1;
        if result.terminal {
            break;
        }
    }
    let episode = env.episode();
    eprintln!(
        "Random episode: {steps} steps | reward {:.0} | lives {} | game over {}",
        episode.reward, episode.lives, episode.game_over
    );
    Ok(())
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
        Commands::Probe(args) => probe(args),
    }
}
