use anyhow::{Result, bail};
use std::sync::Mutex;
use tracing::info;

use crate::env::{EnvConfig, Environment};
use crate::exploration::greedy;
use crate::params::ParamSet;
use crate::simulator::SimulatorFactory;
use crate::value_fn::{ValueFunction, ValueFunctionFactory};

#[derive(Debug, Clone)]
pub struct EvalStats {
    pub avg_reward: f64,
    pub best_reward: f64,
    pub avg_steps: f64,
    pub episodes: usize,
}

/// Play `episodes` greedy episodes with `params` on a fresh environment.
///
/// An episode ends at its first terminal step or after `max_steps` steps.
pub fn run_eval<F, V>(
    sims: &F,
    models: &V,
    params: &ParamSet,
    env_config: EnvConfig,
    episodes: usize,
    max_steps: u64,
) -> Result<EvalStats>
where
    F: SimulatorFactory,
    V: ValueFunctionFactory,
{
    let mut env = Environment::new(env_config);
    env.initialize(&Mutex::new(()), sims)?;
    let mut model = models.build(env.num_actions())?;
    model.load_parameters(params)?;

    let eval_episodes = episodes.max(1);
    let mut total_reward = 0.0f64;
    let mut best_reward = f64::NEG_INFINITY;
    let mut total_steps = 0u64;

    for _ in 0..eval_episodes {
        env.start_episode()?;
        let mut ep_reward = 0.0f64;
        let mut ep_steps = 0u64;

        while ep_steps < max_steps {
            let Some(q_vals) = model.forward(&[env.state()])?.pop() else {
                bail!("value function returned no action values");
            };
            let result = env.step(greedy(&q_vals))?;
            ep_reward += result.reward;
            ep_steps += 1;
            if result.terminal {
                break;
            }
        }

        total_reward += ep_reward;
        best_reward = best_reward.max(ep_reward);
        total_steps += ep_steps;
    }

    let denom = eval_episodes as f64;
    let stats = EvalStats {
        avg_reward: total_reward / denom,
        best_reward,
        avg_steps: total_steps as f64 / denom,
        episodes: eval_episodes,
    };
    info!(
        episodes = stats.episodes,
        avg_reward = stats.avg_reward,
        best_reward = stats.best_reward,
        avg_steps = stats.avg_steps,
        "evaluation finished"
    );
    Ok(stats)
}
