use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::simulator::ActionId;

/// How each worker's exploration rate evolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "schedule", rename_all = "snake_case")]
pub enum ExplorationConfig {
    Constant {
        epsilon: f64,
    },
    Linear {
        start: f64,
        end: f64,
        anneal_steps: u64,
    },
    /// Every worker draws its own floor from `finals` (epsilon, probability).
    Sampled {
        start: f64,
        anneal_steps: u64,
        finals: Vec<(f64, f64)>,
    },
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        ExplorationConfig::Constant { epsilon: 1.0 }
    }
}

impl ExplorationConfig {
    /// Per-thread floors from the asynchronous one-step Q-learning paper.
    pub fn async_q_default() -> Self {
        ExplorationConfig::Sampled {
            start: 1.0,
            anneal_steps: 1_000_000,
            finals: vec![(0.1, 0.4), (0.01, 0.3), (0.5, 0.3)],
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let in_unit = |e: f64| (0.0..=1.0).contains(&e);
        match self {
            ExplorationConfig::Constant { epsilon } if !in_unit(*epsilon) => {
                Err(format!("epsilon {epsilon} outside [0, 1]"))
            }
            ExplorationConfig::Linear { start, end, .. } if !in_unit(*start) || !in_unit(*end) => {
                Err(format!("epsilon range {start}..{end} outside [0, 1]"))
            }
            ExplorationConfig::Sampled { start, finals, .. } => {
                if !in_unit(*start) || finals.iter().any(|(e, _)| !in_unit(*e)) {
                    return Err("sampled epsilons must lie in [0, 1]".into());
                }
                if let Some((_, p)) = finals.iter().find(|(_, p)| p.is_nan() || *p < 0.0) {
                    return Err(format!("final epsilon probability {p} must be non-negative"));
                }
                let total: f64 = finals.iter().map(|(_, p)| p).sum();
                if finals.is_empty() || (total - 1.0).abs() > 1e-6 {
                    return Err(format!("final epsilon probabilities sum to {total}, not 1"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Resolve the schedule for one worker, drawing its floor if sampled.
    pub fn for_worker(&self, rng: &mut impl Rng) -> EpsilonGreedy {
        match self {
            ExplorationConfig::Constant { epsilon } => EpsilonGreedy::new(*epsilon, *epsilon, 0),
            ExplorationConfig::Linear {
                start,
                end,
                anneal_steps,
            } => EpsilonGreedy::new(*start, *end, *anneal_steps),
            ExplorationConfig::Sampled {
                start,
                anneal_steps,
                finals,
            } => {
                let draw = rng.random::<f64>();
                let mut cumulative = 0.0;
                let mut end = finals.last().map_or(*start, |(e, _)| *e);
                for (epsilon, p) in finals {
                    cumulative += p;
                    if draw < cumulative {
                        end = *epsilon;
                        break;
                    }
                }
                EpsilonGreedy::new(*start, end, *anneal_steps)
            }
        }
    }
}

/// Linearly annealed epsilon-greedy policy owned by one worker.
#[derive(Debug, Clone)]
pub struct EpsilonGreedy {
    start: f64,
    end: f64,
    anneal_steps: u64,
}

impl EpsilonGreedy {
    pub fn new(start: f64, end: f64, anneal_steps: u64) -> Self {
        Self {
            start,
            end,
            anneal_steps,
        }
    }

    pub fn final_epsilon(&self) -> f64 {
        self.end
    }

    pub fn epsilon(&self, step: u64) -> f64 {
        if self.anneal_steps == 0 {
            return self.end;
        }
        let progress = (step as f64 / self.anneal_steps as f64).min(1.0);
        self.start + (self.end - self.start) * progress
    }

    pub fn select(&self, values: &[f32], step: u64, rng: &mut impl Rng) -> ActionId {
        if rng.random::<f64>() < self.epsilon(step) {
            rng.random_range(0..values.len())
        } else {
            greedy(values)
        }
    }
}

/// Arg-max with ties going to the lowest index.
pub fn greedy(values: &[f32]) -> ActionId {
    let mut best = 0;
    for (i, v) in values.iter().enumerate().skip(1) {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    #[test]
    fn greedy_ties_go_low() {
        assert_eq!(greedy(&[1.0, 3.0, 3.0, 2.0]), 1);
        assert_eq!(greedy(&[5.0, 5.0]), 0);
        assert_eq!(greedy(&[f32::NAN, 1.0]), 0);
        assert_eq!(greedy(&[-1.0, f32::NAN, 0.5]), 2);
    }

    #[test]
    fn zero_epsilon_is_greedy() {
        let policy = EpsilonGreedy::new(0.0, 0.0, 0);
        let mut rng = SmallRng::seed_from_u64(7);
        for step in 0..100 {
            assert_eq!(policy.select(&[0.1, 0.9, 0.9, 0.3], step, &mut rng), 1);
        }
    }

    #[test]
    fn full_epsilon_covers_all_actions() {
        let policy = ExplorationConfig::default().for_worker(&mut SmallRng::seed_from_u64(1));
        let mut rng = SmallRng::seed_from_u64(3);
        let mut seen = [false; 4];
        for step in 0..500 {
            let a = policy.select(&[0.0, 10.0, 0.0, 0.0], step, &mut rng);
            seen[a] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn linear_schedule_reaches_floor() {
        let policy = EpsilonGreedy::new(1.0, 0.1, 100);
        assert_eq!(policy.epsilon(0), 1.0);
        assert!((policy.epsilon(50) - 0.55).abs() < 1e-12);
        assert!((policy.epsilon(100) - 0.1).abs() < 1e-12);
        assert!((policy.epsilon(10_000) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn sampled_floor_comes_from_finals() {
        let config = ExplorationConfig::async_q_default();
        config.validate().unwrap();
        let mut rng = SmallRng::seed_from_u64(11);
        for _ in 0..50 {
            let floor = config.for_worker(&mut rng).final_epsilon();
            assert!([0.1, 0.01, 0.5].contains(&floor));
        }
    }

    #[test]
    fn rejects_bad_probabilities() {
        let config = ExplorationConfig::Sampled {
            start: 1.0,
            anneal_steps: 10,
            finals: vec![(0.1, 0.5)],
        };
        assert!(config.validate().is_err());
        assert!(ExplorationConfig::Constant { epsilon: 1.5 }.validate().is_err());

        // Sums to one, but one weight is negative.
        let negative = ExplorationConfig::Sampled {
            start: 1.0,
            anneal_steps: 10,
            finals: vec![(0.1, 1.5), (0.5, -0.5)],
        };
        let err = negative.validate().unwrap_err();
        assert!(err.contains("non-negative"), "{err}");
    }
}
