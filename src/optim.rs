use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use crate::error::TrainResult;
use crate::params::ParamSet;

/// Update rule applied to the shared online parameters.
///
/// Implementations must be deterministic: the same gradient sequence always
/// produces the same parameters.
pub trait Optimizer: Send {
    fn apply(&mut self, params: &mut ParamSet, grads: &ParamSet) -> TrainResult<()>;

    fn learning_rate(&self) -> f64;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Sgd {
        lr: f64,
    },
    Adam {
        lr: f64,
        beta1: f64,
        beta2: f64,
        eps: f64,
        /// Global-norm clip applied before the update; `None` disables it.
        max_grad_norm: Option<f64>,
    },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::Adam {
            lr: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            max_grad_norm: Some(10.0),
        }
    }
}

impl OptimizerConfig {
    pub fn build(&self) -> Box<dyn Optimizer> {
        match *self {
            OptimizerConfig::Sgd { lr } => Box::new(Sgd::new(lr)),
            OptimizerConfig::Adam {
                lr,
                beta1,
                beta2,
                eps,
                max_grad_norm,
            } => Box::new(Adam {
                lr,
                beta1,
                beta2,
                eps,
                max_grad_norm,
                t: 0,
                moments: None,
            }),
        }
    }

    pub fn with_learning_rate(mut self, new_lr: f64) -> Self {
        match &mut self {
            OptimizerConfig::Sgd { lr } | OptimizerConfig::Adam { lr, .. } => *lr = new_lr,
        }
        self
    }
}

/// Scale `grads` down so their global L2 norm is at most `max_norm`.
fn clip_by_global_norm(grads: &ParamSet, max_norm: f64) -> Cow<'_, ParamSet> {
    let total_norm = grads
        .iter()
        .flat_map(|t| t.data.iter())
        .map(|&g| (g as f64) * (g as f64))
        .sum::<f64>()
        .sqrt();
    if max_norm <= 0.0 || total_norm <= max_norm {
        return Cow::Borrowed(grads);
    }
    let clip_coef = (max_norm / (total_norm + 1e-6)) as f32;
    let mut clipped = grads.clone();
    for t in clipped.iter_mut() {
        for g in &mut t.data {
            *g *= clip_coef;
        }
    }
    Cow::Owned(clipped)
}

// =============================================================================
// SGD
// =============================================================================

pub struct Sgd {
    lr: f64,
}

impl Sgd {
    pub fn new(lr: f64) -> Self {
        Self { lr }
    }
}

impl Optimizer for Sgd {
    fn apply(&mut self, params: &mut ParamSet, grads: &ParamSet) -> TrainResult<()> {
        params.check_compatible(grads)?;
        let lr = self.lr as f32;
        for (p, g) in params.iter_mut().zip(grads.iter()) {
            for (w, d) in p.data.iter_mut().zip(&g.data) {
                *w -= lr * d;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }
}

// =============================================================================
// Adam
// =============================================================================

pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    max_grad_norm: Option<f64>,
    t: i32,
    /// First and second moments, created on the first update.
    moments: Option<(ParamSet, ParamSet)>,
}

impl Adam {
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            max_grad_norm: None,
            t: 0,
            moments: None,
        }
    }

    pub fn steps(&self) -> i32 {
        self.t
    }
}

impl Optimizer for Adam {
    fn apply(&mut self, params: &mut ParamSet, grads: &ParamSet) -> TrainResult<()> {
        params.check_compatible(grads)?;
        let grads = match self.max_grad_norm {
            Some(max_norm) => clip_by_global_norm(grads, max_norm),
            None => Cow::Borrowed(grads),
        };
        let (m, v) = self
            .moments
            .get_or_insert_with(|| (params.zeros_like(), params.zeros_like()));

        self.t += 1;
        let (b1, b2) = (self.beta1 as f32, self.beta2 as f32);
        let lr_t = (self.lr
            * (1.0 - self.beta2.powi(self.t)).sqrt()
            / (1.0 - self.beta1.powi(self.t))) as f32;
        let eps = self.eps as f32;

        for (((p, g), m), v) in params
            .iter_mut()
            .zip(grads.iter())
            .zip(m.iter_mut())
            .zip(v.iter_mut())
        {
            for j in 0..p.data.len() {
                let grad = g.data[j];
                m.data[j] = b1 * m.data[j] + (1.0 - b1) * grad;
                v.data[j] = b2 * v.data[j] + (1.0 - b2) * grad * grad;
                p.data[j] -= lr_t * m.data[j] / (v.data[j].sqrt() + eps);
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrainError;
    use crate::params::ParamTensor;

    #[test]
    fn sgd_descends() {
        let mut params = ParamSet::scalar("x", 1.0);
        let mut opt = Sgd::new(0.5);
        opt.apply(&mut params, &ParamSet::scalar("x", 2.0)).unwrap();
        assert_eq!(params.get("x").unwrap().data, vec![0.0]);
    }

    #[test]
    fn adam_first_step_moves_by_lr() {
        let mut params = ParamSet::scalar("x", 0.0);
        let mut opt = Adam::new(0.1);
        opt.apply(&mut params, &ParamSet::scalar("x", 3.0)).unwrap();
        let x = params.get("x").unwrap().data[0];
        assert!((x + 0.1).abs() < 1e-4, "x = {x}");
        assert_eq!(opt.steps(), 1);
    }

    #[test]
    fn adam_is_deterministic() {
        let grads: Vec<ParamSet> = (0..20)
            .map(|i| {
                ParamSet::new(vec![ParamTensor::new(
                    "w",
                    vec![3],
                    vec![i as f32 * 0.1, -(i as f32), 0.25],
                )])
            })
            .collect();
        let run = || {
            let mut params = ParamSet::new(vec![ParamTensor::zeros("w", vec![3])]);
            let mut opt = OptimizerConfig::default().build();
            for g in &grads {
                opt.apply(&mut params, g).unwrap();
            }
            params
        };
        assert!(run().bit_eq(&run()));
    }

    #[test]
    fn clipping_bounds_norm() {
        let grads = ParamSet::new(vec![ParamTensor::new("w", vec![2], vec![30.0, 40.0])]);
        let clipped = clip_by_global_norm(&grads, 5.0);
        let data = &clipped.get("w").unwrap().data;
        let norm = (data[0] * data[0] + data[1] * data[1]).sqrt();
        assert!((norm - 5.0).abs() < 1e-3);
        assert!(matches!(clip_by_global_norm(&grads, 100.0), Cow::Borrowed(_)));
    }

    #[test]
    fn mismatch_does_not_update() {
        let mut params = ParamSet::scalar("x", 1.0);
        let mut opt = Sgd::new(1.0);
        let err = opt
            .apply(&mut params, &ParamSet::scalar("y", 1.0))
            .unwrap_err();
        assert!(matches!(err, TrainError::MissingParameter(_)));
        assert_eq!(params.get("x").unwrap().data, vec![1.0]);
    }
}
