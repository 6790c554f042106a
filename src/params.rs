use serde::{Deserialize, Serialize};

use crate::error::{TrainError, TrainResult};

/// A named tensor stored flat, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl ParamTensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Self {
        let tensor = Self {
            name: name.into(),
            shape,
            data,
        };
        debug_assert_eq!(tensor.numel(), tensor.data.len(), "{}", tensor.name);
        tensor
    }

    pub fn zeros(name: impl Into<String>, shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        Self::new(name, shape, vec![0.0; numel])
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Parameters or gradients of one value function, ordered by name.
///
/// Two sets are compatible when they hold the same names with the same shapes;
/// every mutating operation checks this before touching any value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSet {
    tensors: Vec<ParamTensor>,
}

impl ParamSet {
    pub fn new(mut tensors: Vec<ParamTensor>) -> Self {
        tensors.sort_by(|a, b| a.name.cmp(&b.name));
        Self { tensors }
    }

    /// Single-tensor set, handy for scalar models.
    pub fn scalar(name: impl Into<String>, value: f32) -> Self {
        Self::new(vec![ParamTensor::new(name, vec![1], vec![value])])
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            tensors: self
                .tensors
                .iter()
                .map(|t| ParamTensor::zeros(t.name.clone(), t.shape.clone()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn numel(&self) -> usize {
        self.tensors.iter().map(ParamTensor::numel).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParamTensor> {
        self.tensors.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ParamTensor> {
        self.tensors.iter_mut()
    }

    pub fn get(&self, name: &str) -> Option<&ParamTensor> {
        self.tensors
            .binary_search_by(|t| t.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.tensors[i])
    }

    pub fn check_compatible(&self, other: &ParamSet) -> TrainResult<()> {
        for t in &self.tensors {
            let o = other
                .get(&t.name)
                .ok_or_else(|| TrainError::MissingParameter(t.name.clone()))?;
            if o.shape != t.shape || o.data.len() != t.data.len() {
                return Err(TrainError::ShapeMismatch {
                    name: t.name.clone(),
                    expected: t.shape.clone(),
                    actual: o.shape.clone(),
                });
            }
        }
        // Same length plus every name found means identical name sets.
        if let Some(extra) = other.iter().find(|o| self.get(&o.name).is_none()) {
            return Err(TrainError::ShapeMismatch {
                name: extra.name.clone(),
                expected: Vec::new(),
                actual: extra.shape.clone(),
            });
        }
        Ok(())
    }

    /// Elementwise `self += other`.
    pub fn add_assign(&mut self, other: &ParamSet) -> TrainResult<()> {
        self.check_compatible(other)?;
        // Both sides are sorted by name and have identical name sets.
        for (dst, src) in self.tensors.iter_mut().zip(&other.tensors) {
            for (d, s) in dst.data.iter_mut().zip(&src.data) {
                *d += s;
            }
        }
        Ok(())
    }

    pub fn fill_zero(&mut self) {
        for t in &mut self.tensors {
            t.data.fill(0.0);
        }
    }

    pub fn is_zero(&self) -> bool {
        self.tensors
            .iter()
            .all(|t| t.data.iter().all(|v| *v == 0.0))
    }

    /// Equality on raw bits, so NaNs and signed zeros count too.
    pub fn bit_eq(&self, other: &ParamSet) -> bool {
        self.tensors.len() == other.tensors.len()
            && self.tensors.iter().zip(&other.tensors).all(|(a, b)| {
                a.name == b.name
                    && a.shape == b.shape
                    && a.data.len() == b.data.len()
                    && a.data
                        .iter()
                        .zip(&b.data)
                        .all(|(x, y)| x.to_bits() == y.to_bits())
            })
    }
}

// =============================================================================
// Gradient Accumulator
// =============================================================================

/// Per-worker additive gradient buffer, zeroed after every flush.
#[derive(Debug, Clone)]
pub struct GradientAccumulator {
    sum: ParamSet,
    pending: usize,
}

impl GradientAccumulator {
    pub fn new(like: &ParamSet) -> Self {
        Self {
            sum: like.zeros_like(),
            pending: 0,
        }
    }

    pub fn add(&mut self, grads: &ParamSet) -> TrainResult<()> {
        self.sum.add_assign(grads)?;
        self.pending += 1;
        Ok(())
    }

    pub fn gradients(&self) -> &ParamSet {
        &self.sum
    }

    /// Gradients added since the last reset.
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn reset(&mut self) {
        self.sum.fill_zero();
        self.pending = 0;
    }

    pub fn is_zero(&self) -> bool {
        self.sum.is_zero()
    }
}
