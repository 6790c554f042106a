use anyhow::{Context, Result, anyhow, bail};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Linear, Module, VarBuilder, VarMap};

use crate::params::{ParamSet, ParamTensor};
use crate::state::StateWindow;
use crate::{FRAME_HEIGHT, FRAME_WIDTH, HISTORY_LEN};

/// Action-value estimator owned by one worker.
///
/// Gradients are returned rather than applied: the caller decides when they
/// reach the shared parameters.
pub trait ValueFunction {
    /// One vector of action values per state.
    fn forward(&self, states: &[&StateWindow]) -> Result<Vec<Vec<f32>>>;

    /// Gradient of `(target - sum(Q(state) * one_hot))^2` w.r.t. every parameter.
    fn compute_gradient(
        &self,
        state: &StateWindow,
        one_hot: &[f32],
        target: f32,
    ) -> Result<ParamSet>;

    fn parameters(&self) -> Result<ParamSet>;

    fn load_parameters(&mut self, params: &ParamSet) -> Result<()>;
}

/// Builds value functions. Models are constructed on the thread that uses them.
pub trait ValueFunctionFactory: Send + Sync {
    type Model: ValueFunction;

    fn build(&self, num_actions: usize) -> Result<Self::Model>;
}

#[cfg(target_os = "macos")]
fn with_autorelease_pool<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    objc::rc::autoreleasepool(f)
}

#[cfg(not(target_os = "macos"))]
fn with_autorelease_pool<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    f()
}

// =============================================================================
// Convolutional Q-Network (candle)
// =============================================================================

const CONV1_FILTERS: usize = 16;
const CONV2_FILTERS: usize = 32;
const HIDDEN_SIZE: usize = 256;

/// Spatial size after a valid convolution.
const fn conv_out(size: usize, kernel: usize, stride: usize) -> usize {
    (size - kernel) / stride + 1
}

const FLAT_SIZE: usize = CONV2_FILTERS
    * conv_out(conv_out(FRAME_HEIGHT, 8, 4), 4, 2)
    * conv_out(conv_out(FRAME_WIDTH, 8, 4), 4, 2);

/// Stacked frames → conv 8x8/4 → conv 4x4/2 → dense → one value per action.
pub struct QNetwork {
    varmap: VarMap,
    conv1: Conv2d,
    conv2: Conv2d,
    fc: Linear,
    out: Linear,
    device: Device,
    num_actions: usize,
}

impl QNetwork {
    pub fn new(device: &Device, num_actions: usize) -> Result<Self> {
        if num_actions == 0 {
            bail!("Q-network needs at least one action");
        }
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let conv1 = candle_nn::conv2d(
            HISTORY_LEN,
            CONV1_FILTERS,
            8,
            Conv2dConfig {
                stride: 4,
                ..Default::default()
            },
            vs.pp("conv1"),
        )?;
        let conv2 = candle_nn::conv2d(
            CONV1_FILTERS,
            CONV2_FILTERS,
            4,
            Conv2dConfig {
                stride: 2,
                ..Default::default()
            },
            vs.pp("conv2"),
        )?;
        let fc = candle_nn::linear(FLAT_SIZE, HIDDEN_SIZE, vs.pp("fc"))?;
        let out = candle_nn::linear(HIDDEN_SIZE, num_actions, vs.pp("out"))?;

        Ok(Self {
            varmap,
            conv1,
            conv2,
            fc,
            out,
            device: device.clone(),
            num_actions,
        })
    }

    pub fn num_actions(&self) -> usize {
        self.num_actions
    }

    fn forward_tensor(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.conv1.forward(x)?.relu()?;
        let h = self.conv2.forward(&h)?.relu()?;
        let h = h.flatten_from(1)?;
        let h = self.fc.forward(&h)?.relu()?;
        self.out.forward(&h)
    }

    fn batch(&self, states: &[&StateWindow]) -> Result<Tensor> {
        let mut input = Vec::with_capacity(states.len() * HISTORY_LEN * FRAME_HEIGHT * FRAME_WIDTH);
        for state in states {
            if !state.is_full() {
                bail!(
                    "state window holds {} of {HISTORY_LEN} frames",
                    state.len()
                );
            }
            input.extend(state.to_input());
        }
        Ok(Tensor::from_vec(
            input,
            (states.len(), HISTORY_LEN, FRAME_HEIGHT, FRAME_WIDTH),
            &self.device,
        )?)
    }
}

impl ValueFunction for QNetwork {
    fn forward(&self, states: &[&StateWindow]) -> Result<Vec<Vec<f32>>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        with_autorelease_pool(|| {
            let x = self.batch(states)?;
            let q = self.forward_tensor(&x)?;
            Ok(q.to_device(&Device::Cpu)?.to_vec2::<f32>()?)
        })
    }

    fn compute_gradient(
        &self,
        state: &StateWindow,
        one_hot: &[f32],
        target: f32,
    ) -> Result<ParamSet> {
        if one_hot.len() != self.num_actions {
            bail!(
                "one-hot action has {} entries, network has {} outputs",
                one_hot.len(),
                self.num_actions
            );
        }
        with_autorelease_pool(|| {
            let x = self.batch(&[state])?;
            let q = self.forward_tensor(&x)?;
            let mask = Tensor::from_slice(one_hot, (1, self.num_actions), &self.device)?;
            let q_action = q.mul(&mask)?.sum_all()?;
            let loss = q_action.affine(1.0, -(target as f64))?.sqr()?;
            let grads = loss.backward()?;

            let data = self
                .varmap
                .data()
                .lock()
                .map_err(|_| anyhow!("Failed to lock varmap for gradients"))?;
            let mut tensors = Vec::with_capacity(data.len());
            for (name, var) in data.iter() {
                let shape = var.as_tensor().dims().to_vec();
                let flat = match grads.get(var.as_tensor()) {
                    Some(g) => g.to_device(&Device::Cpu)?.flatten_all()?.to_vec1::<f32>()?,
                    None => vec![0.0; var.as_tensor().elem_count()],
                };
                tensors.push(ParamTensor::new(name.clone(), shape, flat));
            }
            Ok(ParamSet::new(tensors))
        })
    }

    fn parameters(&self) -> Result<ParamSet> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("Failed to lock varmap for snapshot"))?;
        let mut tensors = Vec::with_capacity(data.len());
        for (name, var) in data.iter() {
            let tensor = var.as_tensor().to_device(&Device::Cpu)?.detach();
            let shape = tensor.dims().to_vec();
            let flat = tensor.flatten_all()?.to_vec1::<f32>()?;
            tensors.push(ParamTensor::new(name.clone(), shape, flat));
        }
        Ok(ParamSet::new(tensors))
    }

    fn load_parameters(&mut self, params: &ParamSet) -> Result<()> {
        let mut data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("Failed to lock varmap for load"))?;
        if data.len() != params.len() {
            bail!(
                "parameter count mismatch: network has {}, got {}",
                data.len(),
                params.len()
            );
        }
        for (name, var) in data.iter_mut() {
            let p = params
                .get(name)
                .ok_or_else(|| anyhow!("Missing var {name} in parameter set"))?;
            if var.as_tensor().dims() != p.shape.as_slice() {
                bail!(
                    "shape mismatch for {name}: network {:?}, parameters {:?}",
                    var.as_tensor().dims(),
                    p.shape
                );
            }
            let t = Tensor::from_slice(&p.data, p.shape.as_slice(), &self.device)?;
            var.set(&t)
                .with_context(|| format!("Failed to set var {name}"))?;
        }
        Ok(())
    }
}

/// Builds [`QNetwork`]s on a fixed device.
#[derive(Clone)]
pub struct QNetworkFactory {
    device: Device,
}

impl QNetworkFactory {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    /// Metal when available unless `cpu` is set.
    pub fn with_default_device(cpu: bool) -> Self {
        let device = if cpu {
            Device::Cpu
        } else {
            Device::new_metal(0).unwrap_or(Device::Cpu)
        };
        Self::new(device)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl ValueFunctionFactory for QNetworkFactory {
    type Model = QNetwork;

    fn build(&self, num_actions: usize) -> Result<QNetwork> {
        QNetwork::new(&self.device, num_actions)
    }
}
