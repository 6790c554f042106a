#![allow(dead_code)]

use anyhow::{Result, bail};
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_nes_rl::{
    ActionId, ParamSet, ParamTensor, RawFrame, Simulator, SimulatorFactory, StateWindow,
    ValueFunction, ValueFunctionFactory,
};

// =============================================================================
// Scripted Simulator
// =============================================================================

#[derive(Debug, Clone)]
pub struct Script {
    pub num_actions: usize,
    pub start_lives: u32,
    /// Ticks since reset after which one life is lost.
    pub life_loss_tick: Option<u64>,
    pub reward_per_tick: f64,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            num_actions: 4,
            start_lives: 3,
            life_loss_tick: None,
            reward_per_tick: 0.0,
        }
    }
}

pub struct ScriptedSimulator {
    script: Script,
    legal: Vec<ActionId>,
    lives: u32,
    ticks_since_reset: u64,
    total_ticks: u64,
    log: Arc<Mutex<Vec<ActionId>>>,
}

impl Simulator for ScriptedSimulator {
    fn legal_actions(&self) -> &[ActionId] {
        &self.legal
    }

    fn screen_dims(&self) -> (usize, usize) {
        (16, 12)
    }

    fn act(&mut self, action: ActionId) -> Result<f64> {
        self.ticks_since_reset += 1;
        self.total_ticks += 1;
        self.log.lock().unwrap().push(action);
        if self.script.life_loss_tick == Some(self.ticks_since_reset) {
            self.lives = self.lives.saturating_sub(1);
        }
        Ok(self.script.reward_per_tick)
    }

    fn capture_grayscale(&mut self, frame: &mut RawFrame) -> Result<()> {
        frame.pixels_mut().fill((self.total_ticks * 7 % 256) as u8);
        Ok(())
    }

    fn lives(&self) -> u32 {
        self.lives
    }

    fn is_game_over(&self) -> bool {
        self.lives == 0
    }

    fn reset_episode(&mut self) -> Result<()> {
        self.lives = self.script.start_lives;
        self.ticks_since_reset = 0;
        Ok(())
    }
}

#[derive(Clone)]
pub struct ScriptedFactory {
    pub script: Script,
    /// Construction indices (0-based, across all threads) that fail.
    pub fail_constructions: Vec<usize>,
    /// Time each `construct` call spends before returning.
    pub construct_delay: Duration,
    constructed: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    log: Arc<Mutex<Vec<ActionId>>>,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            fail_constructions: Vec::new(),
            construct_delay: Duration::ZERO,
            constructed: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing(mut self, indices: &[usize]) -> Self {
        self.fail_constructions = indices.to_vec();
        self
    }

    pub fn slow_construction(mut self, delay: Duration) -> Self {
        self.construct_delay = delay;
        self
    }

    /// Most `construct` calls ever running at the same time.
    pub fn peak_concurrent_constructions(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn constructions(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
    }

    /// Every action fed to any simulator built by this factory, in order.
    pub fn actions(&self) -> Vec<ActionId> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear_actions(&self) {
        self.log.lock().unwrap().clear();
    }
}

impl SimulatorFactory for ScriptedFactory {
    type Sim = ScriptedSimulator;

    fn action_count(&self) -> usize {
        self.script.num_actions
    }

    fn construct(&self, _seed: u64) -> Result<ScriptedSimulator> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        std::thread::sleep(self.construct_delay);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let index = self.constructed.fetch_add(1, Ordering::SeqCst);
        if self.fail_constructions.contains(&index) {
            bail!("ROM not found");
        }
        Ok(ScriptedSimulator {
            script: self.script.clone(),
            legal: (0..self.script.num_actions).collect(),
            lives: self.script.start_lives,
            ticks_since_reset: 0,
            total_ticks: 0,
            log: self.log.clone(),
        })
    }
}

// =============================================================================
// Linear Value Function
// =============================================================================

/// `Q(s, a) = w[a] * x + b[a]`, `x` the mean brightness of the newest frame.
pub struct LinearValueFunction {
    num_actions: usize,
    params: ParamSet,
    gradient_calls: Cell<u64>,
    bad_gradient_after: Option<u64>,
    fail_forward_after: Option<u64>,
    forward_calls: Cell<u64>,
    targets: Arc<Mutex<Vec<f32>>>,
}

fn feature(state: &StateWindow) -> f32 {
    state.newest().map_or(0.0, |f| {
        f.pixels().iter().map(|&p| p as f32).sum::<f32>() / (f.pixels().len() as f32 * 255.0)
    })
}

impl LinearValueFunction {
    fn q(&self, x: f32) -> Vec<f32> {
        let w = &self.params.get("w").unwrap().data;
        let b = &self.params.get("b").unwrap().data;
        (0..self.num_actions).map(|a| w[a] * x + b[a]).collect()
    }
}

impl ValueFunction for LinearValueFunction {
    fn forward(&self, states: &[&StateWindow]) -> Result<Vec<Vec<f32>>> {
        let calls = self.forward_calls.get() + 1;
        self.forward_calls.set(calls);
        if self.fail_forward_after.is_some_and(|n| calls > n) {
            bail!("device lost");
        }
        Ok(states.iter().map(|s| self.q(feature(s))).collect())
    }

    fn compute_gradient(
        &self,
        state: &StateWindow,
        one_hot: &[f32],
        target: f32,
    ) -> Result<ParamSet> {
        self.targets.lock().unwrap().push(target);
        let done = self.gradient_calls.get();
        self.gradient_calls.set(done + 1);
        let x = feature(state);
        let q = self.q(x);
        let q_action: f32 = q.iter().zip(one_hot).map(|(q, h)| q * h).sum();
        let d = -2.0 * (target - q_action);
        let gw: Vec<f32> = one_hot.iter().map(|h| d * h * x).collect();
        let gb: Vec<f32> = one_hot.iter().map(|h| d * h).collect();

        let rows = match self.bad_gradient_after {
            Some(n) if done >= n => self.num_actions + 1,
            _ => self.num_actions,
        };
        let mut gw_shaped = gw;
        gw_shaped.resize(rows, 0.0);
        Ok(ParamSet::new(vec![
            ParamTensor::new("w", vec![rows, 1], gw_shaped),
            ParamTensor::new("b", vec![self.num_actions], gb),
        ]))
    }

    fn parameters(&self) -> Result<ParamSet> {
        Ok(self.params.clone())
    }

    fn load_parameters(&mut self, params: &ParamSet) -> Result<()> {
        if let Err(e) = self.params.check_compatible(params) {
            bail!("incompatible parameters: {e}");
        }
        self.params = params.clone();
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct LinearFactory {
    /// Initial `b`, one entry per action; zeros when empty.
    pub init_bias: Vec<f32>,
    /// Gradients come back with an extra row once this many were computed.
    pub bad_gradient_after: Option<u64>,
    /// `forward` fails after this many calls per model.
    pub fail_forward_after: Option<u64>,
    targets: Arc<Mutex<Vec<f32>>>,
}

impl LinearFactory {
    pub fn with_bias(init_bias: Vec<f32>) -> Self {
        Self {
            init_bias,
            ..Default::default()
        }
    }

    pub fn bad_gradients_after(mut self, calls: u64) -> Self {
        self.bad_gradient_after = Some(calls);
        self
    }

    pub fn failing_forward_after(mut self, calls: u64) -> Self {
        self.fail_forward_after = Some(calls);
        self
    }

    /// Every bootstrap target passed to `compute_gradient`, in call order.
    pub fn targets(&self) -> Vec<f32> {
        self.targets.lock().unwrap().clone()
    }
}

impl ValueFunctionFactory for LinearFactory {
    type Model = LinearValueFunction;

    fn build(&self, num_actions: usize) -> Result<LinearValueFunction> {
        let bias = if self.init_bias.is_empty() {
            vec![0.0; num_actions]
        } else {
            self.init_bias.clone()
        };
        Ok(LinearValueFunction {
            num_actions,
            params: ParamSet::new(vec![
                ParamTensor::zeros("w", vec![num_actions, 1]),
                ParamTensor::new("b", vec![num_actions], bias),
            ]),
            gradient_calls: Cell::new(0),
            bad_gradient_after: self.bad_gradient_after,
            fail_forward_after: self.fail_forward_after,
            forward_calls: Cell::new(0),
            targets: self.targets.clone(),
        })
    }
}
