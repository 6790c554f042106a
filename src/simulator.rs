use anyhow::Result;

use crate::frame::RawFrame;

/// Index into the simulator's ordered legal action set.
pub type ActionId = usize;

/// Action id every simulator reserves for "press nothing".
pub const NOOP: ActionId = 0;

/// One running game instance. Owned by a single environment, never shared;
/// it is constructed on the worker thread that drives it.
pub trait Simulator {
    /// Ordered legal actions; the first entry is the no-op.
    fn legal_actions(&self) -> &[ActionId];

    /// `(width, height)` of captured screens.
    fn screen_dims(&self) -> (usize, usize);

    /// Advance one tick holding `action`, returning the tick's reward.
    fn act(&mut self, action: ActionId) -> Result<f64>;

    /// Write the current screen as grayscale into `frame`.
    fn capture_grayscale(&mut self, frame: &mut RawFrame) -> Result<()>;

    fn lives(&self) -> u32;

    fn is_game_over(&self) -> bool;

    fn reset_episode(&mut self) -> Result<()>;
}

/// Builds simulators. Construction is not thread-safe for every backend, so
/// callers must hold the initialization lock around `construct`.
pub trait SimulatorFactory: Send + Sync {
    type Sim: Simulator;

    /// Size of the legal action set every constructed simulator exposes.
    fn action_count(&self) -> usize;

    fn construct(&self, seed: u64) -> Result<Self::Sim>;
}
