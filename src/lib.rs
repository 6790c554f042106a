pub const FRAME_WIDTH: usize = 84;
pub const FRAME_HEIGHT: usize = 84;
/// Frames stacked into one network input.
pub const HISTORY_LEN: usize = 4;

pub mod env;
pub mod error;
pub mod eval;
pub mod exploration;
pub mod frame;
pub mod nes;
pub mod optim;
pub mod params;
pub mod shared;
pub mod simulator;
pub mod state;
pub mod train;
pub mod value_fn;
pub mod worker;

pub use env::{EnvConfig, Environment, EpisodeState, Phase, StepOutcome};
pub use error::{TrainError, TrainResult};
pub use eval::{EvalStats, run_eval};
pub use exploration::{EpsilonGreedy, ExplorationConfig, greedy};
pub use frame::{FrameRingBuffer, PreprocessedFrame, Preprocessor, RawFrame, preprocess};
pub use nes::{GameProfile, NesAction, NesFactory, NesSimulator};
pub use optim::{Adam, Optimizer, OptimizerConfig, Sgd};
pub use params::{GradientAccumulator, ParamSet, ParamTensor};
pub use shared::{SharedParameters, WeightSnapshot};
pub use simulator::{ActionId, NOOP, Simulator, SimulatorFactory};
pub use state::StateWindow;
pub use train::{Orchestrator, TrainConfig, TrainSummary};
pub use value_fn::{QNetwork, QNetworkFactory, ValueFunction, ValueFunctionFactory};
pub use worker::{ActorLearner, WorkerConfig, WorkerReport, WorkerStats};
