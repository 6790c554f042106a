use thiserror::Error;

/// Errors surfaced by the training core.
///
/// Collaborator failures (simulator, network) arrive as `anyhow::Error` and are
/// wrapped here together with the worker id and step so a failed run can be
/// reproduced.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("worker {worker}: environment initialization failed: {cause:#}")]
    EnvInit { worker: usize, cause: anyhow::Error },

    #[error("worker {worker} step {step}: environment failure: {cause:#}")]
    Env {
        worker: usize,
        step: u64,
        cause: anyhow::Error,
    },

    #[error("worker {worker} step {step}: value function failure: {cause:#}")]
    ValueFunction {
        worker: usize,
        step: u64,
        cause: anyhow::Error,
    },

    #[error("shape mismatch for `{name}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("parameter `{0}` missing from gradient set")]
    MissingParameter(String),

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),

    #[error("worker {worker} aborted the run at step {step}: {cause}")]
    Aborted {
        worker: usize,
        step: u64,
        cause: Box<TrainError>,
    },

    /// Every worker stopped on an error; `failures` holds each one by worker id.
    #[error("no worker completed its run ({} failed)", .failures.len())]
    NoWorkers { failures: Vec<(usize, TrainError)> },

    #[error("target parameters differ from online parameters after final sync")]
    TargetDiverged,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrainError {
    /// Parameter corruption: continuing would silently train on wrong values.
    pub fn is_fatal_global(&self) -> bool {
        match self {
            TrainError::ShapeMismatch { .. }
            | TrainError::MissingParameter(_)
            | TrainError::TargetDiverged => true,
            TrainError::Aborted { .. } => true,
            _ => false,
        }
    }
}

pub type TrainResult<T> = std::result::Result<T, TrainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_mismatch_is_fatal_global() {
        let err = TrainError::ShapeMismatch {
            name: "fc1.weight".into(),
            expected: vec![2, 3],
            actual: vec![3, 2],
        };
        assert!(err.is_fatal_global());
        assert!(err.to_string().contains("fc1.weight"));
    }

    #[test]
    fn init_failure_is_worker_local() {
        let err = TrainError::EnvInit {
            worker: 2,
            cause: anyhow::anyhow!("no such rom"),
        };
        assert!(!err.is_fatal_global());
        assert_eq!(
            err.to_string(),
            "worker 2: environment initialization failed: no such rom"
        );
    }

    #[test]
    fn no_workers_counts_every_failure() {
        let err = TrainError::NoWorkers {
            failures: vec![
                (0, anyhow::anyhow!("no such rom").into()),
                (1, TrainError::InvalidConfig("x".into())),
            ],
        };
        assert!(!err.is_fatal_global());
        assert_eq!(err.to_string(), "no worker completed its run (2 failed)");
    }
}
