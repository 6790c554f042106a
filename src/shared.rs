use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::trace;

use crate::error::{TrainError, TrainResult};
use crate::optim::Optimizer;
use crate::params::ParamSet;

/// Immutable published copy of a parameter set.
#[derive(Debug, Clone)]
pub struct WeightSnapshot {
    pub version: u64,
    pub params: Arc<ParamSet>,
}

struct Learner {
    online: ParamSet,
    optimizer: Box<dyn Optimizer>,
}

/// Online and target parameters shared by every worker.
///
/// All mutation goes through one mutex, so applies never overlap and a sync
/// always copies a complete post-apply online set. Readers only ever see
/// published snapshots.
pub struct SharedParameters {
    learner: Mutex<Learner>,
    online: RwLock<WeightSnapshot>,
    target: RwLock<WeightSnapshot>,
    online_version: AtomicU64,
    target_version: AtomicU64,
    applies: AtomicU64,
    syncs: AtomicU64,
    global_steps: AtomicU64,
}

impl SharedParameters {
    /// Online and target both start as `initial`.
    pub fn new(initial: ParamSet, optimizer: Box<dyn Optimizer>) -> Self {
        let published = Arc::new(initial.clone());
        Self {
            learner: Mutex::new(Learner {
                online: initial,
                optimizer,
            }),
            online: RwLock::new(WeightSnapshot {
                version: 0,
                params: published.clone(),
            }),
            target: RwLock::new(WeightSnapshot {
                version: 0,
                params: published,
            }),
            online_version: AtomicU64::new(0),
            target_version: AtomicU64::new(0),
            applies: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
            global_steps: AtomicU64::new(0),
        }
    }

    /// Apply one accumulated gradient to the online parameters and publish
    /// the result. Returns the new online version.
    pub fn apply_gradient(&self, grads: &ParamSet) -> TrainResult<u64> {
        let mut learner = self
            .learner
            .lock()
            .map_err(|_| TrainError::LockPoisoned("shared parameters"))?;
        let Learner { online, optimizer } = &mut *learner;
        optimizer.apply(online, grads)?;

        let version = self.online_version.load(Ordering::SeqCst) + 1;
        let snapshot = WeightSnapshot {
            version,
            params: Arc::new(online.clone()),
        };
        *self
            .online
            .write()
            .map_err(|_| TrainError::LockPoisoned("online snapshot"))? = snapshot;
        self.online_version.store(version, Ordering::SeqCst);
        self.applies.fetch_add(1, Ordering::SeqCst);
        trace!(version, "gradient applied");
        Ok(version)
    }

    /// Copy the online parameters into the target wholesale. Returns the new
    /// target version.
    pub fn sync_target(&self) -> TrainResult<u64> {
        // Held so no apply can land between reading online and publishing.
        let _learner = self
            .learner
            .lock()
            .map_err(|_| TrainError::LockPoisoned("shared parameters"))?;
        let params = self.online_snapshot()?.params;

        let version = self.target_version.load(Ordering::SeqCst) + 1;
        *self
            .target
            .write()
            .map_err(|_| TrainError::LockPoisoned("target snapshot"))? =
            WeightSnapshot { version, params };
        self.target_version.store(version, Ordering::SeqCst);
        self.syncs.fetch_add(1, Ordering::SeqCst);
        trace!(version, "target synced");
        Ok(version)
    }

    pub fn online_snapshot(&self) -> TrainResult<WeightSnapshot> {
        self.online
            .read()
            .map(|s| s.clone())
            .map_err(|_| TrainError::LockPoisoned("online snapshot"))
    }

    pub fn target_snapshot(&self) -> TrainResult<WeightSnapshot> {
        self.target
            .read()
            .map(|s| s.clone())
            .map_err(|_| TrainError::LockPoisoned("target snapshot"))
    }

    /// Err with `TargetDiverged` unless target equals online bit for bit.
    pub fn verify_target(&self) -> TrainResult<()> {
        let learner = self
            .learner
            .lock()
            .map_err(|_| TrainError::LockPoisoned("shared parameters"))?;
        if learner.online.bit_eq(&self.target_snapshot()?.params) {
            Ok(())
        } else {
            Err(TrainError::TargetDiverged)
        }
    }

    pub fn online_version(&self) -> u64 {
        self.online_version.load(Ordering::SeqCst)
    }

    pub fn target_version(&self) -> u64 {
        self.target_version.load(Ordering::SeqCst)
    }

    pub fn apply_count(&self) -> u64 {
        self.applies.load(Ordering::SeqCst)
    }

    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::SeqCst)
    }

    /// Count one worker step; returns the new global total.
    pub fn record_step(&self) -> u64 {
        self.global_steps.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn global_steps(&self) -> u64 {
        self.global_steps.load(Ordering::SeqCst)
    }
}
