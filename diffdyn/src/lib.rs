pub mod dynamics;
pub mod math;
pub mod neural;
pub mod realtime;
pub mod simulation;

// Shared fixtures for unit tests, integration tests, benches and the eval binary.
pub mod test_utils;

pub use self::dynamics::*;
pub use self::neural::{
    forward_pass, BackpropSnapshot, ConstrainedGroupGradientMatrices, LossGradient,
    MatrixToAssemble, VectorToAssemble,
};
pub use self::realtime::{Ssid, SsidParams, VectorLog};
pub use self::simulation::{ConstraintSolver, RestorableSnapshot, World};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Index {index} is out of range for {container} of length {len}")]
    IndexOutOfRange {
        container: &'static str,
        index: usize,
        len: usize,
    },
    #[error("Size mismatch for {what}: expected {expected}, got {actual}")]
    SizeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Unknown skeleton: {name:?}")]
    UnknownSkeleton { name: String },
    #[error("Unknown body: {name:?}")]
    UnknownBody { name: String },
    #[error("Duplicate name: {name:?}")]
    DuplicateName { name: String },
    #[error("Cannot assemble {kind:?} with {element} elements")]
    VectorKindMismatch {
        kind: VectorToAssemble,
        element: &'static str,
    },
    #[error("The estimator must be stopped to change its configuration")]
    EstimatorRunning,
    #[error("Missing collaborator: {name:?}")]
    MissingCollaborator { name: String },
    #[error("Failed to spawn worker thread")]
    WorkerSpawn {
        #[from]
        source: std::io::Error,
    },
    #[error("Estimation worker panicked")]
    WorkerPanicked,
    #[error("Invalid parameter: {name:?}")]
    InvalidParameter { name: String },
    #[error("Optimization failed: {reason}")]
    OptimizationFailed { reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn check_size(what: &'static str, expected: usize, actual: usize) -> Result<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(Error::SizeMismatch {
                what,
                expected,
                actual,
            })
        }
    }

    pub(crate) fn check_index(container: &'static str, index: usize, len: usize) -> Result<()> {
        if index < len {
            Ok(())
        } else {
            Err(Error::IndexOutOfRange {
                container,
                index,
                len,
            })
        }
    }
}
