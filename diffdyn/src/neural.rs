//! Jacobians of a single simulation step through contact constraints.

mod constrained_group;
mod snapshot;

pub use constrained_group::{
    ConstrainedGroupGradientMatrices, ConstraintClassification, GroupSkeleton, CLAMPING,
    IRRELEVANT, NOT_CLAMPING,
};
pub use snapshot::{
    forward_pass, AssembledElement, BackpropSnapshot, LossGradient, MatrixToAssemble,
    VectorToAssemble,
};
