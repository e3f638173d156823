mod world;

pub use world::{ConstraintSolver, RestorableSnapshot, World};
