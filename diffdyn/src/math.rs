pub mod finite_difference;
pub mod linalg;
pub mod spatial;

pub use finite_difference::FiniteDifference;
pub use linalg::{pseudo_inverse, solve_least_squares};
pub use spatial::{crf, crm, plucker_motion, skew, spatial_inertia};
