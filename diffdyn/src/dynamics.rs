mod body;
pub mod cache;
mod derivatives;
pub(crate) mod dof;
mod joint;
pub(crate) mod recursive;
mod skeleton;
pub mod support;

pub use body::{BodyNode, BodyProperties};
pub use cache::{Cached, Change, DirtyFlags};
pub use derivatives::WithRespectTo;
pub use dof::DegreeOfFreedom;
pub use joint::{Joint, JointProperties, JointType};
pub use skeleton::{SharedSkeleton, Skeleton};
pub use support::SupportGeometry;
