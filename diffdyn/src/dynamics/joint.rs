use na::{Isometry3, Translation3, Unit, UnitQuaternion, Vector3, Vector6};
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum JointType {
    /// Rigid attachment without any degrees of freedom.
    Weld,
    /// Rotation about `axis` expressed in the joint frame.
    Revolute { axis: [f64; 3] },
    /// Translation along `axis` expressed in the joint frame.
    Prismatic { axis: [f64; 3] },
}

impl JointType {
    pub fn num_dofs(&self) -> usize {
        match self {
            JointType::Weld => 0,
            JointType::Revolute { .. } | JointType::Prismatic { .. } => 1,
        }
    }

    fn unit_axis(axis: &[f64; 3]) -> Unit<Vector3<f64>> {
        Unit::new_normalize(Vector3::from(*axis))
    }

    /// Spatial motion subspace in the child frame, zero for welds.
    pub fn motion_subspace(&self) -> Vector6<f64> {
        match self {
            JointType::Weld => Vector6::zeros(),
            JointType::Revolute { axis } => {
                let a = Self::unit_axis(axis);
                Vector6::new(a.x, a.y, a.z, 0.0, 0.0, 0.0)
            }
            JointType::Prismatic { axis } => {
                let a = Self::unit_axis(axis);
                Vector6::new(0.0, 0.0, 0.0, a.x, a.y, a.z)
            }
        }
    }

    /// Relative transform introduced by the joint at position `q`.
    pub fn motion(&self, q: f64) -> Isometry3<f64> {
        match self {
            JointType::Weld => Isometry3::identity(),
            JointType::Revolute { axis } => Isometry3::from_parts(
                Translation3::identity(),
                UnitQuaternion::from_axis_angle(&Self::unit_axis(axis), q),
            ),
            JointType::Prismatic { axis } => Isometry3::from_parts(
                Translation3::from(Self::unit_axis(axis).into_inner() * q),
                UnitQuaternion::identity(),
            ),
        }
    }

    fn is_valid(&self) -> bool {
        match self {
            JointType::Weld => true,
            JointType::Revolute { axis } | JointType::Prismatic { axis } => {
                Vector3::from(*axis).norm() > 0.0
            }
        }
    }
}

/// Description of a joint connecting a new body to its parent.
///
/// The dynamic properties apply to the joint's degree of freedom and are
/// ignored for welds.
#[derive(Clone, Debug, PartialEq)]
pub struct JointProperties {
    pub name: String,
    pub joint_type: JointType,
    /// Pose of the joint frame in the parent body frame (or world frame for roots).
    pub transform_from_parent: Isometry3<f64>,
    pub damping: f64,
    pub spring_stiffness: f64,
    pub rest_position: f64,
    pub position_limits: (f64, f64),
    pub velocity_limits: (f64, f64),
    pub force_limits: (f64, f64),
}

impl JointProperties {
    pub fn new(name: impl Into<String>, joint_type: JointType) -> Self {
        JointProperties {
            name: name.into(),
            joint_type,
            transform_from_parent: Isometry3::identity(),
            damping: 0.0,
            spring_stiffness: 0.0,
            rest_position: 0.0,
            position_limits: (f64::NEG_INFINITY, f64::INFINITY),
            velocity_limits: (f64::NEG_INFINITY, f64::INFINITY),
            force_limits: (f64::NEG_INFINITY, f64::INFINITY),
        }
    }

    pub fn weld(name: impl Into<String>) -> Self {
        Self::new(name, JointType::Weld)
    }

    pub fn revolute(name: impl Into<String>, axis: [f64; 3]) -> Self {
        Self::new(name, JointType::Revolute { axis })
    }

    pub fn prismatic(name: impl Into<String>, axis: [f64; 3]) -> Self {
        Self::new(name, JointType::Prismatic { axis })
    }

    pub fn with_transform_from_parent(mut self, transform: Isometry3<f64>) -> Self {
        self.transform_from_parent = transform;
        self
    }

    pub fn with_offset(self, offset: [f64; 3]) -> Self {
        self.with_transform_from_parent(Isometry3::translation(offset[0], offset[1], offset[2]))
    }

    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    pub fn with_spring(mut self, stiffness: f64, rest_position: f64) -> Self {
        self.spring_stiffness = stiffness;
        self.rest_position = rest_position;
        self
    }

    pub fn with_position_limits(mut self, lower: f64, upper: f64) -> Self {
        self.position_limits = (lower, upper);
        self
    }

    pub fn with_velocity_limits(mut self, lower: f64, upper: f64) -> Self {
        self.velocity_limits = (lower, upper);
        self
    }

    pub fn with_force_limits(mut self, lower: f64, upper: f64) -> Self {
        self.force_limits = (lower, upper);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), crate::Error> {
        let invalid = |name: &str| crate::Error::InvalidParameter {
            name: format!("{}.{}", self.name, name),
        };
        if !self.joint_type.is_valid() {
            return Err(invalid("axis"));
        }
        if self.damping < 0.0 {
            return Err(invalid("damping"));
        }
        if self.spring_stiffness < 0.0 {
            return Err(invalid("spring_stiffness"));
        }
        Ok(())
    }
}

/// A joint connecting body `child_body` to its parent.
#[derive(Clone, Debug)]
pub struct Joint {
    pub(crate) name: String,
    pub(crate) joint_type: JointType,
    pub(crate) transform_from_parent: Isometry3<f64>,
    pub(crate) index_in_skeleton: usize,
    pub(crate) child_body: usize,
    /// Skeleton index of the degree of freedom driven by this joint.
    pub(crate) dof: Option<usize>,
}

impl Joint {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn joint_type(&self) -> JointType {
        self.joint_type
    }

    pub fn transform_from_parent(&self) -> &Isometry3<f64> {
        &self.transform_from_parent
    }

    pub fn index_in_skeleton(&self) -> usize {
        self.index_in_skeleton
    }

    pub fn child_body(&self) -> usize {
        self.child_body
    }

    pub fn dof(&self) -> Option<usize> {
        self.dof
    }

    pub fn num_dofs(&self) -> usize {
        self.joint_type.num_dofs()
    }

    /// Pose of the child body frame in the parent frame at joint position `q`.
    pub fn relative_transform(&self, q: f64) -> Isometry3<f64> {
        self.transform_from_parent * self.joint_type.motion(q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::*;
    use na::Point3;

    #[test]
    fn revolute_motion_rotates_about_axis() {
        let joint = JointType::Revolute { axis: [0.0, 0.0, 2.0] };
        let p = joint.motion(std::f64::consts::FRAC_PI_2) * Point3::new(1.0, 0.0, 0.0);
        assert_relative_eq!(p, Point3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
        assert_eq!(joint.motion_subspace(), Vector6::new(0.0, 0.0, 1.0, 0.0, 0.0, 0.0));
    }

    #[test]
    fn prismatic_motion_translates() {
        let joint = JointType::Prismatic { axis: [0.0, 1.0, 0.0] };
        let p = joint.motion(0.5) * Point3::origin();
        assert_relative_eq!(p, Point3::new(0.0, 0.5, 0.0));
        assert_eq!(joint.num_dofs(), 1);
        assert_eq!(JointType::Weld.num_dofs(), 0);
    }

    #[test]
    fn invalid_properties_are_rejected() {
        assert!(JointProperties::revolute("j", [0.0; 3]).validate().is_err());
        assert!(JointProperties::weld("j").with_damping(-1.0).validate().is_err());
        assert!(JointProperties::prismatic("j", [1.0, 0.0, 0.0])
            .with_spring(2.0, 0.1)
            .validate()
            .is_ok());
    }
}
