use std::sync::Arc;

use na::{DMatrix, DVector, Vector3};
use rand::{Rng, SeedableRng};

use crate::dynamics::{BodyProperties, JointProperties, JointType, Skeleton};
use crate::neural::{
    ConstrainedGroupGradientMatrices, ConstraintClassification, GroupSkeleton, CLAMPING,
};
use crate::simulation::{ConstraintSolver, World};
use crate::Result;

pub const ARM_LINK_LENGTH: f64 = 1.0;
pub const ARM_LINK_MASS: f64 = 1.0;
/// Rotational inertia of an arm link about its center of mass.
pub const ARM_LINK_INERTIA: f64 = 0.01;

#[cfg(test)]
pub(crate) fn init_logger() {
    let _ = env_logger::Builder::from_env("DIFFDYN_LOG")
        .is_test(true)
        .try_init();
}

/// A planar two link arm rotating about `z` with gravity along `-y`.
///
/// Each link is `ARM_LINK_LENGTH` long with its center of mass at the middle.
pub fn make_two_link_arm() -> Skeleton {
    let mut skel = Skeleton::new("arm");
    skel.set_gravity(Vector3::new(0.0, -9.81, 0.0));
    let link = |name: &str| {
        BodyProperties::new(name, ARM_LINK_MASS)
            .with_local_com([0.5 * ARM_LINK_LENGTH, 0.0, 0.0])
            .with_principal_inertia([ARM_LINK_INERTIA; 3])
    };
    // Both calls are valid by construction.
    let upper = skel
        .add_body(
            None,
            JointProperties::revolute("shoulder", [0.0, 0.0, 1.0]),
            link("upper"),
        )
        .unwrap_or(0);
    let _ = skel.add_body(
        Some(upper),
        JointProperties::revolute("elbow", [0.0, 0.0, 1.0])
            .with_offset([ARM_LINK_LENGTH, 0.0, 0.0]),
        link("lower"),
    );
    skel
}

/// Two trees: `root` with a child `child` which has a child `grandchild`,
/// and a separate single body tree `other_root`.
///
/// Bodies are added so that body and DOF indices are
/// `root = 0`, `child = 1`, `other_root = 2`, `grandchild = 3`.
pub fn make_forked_skeleton() -> Skeleton {
    let mut skel = Skeleton::new("forked");
    let bodies = [
        (
            None,
            JointProperties::revolute("root_joint", [0.0, 0.0, 1.0]),
            BodyProperties::new("root", 1.0).with_local_com([0.3, 0.0, 0.0]),
        ),
        (
            Some(0),
            JointProperties::revolute("child_joint", [0.0, 1.0, 0.0]).with_offset([0.6, 0.0, 0.0]),
            BodyProperties::new("child", 0.7)
                .with_local_com([0.2, 0.1, 0.0])
                .with_principal_inertia([0.02, 0.03, 0.04]),
        ),
        (
            None,
            JointProperties::prismatic("other_root_joint", [1.0, 0.0, 0.0]),
            BodyProperties::new("other_root", 2.0),
        ),
        (
            Some(1),
            JointProperties::revolute("grandchild_joint", [1.0, 0.0, 0.0])
                .with_offset([0.4, 0.0, 0.1]),
            BodyProperties::new("grandchild", 0.5)
                .with_local_com([0.0, 0.2, 0.0])
                .with_principal_inertia([0.01, 0.01, 0.02]),
        ),
    ];
    for (parent, joint, body) in bodies {
        let _ = skel.add_body(parent, joint, body);
    }
    skel
}

/// A unit box of mass 1 sliding along `z` with its bottom face at `z = -0.5`.
pub fn make_prismatic_box() -> Skeleton {
    let mut skel = Skeleton::new("box");
    let corners = [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)]
        .iter()
        .map(|&(x, y)| Vector3::new(x, y, -0.5))
        .collect();
    let _ = skel.add_body(
        None,
        JointProperties::prismatic("slider", [0.0, 0.0, 1.0]),
        BodyProperties::new("box", 1.0)
            .with_principal_inertia([1.0 / 6.0; 3])
            .with_support_points(corners),
    );
    skel
}

/// A serial chain of `links` revolute joints alternating between `z` and `y` axes.
pub fn make_chain(name: &str, links: usize) -> Skeleton {
    let mut skel = Skeleton::new(name);
    let mut parent = None;
    for i in 0..links {
        let axis = if i % 2 == 0 { [0.0, 0.0, 1.0] } else { [0.0, 1.0, 0.0] };
        let offset = if i == 0 { [0.0; 3] } else { [0.5, 0.0, 0.0] };
        let joint = JointProperties::revolute(format!("joint{}", i), axis)
            .with_offset(offset)
            .with_damping(0.01);
        let body = BodyProperties::new(format!("link{}", i), 1.0)
            .with_local_com([0.25, 0.0, 0.0])
            .with_principal_inertia([0.01, 0.02, 0.02]);
        parent = skel.add_body(parent, joint, body).ok();
    }
    skel
}

/// The two link arm followed by the prismatic box.
pub fn make_arm_and_box_world() -> World {
    let mut world = World::new();
    let _ = world.add_skeleton(make_two_link_arm());
    let _ = world.add_skeleton(make_prismatic_box());
    world
}

fn rng(seed: u64) -> rand::rngs::StdRng {
    if cfg!(feature = "deterministic") {
        rand::rngs::StdRng::seed_from_u64(seed)
    } else {
        rand::rngs::StdRng::from_entropy()
    }
}

/// Uniformly random positions, velocities and forces in `[-1, 1]`.
pub fn randomize_state(skel: &mut Skeleton, seed: u64) {
    let mut rng = rng(seed);
    let n = skel.num_dofs();
    let mut sample = || DVector::from_fn(n, |_, _| rng.gen_range(-1.0..=1.0));
    let q = sample();
    let v = sample();
    let f = sample();
    let _ = skel.set_positions(&q);
    let _ = skel.set_velocities(&v);
    let _ = skel.set_forces(&f);
}

/// A minimal contact model: skeletons whose first root joint is prismatic
/// along gravity rest on a floor at `height`.
///
/// A contact is active when the joint position is at or below the floor and
/// the joint is moving down. The impulse reverses the joint velocity scaled by
/// `restitution`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FloorSolver {
    pub height: f64,
    pub restitution: f64,
}

const FLOOR_TOLERANCE: f64 = 1e-9;

impl FloorSolver {
    pub fn new(height: f64, restitution: f64) -> Self {
        FloorSolver {
            height,
            restitution,
        }
    }

    fn floor_dof(skel: &Skeleton) -> Option<usize> {
        let root = skel.root_body(0).ok()?;
        let joint = skel.joint(root).ok()?;
        match joint.joint_type() {
            JointType::Prismatic { axis } => {
                let axis = Vector3::from(axis);
                let up = -skel.gravity();
                if up.norm() > 0.0 && axis.dot(&up) > 0.99 * axis.norm() * up.norm() {
                    joint.dof()
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

impl ConstraintSolver for FloorSolver {
    fn solve(
        &mut self,
        skeletons: &mut [Skeleton],
        _time_step: f64,
        gradient_enabled: bool,
    ) -> Result<()> {
        for skel in skeletons.iter_mut() {
            let dof = match Self::floor_dof(skel) {
                Some(dof) => dof,
                None => continue,
            };
            let q = skel.positions()[dof];
            let v = skel.velocities()[dof];
            if q > self.height + FLOOR_TOLERANCE || v >= 0.0 {
                continue;
            }

            let n = skel.num_dofs();
            let minv = skel.inv_mass_matrix().column(dof).into_owned();
            let impulse = -(1.0 + self.restitution) * v / minv[dof];
            let velocities = skel.velocities() + &minv * impulse;
            skel.set_velocities(&velocities)?;
            log::trace!("Floor contact on {:?} with impulse {}", skel.name(), impulse);

            if gradient_enabled {
                let mut normal = DMatrix::zeros(n, 1);
                normal[(dof, 0)] = 1.0;
                let mut data = ConstraintClassification::empty(n);
                data.massed_clamping = DMatrix::from_column_slice(n, 1, minv.as_slice());
                data.upper_bound_mapping = DMatrix::zeros(0, 1);
                data.bounce_diagonals = DVector::from_element(1, 1.0 + self.restitution);
                if self.restitution > 0.0 {
                    data.bouncing = normal.clone();
                    data.restitution_diagonals = DVector::from_element(1, self.restitution);
                }
                data.clamping = normal;
                data.contact_impulses = DVector::from_element(1, impulse);
                data.contact_mappings = DVector::from_element(1, CLAMPING);
                let group =
                    ConstrainedGroupGradientMatrices::new(vec![GroupSkeleton::of(skel)], data)?;
                skel.set_gradient_constraint_matrices(Arc::new(group));
            }
        }
        Ok(())
    }
}
