use std::cell::Ref;
use std::sync::{Arc, Mutex};

use na::{DMatrix, DVector, Isometry3, Matrix3, Matrix6, Point3, Vector3, Vector6};

use super::body::{validate_inertia, validate_mass, BodyNode, BodyProperties};
use super::cache::{Cached, Change, DataCache, DirtyFlags};
use super::dof::{DegreeOfFreedom, DofState};
use super::joint::{Joint, JointProperties};
use super::recursive::TreeModel;
use super::support::{compute_support_geometry, SupportGeometry};
use crate::math::plucker_motion;
use crate::neural::ConstrainedGroupGradientMatrices;
use crate::{Error, Result};

/// A skeleton behind the mutex that serializes access from multiple threads.
///
/// The caches of a skeleton are not thread safe and never lock internally.
pub type SharedSkeleton = Arc<Mutex<Skeleton>>;

#[derive(Clone, Debug, Default)]
struct TreeData {
    /// Skeleton indices of the bodies in this tree, parents first.
    bodies: Vec<usize>,
    /// Skeleton indices of the degrees of freedom in this tree.
    dofs: Vec<usize>,
    cache: DataCache,
}

/// A collection of rigid bodies connected by joints, forming one or more
/// kinematic trees.
///
/// Body `i` is driven by joint `i` and bodies are stored parents first.
/// Dynamics quantities are computed lazily per tree and cached until a
/// setter invalidates them (see [`Change`](super::Change)).
#[derive(Clone, Debug)]
pub struct Skeleton {
    name: String,
    bodies: Vec<BodyNode>,
    joints: Vec<Joint>,
    dofs: Vec<DegreeOfFreedom>,
    trees: Vec<TreeData>,
    cache: DataCache,
    gravity: Vector3<f64>,
    time_step: f64,
    mobile: bool,
    gradient_constraint_matrices: Option<Arc<ConstrainedGroupGradientMatrices>>,
}

impl Skeleton {
    pub fn new(name: impl Into<String>) -> Self {
        Skeleton {
            name: name.into(),
            bodies: Vec::new(),
            joints: Vec::new(),
            dofs: Vec::new(),
            trees: Vec::new(),
            cache: DataCache::default(),
            gravity: Vector3::new(0.0, 0.0, -9.81),
            time_step: 0.001,
            mobile: true,
            gradient_constraint_matrices: None,
        }
    }

    pub fn into_shared(self) -> SharedSkeleton {
        Arc::new(Mutex::new(self))
    }

    /*
     * Topology
     */

    /// Attach a new body to `parent`, or start a new tree if `parent` is `None`.
    /// Returns the index of the new body.
    pub fn add_body(
        &mut self,
        parent: Option<usize>,
        joint: JointProperties,
        body: BodyProperties,
    ) -> Result<usize> {
        joint.validate()?;
        body.validate()?;
        if let Some(p) = parent {
            Error::check_index("bodies", p, self.bodies.len())?;
        }
        if self.bodies.iter().any(|b| b.name == body.name) {
            return Err(Error::DuplicateName { name: body.name });
        }
        if self.joints.iter().any(|j| j.name == joint.name) {
            return Err(Error::DuplicateName { name: joint.name });
        }

        let index = self.bodies.len();
        let dof = if joint.joint_type.num_dofs() > 0 {
            self.dofs.push(DegreeOfFreedom::from_joint(&joint, index));
            Some(self.dofs.len() - 1)
        } else {
            None
        };
        self.joints.push(Joint {
            name: joint.name,
            joint_type: joint.joint_type,
            transform_from_parent: joint.transform_from_parent,
            index_in_skeleton: index,
            child_body: index,
            dof,
        });
        self.bodies.push(BodyNode::from_properties(body, parent));
        self.rebuild_topology();
        Ok(index)
    }

    /// Remove `body` together with all of its descendants.
    pub fn remove_body(&mut self, body: usize) -> Result<()> {
        Error::check_index("bodies", body, self.bodies.len())?;
        let mut removed = vec![false; self.bodies.len()];
        removed[body] = true;
        for i in body + 1..self.bodies.len() {
            let in_subtree = self.bodies[i].parent.map_or(false, |p| removed[p]);
            removed[i] = in_subtree;
        }

        let mut new_index = vec![None; self.bodies.len()];
        let mut count = 0;
        for (i, &gone) in removed.iter().enumerate() {
            if !gone {
                new_index[i] = Some(count);
                count += 1;
            }
        }

        let bodies = std::mem::take(&mut self.bodies);
        let joints = std::mem::take(&mut self.joints);
        let mut old_dofs: Vec<Option<DegreeOfFreedom>> =
            std::mem::take(&mut self.dofs).into_iter().map(Some).collect();
        for (i, (mut b, mut j)) in bodies.into_iter().zip(joints).enumerate() {
            if removed[i] {
                continue;
            }
            b.parent = b.parent.and_then(|p| new_index[p]);
            j.dof = j.dof.and_then(|d| old_dofs[d].take()).map(|dof| {
                self.dofs.push(dof);
                self.dofs.len() - 1
            });
            self.bodies.push(b);
            self.joints.push(j);
        }
        self.rebuild_topology();
        Ok(())
    }

    /// Recompute all cached indices and tree memberships and reset every cache.
    fn rebuild_topology(&mut self) {
        self.trees.clear();
        for body in self.bodies.iter_mut() {
            body.children.clear();
        }
        for i in 0..self.bodies.len() {
            let parent = self.bodies[i].parent;
            let tree = match parent {
                Some(p) => self.bodies[p].tree,
                None => {
                    self.trees.push(TreeData::default());
                    self.trees.len() - 1
                }
            };
            if let Some(p) = parent {
                self.bodies[p].children.push(i);
            }
            let body = &mut self.bodies[i];
            body.index_in_skeleton = i;
            body.tree = tree;
            body.index_in_tree = self.trees[tree].bodies.len();
            self.trees[tree].bodies.push(i);

            let joint = &mut self.joints[i];
            joint.index_in_skeleton = i;
            joint.child_body = i;
            if let Some(d) = joint.dof {
                let dof = &mut self.dofs[d];
                dof.index_in_skeleton = d;
                dof.joint = i;
                dof.tree = tree;
                dof.index_in_tree = self.trees[tree].dofs.len();
                self.trees[tree].dofs.push(d);
            }
        }
        self.cache = DataCache::default();
        log::debug!(
            "Skeleton {:?}: {} bodies, {} dofs, {} trees",
            self.name,
            self.bodies.len(),
            self.dofs.len(),
            self.trees.len()
        );
    }

    /// Verify that every cached index matches the actual position of its
    /// owner in each container. Intended for tests and assertions.
    pub fn check_indexing_consistency(&self) -> bool {
        let mut consistent = true;
        let mut fail = |what: String| {
            log::warn!("Skeleton {:?} indexing inconsistency: {}", self.name, what);
            consistent = false;
        };
        if self.bodies.len() != self.joints.len() {
            fail(format!(
                "{} bodies but {} joints",
                self.bodies.len(),
                self.joints.len()
            ));
            return false;
        }
        for (i, body) in self.bodies.iter().enumerate() {
            if body.index_in_skeleton != i {
                fail(format!("body {} thinks it is {}", i, body.index_in_skeleton));
            }
            if let Some(p) = body.parent {
                if p >= i || !self.bodies[p].children.contains(&i) {
                    fail(format!("body {} has an invalid parent {}", i, p));
                }
            }
            let orphaned = body
                .children
                .iter()
                .any(|&c| self.bodies.get(c).and_then(|c| c.parent) != Some(i));
            if orphaned {
                fail(format!("body {} has an invalid child list", i));
            }
            if self.trees.get(body.tree).and_then(|t| t.bodies.get(body.index_in_tree)) != Some(&i)
            {
                fail(format!("body {} is not at its tree index", i));
            }
        }
        for (i, joint) in self.joints.iter().enumerate() {
            if joint.index_in_skeleton != i || joint.child_body != i {
                fail(format!("joint {} has stale indices", i));
            }
            if joint.num_dofs() != joint.dof.map_or(0, |_| 1) {
                fail(format!("joint {} has the wrong number of dofs", i));
            }
            if let Some(d) = joint.dof {
                if self.dofs.get(d).map(|dof| dof.joint) != Some(i) {
                    fail(format!("joint {} and dof {} disagree", i, d));
                }
            }
        }
        for (i, dof) in self.dofs.iter().enumerate() {
            if dof.index_in_skeleton != i {
                fail(format!("dof {} thinks it is {}", i, dof.index_in_skeleton));
            }
            if self.trees.get(dof.tree).and_then(|t| t.dofs.get(dof.index_in_tree)) != Some(&i) {
                fail(format!("dof {} is not at its tree index", i));
            }
        }
        let tree_bodies: usize = self.trees.iter().map(|t| t.bodies.len()).sum();
        let tree_dofs: usize = self.trees.iter().map(|t| t.dofs.len()).sum();
        if tree_bodies != self.bodies.len() || tree_dofs != self.dofs.len() {
            fail("trees do not partition the skeleton".to_string());
        }
        consistent
    }

    /*
     * Accessors
     */

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_bodies(&self) -> usize {
        self.bodies.len()
    }

    pub fn num_joints(&self) -> usize {
        self.joints.len()
    }

    pub fn num_dofs(&self) -> usize {
        self.dofs.len()
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn bodies(&self) -> &[BodyNode] {
        &self.bodies
    }

    pub fn joints(&self) -> &[Joint] {
        &self.joints
    }

    pub fn dofs(&self) -> &[DegreeOfFreedom] {
        &self.dofs
    }

    pub fn body(&self, index: usize) -> Result<&BodyNode> {
        Error::check_index("bodies", index, self.bodies.len())?;
        Ok(&self.bodies[index])
    }

    pub fn body_index(&self, name: &str) -> Result<usize> {
        self.bodies
            .iter()
            .position(|b| b.name == name)
            .ok_or_else(|| Error::UnknownBody {
                name: name.to_string(),
            })
    }

    pub fn joint(&self, index: usize) -> Result<&Joint> {
        Error::check_index("joints", index, self.joints.len())?;
        Ok(&self.joints[index])
    }

    pub fn dof(&self, index: usize) -> Result<&DegreeOfFreedom> {
        Error::check_index("dofs", index, self.dofs.len())?;
        Ok(&self.dofs[index])
    }

    fn check_tree(&self, tree: usize) -> Result<()> {
        Error::check_index("trees", tree, self.trees.len())
    }

    pub fn tree_bodies(&self, tree: usize) -> Result<&[usize]> {
        self.check_tree(tree)?;
        Ok(&self.trees[tree].bodies)
    }

    pub fn tree_dofs(&self, tree: usize) -> Result<&[usize]> {
        self.check_tree(tree)?;
        Ok(&self.trees[tree].dofs)
    }

    pub fn root_body(&self, tree: usize) -> Result<usize> {
        self.check_tree(tree)?;
        Ok(self.trees[tree].bodies[0])
    }

    pub fn total_mass(&self) -> f64 {
        self.bodies.iter().map(|b| b.mass).sum()
    }

    pub fn gravity(&self) -> Vector3<f64> {
        self.gravity
    }

    pub fn set_gravity(&mut self, gravity: Vector3<f64>) {
        self.gravity = gravity;
        self.invalidate_all(Change::Gravity);
    }

    pub fn time_step(&self) -> f64 {
        self.time_step
    }

    pub fn set_time_step(&mut self, time_step: f64) -> Result<()> {
        if !(time_step > 0.0) {
            return Err(Error::InvalidParameter {
                name: "time_step".to_string(),
            });
        }
        self.time_step = time_step;
        self.invalidate_all(Change::TimeStep);
        Ok(())
    }

    pub fn is_mobile(&self) -> bool {
        self.mobile
    }

    pub fn set_mobile(&mut self, mobile: bool) {
        self.mobile = mobile;
    }

    pub fn gradient_constraint_matrices(&self) -> Option<&Arc<ConstrainedGroupGradientMatrices>> {
        self.gradient_constraint_matrices.as_ref()
    }

    pub fn set_gradient_constraint_matrices(
        &mut self,
        matrices: Arc<ConstrainedGroupGradientMatrices>,
    ) {
        self.gradient_constraint_matrices = Some(matrices);
    }

    pub fn clear_gradient_constraint_matrices(&mut self) {
        self.gradient_constraint_matrices = None;
    }

    /*
     * Invalidation
     */

    fn invalidate_tree(&mut self, tree: usize, change: Change) {
        self.trees[tree].cache.invalidate(change);
        self.cache.invalidate(change);
    }

    fn invalidate_all(&mut self, change: Change) {
        for tree in self.trees.iter_mut() {
            tree.cache.invalidate(change);
        }
        self.cache.invalidate(change);
    }

    /// Mark the articulated inertia of `tree` and everything derived from it
    /// as stale, for callers that modify the tree outside the regular setters.
    pub fn dirty_articulated_inertia(&mut self, tree: usize) -> Result<()> {
        self.check_tree(tree)?;
        self.invalidate_tree(tree, Change::ArticulatedInertia);
        Ok(())
    }

    /// Mark the support polygon of `tree` as stale.
    pub fn dirty_support_polygon(&mut self, tree: usize) -> Result<()> {
        self.check_tree(tree)?;
        self.invalidate_tree(tree, Change::SupportPolygon);
        Ok(())
    }

    /// Flags of the whole skeleton cache.
    pub fn dirty_flags(&self) -> DirtyFlags {
        self.cache.flags()
    }

    pub fn tree_dirty_flags(&self, tree: usize) -> Result<DirtyFlags> {
        self.check_tree(tree)?;
        Ok(self.trees[tree].cache.flags())
    }

    /*
     * Degree of freedom state
     */

    fn dof_values(&self, state: DofState) -> DVector<f64> {
        DVector::from_iterator(self.dofs.len(), self.dofs.iter().map(|d| d.state(state)))
    }

    fn set_dof_values(&mut self, state: DofState, values: &DVector<f64>) -> Result<()> {
        Error::check_size(state.name(), self.dofs.len(), values.len())?;
        self.write_dof_values(state, values);
        Ok(())
    }

    /// Overwrite one state of every DOF. `values` must have one entry per DOF.
    fn write_dof_values(&mut self, state: DofState, values: &DVector<f64>) {
        debug_assert_eq!(values.len(), self.dofs.len());
        let mut changed = vec![false; self.trees.len()];
        for (dof, &value) in self.dofs.iter_mut().zip(values.iter()) {
            let slot = dof.state_mut(state);
            if *slot != value {
                *slot = value;
                changed[dof.tree] = true;
            }
        }
        if let Some(change) = state.change() {
            for tree in (0..changed.len()).filter(|&t| changed[t]) {
                self.invalidate_tree(tree, change);
            }
        }
    }

    fn set_dof_value(&mut self, state: DofState, index: usize, value: f64) -> Result<()> {
        Error::check_index("dofs", index, self.dofs.len())?;
        let dof = &mut self.dofs[index];
        *dof.state_mut(state) = value;
        let tree = dof.tree;
        if let Some(change) = state.change() {
            self.invalidate_tree(tree, change);
        }
        Ok(())
    }

    pub fn positions(&self) -> DVector<f64> {
        self.dof_values(DofState::Position)
    }

    pub fn set_positions(&mut self, positions: &DVector<f64>) -> Result<()> {
        self.set_dof_values(DofState::Position, positions)
    }

    pub fn set_position(&mut self, dof: usize, position: f64) -> Result<()> {
        self.set_dof_value(DofState::Position, dof, position)
    }

    pub fn velocities(&self) -> DVector<f64> {
        self.dof_values(DofState::Velocity)
    }

    pub fn set_velocities(&mut self, velocities: &DVector<f64>) -> Result<()> {
        self.set_dof_values(DofState::Velocity, velocities)
    }

    pub fn set_velocity(&mut self, dof: usize, velocity: f64) -> Result<()> {
        self.set_dof_value(DofState::Velocity, dof, velocity)
    }

    pub fn accelerations(&self) -> DVector<f64> {
        self.dof_values(DofState::Acceleration)
    }

    pub fn set_accelerations(&mut self, accelerations: &DVector<f64>) -> Result<()> {
        self.set_dof_values(DofState::Acceleration, accelerations)
    }

    pub fn forces(&self) -> DVector<f64> {
        self.dof_values(DofState::Force)
    }

    pub fn set_forces(&mut self, forces: &DVector<f64>) -> Result<()> {
        self.set_dof_values(DofState::Force, forces)
    }

    pub fn set_force(&mut self, dof: usize, force: f64) -> Result<()> {
        self.set_dof_value(DofState::Force, dof, force)
    }

    /// Zero all joint forces.
    pub fn clear_internal_forces(&mut self) {
        for dof in self.dofs.iter_mut() {
            dof.force = 0.0;
        }
    }

    fn limits(&self, get: impl Fn(&DegreeOfFreedom) -> (f64, f64)) -> (DVector<f64>, DVector<f64>) {
        let n = self.dofs.len();
        (
            DVector::from_iterator(n, self.dofs.iter().map(|d| get(d).0)),
            DVector::from_iterator(n, self.dofs.iter().map(|d| get(d).1)),
        )
    }

    /// Lower and upper position limits.
    pub fn position_limits(&self) -> (DVector<f64>, DVector<f64>) {
        self.limits(|d| d.position_limits)
    }

    pub fn velocity_limits(&self) -> (DVector<f64>, DVector<f64>) {
        self.limits(|d| d.velocity_limits)
    }

    pub fn force_limits(&self) -> (DVector<f64>, DVector<f64>) {
        self.limits(|d| d.force_limits)
    }

    pub fn set_position_limits(&mut self, dof: usize, lower: f64, upper: f64) -> Result<()> {
        Error::check_index("dofs", dof, self.dofs.len())?;
        self.dofs[dof].position_limits = (lower, upper);
        Ok(())
    }

    pub fn set_velocity_limits(&mut self, dof: usize, lower: f64, upper: f64) -> Result<()> {
        Error::check_index("dofs", dof, self.dofs.len())?;
        self.dofs[dof].velocity_limits = (lower, upper);
        Ok(())
    }

    pub fn set_force_limits(&mut self, dof: usize, lower: f64, upper: f64) -> Result<()> {
        Error::check_index("dofs", dof, self.dofs.len())?;
        self.dofs[dof].force_limits = (lower, upper);
        Ok(())
    }

    pub fn set_damping(&mut self, dof: usize, damping: f64) -> Result<()> {
        Error::check_index("dofs", dof, self.dofs.len())?;
        if !(damping >= 0.0) {
            return Err(Error::InvalidParameter {
                name: "damping".to_string(),
            });
        }
        self.dofs[dof].damping = damping;
        let tree = self.dofs[dof].tree;
        self.invalidate_tree(tree, Change::JointDynamics);
        Ok(())
    }

    pub fn set_spring_stiffness(&mut self, dof: usize, stiffness: f64) -> Result<()> {
        Error::check_index("dofs", dof, self.dofs.len())?;
        if !(stiffness >= 0.0) {
            return Err(Error::InvalidParameter {
                name: "spring_stiffness".to_string(),
            });
        }
        self.dofs[dof].spring_stiffness = stiffness;
        let tree = self.dofs[dof].tree;
        self.invalidate_tree(tree, Change::JointDynamics);
        Ok(())
    }

    /// The rest position only enters the passive spring force, which is not cached.
    pub fn set_rest_position(&mut self, dof: usize, rest_position: f64) -> Result<()> {
        Error::check_index("dofs", dof, self.dofs.len())?;
        self.dofs[dof].rest_position = rest_position;
        Ok(())
    }

    /*
     * Body properties and forces
     */

    pub fn set_body_mass(&mut self, body: usize, mass: f64) -> Result<()> {
        Error::check_index("bodies", body, self.bodies.len())?;
        validate_mass(&self.bodies[body].name, mass)?;
        self.bodies[body].mass = mass;
        let tree = self.bodies[body].tree;
        self.invalidate_tree(tree, Change::MassProperties);
        Ok(())
    }

    pub fn set_body_inertia(&mut self, body: usize, inertia: Matrix3<f64>) -> Result<()> {
        Error::check_index("bodies", body, self.bodies.len())?;
        validate_inertia(&self.bodies[body].name, &inertia)?;
        self.bodies[body].inertia = inertia;
        let tree = self.bodies[body].tree;
        self.invalidate_tree(tree, Change::MassProperties);
        Ok(())
    }

    pub fn set_body_local_com(&mut self, body: usize, com: Vector3<f64>) -> Result<()> {
        Error::check_index("bodies", body, self.bodies.len())?;
        self.bodies[body].local_com = com;
        let tree = self.bodies[body].tree;
        self.invalidate_tree(tree, Change::MassProperties);
        Ok(())
    }

    /// Mass of every body in skeleton order.
    pub fn link_masses(&self) -> DVector<f64> {
        DVector::from_iterator(self.bodies.len(), self.bodies.iter().map(|b| b.mass))
    }

    pub fn set_link_masses(&mut self, masses: &DVector<f64>) -> Result<()> {
        Error::check_size("link masses", self.bodies.len(), masses.len())?;
        for (body, &mass) in masses.iter().enumerate() {
            if self.bodies[body].mass != mass {
                self.set_body_mass(body, mass)?;
            }
        }
        Ok(())
    }

    /// Lower and upper bounds on the link masses.
    pub fn link_mass_limits(&self) -> (DVector<f64>, DVector<f64>) {
        let n = self.bodies.len();
        (
            DVector::from_iterator(n, self.bodies.iter().map(|b| b.mass_limits.0)),
            DVector::from_iterator(n, self.bodies.iter().map(|b| b.mass_limits.1)),
        )
    }

    /// Set the spatial force on `body`, given in body coordinates as `[torque; force]`.
    pub fn set_external_force(&mut self, body: usize, force: Vector6<f64>) -> Result<()> {
        Error::check_index("bodies", body, self.bodies.len())?;
        self.bodies[body].external_force = force;
        let tree = self.bodies[body].tree;
        self.invalidate_tree(tree, Change::ExternalForces);
        Ok(())
    }

    pub fn add_external_force(&mut self, body: usize, force: Vector6<f64>) -> Result<()> {
        Error::check_index("bodies", body, self.bodies.len())?;
        let total = self.bodies[body].external_force + force;
        self.set_external_force(body, total)
    }

    pub fn clear_external_forces(&mut self) {
        for body in self.bodies.iter_mut() {
            body.external_force = Vector6::zeros();
        }
        self.invalidate_all(Change::ExternalForces);
    }

    /// Set the spatial constraint impulse on `body` in body coordinates.
    pub fn set_constraint_impulse(&mut self, body: usize, impulse: Vector6<f64>) -> Result<()> {
        Error::check_index("bodies", body, self.bodies.len())?;
        self.bodies[body].constraint_impulse = impulse;
        let tree = self.bodies[body].tree;
        self.invalidate_tree(tree, Change::ConstraintImpulses);
        Ok(())
    }

    pub fn clear_constraint_impulses(&mut self) {
        for body in self.bodies.iter_mut() {
            body.constraint_impulse = Vector6::zeros();
        }
        self.invalidate_all(Change::ConstraintImpulses);
    }

    pub fn set_support_points(&mut self, body: usize, points: Vec<Vector3<f64>>) -> Result<()> {
        Error::check_index("bodies", body, self.bodies.len())?;
        self.bodies[body].support_points = points;
        let tree = self.bodies[body].tree;
        self.invalidate_tree(tree, Change::SupportPoints);
        Ok(())
    }

    /*
     * Kinematics
     */

    fn joint_position(&self, joint: &Joint) -> f64 {
        joint.dof.map_or(0.0, |d| self.dofs[d].position)
    }

    /// World poses of all bodies.
    pub fn world_transforms(&self) -> Vec<Isometry3<f64>> {
        let mut poses: Vec<Isometry3<f64>> = Vec::with_capacity(self.bodies.len());
        for (body, joint) in self.bodies.iter().zip(self.joints.iter()) {
            let relative = joint.relative_transform(self.joint_position(joint));
            let pose = match body.parent {
                Some(p) => poses[p] * relative,
                None => relative,
            };
            poses.push(pose);
        }
        poses
    }

    /// World pose of `body`.
    pub fn body_world_transform(&self, body: usize) -> Result<Isometry3<f64>> {
        Error::check_index("bodies", body, self.bodies.len())?;
        let mut pose = Isometry3::identity();
        let mut current = Some(body);
        while let Some(b) = current {
            let joint = &self.joints[b];
            pose = joint.relative_transform(self.joint_position(joint)) * pose;
            current = self.bodies[b].parent;
        }
        Ok(pose)
    }

    /// World space center of mass.
    pub fn com(&self) -> Vector3<f64> {
        let poses = self.world_transforms();
        let total = self.total_mass();
        if total <= 0.0 {
            return Vector3::zeros();
        }
        self.bodies
            .iter()
            .zip(poses.iter())
            .map(|(b, pose)| (pose * Point3::from(b.local_com)).coords * b.mass)
            .sum::<Vector3<f64>>()
            / total
    }

    pub fn compute_kinetic_energy(&self) -> f64 {
        (0..self.trees.len())
            .map(|tree| {
                let model = self.tree_model(tree);
                let v = model.velocities(&self.tree_state(tree, DofState::Velocity));
                v.iter()
                    .zip(model.inertia.iter())
                    .map(|(v, inertia)| 0.5 * v.dot(&(inertia * v)))
                    .sum::<f64>()
            })
            .sum()
    }

    /// Gravitational plus joint spring potential energy.
    pub fn compute_potential_energy(&self) -> f64 {
        let poses = self.world_transforms();
        let gravitational: f64 = self
            .bodies
            .iter()
            .zip(poses.iter())
            .map(|(b, pose)| -b.mass * self.gravity.dot(&(pose * Point3::from(b.local_com)).coords))
            .sum();
        let springs: f64 = self
            .dofs
            .iter()
            .map(|d| 0.5 * d.spring_stiffness * (d.position - d.rest_position).powi(2))
            .sum();
        gravitational + springs
    }

    /*
     * Per-tree dynamics
     */

    pub(crate) fn tree_model(&self, tree: usize) -> TreeModel {
        let data = &self.trees[tree];
        let n = data.bodies.len();
        let mut model = TreeModel {
            parent: Vec::with_capacity(n),
            dof: Vec::with_capacity(n),
            xform: Vec::with_capacity(n),
            subspace: Vec::with_capacity(n),
            inertia: Vec::with_capacity(n),
            num_dofs: data.dofs.len(),
        };
        for &b in data.bodies.iter() {
            let body = &self.bodies[b];
            let joint = &self.joints[b];
            model.parent.push(body.parent.map(|p| self.bodies[p].index_in_tree));
            model.dof.push(joint.dof.map(|d| self.dofs[d].index_in_tree));
            model
                .xform
                .push(plucker_motion(&joint.relative_transform(self.joint_position(joint))));
            model.subspace.push(joint.joint_type.motion_subspace());
            model.inertia.push(body.spatial_inertia());
        }
        model
    }

    pub(crate) fn tree_state(&self, tree: usize, state: DofState) -> DVector<f64> {
        let dofs = &self.trees[tree].dofs;
        DVector::from_iterator(dofs.len(), dofs.iter().map(|&d| self.dofs[d].state(state)))
    }

    pub(crate) fn tree_gather(&self, tree: usize, x: &DVector<f64>) -> DVector<f64> {
        let dofs = &self.trees[tree].dofs;
        DVector::from_iterator(dofs.len(), dofs.iter().map(|&d| x[d]))
    }

    pub(crate) fn tree_implicit_diagonal(&self, tree: usize) -> Vec<f64> {
        self.trees[tree]
            .dofs
            .iter()
            .map(|&d| self.dofs[d].implicit_diagonal(self.time_step))
            .collect()
    }

    fn tree_body_vectors(
        &self,
        tree: usize,
        get: impl Fn(&BodyNode) -> Vector6<f64>,
    ) -> Vec<Vector6<f64>> {
        self.trees[tree]
            .bodies
            .iter()
            .map(|&b| get(&self.bodies[b]))
            .collect()
    }

    pub(crate) fn tree_external_body_forces(&self, tree: usize) -> Vec<Vector6<f64>> {
        self.tree_body_vectors(tree, |b| b.external_force)
    }

    pub(crate) fn tree_dof_slice(&self, tree: usize) -> &[usize] {
        &self.trees[tree].dofs
    }

    pub(crate) fn num_tree_dofs(&self, tree: usize) -> usize {
        self.trees[tree].dofs.len()
    }

    pub(crate) fn mass_matrix_block(&self, tree: usize) -> Ref<'_, DMatrix<f64>> {
        let cache = &self.trees[tree].cache;
        cache.get_or_update(Cached::MassMatrix, &cache.mass_matrix, || {
            self.tree_model(tree).mass_matrix()
        })
    }

    fn aug_mass_matrix_block(&self, tree: usize) -> Ref<'_, DMatrix<f64>> {
        let cache = &self.trees[tree].cache;
        cache.get_or_update(Cached::AugMassMatrix, &cache.aug_mass_matrix, || {
            let diagonal = DVector::from_vec(self.tree_implicit_diagonal(tree));
            &*self.mass_matrix_block(tree) + DMatrix::from_diagonal(&diagonal)
        })
    }

    /// Explicit and implicit articulated inertias of the bodies in `tree`.
    fn articulated_inertia_blocks(
        &self,
        tree: usize,
    ) -> (Ref<'_, Vec<Matrix6<f64>>>, Ref<'_, Vec<Matrix6<f64>>>) {
        self.trees[tree].cache.articulated_inertias(|| {
            let model = self.tree_model(tree);
            let zero = vec![0.0; model.num_dofs];
            (
                model.articulated_inertia(&zero),
                model.articulated_inertia(&self.tree_implicit_diagonal(tree)),
            )
        })
    }

    pub(crate) fn inv_mass_matrix_block(&self, tree: usize) -> Ref<'_, DMatrix<f64>> {
        let cache = &self.trees[tree].cache;
        cache.get_or_update(Cached::InvMassMatrix, &cache.inv_mass_matrix, || {
            let (articulated, _) = self.articulated_inertia_blocks(tree);
            let model = self.tree_model(tree);
            model.inverse_mass_matrix(&articulated, &vec![0.0; model.num_dofs])
        })
    }

    fn inv_aug_mass_matrix_block(&self, tree: usize) -> Ref<'_, DMatrix<f64>> {
        let cache = &self.trees[tree].cache;
        cache.get_or_update(Cached::InvAugMassMatrix, &cache.inv_aug_mass_matrix, || {
            let (_, implicit) = self.articulated_inertia_blocks(tree);
            self.tree_model(tree)
                .inverse_mass_matrix(&implicit, &self.tree_implicit_diagonal(tree))
        })
    }

    fn coriolis_forces_block(&self, tree: usize) -> Ref<'_, DVector<f64>> {
        let cache = &self.trees[tree].cache;
        cache.get_or_update(Cached::CoriolisForces, &cache.coriolis_forces, || {
            let dq = self.tree_state(tree, DofState::Velocity);
            let zero = DVector::zeros(dq.len());
            self.tree_model(tree)
                .inverse_dynamics(&dq, &zero, &Vector3::zeros(), None)
        })
    }

    fn gravity_forces_block(&self, tree: usize) -> Ref<'_, DVector<f64>> {
        let cache = &self.trees[tree].cache;
        cache.get_or_update(Cached::GravityForces, &cache.gravity_forces, || {
            let zero = DVector::zeros(self.num_tree_dofs(tree));
            self.tree_model(tree)
                .inverse_dynamics(&zero, &zero, &self.gravity, None)
        })
    }

    fn coriolis_and_gravity_forces_block(&self, tree: usize) -> Ref<'_, DVector<f64>> {
        let cache = &self.trees[tree].cache;
        cache.get_or_update(
            Cached::CoriolisAndGravityForces,
            &cache.coriolis_and_gravity_forces,
            || &*self.coriolis_forces_block(tree) + &*self.gravity_forces_block(tree),
        )
    }

    fn external_forces_block(&self, tree: usize) -> Ref<'_, DVector<f64>> {
        let cache = &self.trees[tree].cache;
        cache.get_or_update(Cached::ExternalForces, &cache.external_forces, || {
            self.tree_model(tree)
                .body_forces_to_joint_forces(&self.tree_external_body_forces(tree))
        })
    }

    fn constraint_forces_block(&self, tree: usize) -> Ref<'_, DVector<f64>> {
        let cache = &self.trees[tree].cache;
        cache.get_or_update(Cached::ConstraintForces, &cache.constraint_forces, || {
            let impulses = self.tree_body_vectors(tree, |b| b.constraint_impulse);
            self.tree_model(tree).body_forces_to_joint_forces(&impulses) / self.time_step
        })
    }

    fn support_points_where(&self, in_tree: impl Fn(&BodyNode) -> bool) -> SupportGeometry {
        let poses = self.world_transforms();
        let mut points = Vec::new();
        let mut ids = Vec::new();
        for (b, body) in self.bodies.iter().enumerate().filter(|(_, b)| in_tree(b)) {
            for (k, p) in body.support_points.iter().enumerate() {
                points.push((poses[b] * Point3::from(*p)).coords);
                ids.push((b, k));
            }
        }
        compute_support_geometry(&points, &ids, &self.gravity)
    }

    fn support_block(&self, tree: usize) -> Ref<'_, SupportGeometry> {
        let cache = &self.trees[tree].cache;
        cache.get_or_update(Cached::Support, &cache.support, || {
            self.support_points_where(|b| b.tree == tree)
        })
    }

    fn parent_map_block(&self, tree: usize) -> Ref<'_, DMatrix<i32>> {
        let cache = &self.trees[tree].cache;
        cache.get_or_update(Cached::ParentMap, &cache.parent_map, || {
            let dofs = &self.trees[tree].dofs;
            let mut map = DMatrix::zeros(dofs.len(), dofs.len());
            for &d in dofs.iter() {
                let child = &self.dofs[d];
                let mut ancestor = self.bodies[child.joint].parent;
                while let Some(a) = ancestor {
                    if let Some(ad) = self.joints[a].dof {
                        map[(self.dofs[ad].index_in_tree, child.index_in_tree)] = 1;
                    }
                    ancestor = self.bodies[a].parent;
                }
            }
            map
        })
    }

    pub fn tree_mass_matrix(&self, tree: usize) -> Result<Ref<'_, DMatrix<f64>>> {
        self.check_tree(tree)?;
        Ok(self.mass_matrix_block(tree))
    }

    pub fn tree_aug_mass_matrix(&self, tree: usize) -> Result<Ref<'_, DMatrix<f64>>> {
        self.check_tree(tree)?;
        Ok(self.aug_mass_matrix_block(tree))
    }

    pub fn tree_inv_mass_matrix(&self, tree: usize) -> Result<Ref<'_, DMatrix<f64>>> {
        self.check_tree(tree)?;
        Ok(self.inv_mass_matrix_block(tree))
    }

    pub fn tree_inv_aug_mass_matrix(&self, tree: usize) -> Result<Ref<'_, DMatrix<f64>>> {
        self.check_tree(tree)?;
        Ok(self.inv_aug_mass_matrix_block(tree))
    }

    pub fn tree_coriolis_forces(&self, tree: usize) -> Result<Ref<'_, DVector<f64>>> {
        self.check_tree(tree)?;
        Ok(self.coriolis_forces_block(tree))
    }

    pub fn tree_gravity_forces(&self, tree: usize) -> Result<Ref<'_, DVector<f64>>> {
        self.check_tree(tree)?;
        Ok(self.gravity_forces_block(tree))
    }

    pub fn tree_coriolis_and_gravity_forces(&self, tree: usize) -> Result<Ref<'_, DVector<f64>>> {
        self.check_tree(tree)?;
        Ok(self.coriolis_and_gravity_forces_block(tree))
    }

    pub fn tree_external_forces(&self, tree: usize) -> Result<Ref<'_, DVector<f64>>> {
        self.check_tree(tree)?;
        Ok(self.external_forces_block(tree))
    }

    pub fn tree_constraint_forces(&self, tree: usize) -> Result<Ref<'_, DVector<f64>>> {
        self.check_tree(tree)?;
        Ok(self.constraint_forces_block(tree))
    }

    pub fn tree_support_polygon(&self, tree: usize) -> Result<Ref<'_, SupportGeometry>> {
        self.check_tree(tree)?;
        Ok(self.support_block(tree))
    }

    /// Number of times the support geometry of `tree` has been recomputed.
    pub fn tree_support_version(&self, tree: usize) -> Result<usize> {
        self.check_tree(tree)?;
        Ok(self.trees[tree].cache.support_version())
    }

    pub fn tree_parent_map(&self, tree: usize) -> Result<Ref<'_, DMatrix<i32>>> {
        self.check_tree(tree)?;
        Ok(self.parent_map_block(tree))
    }

    /// Articulated inertia of `body` about its origin, in body coordinates.
    pub fn articulated_inertia(&self, body: usize) -> Result<Matrix6<f64>> {
        Error::check_index("bodies", body, self.bodies.len())?;
        let b = &self.bodies[body];
        let (explicit, _) = self.articulated_inertia_blocks(b.tree);
        Ok(explicit[b.index_in_tree])
    }

    /// Articulated inertia including implicit joint damping and springs.
    pub fn articulated_inertia_implicit(&self, body: usize) -> Result<Matrix6<f64>> {
        Error::check_index("bodies", body, self.bodies.len())?;
        let b = &self.bodies[body];
        let (_, implicit) = self.articulated_inertia_blocks(b.tree);
        Ok(implicit[b.index_in_tree])
    }

    /*
     * Whole skeleton dynamics assembled from tree blocks
     */

    fn scatter_matrix<'a, T>(&'a self, block: impl Fn(usize) -> Ref<'a, DMatrix<T>>) -> DMatrix<T>
    where
        T: na::Scalar + num_traits::Zero + Copy,
    {
        let n = self.dofs.len();
        let mut out = DMatrix::zeros(n, n);
        for (tree, data) in self.trees.iter().enumerate() {
            let m = block(tree);
            for (a, &i) in data.dofs.iter().enumerate() {
                for (b, &j) in data.dofs.iter().enumerate() {
                    out[(i, j)] = m[(a, b)];
                }
            }
        }
        out
    }

    fn scatter_vector<'a>(
        &'a self,
        block: impl Fn(usize) -> Ref<'a, DVector<f64>>,
    ) -> DVector<f64> {
        let mut out = DVector::zeros(self.dofs.len());
        for (tree, data) in self.trees.iter().enumerate() {
            let v = block(tree);
            for (a, &i) in data.dofs.iter().enumerate() {
                out[i] = v[a];
            }
        }
        out
    }

    pub fn mass_matrix(&self) -> Ref<'_, DMatrix<f64>> {
        self.cache
            .get_or_update(Cached::MassMatrix, &self.cache.mass_matrix, || {
                self.scatter_matrix(|t| self.mass_matrix_block(t))
            })
    }

    pub fn aug_mass_matrix(&self) -> Ref<'_, DMatrix<f64>> {
        self.cache
            .get_or_update(Cached::AugMassMatrix, &self.cache.aug_mass_matrix, || {
                self.scatter_matrix(|t| self.aug_mass_matrix_block(t))
            })
    }

    pub fn inv_mass_matrix(&self) -> Ref<'_, DMatrix<f64>> {
        self.cache
            .get_or_update(Cached::InvMassMatrix, &self.cache.inv_mass_matrix, || {
                self.scatter_matrix(|t| self.inv_mass_matrix_block(t))
            })
    }

    pub fn inv_aug_mass_matrix(&self) -> Ref<'_, DMatrix<f64>> {
        self.cache.get_or_update(
            Cached::InvAugMassMatrix,
            &self.cache.inv_aug_mass_matrix,
            || self.scatter_matrix(|t| self.inv_aug_mass_matrix_block(t)),
        )
    }

    pub fn coriolis_forces(&self) -> Ref<'_, DVector<f64>> {
        self.cache
            .get_or_update(Cached::CoriolisForces, &self.cache.coriolis_forces, || {
                self.scatter_vector(|t| self.coriolis_forces_block(t))
            })
    }

    pub fn gravity_forces(&self) -> Ref<'_, DVector<f64>> {
        self.cache
            .get_or_update(Cached::GravityForces, &self.cache.gravity_forces, || {
                self.scatter_vector(|t| self.gravity_forces_block(t))
            })
    }

    pub fn coriolis_and_gravity_forces(&self) -> Ref<'_, DVector<f64>> {
        self.cache.get_or_update(
            Cached::CoriolisAndGravityForces,
            &self.cache.coriolis_and_gravity_forces,
            || self.scatter_vector(|t| self.coriolis_and_gravity_forces_block(t)),
        )
    }

    /// Joint space equivalent of the body external forces.
    pub fn external_forces(&self) -> Ref<'_, DVector<f64>> {
        self.cache
            .get_or_update(Cached::ExternalForces, &self.cache.external_forces, || {
                self.scatter_vector(|t| self.external_forces_block(t))
            })
    }

    /// Joint space constraint forces, i.e. constraint impulses over the time step.
    pub fn constraint_forces(&self) -> Ref<'_, DVector<f64>> {
        self.cache.get_or_update(
            Cached::ConstraintForces,
            &self.cache.constraint_forces,
            || self.scatter_vector(|t| self.constraint_forces_block(t)),
        )
    }

    pub fn support_polygon(&self) -> Ref<'_, SupportGeometry> {
        self.cache
            .get_or_update(Cached::Support, &self.cache.support, || {
                self.support_points_where(|_| true)
            })
    }

    pub fn support_version(&self) -> usize {
        self.cache.support_version()
    }

    /// `map[(i, j)]` is 1 iff the joint of DOF `i` is a proper ancestor of the joint of DOF `j`.
    pub fn parent_map(&self) -> Ref<'_, DMatrix<i32>> {
        self.cache
            .get_or_update(Cached::ParentMap, &self.cache.parent_map, || {
                self.scatter_matrix(|t| self.parent_map_block(t))
            })
    }

    /// `(M + h·diag(d) + h²·diag(k)) x` in O(n).
    pub fn multiply_by_implicit_mass_matrix(&self, x: &DVector<f64>) -> Result<DVector<f64>> {
        Error::check_size("implicit mass product", self.dofs.len(), x.len())?;
        let mut out = DVector::zeros(self.dofs.len());
        for tree in 0..self.trees.len() {
            let xt = self.tree_gather(tree, x);
            let zero = DVector::zeros(xt.len());
            let mut yt = self
                .tree_model(tree)
                .inverse_dynamics(&zero, &xt, &Vector3::zeros(), None);
            for (k, d) in self.tree_implicit_diagonal(tree).into_iter().enumerate() {
                yt[k] += d * xt[k];
            }
            for (k, &i) in self.trees[tree].dofs.iter().enumerate() {
                out[i] = yt[k];
            }
        }
        Ok(out)
    }

    /// `(M + h·diag(d) + h²·diag(k))⁻¹ x` in O(n).
    pub fn multiply_by_implicit_inv_mass_matrix(&self, x: &DVector<f64>) -> Result<DVector<f64>> {
        Error::check_size("implicit inverse mass product", self.dofs.len(), x.len())?;
        let mut out = DVector::zeros(self.dofs.len());
        for tree in 0..self.trees.len() {
            let (_, implicit) = self.articulated_inertia_blocks(tree);
            let yt = self.tree_model(tree).apply_inverse(
                &implicit,
                &self.tree_implicit_diagonal(tree),
                &self.tree_gather(tree, x),
            );
            for (k, &i) in self.trees[tree].dofs.iter().enumerate() {
                out[i] = yt[k];
            }
        }
        Ok(out)
    }

    /*
     * Time integration
     */

    /// Passive joint forces from damping and springs.
    pub fn passive_forces(&self) -> DVector<f64> {
        DVector::from_iterator(self.dofs.len(), self.dofs.iter().map(|d| d.passive_force()))
    }

    /// Joint accelerations `M⁻¹ (τ + F_ext - C - g - passive)` at the current state.
    pub fn forward_dynamics_accelerations(&self) -> DVector<f64> {
        let rhs = self.forces() + &*self.external_forces()
            - &*self.coriolis_and_gravity_forces()
            - self.passive_forces();
        &*self.inv_mass_matrix() * rhs
    }

    /// Store the forward dynamics accelerations in the degrees of freedom.
    pub fn compute_forward_dynamics(&mut self) {
        let ddq = self.forward_dynamics_accelerations();
        for (dof, &a) in self.dofs.iter_mut().zip(ddq.iter()) {
            dof.acceleration = a;
        }
    }

    pub fn integrate_velocities(&mut self, dt: f64) {
        let v = self.velocities() + self.accelerations() * dt;
        self.write_dof_values(DofState::Velocity, &v);
    }

    pub fn integrate_positions(&mut self, dt: f64) {
        let q = self.positions() + self.velocities() * dt;
        self.write_dof_values(DofState::Position, &q);
    }
}
