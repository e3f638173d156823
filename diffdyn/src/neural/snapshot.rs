use std::sync::Arc;

use ahash::AHashMap;
use na::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::constrained_group::ConstrainedGroupGradientMatrices;
use crate::dynamics::WithRespectTo;
use crate::math::{pseudo_inverse, solve_least_squares, FiniteDifference};
use crate::simulation::{RestorableSnapshot, World};
use crate::{Error, Result};

const VELOCITY_EPSILON: f64 = 1e-7;
const POSITION_EPSILON: f64 = 1e-1;
const VELOCITY_TO_POSITION_EPSILON: f64 = 1e-3;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatrixToAssemble {
    Clamping,
    MassedClamping,
    UpperBound,
    MassedUpperBound,
    Bouncing,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VectorToAssemble {
    BounceDiagonals,
    RestitutionDiagonals,
    ContactImpulses,
    ContactMappings,
}

/// Element types that group vectors can be assembled into.
pub trait AssembledElement: na::Scalar + Copy + num_traits::Zero {
    const NAME: &'static str;
    /// The group vector of the given kind, if it has this element type.
    fn group_vector(
        group: &ConstrainedGroupGradientMatrices,
        kind: VectorToAssemble,
    ) -> Option<&DVector<Self>>;
    fn accepts(kind: VectorToAssemble) -> bool;
}

impl AssembledElement for f64 {
    const NAME: &'static str = "f64";
    fn group_vector(
        group: &ConstrainedGroupGradientMatrices,
        kind: VectorToAssemble,
    ) -> Option<&DVector<f64>> {
        match kind {
            VectorToAssemble::BounceDiagonals => Some(group.bounce_diagonals()),
            VectorToAssemble::RestitutionDiagonals => Some(group.restitution_diagonals()),
            VectorToAssemble::ContactImpulses => Some(group.contact_constraint_impulses()),
            VectorToAssemble::ContactMappings => None,
        }
    }
    fn accepts(kind: VectorToAssemble) -> bool {
        kind != VectorToAssemble::ContactMappings
    }
}

impl AssembledElement for i32 {
    const NAME: &'static str = "i32";
    fn group_vector(
        group: &ConstrainedGroupGradientMatrices,
        kind: VectorToAssemble,
    ) -> Option<&DVector<i32>> {
        match kind {
            VectorToAssemble::ContactMappings => Some(group.contact_constraint_mappings()),
            _ => None,
        }
    }
    fn accepts(kind: VectorToAssemble) -> bool {
        kind == VectorToAssemble::ContactMappings
    }
}

/// Gradient of a loss with respect to the state at one time step.
#[derive(Clone, Debug, PartialEq)]
pub struct LossGradient {
    pub wrt_position: DVector<f64>,
    pub wrt_velocity: DVector<f64>,
    pub wrt_torque: DVector<f64>,
}

impl LossGradient {
    pub fn zeros(num_dofs: usize) -> Self {
        LossGradient {
            wrt_position: DVector::zeros(num_dofs),
            wrt_velocity: DVector::zeros(num_dofs),
            wrt_torque: DVector::zeros(num_dofs),
        }
    }
}

/// Rows of a group matrix copied into the world matrix.
#[derive(Copy, Clone, Debug)]
struct RowBlock {
    group_offset: usize,
    world_offset: usize,
    num_dofs: usize,
}

/// A record of one completed time step from which the Jacobians of that step
/// are assembled.
///
/// The snapshot describes the world as it was when the step was taken. It must
/// not be reused for another step.
#[derive(Clone, Debug)]
pub struct BackpropSnapshot {
    time_step: f64,
    forward_pass_position: DVector<f64>,
    forward_pass_velocity: DVector<f64>,
    forward_pass_torques: DVector<f64>,
    skeleton_names: Vec<String>,
    skeleton_offsets: AHashMap<String, usize>,
    groups: Vec<Arc<ConstrainedGroupGradientMatrices>>,
    group_rows: Vec<Vec<RowBlock>>,
    num_dofs: usize,
    num_constraint_dim: usize,
    num_clamping: usize,
    num_upper_bound: usize,
    num_bouncing: usize,
    mass_matrix: DMatrix<f64>,
    inv_mass_matrix: DMatrix<f64>,
}

impl BackpropSnapshot {
    /// Record the step just taken by `world` from the given pre-step state.
    ///
    /// The world mass matrices are evaluated at `forward_pass_position`; the
    /// world positions are restored before returning.
    pub fn new(
        world: &mut World,
        forward_pass_position: DVector<f64>,
        forward_pass_velocity: DVector<f64>,
        forward_pass_torques: DVector<f64>,
    ) -> Result<Self> {
        let num_dofs = world.num_dofs();
        Error::check_size("forward pass position", num_dofs, forward_pass_position.len())?;
        Error::check_size("forward pass velocity", num_dofs, forward_pass_velocity.len())?;
        Error::check_size("forward pass torques", num_dofs, forward_pass_torques.len())?;

        let mut skeleton_names = Vec::with_capacity(world.num_skeletons());
        let mut skeleton_offsets = AHashMap::new();
        let mut layout: AHashMap<String, (usize, usize)> = AHashMap::new();
        let mut groups: Vec<Arc<ConstrainedGroupGradientMatrices>> = Vec::new();
        let mut offset = 0;
        for skel in world.skeletons() {
            skeleton_names.push(skel.name().to_string());
            skeleton_offsets.insert(skel.name().to_string(), offset);
            layout.insert(skel.name().to_string(), (offset, skel.num_dofs()));
            offset += skel.num_dofs();
            if let Some(group) = skel.gradient_constraint_matrices() {
                if !groups.iter().any(|g| Arc::ptr_eq(g, group)) {
                    groups.push(Arc::clone(group));
                }
            }
        }

        let mut group_rows = Vec::with_capacity(groups.len());
        for group in groups.iter() {
            let mut rows = Vec::with_capacity(group.skeletons().len());
            let mut group_offset = 0;
            for member in group.skeletons() {
                let (world_offset, num_dofs) =
                    *layout.get(&member.name).ok_or_else(|| Error::UnknownSkeleton {
                        name: member.name.clone(),
                    })?;
                Error::check_size("group skeleton dofs", num_dofs, member.num_dofs)?;
                rows.push(RowBlock {
                    group_offset,
                    world_offset,
                    num_dofs: member.num_dofs,
                });
                group_offset += member.num_dofs;
            }
            group_rows.push(rows);
        }

        let current_position = world.positions();
        world.set_positions(&forward_pass_position)?;
        let mass_matrix = world.mass_matrix();
        let inv_mass_matrix = world.inv_mass_matrix();
        world.set_positions(&current_position)?;

        log::debug!(
            "Backprop snapshot: {} dofs, {} constraint groups",
            num_dofs,
            groups.len()
        );

        Ok(BackpropSnapshot {
            time_step: world.time_step(),
            forward_pass_position,
            forward_pass_velocity,
            forward_pass_torques,
            skeleton_names,
            skeleton_offsets,
            num_constraint_dim: groups.iter().map(|g| g.num_constraint_dim()).sum(),
            num_clamping: groups.iter().map(|g| g.num_clamping()).sum(),
            num_upper_bound: groups.iter().map(|g| g.num_upper_bound()).sum(),
            num_bouncing: groups.iter().map(|g| g.num_bouncing()).sum(),
            groups,
            group_rows,
            num_dofs,
            mass_matrix,
            inv_mass_matrix,
        })
    }

    /*
     * Accessors
     */

    pub fn time_step(&self) -> f64 {
        self.time_step
    }

    pub fn num_dofs(&self) -> usize {
        self.num_dofs
    }

    pub fn num_constraint_dim(&self) -> usize {
        self.num_constraint_dim
    }

    pub fn num_clamping(&self) -> usize {
        self.num_clamping
    }

    pub fn num_upper_bound(&self) -> usize {
        self.num_upper_bound
    }

    pub fn num_bouncing(&self) -> usize {
        self.num_bouncing
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn skeleton_names(&self) -> &[String] {
        &self.skeleton_names
    }

    /// Offset of the named skeleton into world state vectors.
    pub fn skeleton_offset(&self, name: &str) -> Result<usize> {
        self.skeleton_offsets
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownSkeleton {
                name: name.to_string(),
            })
    }

    pub fn forward_pass_position(&self) -> &DVector<f64> {
        &self.forward_pass_position
    }

    pub fn forward_pass_velocity(&self) -> &DVector<f64> {
        &self.forward_pass_velocity
    }

    pub fn forward_pass_torques(&self) -> &DVector<f64> {
        &self.forward_pass_torques
    }

    pub fn mass_matrix(&self) -> &DMatrix<f64> {
        &self.mass_matrix
    }

    pub fn inv_mass_matrix(&self) -> &DMatrix<f64> {
        &self.inv_mass_matrix
    }

    pub fn clamping_constraint_matrix(&self) -> DMatrix<f64> {
        self.assemble_matrix(MatrixToAssemble::Clamping)
    }

    pub fn massed_clamping_constraint_matrix(&self) -> DMatrix<f64> {
        self.assemble_matrix(MatrixToAssemble::MassedClamping)
    }

    pub fn upper_bound_constraint_matrix(&self) -> DMatrix<f64> {
        self.assemble_matrix(MatrixToAssemble::UpperBound)
    }

    pub fn massed_upper_bound_constraint_matrix(&self) -> DMatrix<f64> {
        self.assemble_matrix(MatrixToAssemble::MassedUpperBound)
    }

    pub fn bouncing_constraint_matrix(&self) -> DMatrix<f64> {
        self.assemble_matrix(MatrixToAssemble::Bouncing)
    }

    /// Block diagonal mapping from clamping impulses to upper-bound impulses.
    pub fn upper_bound_mapping_matrix(&self) -> DMatrix<f64> {
        let mut mapping = DMatrix::zeros(self.num_upper_bound, self.num_clamping);
        let mut row = 0;
        let mut col = 0;
        for group in self.groups.iter() {
            let block = group.upper_bound_mapping_matrix();
            mapping
                .view_mut((row, col), block.shape())
                .copy_from(block);
            row += block.nrows();
            col += block.ncols();
        }
        mapping
    }

    pub fn bounce_diagonals(&self) -> DVector<f64> {
        self.stack(|g| g.bounce_diagonals())
    }

    pub fn restitution_diagonals(&self) -> DVector<f64> {
        self.stack(|g| g.restitution_diagonals())
    }

    pub fn contact_constraint_impulses(&self) -> DVector<f64> {
        self.stack(|g| g.contact_constraint_impulses())
    }

    pub fn contact_constraint_mappings(&self) -> DVector<i32> {
        self.stack(|g| g.contact_constraint_mappings())
    }

    /*
     * Assembly
     */

    /// World-DOF rows by the total number of columns of the given kind.
    ///
    /// Groups occupy consecutive column ranges in the order they were found;
    /// rows of each member skeleton land at the skeleton's world offset.
    pub fn assemble_matrix(&self, kind: MatrixToAssemble) -> DMatrix<f64> {
        let num_cols = match kind {
            MatrixToAssemble::Clamping | MatrixToAssemble::MassedClamping => self.num_clamping,
            MatrixToAssemble::UpperBound | MatrixToAssemble::MassedUpperBound => {
                self.num_upper_bound
            }
            MatrixToAssemble::Bouncing => self.num_bouncing,
        };
        let mut matrix = DMatrix::zeros(self.num_dofs, num_cols);
        let mut col = 0;
        for (group, rows) in self.groups.iter().zip(self.group_rows.iter()) {
            let group_matrix = match kind {
                MatrixToAssemble::Clamping => group.clamping_constraint_matrix(),
                MatrixToAssemble::MassedClamping => group.massed_clamping_constraint_matrix(),
                MatrixToAssemble::UpperBound => group.upper_bound_constraint_matrix(),
                MatrixToAssemble::MassedUpperBound => {
                    group.massed_upper_bound_constraint_matrix()
                }
                MatrixToAssemble::Bouncing => group.bouncing_constraint_matrix(),
            };
            let ncols = group_matrix.ncols();
            for block in rows.iter() {
                let source = group_matrix.view((block.group_offset, 0), (block.num_dofs, ncols));
                matrix
                    .view_mut((block.world_offset, col), (block.num_dofs, ncols))
                    .copy_from(&source);
            }
            col += ncols;
        }
        matrix
    }

    /// Concatenate the group vectors of the given kind in group order.
    ///
    /// Contact mappings are `i32`; every other kind is `f64`. Requesting a kind
    /// with the wrong element type is an error.
    pub fn assemble_vector<T: AssembledElement>(
        &self,
        kind: VectorToAssemble,
    ) -> Result<DVector<T>> {
        if !T::accepts(kind) {
            return Err(Error::VectorKindMismatch {
                kind,
                element: T::NAME,
            });
        }
        let parts = self
            .groups
            .iter()
            .map(|g| {
                T::group_vector(g, kind).ok_or(Error::VectorKindMismatch {
                    kind,
                    element: T::NAME,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if parts.len() == 1 {
            return Ok(parts[0].clone());
        }
        Ok(concatenate(&parts))
    }

    fn stack<T: AssembledElement>(
        &self,
        get: impl Fn(&ConstrainedGroupGradientMatrices) -> &DVector<T>,
    ) -> DVector<T> {
        let parts: Vec<&DVector<T>> = self.groups.iter().map(|g| get(g)).collect();
        concatenate(&parts)
    }

    /*
     * Jacobians
     */

    /// Clamping columns plus upper-bound columns expressed through `E`.
    fn constraint_directions(&self) -> DMatrix<f64> {
        let a_c = self.clamping_constraint_matrix();
        if self.num_upper_bound == 0 {
            return a_c;
        }
        a_c + self.upper_bound_constraint_matrix() * self.upper_bound_mapping_matrix()
    }

    /// `P_c = (1/h) pinv(A_cᵀ (V_c + V_ub E)) diag(bounce) A_cᵀ`, mapping
    /// velocities to the impulses that keep clamping contacts clamped.
    pub fn projection_into_clamps_matrix(&self) -> DMatrix<f64> {
        let a_c = self.clamping_constraint_matrix();
        if a_c.ncols() == 0 {
            return DMatrix::zeros(0, self.num_dofs);
        }
        let v_c = self.massed_clamping_constraint_matrix();
        let implied = if self.num_upper_bound == 0 {
            v_c
        } else {
            v_c + self.massed_upper_bound_constraint_matrix() * self.upper_bound_mapping_matrix()
        };
        let force_to_vel = a_c.transpose() * implied;
        let vel_to_force = pseudo_inverse(&force_to_vel);
        let bounce = DMatrix::from_diagonal(&self.bounce_diagonals());
        vel_to_force * bounce * a_c.transpose() / self.time_step
    }

    /// `∂v'/∂τ = h M⁻¹ (I - h (A_c + A_ub E) P_c M⁻¹)`
    pub fn force_vel_jacobian(&self) -> DMatrix<f64> {
        let h = self.time_step;
        let minv = &self.inv_mass_matrix;
        let identity = DMatrix::identity(self.num_dofs, self.num_dofs);
        if self.num_clamping == 0 {
            return minv * h;
        }
        let correction = self.constraint_directions() * self.projection_into_clamps_matrix() * minv;
        minv * (identity - correction * h) * h
    }

    /// `∂v'/∂v = (I - h M⁻¹ (A_c + A_ub E) P_c) B`
    ///
    /// `B` is taken to be the identity, which ignores the velocity dependence
    /// of the unconstrained forces.
    pub fn vel_vel_jacobian(&self) -> DMatrix<f64> {
        let h = self.time_step;
        let identity = DMatrix::identity(self.num_dofs, self.num_dofs);
        if self.num_clamping == 0 {
            return identity;
        }
        let correction = &self.inv_mass_matrix
            * self.constraint_directions()
            * self.projection_into_clamps_matrix();
        identity - correction * h
    }

    /// `∂q'/∂q`: the identity without bouncing contacts. Otherwise the matrix
    /// `X` closest to the identity with `aᵢᵀ X aᵢ = -rᵢ` for every bouncing
    /// column `aᵢ` and restitution coefficient `rᵢ`.
    pub fn pos_pos_jacobian(&self) -> DMatrix<f64> {
        let n = self.num_dofs;
        let a_b = self.bouncing_constraint_matrix();
        if a_b.ncols() == 0 {
            return DMatrix::identity(n, n);
        }

        // Column i holds vec(aᵢ aᵢᵀ).
        let mut w = DMatrix::zeros(n * n, a_b.ncols());
        for (i, a) in a_b.column_iter().enumerate() {
            let outer = &a * a.transpose();
            w.column_mut(i).copy_from_slice(outer.as_slice());
        }

        let identity = DMatrix::<f64>::identity(n, n);
        let center = DVector::from_column_slice(identity.as_slice());
        let wt = w.transpose();
        let rhs = self.restitution_diagonals() + &wt * &center;
        let q = center - solve_least_squares(&wt, &rhs);
        DMatrix::from_column_slice(n, n, q.as_slice())
    }

    /// `∂q'/∂v = h ∂q'/∂q`
    pub fn vel_pos_jacobian(&self) -> DMatrix<f64> {
        self.pos_pos_jacobian() * self.time_step
    }

    /// Propagate the loss gradient of the next time step to this one.
    pub fn backprop(&self, next: &LossGradient) -> Result<LossGradient> {
        Error::check_size("loss wrt position", self.num_dofs, next.wrt_position.len())?;
        Error::check_size("loss wrt velocity", self.num_dofs, next.wrt_velocity.len())?;

        let pos_pos = self.pos_pos_jacobian();
        let vel_pos = &pos_pos * self.time_step;
        let vel_vel = self.vel_vel_jacobian();
        let force_vel = self.force_vel_jacobian();

        Ok(LossGradient {
            wrt_position: pos_pos.tr_mul(&next.wrt_position),
            wrt_velocity: vel_pos.tr_mul(&next.wrt_position) + vel_vel.tr_mul(&next.wrt_velocity),
            wrt_torque: force_vel.tr_mul(&next.wrt_velocity),
        })
    }

    /*
     * Finite difference counterparts
     */

    pub fn finite_difference_force_vel_jacobian(&self, world: &mut World) -> Result<DMatrix<f64>> {
        self.finite_difference_step(
            world,
            1,
            VELOCITY_EPSILON,
            WithRespectTo::Force,
            WithRespectTo::Velocity,
        )
    }

    pub fn finite_difference_vel_vel_jacobian(&self, world: &mut World) -> Result<DMatrix<f64>> {
        self.finite_difference_step(
            world,
            1,
            VELOCITY_EPSILON,
            WithRespectTo::Velocity,
            WithRespectTo::Velocity,
        )
    }

    /// The step is replayed as `subdivisions` shorter steps. The perturbation
    /// must be much larger than the distance travelled in one of them.
    pub fn finite_difference_pos_pos_jacobian(
        &self,
        world: &mut World,
        subdivisions: usize,
    ) -> Result<DMatrix<f64>> {
        self.finite_difference_step(
            world,
            subdivisions,
            POSITION_EPSILON / subdivisions.max(1) as f64,
            WithRespectTo::Position,
            WithRespectTo::Position,
        )
    }

    pub fn finite_difference_vel_pos_jacobian(
        &self,
        world: &mut World,
        subdivisions: usize,
    ) -> Result<DMatrix<f64>> {
        self.finite_difference_step(
            world,
            subdivisions,
            VELOCITY_TO_POSITION_EPSILON / subdivisions.max(1) as f64,
            WithRespectTo::Velocity,
            WithRespectTo::Position,
        )
    }

    /// Replay the step from the forward pass state with one input perturbed.
    ///
    /// Gradients are disabled while replaying; the world state, time step and
    /// gradient flag are restored afterwards.
    fn finite_difference_step(
        &self,
        world: &mut World,
        subdivisions: usize,
        epsilon: f64,
        input: WithRespectTo,
        output: WithRespectTo,
    ) -> Result<DMatrix<f64>> {
        if subdivisions == 0 {
            return Err(Error::InvalidParameter {
                name: "subdivisions".to_string(),
            });
        }
        Error::check_size("world dofs", self.num_dofs, world.num_dofs())?;

        let saved = RestorableSnapshot::new(world);
        let gradient_enabled = world.gradient_enabled();
        world.set_gradient_enabled(false);

        let result = self.replay_columns(world, subdivisions, epsilon, input, output);

        world.set_gradient_enabled(gradient_enabled);
        saved.restore(world)?;
        result
    }

    fn replay_columns(
        &self,
        world: &mut World,
        subdivisions: usize,
        epsilon: f64,
        input: WithRespectTo,
        output: WithRespectTo,
    ) -> Result<DMatrix<f64>> {
        world.set_time_step(self.time_step / subdivisions as f64)?;
        let n = self.num_dofs;
        let method = FiniteDifference::Forward { step: epsilon };
        let mut jac = DMatrix::zeros(n, n);
        for i in 0..n {
            let column = method.derivative(|delta| {
                let mut position = self.forward_pass_position.clone();
                let mut velocity = self.forward_pass_velocity.clone();
                let mut torques = self.forward_pass_torques.clone();
                match input {
                    WithRespectTo::Position => position[i] += delta,
                    WithRespectTo::Velocity => velocity[i] += delta,
                    WithRespectTo::Force => torques[i] += delta,
                }
                world.set_positions(&position)?;
                world.set_velocities(&velocity)?;
                world.set_forces(&torques)?;
                for _ in 0..subdivisions {
                    world.step(false)?;
                }
                Ok::<_, Error>(match output {
                    WithRespectTo::Position => world.positions(),
                    WithRespectTo::Velocity => world.velocities(),
                    WithRespectTo::Force => world.forces(),
                })
            })?;
            jac.column_mut(i).copy_from(&column);
        }
        Ok(jac)
    }
}

fn concatenate<T: AssembledElement>(parts: &[&DVector<T>]) -> DVector<T> {
    let len = parts.iter().map(|p| p.len()).sum();
    let mut out = DVector::from_element(len, T::zero());
    let mut offset = 0;
    for part in parts {
        out.rows_mut(offset, part.len()).copy_from(*part);
        offset += part.len();
    }
    out
}

/// Take one step of `world` with gradients enabled and record it.
pub fn forward_pass(world: &mut World) -> Result<BackpropSnapshot> {
    let position = world.positions();
    let velocity = world.velocities();
    let torques = world.forces();

    let gradient_enabled = world.gradient_enabled();
    world.set_gradient_enabled(true);
    let stepped = world.step(false);
    world.set_gradient_enabled(gradient_enabled);
    stepped?;

    BackpropSnapshot::new(world, position, velocity, torques)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::{ConstraintClassification, GroupSkeleton, CLAMPING};
    use crate::test_utils::*;
    use approx::*;

    fn group_for(
        world: &World,
        names: &[&str],
        mut fill: impl FnMut(&mut ConstraintClassification),
    ) -> Arc<ConstrainedGroupGradientMatrices> {
        let members: Vec<_> = names
            .iter()
            .map(|name| GroupSkeleton::of(world.skeleton_by_name(name).unwrap()))
            .collect();
        let n = members.iter().map(|m| m.num_dofs).sum();
        let mut data = ConstraintClassification::empty(n);
        fill(&mut data);
        Arc::new(ConstrainedGroupGradientMatrices::new(members, data).unwrap())
    }

    fn one_clamp(data: &mut ConstraintClassification, column: &[f64], bounce: f64) {
        let n = column.len();
        data.clamping = DMatrix::from_column_slice(n, 1, column);
        data.massed_clamping = DMatrix::from_column_slice(n, 1, column) * 0.5;
        data.upper_bound_mapping = DMatrix::zeros(0, 1);
        data.bounce_diagonals = DVector::from_element(1, bounce);
        data.contact_impulses = DVector::from_element(1, 2.0);
        data.contact_mappings = DVector::from_element(1, CLAMPING);
    }

    fn snapshot(world: &mut World) -> BackpropSnapshot {
        let (q, v, f) = (world.positions(), world.velocities(), world.forces());
        BackpropSnapshot::new(world, q, v, f).unwrap()
    }

    #[test]
    fn no_contacts() {
        let mut world = make_arm_and_box_world();
        world.set_time_step(0.01).unwrap();
        let snap = snapshot(&mut world);
        assert_eq!(snap.num_groups(), 0);
        assert_eq!(snap.projection_into_clamps_matrix().shape(), (0, 3));
        assert_relative_eq!(
            snap.force_vel_jacobian(),
            snap.inv_mass_matrix() * 0.01,
            epsilon = 1e-14
        );
        assert_eq!(snap.pos_pos_jacobian(), DMatrix::identity(3, 3));
        assert_eq!(snap.vel_pos_jacobian(), DMatrix::identity(3, 3) * 0.01);
        assert_eq!(
            snap.assemble_vector::<f64>(VectorToAssemble::ContactImpulses)
                .unwrap()
                .len(),
            0
        );
    }

    #[test]
    fn groups_are_deduplicated_and_placed_by_offset() {
        let mut world = make_arm_and_box_world();
        let group = group_for(&world, &["box", "arm"], |d| one_clamp(d, &[1.0, 2.0, 3.0], 1.0));
        for skel in world.skeletons_mut() {
            skel.set_gradient_constraint_matrices(Arc::clone(&group));
        }
        let snap = snapshot(&mut world);
        assert_eq!(snap.num_groups(), 1);
        assert_eq!(snap.num_clamping(), 1);
        assert_eq!(snap.num_constraint_dim(), 1);
        // The box comes first in the group but second in the world.
        let a_c = snap.assemble_matrix(MatrixToAssemble::Clamping);
        assert_eq!(a_c, DMatrix::from_column_slice(3, 1, &[2.0, 3.0, 1.0]));
        assert_eq!(a_c, snap.assemble_matrix(MatrixToAssemble::Clamping));
        assert_eq!(
            snap.assemble_vector::<i32>(VectorToAssemble::ContactMappings)
                .unwrap(),
            DVector::from_element(1, CLAMPING)
        );
    }

    #[test]
    fn disjoint_groups_are_block_diagonal() {
        let mut world = make_arm_and_box_world();
        let arm = group_for(&world, &["arm"], |d| one_clamp(d, &[1.0, -1.0], 1.0));
        let bx = group_for(&world, &["box"], |d| one_clamp(d, &[4.0], 2.0));
        world.skeleton_mut(0).unwrap().set_gradient_constraint_matrices(arm);
        world.skeleton_mut(1).unwrap().set_gradient_constraint_matrices(bx);
        let snap = snapshot(&mut world);
        assert_eq!(
            snap.clamping_constraint_matrix(),
            DMatrix::from_row_slice(3, 2, &[1.0, 0.0, -1.0, 0.0, 0.0, 4.0])
        );
        assert_eq!(
            snap.bounce_diagonals(),
            DVector::from_vec(vec![1.0, 2.0])
        );
        assert_eq!(
            snap.assemble_vector::<f64>(VectorToAssemble::ContactImpulses)
                .unwrap(),
            DVector::from_vec(vec![2.0, 2.0])
        );
        assert_eq!(snap.upper_bound_mapping_matrix().shape(), (0, 2));
    }

    #[test]
    fn vector_kind_must_match_element_type() {
        let mut world = make_arm_and_box_world();
        let snap = snapshot(&mut world);
        assert!(matches!(
            snap.assemble_vector::<f64>(VectorToAssemble::ContactMappings),
            Err(Error::VectorKindMismatch { element: "f64", .. })
        ));
        assert!(matches!(
            snap.assemble_vector::<i32>(VectorToAssemble::BounceDiagonals),
            Err(Error::VectorKindMismatch { element: "i32", .. })
        ));
    }

    #[test]
    fn unknown_group_member_is_rejected() {
        let mut world = make_arm_and_box_world();
        let stranger = Arc::new(
            ConstrainedGroupGradientMatrices::new(
                vec![GroupSkeleton {
                    name: "stranger".to_string(),
                    num_dofs: 1,
                }],
                ConstraintClassification::empty(1),
            )
            .unwrap(),
        );
        world.skeleton_mut(1).unwrap().set_gradient_constraint_matrices(stranger);
        let (q, v, f) = (world.positions(), world.velocities(), world.forces());
        assert!(matches!(
            BackpropSnapshot::new(&mut world, q, v, f),
            Err(Error::UnknownSkeleton { .. })
        ));
    }

    #[test]
    fn single_bounce_sets_restitution_on_the_diagonal() {
        let mut world = World::new();
        world.add_skeleton(make_prismatic_box()).unwrap();
        let group = group_for(&world, &["box"], |d| {
            one_clamp(d, &[1.0], 1.5);
            d.bouncing = DMatrix::from_element(1, 1, 1.0);
            d.restitution_diagonals = DVector::from_element(1, 0.5);
        });
        world.skeleton_mut(0).unwrap().set_gradient_constraint_matrices(group);
        let snap = snapshot(&mut world);
        assert_relative_eq!(snap.pos_pos_jacobian()[(0, 0)], -0.5, epsilon = 1e-12);
    }

    #[test]
    fn clamped_box_loses_force_sensitivity() {
        let mut world = World::new();
        world.set_time_step(0.01).unwrap();
        world.add_skeleton(make_prismatic_box()).unwrap();
        let minv = world.inv_mass_matrix()[(0, 0)];
        let group = group_for(&world, &["box"], |d| {
            d.clamping = DMatrix::from_element(1, 1, 1.0);
            d.massed_clamping = DMatrix::from_element(1, 1, minv);
            d.upper_bound_mapping = DMatrix::zeros(0, 1);
            d.bounce_diagonals = DVector::from_element(1, 1.0);
        });
        world.skeleton_mut(0).unwrap().set_gradient_constraint_matrices(group);
        let snap = snapshot(&mut world);
        assert_relative_eq!(snap.force_vel_jacobian()[(0, 0)], 0.0, epsilon = 1e-12);
        assert_relative_eq!(snap.vel_vel_jacobian()[(0, 0)], 0.0, epsilon = 1e-12);
        assert_relative_eq!(
            snap.projection_into_clamps_matrix()[(0, 0)],
            1.0 / (0.01 * minv),
            max_relative = 1e-12
        );
    }
}
