//! Analytical Jacobians of skeleton dynamics and their finite difference counterparts.

use na::{DMatrix, DVector, Vector3};
use serde::{Deserialize, Serialize};

use super::dof::DofState;
use super::skeleton::Skeleton;
use crate::math::finite_difference::{self, FiniteDifference};
use crate::{Error, Result};

/// The state a Jacobian is taken with respect to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WithRespectTo {
    Position,
    Velocity,
    Force,
}

impl WithRespectTo {
    fn state(self) -> DofState {
        match self {
            WithRespectTo::Position => DofState::Position,
            WithRespectTo::Velocity => DofState::Velocity,
            WithRespectTo::Force => DofState::Force,
        }
    }
}

impl Skeleton {
    /// Assemble a block diagonal matrix from per-tree blocks.
    fn scatter_tree_blocks(&self, mut block: impl FnMut(usize) -> DMatrix<f64>) -> DMatrix<f64> {
        let n = self.num_dofs();
        let mut out = DMatrix::zeros(n, n);
        for tree in 0..self.num_trees() {
            let m = block(tree);
            let dofs = self.tree_dof_slice(tree);
            for (a, &i) in dofs.iter().enumerate() {
                for (b, &j) in dofs.iter().enumerate() {
                    out[(i, j)] = m[(a, b)];
                }
            }
        }
        out
    }

    /// `∂(M(q) x)/∂q`.
    pub fn jacobian_of_mass_action_wrt_positions(&self, x: &DVector<f64>) -> Result<DMatrix<f64>> {
        Error::check_size("mass action direction", self.num_dofs(), x.len())?;
        Ok(self.scatter_tree_blocks(|tree| {
            let xt = self.tree_gather(tree, x);
            let zero = DVector::zeros(xt.len());
            let (wrt_q, _) = self
                .tree_model(tree)
                .inverse_dynamics_derivatives(&zero, &xt, &Vector3::zeros(), None);
            wrt_q
        }))
    }

    /// Jacobian of the Coriolis force vector `C(q, q̇)`.
    pub fn coriolis_jacobian(&self, wrt: WithRespectTo) -> DMatrix<f64> {
        if wrt == WithRespectTo::Force {
            return DMatrix::zeros(self.num_dofs(), self.num_dofs());
        }
        self.scatter_tree_blocks(|tree| {
            let dq = self.tree_state(tree, DofState::Velocity);
            let zero = DVector::zeros(dq.len());
            let (wrt_q, wrt_dq) = self
                .tree_model(tree)
                .inverse_dynamics_derivatives(&dq, &zero, &Vector3::zeros(), None);
            match wrt {
                WithRespectTo::Position => wrt_q,
                _ => wrt_dq,
            }
        })
    }

    /// Jacobian of the forward dynamics accelerations
    /// `q̈ = M⁻¹ (τ + F_ext - C - g - d∘q̇ - k∘(q - q₀))`.
    pub fn forward_dynamics_jacobian(&self, wrt: WithRespectTo) -> DMatrix<f64> {
        let inv_mass = self.inv_mass_matrix().clone();
        if wrt == WithRespectTo::Force {
            return inv_mass;
        }
        let ddq = self.forward_dynamics_accelerations();
        let inverse_dynamics = self.scatter_tree_blocks(|tree| {
            let dq = self.tree_state(tree, DofState::Velocity);
            let ddq_t = self.tree_gather(tree, &ddq);
            let external = self.tree_external_body_forces(tree);
            let (wrt_q, wrt_dq) = self.tree_model(tree).inverse_dynamics_derivatives(
                &dq,
                &ddq_t,
                &self.gravity(),
                Some(external.as_slice()),
            );
            let passive = self.tree_passive_diagonal(tree, wrt);
            let partial = match wrt {
                WithRespectTo::Position => wrt_q,
                _ => wrt_dq,
            };
            partial + DMatrix::from_diagonal(&passive)
        });
        -(inv_mass * inverse_dynamics)
    }

    /// Diagonal of the passive force Jacobian: stiffness for positions, damping for velocities.
    fn tree_passive_diagonal(&self, tree: usize, wrt: WithRespectTo) -> DVector<f64> {
        let dofs = self.tree_dof_slice(tree);
        DVector::from_iterator(
            dofs.len(),
            dofs.iter().map(|&d| {
                let dof = &self.dofs()[d];
                match wrt {
                    WithRespectTo::Position => dof.spring_stiffness(),
                    WithRespectTo::Velocity => dof.damping(),
                    WithRespectTo::Force => 0.0,
                }
            }),
        )
    }

    /// Jacobian of the velocity after one explicit step of length `dt`,
    /// `q̇' = q̇ + dt·q̈`, ignoring constraints.
    pub fn unconstrained_vel_jacobian_wrt(&self, dt: f64, wrt: WithRespectTo) -> DMatrix<f64> {
        let mut jac = self.forward_dynamics_jacobian(wrt) * dt;
        if wrt == WithRespectTo::Velocity {
            for i in 0..jac.nrows() {
                jac[(i, i)] += 1.0;
            }
        }
        jac
    }

    /*
     * Finite difference counterparts
     */

    fn finite_difference_wrt(
        &self,
        wrt: WithRespectTo,
        method: FiniteDifference,
        eval: impl Fn(&Skeleton) -> DVector<f64> + Sync,
    ) -> Result<DMatrix<f64>> {
        let n = self.num_dofs();
        let state = wrt.state();
        let base = match state {
            DofState::Position => self.positions(),
            DofState::Velocity => self.velocities(),
            _ => self.forces(),
        };
        finite_difference::jacobian(self, n, n, method, |probe, i, delta| {
            let mut perturbed = base.clone();
            perturbed[i] += delta;
            match state {
                DofState::Position => probe.set_positions(&perturbed)?,
                DofState::Velocity => probe.set_velocities(&perturbed)?,
                _ => probe.set_forces(&perturbed)?,
            }
            Ok::<_, Error>(eval(probe))
        })
    }

    pub fn finite_difference_jacobian_of_mass_action(
        &self,
        x: &DVector<f64>,
        method: FiniteDifference,
    ) -> Result<DMatrix<f64>> {
        Error::check_size("mass action direction", self.num_dofs(), x.len())?;
        self.finite_difference_wrt(WithRespectTo::Position, method, |s| &*s.mass_matrix() * x)
    }

    pub fn finite_difference_coriolis_jacobian(
        &self,
        wrt: WithRespectTo,
        method: FiniteDifference,
    ) -> Result<DMatrix<f64>> {
        self.finite_difference_wrt(wrt, method, |s| s.coriolis_forces().clone())
    }

    pub fn finite_difference_forward_dynamics_jacobian(
        &self,
        wrt: WithRespectTo,
        method: FiniteDifference,
    ) -> Result<DMatrix<f64>> {
        self.finite_difference_wrt(wrt, method, |s| s.forward_dynamics_accelerations())
    }

    pub fn finite_difference_unconstrained_vel_jacobian(
        &self,
        dt: f64,
        wrt: WithRespectTo,
        method: FiniteDifference,
    ) -> Result<DMatrix<f64>> {
        self.finite_difference_wrt(wrt, method, |s| {
            s.velocities() + s.forward_dynamics_accelerations() * dt
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use approx::*;

    #[test]
    fn unconstrained_velocity_jacobian_wrt_force_is_scaled_inverse_mass() {
        let skel = make_two_link_arm();
        let jac = skel.unconstrained_vel_jacobian_wrt(0.01, WithRespectTo::Force);
        assert_relative_eq!(jac, &*skel.inv_mass_matrix() * 0.01, epsilon = 1e-14);
    }

    #[test]
    fn unconstrained_velocity_jacobian_matches_finite_differences() {
        let mut skel = make_two_link_arm();
        randomize_state(&mut skel, 7);
        for wrt in [WithRespectTo::Position, WithRespectTo::Velocity] {
            let analytical = skel.unconstrained_vel_jacobian_wrt(0.01, wrt);
            let fd = skel
                .finite_difference_unconstrained_vel_jacobian(
                    0.01,
                    wrt,
                    FiniteDifference::Central { step: 1e-6 },
                )
                .unwrap();
            assert_relative_eq!(analytical, fd, epsilon = 1e-6);
        }
    }

    #[test]
    fn coriolis_is_independent_of_force() {
        let skel = make_two_link_arm();
        assert_eq!(
            skel.coriolis_jacobian(WithRespectTo::Force),
            DMatrix::zeros(2, 2)
        );
    }
}
