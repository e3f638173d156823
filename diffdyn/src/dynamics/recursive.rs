//! Recursive rigid body algorithms over a single kinematic tree.
//!
//! Bodies are stored parent-first and every body has at most one degree of
//! freedom. Spatial quantities are expressed in body coordinates.

use na::{DMatrix, DVector, Matrix6, Vector3, Vector6};

use crate::math::{crf, crm};

/// Kinematic and inertial snapshot of a tree at fixed joint positions.
#[derive(Clone, Debug)]
pub(crate) struct TreeModel {
    /// Tree-local parent body.
    pub parent: Vec<Option<usize>>,
    /// Tree-local degree of freedom driven by each body's joint.
    pub dof: Vec<Option<usize>>,
    /// Motion transform from the parent frame (world for roots) into the body frame.
    pub xform: Vec<Matrix6<f64>>,
    /// Joint motion subspace, zero for welds.
    pub subspace: Vec<Vector6<f64>>,
    pub inertia: Vec<Matrix6<f64>>,
    pub num_dofs: usize,
}

/// Per-DOF joint-space terms added to the pivots of the articulated body algorithm.
pub(crate) type JointDiagonal = [f64];

impl TreeModel {
    pub fn num_bodies(&self) -> usize {
        self.parent.len()
    }

    fn gravity_acceleration(gravity: &Vector3<f64>) -> Vector6<f64> {
        Vector6::new(0.0, 0.0, 0.0, -gravity.x, -gravity.y, -gravity.z)
    }

    fn dof_value(&self, i: usize, x: &DVector<f64>) -> f64 {
        self.dof[i].map_or(0.0, |d| x[d])
    }

    /// Composite rigid body algorithm.
    pub fn mass_matrix(&self) -> DMatrix<f64> {
        let n = self.num_bodies();
        let mut composite = self.inertia.clone();
        for i in (0..n).rev() {
            if let Some(p) = self.parent[i] {
                let child = self.xform[i].transpose() * composite[i] * self.xform[i];
                composite[p] += child;
            }
        }

        let mut m = DMatrix::zeros(self.num_dofs, self.num_dofs);
        for i in 0..n {
            let di = match self.dof[i] {
                Some(di) => di,
                None => continue,
            };
            let mut f = composite[i] * self.subspace[i];
            m[(di, di)] = self.subspace[i].dot(&f);
            let mut j = i;
            while let Some(p) = self.parent[j] {
                f = self.xform[j].transpose() * f;
                j = p;
                if let Some(dj) = self.dof[j] {
                    let value = self.subspace[j].dot(&f);
                    m[(di, dj)] = value;
                    m[(dj, di)] = value;
                }
            }
        }
        m
    }

    /// Body velocities for joint velocities `dq`.
    pub fn velocities(&self, dq: &DVector<f64>) -> Vec<Vector6<f64>> {
        let mut v: Vec<Vector6<f64>> = Vec::with_capacity(self.num_bodies());
        for i in 0..self.num_bodies() {
            let vp = self.parent[i].map_or_else(Vector6::zeros, |p| v[p]);
            v.push(self.xform[i] * vp + self.subspace[i] * self.dof_value(i, dq));
        }
        v
    }

    /// Forward pass of the recursive Newton-Euler algorithm producing body
    /// velocities, accelerations and net body forces (without children).
    fn rnea_forward(
        &self,
        dq: &DVector<f64>,
        ddq: &DVector<f64>,
        gravity: &Vector3<f64>,
        external: Option<&[Vector6<f64>]>,
    ) -> (Vec<Vector6<f64>>, Vec<Vector6<f64>>, Vec<Vector6<f64>>) {
        let n = self.num_bodies();
        let a0 = Self::gravity_acceleration(gravity);
        let mut v = Vec::with_capacity(n);
        let mut a = Vec::with_capacity(n);
        let mut f = Vec::with_capacity(n);
        for i in 0..n {
            let (vp, ap) = match self.parent[i] {
                Some(p) => (v[p], a[p]),
                None => (Vector6::zeros(), a0),
            };
            let s = &self.subspace[i];
            let qd = self.dof_value(i, dq);
            let vi = self.xform[i] * vp + s * qd;
            let ai = self.xform[i] * ap + s * self.dof_value(i, ddq) + crm(&vi) * s * qd;
            let inertia = &self.inertia[i];
            let mut fi = inertia * ai + crf(&vi) * (inertia * vi);
            if let Some(ext) = external {
                fi -= ext[i];
            }
            v.push(vi);
            a.push(ai);
            f.push(fi);
        }
        (v, a, f)
    }

    /// Accumulate body forces towards the root and project them onto the joints.
    /// On return `forces` holds the total force transmitted by each joint.
    fn backward_pass(&self, forces: &mut [Vector6<f64>]) -> DVector<f64> {
        let mut tau = DVector::zeros(self.num_dofs);
        for i in (0..self.num_bodies()).rev() {
            if let Some(d) = self.dof[i] {
                tau[d] = self.subspace[i].dot(&forces[i]);
            }
            if let Some(p) = self.parent[i] {
                let transmitted = self.xform[i].transpose() * forces[i];
                forces[p] += transmitted;
            }
        }
        tau
    }

    /// Recursive Newton-Euler inverse dynamics. Body `external` forces are
    /// given in body coordinates and oppose the required joint forces.
    pub fn inverse_dynamics(
        &self,
        dq: &DVector<f64>,
        ddq: &DVector<f64>,
        gravity: &Vector3<f64>,
        external: Option<&[Vector6<f64>]>,
    ) -> DVector<f64> {
        let (_, _, mut f) = self.rnea_forward(dq, ddq, gravity, external);
        self.backward_pass(&mut f)
    }

    /// Joint forces equivalent to the given body forces, `Σ Jᵢᵀ fᵢ`.
    pub fn body_forces_to_joint_forces(&self, body_forces: &[Vector6<f64>]) -> DVector<f64> {
        let mut f = body_forces.to_vec();
        self.backward_pass(&mut f)
    }

    /// Articulated inertias with `diagonal` added to each joint pivot.
    pub fn articulated_inertia(&self, diagonal: &JointDiagonal) -> Vec<Matrix6<f64>> {
        let mut ia = self.inertia.clone();
        for i in (0..self.num_bodies()).rev() {
            let p = match self.parent[i] {
                Some(p) => p,
                None => continue,
            };
            let mut transmitted = ia[i];
            if let Some(d) = self.dof[i] {
                let u = ia[i] * self.subspace[i];
                let pivot = self.subspace[i].dot(&u) + diagonal[d];
                transmitted -= u * u.transpose() / pivot;
            }
            let child = self.xform[i].transpose() * transmitted * self.xform[i];
            ia[p] += child;
        }
        ia
    }

    /// Articulated body algorithm without velocity or gravity terms, i.e.
    /// `(M + diag(diagonal))⁻¹ τ` given the matching articulated inertias.
    pub fn apply_inverse(
        &self,
        articulated: &[Matrix6<f64>],
        diagonal: &JointDiagonal,
        tau: &DVector<f64>,
    ) -> DVector<f64> {
        let n = self.num_bodies();
        let mut bias = vec![Vector6::zeros(); n];
        let mut u_vec = vec![Vector6::zeros(); n];
        let mut pivot = vec![1.0; n];
        let mut u_force = vec![0.0; n];
        for i in (0..n).rev() {
            let mut transmitted = bias[i];
            if let Some(d) = self.dof[i] {
                u_vec[i] = articulated[i] * self.subspace[i];
                pivot[i] = self.subspace[i].dot(&u_vec[i]) + diagonal[d];
                u_force[i] = tau[d] - self.subspace[i].dot(&bias[i]);
                transmitted += u_vec[i] * (u_force[i] / pivot[i]);
            }
            if let Some(p) = self.parent[i] {
                let child = self.xform[i].transpose() * transmitted;
                bias[p] += child;
            }
        }

        let mut ddq = DVector::zeros(self.num_dofs);
        let mut a: Vec<Vector6<f64>> = Vec::with_capacity(n);
        for i in 0..n {
            let ap = self.parent[i].map_or_else(Vector6::zeros, |p| a[p]);
            let mut ai = self.xform[i] * ap;
            if let Some(d) = self.dof[i] {
                ddq[d] = (u_force[i] - u_vec[i].dot(&ai)) / pivot[i];
                ai += self.subspace[i] * ddq[d];
            }
            a.push(ai);
        }
        ddq
    }

    /// Dense `(M + diag(diagonal))⁻¹` built one column at a time.
    pub fn inverse_mass_matrix(
        &self,
        articulated: &[Matrix6<f64>],
        diagonal: &JointDiagonal,
    ) -> DMatrix<f64> {
        let n = self.num_dofs;
        let mut inv = DMatrix::zeros(n, n);
        let mut unit = DVector::zeros(n);
        for k in 0..n {
            unit[k] = 1.0;
            let col = self.apply_inverse(articulated, diagonal, &unit);
            inv.column_mut(k).copy_from(&col);
            unit[k] = 0.0;
        }
        // Symmetrize to remove round-off asymmetry.
        (&inv + inv.transpose()) * 0.5
    }

    /// Partial derivatives of `inverse_dynamics` with respect to joint positions
    /// and joint velocities.
    pub fn inverse_dynamics_derivatives(
        &self,
        dq: &DVector<f64>,
        ddq: &DVector<f64>,
        gravity: &Vector3<f64>,
        external: Option<&[Vector6<f64>]>,
    ) -> (DMatrix<f64>, DMatrix<f64>) {
        let n = self.num_bodies();
        let a0 = Self::gravity_acceleration(gravity);
        let (v, a, mut f) = self.rnea_forward(dq, ddq, gravity, external);
        // Total joint forces after accumulating the subtrees.
        let _ = self.backward_pass(&mut f);

        let mut wrt_q = DMatrix::zeros(self.num_dofs, self.num_dofs);
        let mut wrt_dq = DMatrix::zeros(self.num_dofs, self.num_dofs);

        for k_body in 0..n {
            let k = match self.dof[k_body] {
                Some(k) => k,
                None => continue,
            };
            let s_k = &self.subspace[k_body];

            // Position direction: only the transform of body k depends on q_k,
            // with dX/dq = -crm(S) X.
            let mut dv = vec![Vector6::zeros(); n];
            let mut da = vec![Vector6::zeros(); n];
            let mut df = vec![Vector6::zeros(); n];
            for i in 0..n {
                let (vp, ap, dvp, dap) = match self.parent[i] {
                    Some(p) => (v[p], a[p], dv[p], da[p]),
                    None => (Vector6::zeros(), a0, Vector6::zeros(), Vector6::zeros()),
                };
                let x = &self.xform[i];
                let mut dvi = x * dvp;
                let mut dai = x * dap;
                if i == k_body {
                    let cross = crm(s_k);
                    dvi -= cross * (x * vp);
                    dai -= cross * (x * ap);
                }
                dai += crm(&dvi) * self.subspace[i] * self.dof_value(i, dq);
                dv[i] = dvi;
                da[i] = dai;
                df[i] = self.force_derivative(i, &v[i], &dvi, &dai);
            }
            for i in (0..n).rev() {
                if let Some(d) = self.dof[i] {
                    wrt_q[(d, k)] = self.subspace[i].dot(&df[i]);
                }
                if let Some(p) = self.parent[i] {
                    let xt = self.xform[i].transpose();
                    let mut transmitted = xt * df[i];
                    if i == k_body {
                        transmitted += xt * (crf(s_k) * f[i]);
                    }
                    df[p] += transmitted;
                }
            }

            // Velocity direction.
            for i in 0..n {
                let (dvp, dap) = match self.parent[i] {
                    Some(p) => (dv[p], da[p]),
                    None => (Vector6::zeros(), Vector6::zeros()),
                };
                let x = &self.xform[i];
                let s = &self.subspace[i];
                let mut dvi = x * dvp;
                if i == k_body {
                    dvi += s;
                }
                let mut dai = x * dap + crm(&dvi) * s * self.dof_value(i, dq);
                if i == k_body {
                    dai += crm(&v[i]) * s;
                }
                dv[i] = dvi;
                da[i] = dai;
                df[i] = self.force_derivative(i, &v[i], &dvi, &dai);
            }
            let col = self.backward_pass(&mut df);
            wrt_dq.column_mut(k).copy_from(&col);
        }
        (wrt_q, wrt_dq)
    }

    /// Directional derivative of `I a + v ×* I v`.
    fn force_derivative(
        &self,
        i: usize,
        v: &Vector6<f64>,
        dv: &Vector6<f64>,
        da: &Vector6<f64>,
    ) -> Vector6<f64> {
        let inertia = &self.inertia[i];
        inertia * da + crf(dv) * (inertia * v) + crf(v) * (inertia * dv)
    }
}
