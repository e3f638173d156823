use na::{DVector, Vector3};
use rayon::prelude::*;

use crate::dynamics::Skeleton;
use crate::{Error, Result};

/// Resolves contacts after the unconstrained velocity update.
///
/// When `gradient_enabled` is set, the solver must attach the gradient
/// matrices of every constraint group to each participating skeleton (see
/// [`Skeleton::set_gradient_constraint_matrices`]) so that the step can be
/// backpropagated.
pub trait ConstraintSolver: Send {
    fn solve(
        &mut self,
        skeletons: &mut [Skeleton],
        time_step: f64,
        gradient_enabled: bool,
    ) -> Result<()>;
}

/// A collection of skeletons simulated together.
///
/// World level state vectors concatenate the skeletons' vectors in the order
/// the skeletons were added.
pub struct World {
    skeletons: Vec<Skeleton>,
    time_step: f64,
    gravity: Vector3<f64>,
    time: f64,
    constraint_solver: Option<Box<dyn ConstraintSolver>>,
    gradient_enabled: bool,
}

impl Default for World {
    fn default() -> Self {
        World::new()
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("skeletons", &self.skeletons.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("time_step", &self.time_step)
            .field("gravity", &self.gravity)
            .field("time", &self.time)
            .field("gradient_enabled", &self.gradient_enabled)
            .finish()
    }
}

impl World {
    pub fn new() -> Self {
        World {
            skeletons: Vec::new(),
            time_step: 0.001,
            gravity: Vector3::new(0.0, 0.0, -9.81),
            time: 0.0,
            constraint_solver: None,
            gradient_enabled: false,
        }
    }

    /// Add a skeleton, adopting the world time step and gravity. Returns its index.
    pub fn add_skeleton(&mut self, mut skeleton: Skeleton) -> Result<usize> {
        if self.skeletons.iter().any(|s| s.name() == skeleton.name()) {
            return Err(Error::DuplicateName {
                name: skeleton.name().to_string(),
            });
        }
        skeleton.set_time_step(self.time_step)?;
        skeleton.set_gravity(self.gravity);
        self.skeletons.push(skeleton);
        Ok(self.skeletons.len() - 1)
    }

    pub fn num_skeletons(&self) -> usize {
        self.skeletons.len()
    }

    pub fn skeletons(&self) -> &[Skeleton] {
        &self.skeletons
    }

    pub fn skeletons_mut(&mut self) -> &mut [Skeleton] {
        &mut self.skeletons
    }

    pub fn skeleton(&self, index: usize) -> Result<&Skeleton> {
        Error::check_index("skeletons", index, self.skeletons.len())?;
        Ok(&self.skeletons[index])
    }

    pub fn skeleton_mut(&mut self, index: usize) -> Result<&mut Skeleton> {
        Error::check_index("skeletons", index, self.skeletons.len())?;
        Ok(&mut self.skeletons[index])
    }

    pub fn skeleton_by_name(&self, name: &str) -> Result<&Skeleton> {
        self.skeletons
            .iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| Error::UnknownSkeleton {
                name: name.to_string(),
            })
    }

    pub fn num_dofs(&self) -> usize {
        self.skeletons.iter().map(|s| s.num_dofs()).sum()
    }

    pub fn time_step(&self) -> f64 {
        self.time_step
    }

    pub fn set_time_step(&mut self, time_step: f64) -> Result<()> {
        if !(time_step > 0.0 && time_step.is_finite()) {
            return Err(Error::InvalidParameter {
                name: "time_step".to_string(),
            });
        }
        for skeleton in self.skeletons.iter_mut() {
            skeleton.set_time_step(time_step)?;
        }
        self.time_step = time_step;
        Ok(())
    }

    pub fn gravity(&self) -> Vector3<f64> {
        self.gravity
    }

    pub fn set_gravity(&mut self, gravity: Vector3<f64>) {
        self.gravity = gravity;
        for skeleton in self.skeletons.iter_mut() {
            skeleton.set_gravity(gravity);
        }
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn set_time(&mut self, time: f64) {
        self.time = time;
    }

    pub fn set_constraint_solver(&mut self, solver: Box<dyn ConstraintSolver>) {
        self.constraint_solver = Some(solver);
    }

    pub fn remove_constraint_solver(&mut self) -> Option<Box<dyn ConstraintSolver>> {
        self.constraint_solver.take()
    }

    pub fn gradient_enabled(&self) -> bool {
        self.gradient_enabled
    }

    pub fn set_gradient_enabled(&mut self, enabled: bool) {
        self.gradient_enabled = enabled;
    }

    /*
     * Concatenated state
     */

    fn concatenate(&self, get: impl Fn(&Skeleton) -> DVector<f64>) -> DVector<f64> {
        let parts: Vec<DVector<f64>> = self.skeletons.iter().map(get).collect();
        let len = parts.iter().map(|p| p.len()).sum();
        DVector::from_iterator(len, parts.iter().flat_map(|p| p.iter().copied()))
    }

    fn distribute(
        &mut self,
        what: &'static str,
        values: &DVector<f64>,
        count: impl Fn(&Skeleton) -> usize,
        mut set: impl FnMut(&mut Skeleton, &DVector<f64>) -> Result<()>,
    ) -> Result<()> {
        let total: usize = self.skeletons.iter().map(&count).sum();
        Error::check_size(what, total, values.len())?;
        let mut offset = 0;
        for skeleton in self.skeletons.iter_mut() {
            let n = count(skeleton);
            set(skeleton, &values.rows(offset, n).into_owned())?;
            offset += n;
        }
        Ok(())
    }

    pub fn positions(&self) -> DVector<f64> {
        self.concatenate(Skeleton::positions)
    }

    pub fn set_positions(&mut self, positions: &DVector<f64>) -> Result<()> {
        self.distribute("positions", positions, Skeleton::num_dofs, Skeleton::set_positions)
    }

    pub fn velocities(&self) -> DVector<f64> {
        self.concatenate(Skeleton::velocities)
    }

    pub fn set_velocities(&mut self, velocities: &DVector<f64>) -> Result<()> {
        self.distribute("velocities", velocities, Skeleton::num_dofs, Skeleton::set_velocities)
    }

    pub fn forces(&self) -> DVector<f64> {
        self.concatenate(Skeleton::forces)
    }

    pub fn set_forces(&mut self, forces: &DVector<f64>) -> Result<()> {
        self.distribute("forces", forces, Skeleton::num_dofs, Skeleton::set_forces)
    }

    pub fn num_masses(&self) -> usize {
        self.skeletons.iter().map(|s| s.num_bodies()).sum()
    }

    /// Link masses of every skeleton.
    pub fn masses(&self) -> DVector<f64> {
        self.concatenate(Skeleton::link_masses)
    }

    pub fn set_masses(&mut self, masses: &DVector<f64>) -> Result<()> {
        self.distribute("masses", masses, Skeleton::num_bodies, Skeleton::set_link_masses)
    }

    pub fn mass_lower_limits(&self) -> DVector<f64> {
        self.concatenate(|s| s.link_mass_limits().0)
    }

    pub fn mass_upper_limits(&self) -> DVector<f64> {
        self.concatenate(|s| s.link_mass_limits().1)
    }

    /// Block diagonal world mass matrix.
    pub fn mass_matrix(&self) -> na::DMatrix<f64> {
        self.block_diagonal(|s| s.mass_matrix().clone())
    }

    /// Block diagonal world inverse mass matrix.
    pub fn inv_mass_matrix(&self) -> na::DMatrix<f64> {
        self.block_diagonal(|s| s.inv_mass_matrix().clone())
    }

    fn block_diagonal(&self, block: impl Fn(&Skeleton) -> na::DMatrix<f64>) -> na::DMatrix<f64> {
        let n = self.num_dofs();
        let mut out = na::DMatrix::zeros(n, n);
        let mut offset = 0;
        for skeleton in self.skeletons.iter() {
            let m = block(skeleton);
            let k = skeleton.num_dofs();
            out.view_mut((offset, offset), (k, k)).copy_from(&m);
            offset += k;
        }
        out
    }

    /*
     * Time stepping
     */

    /// Advance the world by one time step.
    ///
    /// Each mobile skeleton computes its unconstrained forward dynamics and
    /// velocity update, then the constraint solver corrects the velocities
    /// before positions are integrated. Joint forces are cleared if
    /// `reset_command` is set.
    pub fn step(&mut self, reset_command: bool) -> Result<()> {
        let h = self.time_step;
        self.skeletons
            .par_iter_mut()
            .filter(|s| s.is_mobile())
            .for_each(|s| {
                s.compute_forward_dynamics();
                s.integrate_velocities(h);
            });

        // Groups from the previous step must not leak into this one.
        if self.gradient_enabled {
            for skeleton in self.skeletons.iter_mut() {
                skeleton.clear_gradient_constraint_matrices();
            }
        }
        if let Some(solver) = self.constraint_solver.as_mut() {
            solver.solve(&mut self.skeletons, h, self.gradient_enabled)?;
        }

        for skeleton in self.skeletons.iter_mut().filter(|s| s.is_mobile()) {
            skeleton.integrate_positions(h);
            if reset_command {
                skeleton.clear_internal_forces();
                skeleton.clear_external_forces();
            }
            skeleton.clear_constraint_impulses();
        }
        self.time += h;
        Ok(())
    }
}

/// Saved world state that can be restored after replaying steps.
#[derive(Clone, Debug, PartialEq)]
pub struct RestorableSnapshot {
    positions: DVector<f64>,
    velocities: DVector<f64>,
    forces: DVector<f64>,
    time_step: f64,
    time: f64,
}

impl RestorableSnapshot {
    pub fn new(world: &World) -> Self {
        RestorableSnapshot {
            positions: world.positions(),
            velocities: world.velocities(),
            forces: world.forces(),
            time_step: world.time_step(),
            time: world.time(),
        }
    }

    pub fn restore(&self, world: &mut World) -> Result<()> {
        world.set_time_step(self.time_step)?;
        world.set_positions(&self.positions)?;
        world.set_velocities(&self.velocities)?;
        world.set_forces(&self.forces)?;
        world.set_time(self.time);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use approx::*;

    #[test]
    fn concatenated_state() {
        let world = make_arm_and_box_world();
        assert_eq!(world.num_dofs(), 3);
        let q = DVector::from_vec(vec![0.1, 0.2, 0.3]);
        let mut world = world;
        world.set_positions(&q).unwrap();
        assert_eq!(world.positions(), q);
        assert_eq!(world.skeleton(1).unwrap().positions()[0], 0.3);
        assert!(matches!(
            world.set_positions(&DVector::zeros(2)),
            Err(Error::SizeMismatch { expected: 3, actual: 2, .. })
        ));
        assert_eq!(world.masses().len(), world.num_masses());
    }

    #[test]
    fn free_fall_without_solver() {
        let mut world = World::new();
        world.set_time_step(0.01).unwrap();
        world.add_skeleton(make_prismatic_box()).unwrap();
        for _ in 0..10 {
            world.step(false).unwrap();
        }
        // Semi-implicit Euler: v = -g t, q = -g h² (1 + 2 + ... + 10).
        assert_relative_eq!(world.velocities()[0], -0.981, epsilon = 1e-12);
        assert_relative_eq!(world.positions()[0], -9.81 * 1e-4 * 55.0, epsilon = 1e-12);
        assert_relative_eq!(world.time(), 0.1, epsilon = 1e-12);
    }

    #[test]
    fn snapshot_restores_state() {
        let mut world = make_arm_and_box_world();
        world.set_forces(&DVector::from_vec(vec![1.0, 0.0, 2.0])).unwrap();
        let snapshot = RestorableSnapshot::new(&world);
        world.step(true).unwrap();
        assert_eq!(world.forces(), DVector::zeros(3));
        snapshot.restore(&mut world).unwrap();
        assert_eq!(RestorableSnapshot::new(&world), snapshot);
    }

    #[test]
    fn time_step_must_be_positive() {
        let mut world = World::new();
        for bad in [0.0, -0.01, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                world.set_time_step(bad),
                Err(Error::InvalidParameter { .. })
            ));
        }
        assert_eq!(world.time_step(), 0.001);
        world.add_skeleton(make_prismatic_box()).unwrap();
        world.set_time_step(0.02).unwrap();
        assert_eq!(world.skeleton(0).unwrap().time_step(), 0.02);
    }

    #[test]
    fn duplicate_skeleton_names_are_rejected() {
        let mut world = World::new();
        world.add_skeleton(make_prismatic_box()).unwrap();
        assert!(matches!(
            world.add_skeleton(make_prismatic_box()),
            Err(Error::DuplicateName { .. })
        ));
        assert!(world.skeleton_by_name("missing").is_err());
    }
}
