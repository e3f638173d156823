use ahash::AHashMap;
use na::{DMatrix, DVector};

use crate::simulation::{RestorableSnapshot, World};
use crate::{Error, Result};

/// Positions, velocities and forces of a trajectory, one column per step.
#[derive(Clone, Debug, PartialEq)]
pub struct TrajectoryRollout {
    pub positions: DMatrix<f64>,
    pub velocities: DMatrix<f64>,
    pub forces: DMatrix<f64>,
}

impl TrajectoryRollout {
    pub fn zeros(num_dofs: usize, steps: usize) -> Self {
        TrajectoryRollout {
            positions: DMatrix::zeros(num_dofs, steps),
            velocities: DMatrix::zeros(num_dofs, steps),
            forces: DMatrix::zeros(num_dofs, steps),
        }
    }

    pub fn num_steps(&self) -> usize {
        self.positions.ncols()
    }
}

/// Summary of an optimization run.
#[derive(Clone, Debug, PartialEq)]
pub struct Solution {
    pub loss: f64,
    pub iterations: usize,
}

/// A trajectory problem whose forces can be pinned to recorded controls.
pub trait Problem: Send {
    fn num_steps(&self) -> usize;
    fn pin_force(&mut self, step: usize, force: &DVector<f64>) -> Result<()>;
    fn set_metadata(&mut self, key: &str, value: DMatrix<f64>);
    fn metadata(&self, key: &str) -> Option<&DMatrix<f64>>;
    fn set_start_pos(&mut self, position: DVector<f64>) -> Result<()>;
    /// Roll the current decision variables out in `world`.
    fn rollout_cache(&mut self, world: &mut World) -> Result<&TrajectoryRollout>;
}

/// Searches the free variables of a problem.
pub trait Optimizer: Send {
    fn optimize(&mut self, problem: &mut dyn Problem, world: &mut World) -> Result<Solution>;
}

/// Single shooting from the start position at rest with every force pinned.
///
/// The world state is restored after each rollout.
#[derive(Clone, Debug)]
pub struct ForceReplay {
    forces: DMatrix<f64>,
    start_pos: DVector<f64>,
    metadata: AHashMap<String, DMatrix<f64>>,
    rollout: TrajectoryRollout,
}

impl ForceReplay {
    pub fn new(num_dofs: usize, steps: usize) -> Self {
        ForceReplay {
            forces: DMatrix::zeros(num_dofs, steps),
            start_pos: DVector::zeros(num_dofs),
            metadata: AHashMap::new(),
            rollout: TrajectoryRollout::zeros(num_dofs, steps),
        }
    }

    fn simulate(&mut self, world: &mut World) -> Result<()> {
        world.set_positions(&self.start_pos)?;
        world.set_velocities(&DVector::zeros(self.start_pos.len()))?;
        for i in 0..self.forces.ncols() {
            let force = self.forces.column(i).into_owned();
            world.set_forces(&force)?;
            world.step(false)?;
            self.rollout.positions.set_column(i, &world.positions());
            self.rollout.velocities.set_column(i, &world.velocities());
            self.rollout.forces.set_column(i, &force);
        }
        Ok(())
    }
}

impl Problem for ForceReplay {
    fn num_steps(&self) -> usize {
        self.forces.ncols()
    }

    fn pin_force(&mut self, step: usize, force: &DVector<f64>) -> Result<()> {
        Error::check_index("steps", step, self.forces.ncols())?;
        Error::check_size("pinned force", self.forces.nrows(), force.len())?;
        self.forces.set_column(step, force);
        Ok(())
    }

    fn set_metadata(&mut self, key: &str, value: DMatrix<f64>) {
        self.metadata.insert(key.to_string(), value);
    }

    fn metadata(&self, key: &str) -> Option<&DMatrix<f64>> {
        self.metadata.get(key)
    }

    fn set_start_pos(&mut self, position: DVector<f64>) -> Result<()> {
        Error::check_size("start position", self.start_pos.len(), position.len())?;
        self.start_pos = position;
        Ok(())
    }

    fn rollout_cache(&mut self, world: &mut World) -> Result<&TrajectoryRollout> {
        Error::check_size("world dofs", self.forces.nrows(), world.num_dofs())?;
        let saved = RestorableSnapshot::new(world);
        let simulated = self.simulate(world);
        saved.restore(world)?;
        simulated?;
        Ok(&self.rollout)
    }
}
