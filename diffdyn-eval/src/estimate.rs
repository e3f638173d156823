use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use diffdyn::realtime::{time_since_epoch_millis, Optimizer, Problem, Solution};
use diffdyn::{Error, Ssid, SsidParams, World};

use crate::scene::SceneConfig;

/// Coordinate search over link masses that minimizes the distance between
/// the replayed trajectory and the sensed positions.
pub struct MassSearch {
    factors: Vec<f64>,
}

impl Default for MassSearch {
    fn default() -> Self {
        MassSearch {
            factors: vec![0.5, 0.8, 1.25, 2.0],
        }
    }
}

fn tracking_loss(problem: &mut dyn Problem, world: &mut World) -> diffdyn::Result<f64> {
    let sensors = problem
        .metadata("sensors")
        .cloned()
        .ok_or_else(|| Error::MissingCollaborator {
            name: "sensors".to_string(),
        })?;
    let rollout = problem.rollout_cache(world)?;
    if sensors.shape() != rollout.positions.shape() {
        return Err(Error::SizeMismatch {
            what: "sensor rows",
            expected: rollout.positions.nrows(),
            actual: sensors.nrows(),
        });
    }
    Ok((&rollout.positions - sensors).norm_squared())
}

impl Optimizer for MassSearch {
    fn optimize(
        &mut self,
        problem: &mut dyn Problem,
        world: &mut World,
    ) -> diffdyn::Result<Solution> {
        let lower = world.mass_lower_limits();
        let upper = world.mass_upper_limits();
        let mut best = tracking_loss(problem, world)?;
        let mut iterations = 1;
        for i in 0..world.num_masses() {
            let mut masses = world.masses();
            let base = masses[i];
            let mut best_mass = base;
            for &factor in self.factors.iter() {
                let candidate = (base * factor).max(lower[i]).min(upper[i]);
                if candidate == base {
                    continue;
                }
                masses[i] = candidate;
                world.set_masses(&masses)?;
                let loss = tracking_loss(problem, world)?;
                iterations += 1;
                if loss < best {
                    best = loss;
                    best_mass = candidate;
                }
            }
            masses[i] = best_mass;
            world.set_masses(&masses)?;
        }
        Ok(Solution {
            loss: best,
            iterations,
        })
    }
}

/// Simulate the plant in real time for `seconds` while estimating its masses.
pub fn run_realtime(scene: &SceneConfig, seconds: f64, interrupted: Arc<AtomicBool>) -> Result<()> {
    let mut plant = scene.build_plant()?;
    let model = scene.build_world()?;
    let num_dofs = plant.num_dofs();

    let mut ssid = Ssid::new(
        model,
        SsidParams {
            planning_history_millis: scene.planning_history_millis,
            sensor_dim: num_dofs,
        },
    );
    ssid.set_optimizer(Box::new(MassSearch::default()))?;
    ssid.set_initial_pos_estimator(|sensors, _| sensors.column(0).into_owned())?;
    ssid.register_infer_listener(|time, position, _, masses, compute_millis| {
        log::info!(
            "t = {} ms: position {:?}, masses {:?} ({} ms)",
            time,
            position.as_slice(),
            masses.as_slice(),
            compute_millis
        );
    })?;
    ssid.start()?;

    let period = Duration::from_secs_f64(plant.time_step());
    let started = Instant::now();
    let mut steps = 0u64;
    while started.elapsed().as_secs_f64() < seconds && !interrupted.load(Ordering::SeqCst) {
        let now = time_since_epoch_millis();
        ssid.register_controls(now, plant.forces())?;
        ssid.register_sensors(now, plant.positions())?;
        plant.step(false)?;
        steps += 1;
        std::thread::sleep(period);
    }
    ssid.stop()?;

    if let Some(world) = ssid.world() {
        println!("Simulated {} plant steps", steps);
        println!("Plant masses:     {:?}", plant.masses().as_slice());
        println!("Estimated masses: {:?}", world.masses().as_slice());
    }
    if let Some(solution) = ssid.last_solution() {
        println!(
            "Last fit: loss {:e} after {} rollouts",
            solution.loss, solution.iterations
        );
    }
    Ok(())
}
