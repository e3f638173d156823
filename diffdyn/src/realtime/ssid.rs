use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use na::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::millis::time_since_epoch_millis;
use super::rollout::{ForceReplay, Optimizer, Problem, Solution};
use super::signals::block_termination_signals;
use super::vector_log::VectorLog;
use crate::simulation::World;
use crate::{Error, Result};

/// Called with `(timestamp, position, velocity, masses, compute_millis)` after
/// every inference cycle.
pub type InferListener =
    Box<dyn FnMut(i64, &DVector<f64>, &DVector<f64>, &DVector<f64>, i64) + Send>;

/// Estimates the start position of the planning window from the resampled
/// sensor history and the inference time.
pub type InitialPosEstimator = Box<dyn FnMut(&DMatrix<f64>, i64) -> DVector<f64> + Send>;

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SsidParams {
    /// Length of the history window each inference cycle fits.
    pub planning_history_millis: i64,
    /// Width of the sensor vectors.
    pub sensor_dim: usize,
}

impl SsidParams {
    /// Milliseconds per simulation step and number of steps in the planning window.
    pub fn window(&self, time_step: f64) -> (i64, usize) {
        let millis_per_step = ((time_step * 1000.0).ceil() as i64).max(1);
        let history = self.planning_history_millis.max(0);
        let steps = ((history + millis_per_step - 1) / millis_per_step).max(1) as usize;
        (millis_per_step, steps)
    }
}

fn lock(log: &Mutex<VectorLog>) -> MutexGuard<'_, VectorLog> {
    log.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything an inference cycle needs. Owned by the worker while running.
struct Engine {
    world: World,
    params: SsidParams,
    sensor_log: Arc<Mutex<VectorLog>>,
    control_log: Arc<Mutex<VectorLog>>,
    problem: Option<Box<dyn Problem>>,
    optimizer: Option<Box<dyn Optimizer>>,
    estimator: InitialPosEstimator,
    listeners: Vec<InferListener>,
    last_solution: Option<Solution>,
}

impl Engine {
    fn run_inference(&mut self, start_time: i64) -> Result<()> {
        let started = time_since_epoch_millis();
        let (millis_per_step, steps) = self.params.window(self.world.time_step());

        let window_start = start_time - self.params.planning_history_millis;
        let forces =
            lock(&self.control_log).values_starting_at(window_start, steps, millis_per_step);
        let sensors =
            lock(&self.sensor_log).values_starting_at(window_start, steps, millis_per_step);

        let num_dofs = self.world.num_dofs();
        let problem = self
            .problem
            .get_or_insert_with(|| Box::new(ForceReplay::new(num_dofs, steps)) as Box<dyn Problem>);
        for i in 0..steps {
            problem.pin_force(i, &forces.column(i).into_owned())?;
        }
        problem.set_metadata("forces", forces);
        problem.set_metadata("sensors", sensors.clone());
        problem.set_start_pos((self.estimator)(&sensors, start_time))?;

        let optimizer = self
            .optimizer
            .as_mut()
            .ok_or_else(|| Error::MissingCollaborator {
                name: "optimizer".to_string(),
            })?;
        let solution = optimizer.optimize(&mut **problem, &mut self.world)?;
        let compute_millis = time_since_epoch_millis() - started;

        let rollout = problem.rollout_cache(&mut self.world)?;
        let last = rollout.num_steps().checked_sub(1).ok_or_else(|| Error::SizeMismatch {
            what: "rollout steps",
            expected: steps,
            actual: 0,
        })?;
        let position = rollout.positions.column(last).into_owned();
        let velocity = rollout.velocities.column(last).into_owned();
        let masses = self.world.masses();

        log::info!(
            "Inference at {} took {} ms (loss {:e}, {} iterations)",
            start_time,
            compute_millis,
            solution.loss,
            solution.iterations
        );

        for listener in self.listeners.iter_mut() {
            listener(start_time, &position, &velocity, &masses, compute_millis);
        }
        self.last_solution = Some(solution);
        Ok(())
    }
}

/// Consecutive failed inference cycles. Warnings are logged on the 1st, 2nd,
/// 4th, 8th, ... failure of a streak.
#[derive(Debug, Default)]
struct FailureStreak {
    count: u64,
}

impl FailureStreak {
    /// Returns `true` if the failure was logged as a warning.
    fn report(&mut self, result: Result<()>) -> bool {
        match result {
            Ok(()) => {
                if self.count > 0 {
                    log::info!("Inference recovered after {} failed cycles", self.count);
                }
                self.count = 0;
                false
            }
            Err(err) => {
                self.count += 1;
                let warn = self.count.is_power_of_two();
                if warn {
                    log::warn!("Inference failed ({} in a row): {}", self.count, err);
                }
                warn
            }
        }
    }
}

fn worker_loop(mut engine: Engine, running: Arc<AtomicBool>) -> Engine {
    if let Err(err) = block_termination_signals() {
        log::warn!("Failed to mask termination signals: {}", err);
    }
    let history = engine.params.planning_history_millis;
    let mut failures = FailureStreak::default();
    while running.load(Ordering::Acquire) {
        let now = time_since_epoch_millis();
        if lock(&engine.control_log).available_history_before(now) >= history {
            let result = engine.run_inference(now);
            if result.is_err() {
                std::thread::yield_now();
            }
            failures.report(result);
        } else {
            std::hint::spin_loop();
        }
    }
    engine
}

/// Real time system identification.
///
/// Sensor and control readings are logged by the caller while a single worker
/// thread repeatedly fits the most recent planning window and reports the
/// estimated state to the registered listeners. The worker polls without
/// sleeping.
pub struct Ssid {
    running: Arc<AtomicBool>,
    sensor_log: Arc<Mutex<VectorLog>>,
    control_log: Arc<Mutex<VectorLog>>,
    /// `None` while the worker owns it.
    engine: Option<Engine>,
    worker: Option<JoinHandle<Engine>>,
}

impl Ssid {
    pub fn new(world: World, params: SsidParams) -> Self {
        let num_dofs = world.num_dofs();
        let sensor_log = Arc::new(Mutex::new(VectorLog::new(params.sensor_dim)));
        let control_log = Arc::new(Mutex::new(VectorLog::new(num_dofs)));
        let engine = Engine {
            world,
            params,
            sensor_log: Arc::clone(&sensor_log),
            control_log: Arc::clone(&control_log),
            problem: None,
            optimizer: None,
            estimator: Box::new(move |_, _| DVector::zeros(num_dofs)),
            listeners: Vec::new(),
            last_solution: None,
        };
        Ssid {
            running: Arc::new(AtomicBool::new(false)),
            sensor_log,
            control_log,
            engine: Some(engine),
            worker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    fn engine_mut(&mut self) -> Result<&mut Engine> {
        if self.worker.is_some() {
            return Err(Error::EstimatorRunning);
        }
        self.engine.as_mut().ok_or(Error::WorkerPanicked)
    }

    /*
     * Logging
     */

    pub fn register_sensors(&self, time: i64, sensors: DVector<f64>) -> Result<()> {
        lock(&self.sensor_log).record(time, sensors)
    }

    pub fn register_sensors_now(&self, sensors: DVector<f64>) -> Result<()> {
        self.register_sensors(time_since_epoch_millis(), sensors)
    }

    pub fn register_controls(&self, time: i64, controls: DVector<f64>) -> Result<()> {
        lock(&self.control_log).record(time, controls)
    }

    pub fn register_controls_now(&self, controls: DVector<f64>) -> Result<()> {
        self.register_controls(time_since_epoch_millis(), controls)
    }

    pub fn sensor_log(&self) -> VectorLog {
        lock(&self.sensor_log).clone()
    }

    pub fn control_log(&self) -> VectorLog {
        lock(&self.control_log).clone()
    }

    /*
     * Configuration. Only allowed while stopped.
     */

    pub fn set_problem(&mut self, problem: Box<dyn Problem>) -> Result<()> {
        self.engine_mut()?.problem = Some(problem);
        Ok(())
    }

    pub fn set_optimizer(&mut self, optimizer: Box<dyn Optimizer>) -> Result<()> {
        self.engine_mut()?.optimizer = Some(optimizer);
        Ok(())
    }

    pub fn set_initial_pos_estimator(
        &mut self,
        estimator: impl FnMut(&DMatrix<f64>, i64) -> DVector<f64> + Send + 'static,
    ) -> Result<()> {
        self.engine_mut()?.estimator = Box::new(estimator);
        Ok(())
    }

    pub fn register_infer_listener(
        &mut self,
        listener: impl FnMut(i64, &DVector<f64>, &DVector<f64>, &DVector<f64>, i64)
            + Send
            + 'static,
    ) -> Result<()> {
        self.engine_mut()?.listeners.push(Box::new(listener));
        Ok(())
    }

    pub fn world(&self) -> Option<&World> {
        self.engine.as_ref().map(|e| &e.world)
    }

    pub fn world_mut(&mut self) -> Result<&mut World> {
        Ok(&mut self.engine_mut()?.world)
    }

    /// The solution of the latest inference cycle, unless the worker is running.
    pub fn last_solution(&self) -> Option<&Solution> {
        self.engine.as_ref().and_then(|e| e.last_solution.as_ref())
    }

    /// Run one inference cycle on the calling thread, fitting the
    /// `planning_history_millis` leading up to `start_time`.
    pub fn run_inference(&mut self, start_time: i64) -> Result<()> {
        self.engine_mut()?.run_inference(start_time)
    }

    /*
     * Lifecycle
     */

    /// Spawn the worker. Does nothing if it is already running.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        if self.engine_mut()?.optimizer.is_none() {
            return Err(Error::MissingCollaborator {
                name: "optimizer".to_string(),
            });
        }
        let engine = self.engine.take().ok_or(Error::WorkerPanicked)?;
        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let spawned = std::thread::Builder::new()
            .name("ssid".to_string())
            .spawn(move || worker_loop(engine, running));
        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::Release);
                Err(err.into())
            }
        }
    }

    /// Stop the worker and wait for it to finish its current cycle. Does
    /// nothing if it is not running.
    pub fn stop(&mut self) -> Result<()> {
        let worker = match self.worker.take() {
            Some(worker) => worker,
            None => return Ok(()),
        };
        self.running.store(false, Ordering::Release);
        let engine = worker.join().map_err(|_| Error::WorkerPanicked)?;
        self.engine = Some(engine);
        Ok(())
    }
}

impl Drop for Ssid {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("Estimation worker did not stop cleanly: {}", err);
        }
    }
}
