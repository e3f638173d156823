mod test_utils;

use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use approx::*;
use diffdyn::realtime::{time_since_epoch_millis, Optimizer, Problem, Solution};
use diffdyn::*;
use na::{DMatrix, DVector};
use test_utils::*;

/// Rolls the problem out once and scores the distance to the sensed positions.
struct TrackSensors;

impl Optimizer for TrackSensors {
    fn optimize(&mut self, problem: &mut dyn Problem, world: &mut World) -> Result<Solution> {
        let sensors = problem
            .metadata("sensors")
            .cloned()
            .ok_or_else(|| Error::MissingCollaborator {
                name: "sensors".to_string(),
            })?;
        let rollout = problem.rollout_cache(world)?;
        Ok(Solution {
            loss: (&rollout.positions - sensors).norm_squared(),
            iterations: 1,
        })
    }
}

fn box_estimator(planning_history_millis: i64) -> Ssid {
    let mut world = World::new();
    world.set_time_step(0.01).unwrap();
    world.add_skeleton(make_prismatic_box()).unwrap();
    let mut ssid = Ssid::new(
        world,
        SsidParams {
            planning_history_millis,
            sensor_dim: 1,
        },
    );
    ssid.set_optimizer(Box::new(TrackSensors)).unwrap();
    ssid
}

#[test]
fn inference_starts_from_the_estimated_position() {
    init_logger();
    let mut ssid = box_estimator(50);
    ssid.set_initial_pos_estimator(|sensors, _| sensors.column(sensors.ncols() - 1).into_owned())
        .unwrap();
    let (sender, receiver) = mpsc::channel();
    ssid.register_infer_listener(move |time, pos, vel, masses, _| {
        let _ = sender.send((time, pos.clone(), vel.clone(), masses.clone()));
    })
    .unwrap();

    for t in (0..=100).step_by(10) {
        ssid.register_controls(t, DVector::from_element(1, 9.81)).unwrap();
        ssid.register_sensors(t, DVector::from_element(1, 2.0)).unwrap();
    }
    ssid.run_inference(100).unwrap();

    let (time, pos, vel, masses) = receiver.try_recv().unwrap();
    assert_eq!(time, 100);
    assert_relative_eq!(pos[0], 2.0, epsilon = 1e-12);
    assert_relative_eq!(vel[0], 0.0, epsilon = 1e-12);
    assert_eq!(masses, DVector::from_element(1, 1.0));

    let solution = ssid.last_solution().unwrap();
    assert_eq!(solution.iterations, 1);
    assert!(solution.loss < 1e-20);
}

/// Keeps the windows each cycle hands to the optimizer.
struct RecordWindows {
    windows: Arc<Mutex<Vec<(DMatrix<f64>, DMatrix<f64>)>>>,
}

impl Optimizer for RecordWindows {
    fn optimize(&mut self, problem: &mut dyn Problem, _: &mut World) -> Result<Solution> {
        let forces = problem.metadata("forces").cloned();
        let sensors = problem.metadata("sensors").cloned();
        if let (Some(forces), Some(sensors)) = (forces, sensors) {
            self.windows.lock().unwrap().push((forces, sensors));
        }
        Ok(Solution {
            loss: 0.0,
            iterations: 0,
        })
    }
}

#[test]
fn planning_window_leads_up_to_the_inference_time() {
    let mut ssid = box_estimator(50);
    let windows = Arc::new(Mutex::new(Vec::new()));
    ssid.set_optimizer(Box::new(RecordWindows {
        windows: Arc::clone(&windows),
    }))
    .unwrap();

    for t in (0..=100).step_by(10) {
        ssid.register_controls(t, DVector::from_element(1, t as f64))
            .unwrap();
        ssid.register_sensors(t, DVector::from_element(1, -(t as f64)))
            .unwrap();
    }
    ssid.run_inference(100).unwrap();

    let windows = windows.lock().unwrap();
    assert_eq!(windows.len(), 1);
    let (forces, sensors) = &windows[0];
    assert_eq!(
        *forces,
        DMatrix::from_row_slice(1, 5, &[50.0, 60.0, 70.0, 80.0, 90.0])
    );
    assert_eq!(
        *sensors,
        DMatrix::from_row_slice(1, 5, &[-50.0, -60.0, -70.0, -80.0, -90.0])
    );
}

#[test]
fn worker_reports_estimates_until_stopped() {
    init_logger();
    let mut ssid = box_estimator(50);
    let (sender, receiver) = mpsc::channel();
    ssid.register_infer_listener(move |time, pos, _, masses, compute_millis| {
        let _ = sender.send((time, pos.clone(), masses.clone(), compute_millis));
    })
    .unwrap();

    let now = time_since_epoch_millis();
    for t in (now - 200..=now).step_by(10) {
        ssid.register_controls(t, DVector::from_element(1, 9.81)).unwrap();
        ssid.register_sensors(t, DVector::zeros(1)).unwrap();
    }

    ssid.start().unwrap();
    assert!(matches!(
        ssid.world_mut(),
        Err(Error::EstimatorRunning)
    ));
    // Logging stays available while the worker runs.
    ssid.register_controls_now(DVector::from_element(1, 9.81)).unwrap();

    let (time, pos, masses, compute_millis) = receiver
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    ssid.stop().unwrap();

    assert!(time >= now);
    assert!(compute_millis >= 0);
    assert!(pos[0].abs() < 1e-9);
    assert_eq!(masses, DVector::from_element(1, 1.0));
    assert!(ssid.world().is_some());
    assert!(ssid.last_solution().is_some());
    assert!(ssid.control_log().len() >= 21);
}

#[test]
fn no_inference_without_enough_history() {
    let mut ssid = box_estimator(60_000);
    let (sender, receiver) = mpsc::channel();
    ssid.register_infer_listener(move |time, _, _, _, _| {
        let _ = sender.send(time);
    })
    .unwrap();
    ssid.register_controls_now(DVector::zeros(1)).unwrap();

    ssid.start().unwrap();
    assert!(receiver.recv_timeout(Duration::from_millis(20)).is_err());
    ssid.stop().unwrap();
    assert!(ssid.last_solution().is_none());
}
