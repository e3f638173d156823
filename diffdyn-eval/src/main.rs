mod estimate;
mod scene;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use diffdyn::{forward_pass, World};
use scene::SceneConfig;

const ABOUT: &str = "
Diffdyn steps articulated rigid body scenes, checks the Jacobians of each step against finite
differences and estimates link masses from live trajectories.";

#[derive(Parser)]
#[clap(author, about = ABOUT, name = "diffdyn")]
struct Opt {
    /// Path to the scene configuration file in `ron` format.
    #[clap(name = "CONFIG", parse(from_os_str))]
    config: PathBuf,

    /// Number of steps of simulation to run.
    #[clap(short, long, default_value = "1")]
    steps: u64,

    /// Compare the analytical step Jacobians with finite differences at every step.
    #[clap(short, long)]
    check_gradients: bool,

    /// Simulate the scene in real time for the given number of seconds while
    /// estimating its link masses.
    #[clap(short, long, value_name = "SECONDS")]
    realtime: Option<f64>,

    #[clap(flatten)]
    verbose: clap_verbosity_flag::Verbosity,
}

pub fn main() {
    if let Err(err) = try_main() {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

pub fn try_main() -> Result<()> {
    let opt = Opt::parse();
    let _ = env_logger::Builder::new()
        .filter_level(opt.verbose.log_level_filter())
        .parse_env("DIFFDYN_LOG")
        .try_init();

    let config_ext = match opt.config.extension().and_then(|x| x.to_str()) {
        Some(ext) => ext,
        None => anyhow::bail!(
            "Missing file extension in config path: {}",
            opt.config.display()
        ),
    };
    let scene = match config_ext {
        "ron" => SceneConfig::load_from_ron(&opt.config)?,
        _ => anyhow::bail!("Unsupported config extension: '.{}'", config_ext),
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst))?;
    }

    if let Some(seconds) = opt.realtime {
        return estimate::run_realtime(&scene, seconds, interrupted);
    }

    let mut world = scene.build_world()?;
    simulate(&mut world, opt.steps, opt.check_gradients, &interrupted)?;

    println!("Time: {}", world.time());
    println!("Positions:  {:?}", world.positions().as_slice());
    println!("Velocities: {:?}", world.velocities().as_slice());
    let energy: f64 = world
        .skeletons()
        .iter()
        .map(|s| s.compute_kinetic_energy() + s.compute_potential_energy())
        .sum();
    println!("Energy: {}", energy);
    Ok(())
}

/// Largest absolute differences between analytical and finite difference Jacobians.
#[derive(Copy, Clone, Debug, Default)]
struct GradientError {
    force_vel: f64,
    vel_vel: f64,
    pos_pos: f64,
    vel_pos: f64,
}

impl GradientError {
    fn max(self, other: GradientError) -> GradientError {
        GradientError {
            force_vel: self.force_vel.max(other.force_vel),
            vel_vel: self.vel_vel.max(other.vel_vel),
            pos_pos: self.pos_pos.max(other.pos_pos),
            vel_pos: self.vel_pos.max(other.vel_pos),
        }
    }
}

const SUBDIVISIONS: usize = 10;

fn check_step(world: &mut World) -> Result<GradientError> {
    let snapshot = forward_pass(world)?;
    let force_vel = snapshot.finite_difference_force_vel_jacobian(world)?;
    let vel_vel = snapshot.finite_difference_vel_vel_jacobian(world)?;
    let pos_pos = snapshot.finite_difference_pos_pos_jacobian(world, SUBDIVISIONS)?;
    let vel_pos = snapshot.finite_difference_vel_pos_jacobian(world, SUBDIVISIONS)?;
    Ok(GradientError {
        force_vel: (snapshot.force_vel_jacobian() - force_vel).amax(),
        vel_vel: (snapshot.vel_vel_jacobian() - vel_vel).amax(),
        pos_pos: (snapshot.pos_pos_jacobian() - pos_pos).amax(),
        vel_pos: (snapshot.vel_pos_jacobian() - vel_pos).amax(),
    })
}

fn simulate(
    world: &mut World,
    steps: u64,
    check_gradients: bool,
    interrupted: &AtomicBool,
) -> Result<()> {
    let progress = ProgressBar::new(steps);
    progress.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} steps [{elapsed_precise}] {msg}")?
            .progress_chars("##-"),
    );

    let mut worst = GradientError::default();
    for _ in 0..steps {
        if interrupted.load(Ordering::SeqCst) {
            progress.abandon_with_message("interrupted");
            break;
        }
        if check_gradients {
            let error = check_step(world)?;
            log::debug!("Step at t = {}: {:?}", world.time(), error);
            worst = worst.max(error);
            progress.set_message(format!("worst force-vel error {:.2e}", worst.force_vel));
        } else {
            world.step(false)?;
        }
        progress.inc(1);
    }
    progress.finish();

    if check_gradients {
        println!("Largest Jacobian errors against finite differences:");
        println!("  force-vel: {:e}", worst.force_vel);
        println!("  vel-vel:   {:e}", worst.vel_vel);
        println!("  pos-pos:   {:e}", worst.pos_pos);
        println!("  vel-pos:   {:e}", worst.vel_pos);
    }
    Ok(())
}
