mod test_utils;

use std::f64::consts::FRAC_PI_2;

use approx::*;
use diffdyn::*;
use na::Vector3;
use test_utils::*;

#[test]
fn forward_kinematics_of_the_arm() {
    let mut arm = make_two_link_arm();
    assert_relative_eq!(arm.com(), Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-14);

    arm.set_positions(&vector(&[FRAC_PI_2, 0.0])).unwrap();
    let elbow = arm.body_world_transform(1).unwrap();
    assert_relative_eq!(
        elbow.translation.vector,
        Vector3::new(0.0, 1.0, 0.0),
        epsilon = 1e-14
    );
    let poses = arm.world_transforms();
    assert_relative_eq!(poses[1], elbow, epsilon = 1e-14);
    assert_relative_eq!(arm.com(), Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-14);

    arm.set_positions(&vector(&[0.0, FRAC_PI_2])).unwrap();
    assert_relative_eq!(
        arm.com(),
        Vector3::new(0.75, 0.25, 0.0),
        epsilon = 1e-14
    );
}

#[test]
fn energies_of_the_arm() {
    let mut arm = make_two_link_arm();
    assert_relative_eq!(arm.compute_potential_energy(), 0.0, epsilon = 1e-14);

    arm.set_positions(&vector(&[FRAC_PI_2, 0.0])).unwrap();
    assert_relative_eq!(arm.compute_potential_energy(), 2.0 * 9.81, epsilon = 1e-12);

    arm.set_positions(&vector(&[0.0, 0.0])).unwrap();
    arm.set_velocities(&vector(&[1.0, 0.0])).unwrap();
    let m11 = 2.0 * ARM_LINK_INERTIA + 0.25 + (1.0 + 0.25 + 1.0);
    assert_relative_eq!(arm.compute_kinetic_energy(), 0.5 * m11, epsilon = 1e-12);

    // Kinetic energy is the quadratic form of the mass matrix.
    randomize_state(&mut arm, 4);
    let v = arm.velocities();
    let quadratic = 0.5 * v.dot(&(&*arm.mass_matrix() * &v));
    assert_relative_eq!(arm.compute_kinetic_energy(), quadratic, epsilon = 1e-12);
}

#[test]
fn spring_energy_is_included() {
    let mut skel = make_forked_skeleton();
    skel.set_gravity(Vector3::zeros());
    skel.set_spring_stiffness(2, 8.0).unwrap();
    skel.set_rest_position(2, 0.5).unwrap();
    skel.set_position(2, 1.0).unwrap();
    assert_relative_eq!(skel.compute_potential_energy(), 1.0, epsilon = 1e-14);
}

#[test]
fn swinging_arm_conserves_energy() {
    init_logger();
    let mut world = World::new();
    world.set_gravity(Vector3::new(0.0, -9.81, 0.0));
    world.set_time_step(1e-4).unwrap();
    world.add_skeleton(make_two_link_arm()).unwrap();
    world.set_positions(&vector(&[0.3, 0.2])).unwrap();

    let energy = |world: &World| {
        let arm = world.skeleton(0).unwrap();
        arm.compute_kinetic_energy() + arm.compute_potential_energy()
    };
    let initial = energy(&world);
    for _ in 0..1000 {
        world.step(false).unwrap();
    }
    assert!(world.velocities().norm() > 0.1);
    assert_relative_eq!(energy(&world), initial, epsilon = 1e-2);
}

#[test]
fn support_polygon_of_the_box() {
    let mut skel = make_prismatic_box();
    let version = skel.support_version();
    let support = skel.support_polygon().clone();
    assert_eq!(support.polygon.len(), 4);
    assert_relative_eq!(support.centroid, na::Vector2::zeros(), epsilon = 1e-14);
    assert_eq!(skel.support_version(), version + 1);

    // Reading again reuses the cached geometry.
    let _ = skel.support_polygon();
    assert_eq!(skel.support_version(), version + 1);

    skel.set_position(0, 0.3).unwrap();
    let _ = skel.support_polygon();
    assert_eq!(skel.support_version(), version + 2);
}
