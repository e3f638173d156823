mod test_utils;

use approx::*;
use diffdyn::*;
use na::{Matrix3, Vector3, Vector6};
pub use test_utils::*;

#[test]
fn two_link_arm_matches_closed_form() {
    init_logger();
    let mut arm = make_two_link_arm();
    let (q1, q2) = (0.3, -0.7);
    let (v1, v2) = (0.5, 1.2);
    arm.set_positions(&vector(&[q1, q2])).unwrap();
    arm.set_velocities(&vector(&[v1, v2])).unwrap();

    let (m, l, lc, i, g) = (ARM_LINK_MASS, ARM_LINK_LENGTH, 0.5, ARM_LINK_INERTIA, 9.81);
    let m11 = 2.0 * i + m * lc * lc + m * (l * l + lc * lc + 2.0 * l * lc * q2.cos());
    let m12 = i + m * (lc * lc + l * lc * q2.cos());
    let m22 = i + m * lc * lc;
    assert_relative_eq!(
        *arm.mass_matrix(),
        matrix(2, 2, &[m11, m12, m12, m22]),
        epsilon = 1e-12
    );

    let h = m * l * lc * q2.sin();
    let coriolis = vector(&[-h * (2.0 * v1 * v2 + v2 * v2), h * v1 * v1]);
    assert_relative_eq!(*arm.coriolis_forces(), coriolis, epsilon = 1e-12);

    let gravity = vector(&[
        (m * lc + m * l) * g * q1.cos() + m * lc * g * (q1 + q2).cos(),
        m * lc * g * (q1 + q2).cos(),
    ]);
    assert_relative_eq!(*arm.gravity_forces(), gravity, epsilon = 1e-12);
    assert_relative_eq!(
        *arm.coriolis_and_gravity_forces(),
        coriolis + gravity,
        epsilon = 1e-12
    );
}

#[test]
fn cache_agrees_with_a_fresh_skeleton_after_mutations() {
    init_logger();
    let mut skel = make_forked_skeleton();
    skel.set_time_step(0.01).unwrap();
    let flags = read_everything(&skel);
    assert!(flags.iter().all(|f| f.is_clean()));

    // Interleave mutations with reads so that stale values would be observed.
    randomize_state(&mut skel, 3);
    let _ = read_everything(&skel);
    skel.set_damping(0, 0.5).unwrap();
    let _ = skel.inv_aug_mass_matrix();
    skel.set_spring_stiffness(3, 20.0).unwrap();
    skel.set_body_mass(1, 1.3).unwrap();
    let _ = read_everything(&skel);
    skel.set_gravity(Vector3::new(0.0, -9.81, 0.0));
    skel.set_external_force(3, Vector6::new(0.0, 0.0, 0.1, 1.0, 0.0, -2.0))
        .unwrap();
    let _ = read_everything(&skel);
    skel.set_body_inertia(2, Matrix3::from_diagonal(&Vector3::new(0.2, 0.3, 0.4)))
        .unwrap();
    skel.set_velocity(1, -0.8).unwrap();
    skel.set_position(2, 0.25).unwrap();
    skel.set_time_step(0.002).unwrap();

    let mut fresh = make_forked_skeleton();
    fresh.set_time_step(0.002).unwrap();
    fresh.set_damping(0, 0.5).unwrap();
    fresh.set_spring_stiffness(3, 20.0).unwrap();
    fresh.set_body_mass(1, 1.3).unwrap();
    fresh.set_gravity(Vector3::new(0.0, -9.81, 0.0));
    fresh.set_external_force(3, Vector6::new(0.0, 0.0, 0.1, 1.0, 0.0, -2.0))
        .unwrap();
    fresh.set_body_inertia(2, Matrix3::from_diagonal(&Vector3::new(0.2, 0.3, 0.4)))
        .unwrap();
    fresh.set_positions(&skel.positions()).unwrap();
    fresh.set_velocities(&skel.velocities()).unwrap();

    assert_same_dynamics(&skel, &fresh, 1e-12);
    for body in 0..skel.num_bodies() {
        assert_relative_eq!(
            skel.articulated_inertia_implicit(body).unwrap(),
            fresh.articulated_inertia_implicit(body).unwrap(),
            epsilon = 1e-12
        );
    }
}

#[test]
fn invalidation_follows_the_dependency_table() {
    let mut skel = make_forked_skeleton();

    let _ = read_everything(&skel);
    skel.set_force(0, 1.0).unwrap();
    assert!(skel.tree_dirty_flags(0).unwrap().is_clean());

    skel.set_external_force(0, Vector6::repeat(1.0)).unwrap();
    let flags = skel.tree_dirty_flags(0).unwrap();
    assert!(flags.external_forces);
    assert!(!flags.mass_matrix);

    let _ = read_everything(&skel);
    skel.set_time_step(0.05).unwrap();
    let flags = skel.tree_dirty_flags(0).unwrap();
    assert!(flags.articulated_inertia);
    assert!(flags.aug_mass_matrix);
    assert!(flags.inv_aug_mass_matrix);
    assert!(!flags.mass_matrix);
    assert!(!flags.inv_mass_matrix);

    let _ = read_everything(&skel);
    skel.set_gravity(Vector3::new(0.0, 0.0, -1.0));
    let flags = skel.tree_dirty_flags(1).unwrap();
    assert!(flags.gravity_forces);
    assert!(flags.coriolis_and_gravity_forces);
    assert!(flags.support);
    assert!(!flags.coriolis_forces);

    let _ = read_everything(&skel);
    skel.dirty_articulated_inertia(1).unwrap();
    let flags = skel.tree_dirty_flags(1).unwrap();
    assert!(flags.articulated_inertia);
    assert!(flags.mass_matrix);
    assert!(flags.coriolis_forces);
    assert!(!flags.support);
    assert!(!flags.external_forces);
    assert!(skel.tree_dirty_flags(0).unwrap().is_clean());

    let _ = read_everything(&skel);
    skel.remove_body(3).unwrap();
    assert_eq!(skel.dirty_flags(), DirtyFlags::all_dirty());
    assert!(read_everything(&skel).iter().all(|f| f.is_clean()));
}

#[test]
fn shared_skeleton_is_serialized_by_its_mutex() {
    let shared = make_two_link_arm().into_shared();
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let shared = std::sync::Arc::clone(&shared);
            std::thread::spawn(move || {
                let mut skel = shared.lock().unwrap();
                skel.set_position(0, 0.1 * i as f64).unwrap();
                let mut fresh = make_two_link_arm();
                fresh.set_position(0, 0.1 * i as f64).unwrap();
                assert_relative_eq!(*skel.mass_matrix(), *fresh.mass_matrix(), epsilon = 1e-14);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}
