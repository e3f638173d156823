mod test_utils;

use approx::*;
use diffdyn::math::FiniteDifference;
use diffdyn::*;
use test_utils::*;

const RIDDERS: FiniteDifference = FiniteDifference::Ridders { initial_step: 1e-2 };

fn forked_with_passive_joints() -> Skeleton {
    let mut skel = make_forked_skeleton();
    skel.set_damping(1, 0.3).unwrap();
    skel.set_spring_stiffness(2, 4.0).unwrap();
    skel.set_rest_position(2, 0.1).unwrap();
    randomize_state(&mut skel, 11);
    skel
}

#[test]
fn mass_action_jacobian() {
    init_logger();
    for mut skel in [forked_with_passive_joints(), make_chain("chain", 5)] {
        randomize_state(&mut skel, 5);
        let x = vector(&vec![0.7; skel.num_dofs()]);
        let analytical = skel.jacobian_of_mass_action_wrt_positions(&x).unwrap();
        let fd = skel
            .finite_difference_jacobian_of_mass_action(&x, RIDDERS)
            .unwrap();
        assert_relative_eq!(analytical, fd, epsilon = 1e-7);
    }
}

#[test]
fn mass_action_direction_must_match_dofs() {
    let skel = make_two_link_arm();
    assert!(matches!(
        skel.jacobian_of_mass_action_wrt_positions(&vector(&[1.0])),
        Err(Error::SizeMismatch { .. })
    ));
}

#[test]
fn coriolis_jacobians() {
    init_logger();
    for skel in [forked_with_passive_joints(), make_two_link_arm()] {
        for wrt in [WithRespectTo::Position, WithRespectTo::Velocity] {
            let analytical = skel.coriolis_jacobian(wrt);
            let fd = skel.finite_difference_coriolis_jacobian(wrt, RIDDERS).unwrap();
            assert_relative_eq!(analytical, fd, epsilon = 1e-7);
        }
    }
}

#[test]
fn forward_dynamics_jacobians() {
    init_logger();
    let mut skel = forked_with_passive_joints();
    skel.set_external_force(3, na::Vector6::new(0.1, -0.2, 0.0, 0.5, 1.0, 0.0))
        .unwrap();
    for wrt in [
        WithRespectTo::Position,
        WithRespectTo::Velocity,
        WithRespectTo::Force,
    ] {
        let analytical = skel.forward_dynamics_jacobian(wrt);
        let fd = skel
            .finite_difference_forward_dynamics_jacobian(wrt, RIDDERS)
            .unwrap();
        assert_relative_eq!(analytical, fd, epsilon = 1e-6, max_relative = 1e-6);
    }
}

#[test]
fn unconstrained_velocity_jacobians_on_a_long_chain() {
    let mut skel = make_chain("chain", 6);
    randomize_state(&mut skel, 2);
    let dt = 0.005;
    for wrt in [WithRespectTo::Velocity, WithRespectTo::Force] {
        let analytical = skel.unconstrained_vel_jacobian_wrt(dt, wrt);
        let fd = skel
            .finite_difference_unconstrained_vel_jacobian(
                dt,
                wrt,
                FiniteDifference::Central { step: 1e-6 },
            )
            .unwrap();
        assert_relative_eq!(analytical, fd, epsilon = 1e-6);
    }
}

#[test]
fn finite_differences_leave_the_skeleton_untouched() {
    let skel = forked_with_passive_joints();
    let q = skel.positions();
    let _ = read_everything(&skel);
    let _ = skel
        .finite_difference_forward_dynamics_jacobian(WithRespectTo::Position, RIDDERS)
        .unwrap();
    assert_eq!(skel.positions(), q);
    assert!(skel
        .tree_dirty_flags(0)
        .unwrap()
        .is_clean());
}
