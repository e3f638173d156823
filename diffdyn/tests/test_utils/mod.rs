use approx::*;
pub use diffdyn::test_utils::*;
use diffdyn::{DirtyFlags, Skeleton};
use na::{DMatrix, DVector};

pub fn init_logger() {
    let _ = env_logger::Builder::from_env("DIFFDYN_LOG")
        .is_test(true)
        .try_init();
}

/// Compare every cached dynamics quantity of `skel` against `expected`.
#[allow(dead_code)]
pub fn assert_same_dynamics(skel: &Skeleton, expected: &Skeleton, tol: f64) {
    assert_relative_eq!(*skel.mass_matrix(), *expected.mass_matrix(), epsilon = tol);
    assert_relative_eq!(*skel.aug_mass_matrix(), *expected.aug_mass_matrix(), epsilon = tol);
    assert_relative_eq!(*skel.inv_mass_matrix(), *expected.inv_mass_matrix(), epsilon = tol);
    assert_relative_eq!(
        *skel.inv_aug_mass_matrix(),
        *expected.inv_aug_mass_matrix(),
        epsilon = tol
    );
    assert_relative_eq!(*skel.coriolis_forces(), *expected.coriolis_forces(), epsilon = tol);
    assert_relative_eq!(*skel.gravity_forces(), *expected.gravity_forces(), epsilon = tol);
    assert_relative_eq!(
        *skel.coriolis_and_gravity_forces(),
        *expected.coriolis_and_gravity_forces(),
        epsilon = tol
    );
    assert_relative_eq!(*skel.external_forces(), *expected.external_forces(), epsilon = tol);
    assert_eq!(*skel.parent_map(), *expected.parent_map());
}

/// Read every cached quantity and return the resulting flags of each tree.
#[allow(dead_code)]
pub fn read_everything(skel: &Skeleton) -> Vec<DirtyFlags> {
    let _ = skel.mass_matrix();
    let _ = skel.aug_mass_matrix();
    let _ = skel.inv_mass_matrix();
    let _ = skel.inv_aug_mass_matrix();
    let _ = skel.coriolis_and_gravity_forces();
    let _ = skel.external_forces();
    let _ = skel.constraint_forces();
    let _ = skel.support_polygon();
    let _ = skel.parent_map();
    for tree in 0..skel.num_trees() {
        let _ = skel.tree_coriolis_forces(tree);
        let _ = skel.tree_gravity_forces(tree);
        let _ = skel.tree_support_polygon(tree);
    }
    for body in 0..skel.num_bodies() {
        let _ = skel.articulated_inertia(body);
        let _ = skel.articulated_inertia_implicit(body);
    }
    (0..skel.num_trees())
        .map(|tree| skel.tree_dirty_flags(tree).unwrap())
        .collect()
}

#[allow(dead_code)]
pub fn vector(values: &[f64]) -> DVector<f64> {
    DVector::from_column_slice(values)
}

#[allow(dead_code)]
pub fn matrix(rows: usize, cols: usize, values: &[f64]) -> DMatrix<f64> {
    DMatrix::from_row_slice(rows, cols, values)
}
