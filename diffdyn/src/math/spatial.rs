//! Spatial vector algebra.
//!
//! Spatial motion and force vectors are stored with the angular part first,
//! i.e. `[ω; v]` and `[n; f]`.

use na::{Isometry3, Matrix3, Matrix6, Vector3, Vector6};

#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    v.cross_matrix()
}

#[inline]
fn angular(v: &Vector6<f64>) -> Vector3<f64> {
    v.fixed_rows::<3>(0).into_owned()
}

#[inline]
fn linear(v: &Vector6<f64>) -> Vector3<f64> {
    v.fixed_rows::<3>(3).into_owned()
}

/// Spatial cross product operator for motion vectors: `crm(v) * m = v ×ₘ m`.
pub fn crm(v: &Vector6<f64>) -> Matrix6<f64> {
    let w = skew(&angular(v));
    let u = skew(&linear(v));
    let mut out = Matrix6::zeros();
    out.fixed_view_mut::<3, 3>(0, 0).copy_from(&w);
    out.fixed_view_mut::<3, 3>(3, 0).copy_from(&u);
    out.fixed_view_mut::<3, 3>(3, 3).copy_from(&w);
    out
}

/// Spatial cross product operator for force vectors: `crf(v) * f = v ×* f`.
#[inline]
pub fn crf(v: &Vector6<f64>) -> Matrix6<f64> {
    -crm(v).transpose()
}

/// Motion transform from the frame of `pose`'s parent into the frame described
/// by `pose`, where `pose` maps child coordinates to parent coordinates.
///
/// Force vectors are transformed in the opposite direction (child to parent)
/// by the transpose of the returned matrix.
pub fn plucker_motion(pose: &Isometry3<f64>) -> Matrix6<f64> {
    let e = pose.rotation.to_rotation_matrix().into_inner().transpose();
    let r = pose.translation.vector;
    let mut out = Matrix6::zeros();
    out.fixed_view_mut::<3, 3>(0, 0).copy_from(&e);
    out.fixed_view_mut::<3, 3>(3, 0).copy_from(&(-e * skew(&r)));
    out.fixed_view_mut::<3, 3>(3, 3).copy_from(&e);
    out
}

/// Spatial inertia about the body origin of a body with the given `mass`,
/// center of mass `com` and rotational inertia `inertia_com` about the center of mass.
pub fn spatial_inertia(mass: f64, com: &Vector3<f64>, inertia_com: &Matrix3<f64>) -> Matrix6<f64> {
    let c = skew(com);
    let mut out = Matrix6::zeros();
    out.fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&(inertia_com + c * c.transpose() * mass));
    out.fixed_view_mut::<3, 3>(0, 3).copy_from(&(c * mass));
    out.fixed_view_mut::<3, 3>(3, 0)
        .copy_from(&(c.transpose() * mass));
    out.fixed_view_mut::<3, 3>(3, 3)
        .copy_from(&(Matrix3::identity() * mass));
    out
}
