//! Lazily computed dynamics quantities guarded by dirty flags.
//!
//! Each kinematic tree of a skeleton owns a [`DataCache`], and the skeleton
//! owns one more for the assembled whole-skeleton quantities. A value is
//! valid iff its flag in [`DirtyFlags`] is clear. Flags are raised by
//! [`Change::invalidate`] and cleared only after the value is recomputed.
//!
//! Which changes invalidate which quantities:
//!
//! | change                      | artic. | M | AugM | M⁻¹ | AugM⁻¹ | C | g | C+g | Fext | Fc | support | parents |
//! |-----------------------------|--------|---|------|-----|--------|---|---|-----|------|----|---------|---------|
//! | `Positions`                 | x      | x | x    | x   | x      | x | x | x   | x    | x  | x       |         |
//! | `Velocities`                |        |   |      |     |        | x |   | x   |      |    |         |         |
//! | `Forces`                    |        |   |      |     |        |   |   |     |      |    |         |         |
//! | `ExternalForces`            |        |   |      |     |        |   |   |     | x    |    |         |         |
//! | `ConstraintImpulses`        |        |   |      |     |        |   |   |     |      | x  |         |         |
//! | `MassProperties`            | x      | x | x    | x   | x      | x | x | x   |      |    | x       |         |
//! | `JointDynamics`             | x      |   | x    |     | x      |   |   |     |      |    |         |         |
//! | `TimeStep`                  | x      |   | x    |     | x      |   |   |     |      | x  |         |         |
//! | `Gravity`                   |        |   |      |     |        |   | x | x   |      |    | x       |         |
//! | `SupportPoints`             |        |   |      |     |        |   |   |     |      |    | x       |         |
//! | `ArticulatedInertia` (hook) | x      | x | x    | x   | x      | x | x | x   |      |    |         |         |
//! | `SupportPolygon` (hook)     |        |   |      |     |        |   |   |     |      |    | x       |         |
//! | `Topology`                  | x      | x | x    | x   | x      | x | x | x   | x    | x  | x       | x       |

use std::cell::{Cell, Ref, RefCell};

use na::{DMatrix, DVector, Matrix6};

use super::support::SupportGeometry;

/// A cached quantity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Cached {
    ArticulatedInertia,
    MassMatrix,
    AugMassMatrix,
    InvMassMatrix,
    InvAugMassMatrix,
    CoriolisForces,
    GravityForces,
    CoriolisAndGravityForces,
    ExternalForces,
    ConstraintForces,
    Support,
    ParentMap,
}

impl Cached {
    pub const ALL: [Cached; 12] = [
        Cached::ArticulatedInertia,
        Cached::MassMatrix,
        Cached::AugMassMatrix,
        Cached::InvMassMatrix,
        Cached::InvAugMassMatrix,
        Cached::CoriolisForces,
        Cached::GravityForces,
        Cached::CoriolisAndGravityForces,
        Cached::ExternalForces,
        Cached::ConstraintForces,
        Cached::Support,
        Cached::ParentMap,
    ];
}

/// A state change that may invalidate cached quantities.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Change {
    Positions,
    Velocities,
    /// Joint forces. Nothing is cached in terms of these.
    Forces,
    ExternalForces,
    ConstraintImpulses,
    MassProperties,
    /// Joint damping or spring stiffness.
    JointDynamics,
    TimeStep,
    Gravity,
    SupportPoints,
    /// Explicit articulated inertia invalidation hook.
    ArticulatedInertia,
    /// Explicit support polygon invalidation hook.
    SupportPolygon,
    Topology,
}

impl Change {
    /// Quantities that depend on this change.
    pub fn dependents(self) -> &'static [Cached] {
        use Cached::*;
        match self {
            Change::Positions => &[
                ArticulatedInertia,
                MassMatrix,
                AugMassMatrix,
                InvMassMatrix,
                InvAugMassMatrix,
                CoriolisForces,
                GravityForces,
                CoriolisAndGravityForces,
                ExternalForces,
                ConstraintForces,
                Support,
            ],
            Change::Velocities => &[CoriolisForces, CoriolisAndGravityForces],
            Change::Forces => &[],
            Change::ExternalForces => &[ExternalForces],
            Change::ConstraintImpulses => &[ConstraintForces],
            Change::MassProperties => &[
                ArticulatedInertia,
                MassMatrix,
                AugMassMatrix,
                InvMassMatrix,
                InvAugMassMatrix,
                CoriolisForces,
                GravityForces,
                CoriolisAndGravityForces,
                Support,
            ],
            Change::JointDynamics => &[ArticulatedInertia, AugMassMatrix, InvAugMassMatrix],
            Change::TimeStep => &[
                ArticulatedInertia,
                AugMassMatrix,
                InvAugMassMatrix,
                ConstraintForces,
            ],
            Change::Gravity => &[GravityForces, CoriolisAndGravityForces, Support],
            Change::SupportPoints | Change::SupportPolygon => &[Support],
            Change::ArticulatedInertia => &[
                ArticulatedInertia,
                MassMatrix,
                AugMassMatrix,
                InvMassMatrix,
                InvAugMassMatrix,
                CoriolisForces,
                GravityForces,
                CoriolisAndGravityForces,
            ],
            Change::Topology => &Cached::ALL,
        }
    }

    pub fn invalidate(self, flags: &mut DirtyFlags) {
        for &cached in self.dependents() {
            flags.set(cached, true);
        }
    }
}

/// Per-quantity validity flags. A set flag means the cached value is stale.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DirtyFlags {
    pub articulated_inertia: bool,
    pub mass_matrix: bool,
    pub aug_mass_matrix: bool,
    pub inv_mass_matrix: bool,
    pub inv_aug_mass_matrix: bool,
    pub coriolis_forces: bool,
    pub gravity_forces: bool,
    pub coriolis_and_gravity_forces: bool,
    pub external_forces: bool,
    pub constraint_forces: bool,
    pub support: bool,
    pub parent_map: bool,
}

impl DirtyFlags {
    pub fn all_dirty() -> Self {
        let mut flags = DirtyFlags::default();
        Change::Topology.invalidate(&mut flags);
        flags
    }

    pub fn is_clean(&self) -> bool {
        Cached::ALL.iter().all(|&c| !self.get(c))
    }

    fn field_mut(&mut self, cached: Cached) -> &mut bool {
        match cached {
            Cached::ArticulatedInertia => &mut self.articulated_inertia,
            Cached::MassMatrix => &mut self.mass_matrix,
            Cached::AugMassMatrix => &mut self.aug_mass_matrix,
            Cached::InvMassMatrix => &mut self.inv_mass_matrix,
            Cached::InvAugMassMatrix => &mut self.inv_aug_mass_matrix,
            Cached::CoriolisForces => &mut self.coriolis_forces,
            Cached::GravityForces => &mut self.gravity_forces,
            Cached::CoriolisAndGravityForces => &mut self.coriolis_and_gravity_forces,
            Cached::ExternalForces => &mut self.external_forces,
            Cached::ConstraintForces => &mut self.constraint_forces,
            Cached::Support => &mut self.support,
            Cached::ParentMap => &mut self.parent_map,
        }
    }

    pub fn get(&self, cached: Cached) -> bool {
        let mut copy = *self;
        *copy.field_mut(cached)
    }

    pub fn set(&mut self, cached: Cached, dirty: bool) {
        *self.field_mut(cached) = dirty;
    }
}

/// Cached dynamics quantities of a tree or of a whole skeleton.
///
/// Reads go through shared references. Each quantity has its own cell so
/// recomputing one value may read others.
#[derive(Clone, Debug)]
pub(crate) struct DataCache {
    flags: Cell<DirtyFlags>,
    pub(crate) articulated_inertia: RefCell<Vec<Matrix6<f64>>>,
    pub(crate) articulated_inertia_implicit: RefCell<Vec<Matrix6<f64>>>,
    pub(crate) mass_matrix: RefCell<DMatrix<f64>>,
    pub(crate) aug_mass_matrix: RefCell<DMatrix<f64>>,
    pub(crate) inv_mass_matrix: RefCell<DMatrix<f64>>,
    pub(crate) inv_aug_mass_matrix: RefCell<DMatrix<f64>>,
    pub(crate) coriolis_forces: RefCell<DVector<f64>>,
    pub(crate) gravity_forces: RefCell<DVector<f64>>,
    pub(crate) coriolis_and_gravity_forces: RefCell<DVector<f64>>,
    pub(crate) external_forces: RefCell<DVector<f64>>,
    pub(crate) constraint_forces: RefCell<DVector<f64>>,
    pub(crate) support: RefCell<SupportGeometry>,
    support_version: Cell<usize>,
    pub(crate) parent_map: RefCell<DMatrix<i32>>,
}

impl Default for DataCache {
    fn default() -> Self {
        DataCache {
            flags: Cell::new(DirtyFlags::all_dirty()),
            articulated_inertia: RefCell::new(Vec::new()),
            articulated_inertia_implicit: RefCell::new(Vec::new()),
            mass_matrix: RefCell::new(DMatrix::zeros(0, 0)),
            aug_mass_matrix: RefCell::new(DMatrix::zeros(0, 0)),
            inv_mass_matrix: RefCell::new(DMatrix::zeros(0, 0)),
            inv_aug_mass_matrix: RefCell::new(DMatrix::zeros(0, 0)),
            coriolis_forces: RefCell::new(DVector::zeros(0)),
            gravity_forces: RefCell::new(DVector::zeros(0)),
            coriolis_and_gravity_forces: RefCell::new(DVector::zeros(0)),
            external_forces: RefCell::new(DVector::zeros(0)),
            constraint_forces: RefCell::new(DVector::zeros(0)),
            support: RefCell::new(SupportGeometry::default()),
            support_version: Cell::new(0),
            parent_map: RefCell::new(DMatrix::zeros(0, 0)),
        }
    }
}

impl DataCache {
    pub(crate) fn flags(&self) -> DirtyFlags {
        self.flags.get()
    }

    pub(crate) fn is_dirty(&self, cached: Cached) -> bool {
        self.flags.get().get(cached)
    }

    pub(crate) fn invalidate(&mut self, change: Change) {
        change.invalidate(self.flags.get_mut());
    }

    pub(crate) fn support_version(&self) -> usize {
        self.support_version.get()
    }

    /// Return the cached value in `slot`, first recomputing it with `compute`
    /// if its flag is set.
    pub(crate) fn get_or_update<'a, T>(
        &'a self,
        cached: Cached,
        slot: &'a RefCell<T>,
        compute: impl FnOnce() -> T,
    ) -> Ref<'a, T> {
        if self.is_dirty(cached) {
            let value = compute();
            *slot.borrow_mut() = value;
            let mut flags = self.flags.get();
            flags.set(cached, false);
            self.flags.set(flags);
            if cached == Cached::Support {
                self.support_version.set(self.support_version.get() + 1);
            }
            log::trace!("Recomputed {:?}", cached);
        }
        slot.borrow()
    }

    /// Like `get_or_update` for the two articulated inertia variants which
    /// share a flag.
    pub(crate) fn articulated_inertias(
        &self,
        compute: impl FnOnce() -> (Vec<Matrix6<f64>>, Vec<Matrix6<f64>>),
    ) -> (Ref<'_, Vec<Matrix6<f64>>>, Ref<'_, Vec<Matrix6<f64>>>) {
        if self.is_dirty(Cached::ArticulatedInertia) {
            let (explicit, implicit) = compute();
            *self.articulated_inertia.borrow_mut() = explicit;
            *self.articulated_inertia_implicit.borrow_mut() = implicit;
            let mut flags = self.flags.get();
            flags.set(Cached::ArticulatedInertia, false);
            self.flags.set(flags);
        }
        (
            self.articulated_inertia.borrow(),
            self.articulated_inertia_implicit.borrow(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn velocity_change_keeps_mass_terms_valid() {
        let mut flags = DirtyFlags::default();
        Change::Velocities.invalidate(&mut flags);
        assert!(flags.coriolis_forces);
        assert!(flags.coriolis_and_gravity_forces);
        assert!(!flags.gravity_forces);
        assert!(!flags.mass_matrix);
        assert!(!flags.inv_mass_matrix);
    }

    #[test]
    fn joint_forces_invalidate_nothing() {
        let mut flags = DirtyFlags::default();
        Change::Forces.invalidate(&mut flags);
        assert!(flags.is_clean());
    }

    #[test]
    fn topology_invalidates_everything() {
        let flags = DirtyFlags::all_dirty();
        assert!(Cached::ALL.iter().all(|&c| flags.get(c)));
    }

    #[test]
    fn recompute_clears_only_its_flag() {
        let cache = DataCache::default();
        let mut calls = 0;
        {
            let m = cache.get_or_update(Cached::MassMatrix, &cache.mass_matrix, || {
                calls += 1;
                DMatrix::identity(2, 2)
            });
            assert_eq!(m.nrows(), 2);
        }
        let _ = cache.get_or_update(Cached::MassMatrix, &cache.mass_matrix, || {
            calls += 1;
            DMatrix::identity(3, 3)
        });
        assert_eq!(calls, 1);
        assert!(!cache.is_dirty(Cached::MassMatrix));
        assert!(cache.is_dirty(Cached::InvMassMatrix));
    }

    #[test]
    fn support_version_counts_recomputes() {
        let mut cache = DataCache::default();
        assert_eq!(cache.support_version(), 0);
        let _ = cache.get_or_update(Cached::Support, &cache.support, SupportGeometry::default);
        let _ = cache.get_or_update(Cached::Support, &cache.support, SupportGeometry::default);
        assert_eq!(cache.support_version(), 1);
        cache.invalidate(Change::Gravity);
        let _ = cache.get_or_update(Cached::Support, &cache.support, SupportGeometry::default);
        assert_eq!(cache.support_version(), 2);
    }
}
