use na::{DMatrix, DVector};

use crate::dynamics::Skeleton;
use crate::{Error, Result};

/// Contact mapping of a constraint that is clamping.
pub const CLAMPING: i32 = -1;
/// Contact mapping of a constraint that is not clamping.
pub const NOT_CLAMPING: i32 = -2;
/// Contact mapping of a constraint that does not affect the step.
pub const IRRELEVANT: i32 = -3;

/// A member of a constraint group. Group rows are laid out in member order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupSkeleton {
    pub name: String,
    pub num_dofs: usize,
}

impl GroupSkeleton {
    pub fn of(skeleton: &Skeleton) -> Self {
        GroupSkeleton {
            name: skeleton.name().to_string(),
            num_dofs: skeleton.num_dofs(),
        }
    }
}

/// Classification of the constraints of one group as produced by a constraint solver.
///
/// Matrix rows are group DOFs. `upper_bound_mapping` maps clamping impulses to
/// upper-bound impulses and has one row per upper-bound column and one column
/// per clamping column.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstraintClassification {
    pub clamping: DMatrix<f64>,
    pub massed_clamping: DMatrix<f64>,
    pub upper_bound: DMatrix<f64>,
    pub massed_upper_bound: DMatrix<f64>,
    pub bouncing: DMatrix<f64>,
    pub upper_bound_mapping: DMatrix<f64>,
    /// One entry per clamping column.
    pub bounce_diagonals: DVector<f64>,
    /// One entry per bouncing column.
    pub restitution_diagonals: DVector<f64>,
    /// One entry per constraint dimension.
    pub contact_impulses: DVector<f64>,
    /// One entry per constraint dimension.
    pub contact_mappings: DVector<i32>,
}

impl ConstraintClassification {
    /// No active constraints in a group with `num_dofs` degrees of freedom.
    pub fn empty(num_dofs: usize) -> Self {
        ConstraintClassification {
            clamping: DMatrix::zeros(num_dofs, 0),
            massed_clamping: DMatrix::zeros(num_dofs, 0),
            upper_bound: DMatrix::zeros(num_dofs, 0),
            massed_upper_bound: DMatrix::zeros(num_dofs, 0),
            bouncing: DMatrix::zeros(num_dofs, 0),
            upper_bound_mapping: DMatrix::zeros(0, 0),
            bounce_diagonals: DVector::zeros(0),
            restitution_diagonals: DVector::zeros(0),
            contact_impulses: DVector::zeros(0),
            contact_mappings: DVector::zeros(0),
        }
    }
}

/// Gradient information of a group of skeletons coupled by constraints
/// during one time step.
///
/// Shared by every member skeleton.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstrainedGroupGradientMatrices {
    skeletons: Vec<GroupSkeleton>,
    num_dofs: usize,
    data: ConstraintClassification,
}

impl ConstrainedGroupGradientMatrices {
    pub fn new(skeletons: Vec<GroupSkeleton>, data: ConstraintClassification) -> Result<Self> {
        let num_dofs = skeletons.iter().map(|s| s.num_dofs).sum();
        let num_clamping = data.clamping.ncols();
        let num_upper_bound = data.upper_bound.ncols();

        for (what, m) in [
            ("clamping rows", &data.clamping),
            ("massed clamping rows", &data.massed_clamping),
            ("upper bound rows", &data.upper_bound),
            ("massed upper bound rows", &data.massed_upper_bound),
            ("bouncing rows", &data.bouncing),
        ] {
            Error::check_size(what, num_dofs, m.nrows())?;
        }
        Error::check_size(
            "massed clamping columns",
            num_clamping,
            data.massed_clamping.ncols(),
        )?;
        Error::check_size(
            "massed upper bound columns",
            num_upper_bound,
            data.massed_upper_bound.ncols(),
        )?;
        Error::check_size(
            "upper bound mapping rows",
            num_upper_bound,
            data.upper_bound_mapping.nrows(),
        )?;
        Error::check_size(
            "upper bound mapping columns",
            num_clamping,
            data.upper_bound_mapping.ncols(),
        )?;
        Error::check_size("bounce diagonals", num_clamping, data.bounce_diagonals.len())?;
        Error::check_size(
            "restitution diagonals",
            data.bouncing.ncols(),
            data.restitution_diagonals.len(),
        )?;
        Error::check_size(
            "contact mappings",
            data.contact_impulses.len(),
            data.contact_mappings.len(),
        )?;

        Ok(ConstrainedGroupGradientMatrices {
            skeletons,
            num_dofs,
            data,
        })
    }

    pub fn skeletons(&self) -> &[GroupSkeleton] {
        &self.skeletons
    }

    /// Offset of the rows belonging to the named skeleton.
    pub fn skeleton_offset(&self, name: &str) -> Option<usize> {
        let mut offset = 0;
        for s in self.skeletons.iter() {
            if s.name == name {
                return Some(offset);
            }
            offset += s.num_dofs;
        }
        None
    }

    pub fn num_dofs(&self) -> usize {
        self.num_dofs
    }

    pub fn num_constraint_dim(&self) -> usize {
        self.data.contact_impulses.len()
    }

    pub fn num_clamping(&self) -> usize {
        self.data.clamping.ncols()
    }

    pub fn num_upper_bound(&self) -> usize {
        self.data.upper_bound.ncols()
    }

    pub fn num_bouncing(&self) -> usize {
        self.data.bouncing.ncols()
    }

    pub fn clamping_constraint_matrix(&self) -> &DMatrix<f64> {
        &self.data.clamping
    }

    pub fn massed_clamping_constraint_matrix(&self) -> &DMatrix<f64> {
        &self.data.massed_clamping
    }

    pub fn upper_bound_constraint_matrix(&self) -> &DMatrix<f64> {
        &self.data.upper_bound
    }

    pub fn massed_upper_bound_constraint_matrix(&self) -> &DMatrix<f64> {
        &self.data.massed_upper_bound
    }

    pub fn bouncing_constraint_matrix(&self) -> &DMatrix<f64> {
        &self.data.bouncing
    }

    pub fn upper_bound_mapping_matrix(&self) -> &DMatrix<f64> {
        &self.data.upper_bound_mapping
    }

    pub fn bounce_diagonals(&self) -> &DVector<f64> {
        &self.data.bounce_diagonals
    }

    pub fn restitution_diagonals(&self) -> &DVector<f64> {
        &self.data.restitution_diagonals
    }

    pub fn contact_constraint_impulses(&self) -> &DVector<f64> {
        &self.data.contact_impulses
    }

    pub fn contact_constraint_mappings(&self) -> &DVector<i32> {
        &self.data.contact_mappings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members() -> Vec<GroupSkeleton> {
        vec![
            GroupSkeleton {
                name: "a".to_string(),
                num_dofs: 2,
            },
            GroupSkeleton {
                name: "b".to_string(),
                num_dofs: 1,
            },
        ]
    }

    #[test]
    fn offsets_are_cumulative() {
        let group =
            ConstrainedGroupGradientMatrices::new(members(), ConstraintClassification::empty(3))
                .unwrap();
        assert_eq!(group.num_dofs(), 3);
        assert_eq!(group.skeleton_offset("a"), Some(0));
        assert_eq!(group.skeleton_offset("b"), Some(2));
        assert_eq!(group.skeleton_offset("c"), None);
    }

    #[test]
    fn shapes_are_validated() {
        let mut data = ConstraintClassification::empty(3);
        data.clamping = DMatrix::zeros(3, 1);
        // Massed clamping still has no columns.
        assert!(matches!(
            ConstrainedGroupGradientMatrices::new(members(), data.clone()),
            Err(Error::SizeMismatch {
                what: "massed clamping columns",
                ..
            })
        ));
        data.massed_clamping = DMatrix::zeros(3, 1);
        data.upper_bound_mapping = DMatrix::zeros(0, 1);
        assert!(matches!(
            ConstrainedGroupGradientMatrices::new(members(), data.clone()),
            Err(Error::SizeMismatch {
                what: "bounce diagonals",
                ..
            })
        ));
        data.bounce_diagonals = DVector::from_element(1, 1.0);
        assert!(ConstrainedGroupGradientMatrices::new(members(), data).is_ok());

        let wrong_rows = ConstraintClassification::empty(4);
        assert!(ConstrainedGroupGradientMatrices::new(members(), wrong_rows).is_err());
    }
}
