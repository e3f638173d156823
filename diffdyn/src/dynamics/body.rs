use na::{Matrix3, Matrix6, Vector3, Vector6};

use crate::math::spatial_inertia;
use crate::Error;

/// Mass properties and contact geometry of a new body.
#[derive(Clone, Debug, PartialEq)]
pub struct BodyProperties {
    pub name: String,
    pub mass: f64,
    /// Center of mass in the body frame.
    pub local_com: Vector3<f64>,
    /// Rotational inertia about the center of mass.
    pub inertia: Matrix3<f64>,
    pub mass_limits: (f64, f64),
    /// Points in the body frame that can support the skeleton when in contact.
    pub support_points: Vec<Vector3<f64>>,
}

impl BodyProperties {
    pub fn new(name: impl Into<String>, mass: f64) -> Self {
        BodyProperties {
            name: name.into(),
            mass,
            local_com: Vector3::zeros(),
            inertia: Matrix3::identity(),
            mass_limits: (0.0, f64::INFINITY),
            support_points: Vec::new(),
        }
    }

    pub fn with_local_com(mut self, com: [f64; 3]) -> Self {
        self.local_com = Vector3::from(com);
        self
    }

    pub fn with_inertia(mut self, inertia: Matrix3<f64>) -> Self {
        self.inertia = inertia;
        self
    }

    /// Principal moments of inertia about the center of mass.
    pub fn with_principal_inertia(self, moments: [f64; 3]) -> Self {
        self.with_inertia(Matrix3::from_diagonal(&Vector3::from(moments)))
    }

    pub fn with_mass_limits(mut self, lower: f64, upper: f64) -> Self {
        self.mass_limits = (lower, upper);
        self
    }

    pub fn with_support_points(mut self, points: Vec<Vector3<f64>>) -> Self {
        self.support_points = points;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        validate_mass(&self.name, self.mass)?;
        validate_inertia(&self.name, &self.inertia)
    }
}

pub(crate) fn validate_mass(name: &str, mass: f64) -> Result<(), Error> {
    if mass > 0.0 && mass.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidParameter {
            name: format!("{}.mass", name),
        })
    }
}

pub(crate) fn validate_inertia(name: &str, inertia: &Matrix3<f64>) -> Result<(), Error> {
    let symmetric = approx::relative_eq!(*inertia, inertia.transpose(), epsilon = 1e-12);
    if symmetric && inertia.cholesky().is_some() {
        Ok(())
    } else {
        Err(Error::InvalidParameter {
            name: format!("{}.inertia", name),
        })
    }
}

/// A rigid body in a skeleton, driven by the joint with the same index.
#[derive(Clone, Debug)]
pub struct BodyNode {
    pub(crate) name: String,
    pub(crate) mass: f64,
    pub(crate) local_com: Vector3<f64>,
    pub(crate) inertia: Matrix3<f64>,
    pub(crate) mass_limits: (f64, f64),
    pub(crate) support_points: Vec<Vector3<f64>>,
    pub(crate) parent: Option<usize>,
    pub(crate) children: Vec<usize>,
    pub(crate) index_in_skeleton: usize,
    pub(crate) tree: usize,
    pub(crate) index_in_tree: usize,
    /// Spatial force applied to this body, expressed in the body frame.
    pub(crate) external_force: Vector6<f64>,
    /// Spatial constraint impulse applied to this body, expressed in the body frame.
    pub(crate) constraint_impulse: Vector6<f64>,
}

impl BodyNode {
    pub(crate) fn from_properties(props: BodyProperties, parent: Option<usize>) -> Self {
        BodyNode {
            name: props.name,
            mass: props.mass,
            local_com: props.local_com,
            inertia: props.inertia,
            mass_limits: props.mass_limits,
            support_points: props.support_points,
            parent,
            children: Vec::new(),
            index_in_skeleton: 0,
            tree: 0,
            index_in_tree: 0,
            external_force: Vector6::zeros(),
            constraint_impulse: Vector6::zeros(),
        }
    }

    pub(crate) fn properties(&self) -> BodyProperties {
        BodyProperties {
            name: self.name.clone(),
            mass: self.mass,
            local_com: self.local_com,
            inertia: self.inertia,
            mass_limits: self.mass_limits,
            support_points: self.support_points.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mass(&self) -> f64 {
        self.mass
    }

    pub fn local_com(&self) -> &Vector3<f64> {
        &self.local_com
    }

    pub fn inertia(&self) -> &Matrix3<f64> {
        &self.inertia
    }

    pub fn mass_limits(&self) -> (f64, f64) {
        self.mass_limits
    }

    pub fn support_points(&self) -> &[Vector3<f64>] {
        &self.support_points
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn children(&self) -> &[usize] {
        &self.children
    }

    pub fn index_in_skeleton(&self) -> usize {
        self.index_in_skeleton
    }

    pub fn tree(&self) -> usize {
        self.tree
    }

    pub fn index_in_tree(&self) -> usize {
        self.index_in_tree
    }

    pub fn external_force(&self) -> &Vector6<f64> {
        &self.external_force
    }

    pub fn constraint_impulse(&self) -> &Vector6<f64> {
        &self.constraint_impulse
    }

    /// Spatial inertia about the body frame origin.
    pub fn spatial_inertia(&self) -> Matrix6<f64> {
        spatial_inertia(self.mass, &self.local_com, &self.inertia)
    }
}
