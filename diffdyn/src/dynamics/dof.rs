use super::joint::JointProperties;

/// A single generalized coordinate together with its state and joint-space
/// dynamic properties.
#[derive(Clone, Debug, PartialEq)]
pub struct DegreeOfFreedom {
    pub(crate) name: String,
    pub(crate) joint: usize,
    pub(crate) index_in_skeleton: usize,
    pub(crate) tree: usize,
    pub(crate) index_in_tree: usize,
    pub(crate) position: f64,
    pub(crate) velocity: f64,
    pub(crate) acceleration: f64,
    pub(crate) force: f64,
    pub(crate) position_limits: (f64, f64),
    pub(crate) velocity_limits: (f64, f64),
    pub(crate) force_limits: (f64, f64),
    pub(crate) damping: f64,
    pub(crate) spring_stiffness: f64,
    pub(crate) rest_position: f64,
}

impl DegreeOfFreedom {
    pub(crate) fn from_joint(props: &JointProperties, joint: usize) -> Self {
        DegreeOfFreedom {
            name: props.name.clone(),
            joint,
            index_in_skeleton: 0,
            tree: 0,
            index_in_tree: 0,
            position: 0.0,
            velocity: 0.0,
            acceleration: 0.0,
            force: 0.0,
            position_limits: props.position_limits,
            velocity_limits: props.velocity_limits,
            force_limits: props.force_limits,
            damping: props.damping,
            spring_stiffness: props.spring_stiffness,
            rest_position: props.rest_position,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn joint(&self) -> usize {
        self.joint
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

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn velocity(&self) -> f64 {
        self.velocity
    }

    pub fn acceleration(&self) -> f64 {
        self.acceleration
    }

    pub fn force(&self) -> f64 {
        self.force
    }

    pub fn position_limits(&self) -> (f64, f64) {
        self.position_limits
    }

    pub fn velocity_limits(&self) -> (f64, f64) {
        self.velocity_limits
    }

    pub fn force_limits(&self) -> (f64, f64) {
        self.force_limits
    }

    pub fn damping(&self) -> f64 {
        self.damping
    }

    pub fn spring_stiffness(&self) -> f64 {
        self.spring_stiffness
    }

    pub fn rest_position(&self) -> f64 {
        self.rest_position
    }

    /// Joint-space passive force `d·q̇ + k·(q - q₀)`.
    pub fn passive_force(&self) -> f64 {
        self.damping * self.velocity + self.spring_stiffness * (self.position - self.rest_position)
    }

    /// Diagonal term added to the mass matrix for implicit damping and springs.
    pub fn implicit_diagonal(&self, time_step: f64) -> f64 {
        time_step * self.damping + time_step * time_step * self.spring_stiffness
    }
}

/// A per-DOF state variable.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DofState {
    Position,
    Velocity,
    Acceleration,
    Force,
}

impl DofState {
    pub(crate) fn name(self) -> &'static str {
        match self {
            DofState::Position => "positions",
            DofState::Velocity => "velocities",
            DofState::Acceleration => "accelerations",
            DofState::Force => "forces",
        }
    }

    /// Cache change caused by writing this state, if any.
    pub(crate) fn change(self) -> Option<super::cache::Change> {
        use super::cache::Change;
        match self {
            DofState::Position => Some(Change::Positions),
            DofState::Velocity => Some(Change::Velocities),
            DofState::Acceleration => None,
            DofState::Force => Some(Change::Forces),
        }
    }
}

impl DegreeOfFreedom {
    pub(crate) fn state(&self, state: DofState) -> f64 {
        match state {
            DofState::Position => self.position,
            DofState::Velocity => self.velocity,
            DofState::Acceleration => self.acceleration,
            DofState::Force => self.force,
        }
    }

    pub(crate) fn state_mut(&mut self, state: DofState) -> &mut f64 {
        match state {
            DofState::Position => &mut self.position,
            DofState::Velocity => &mut self.velocity,
            DofState::Acceleration => &mut self.acceleration,
            DofState::Force => &mut self.force,
        }
    }
}
