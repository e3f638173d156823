use std::path::Path;

use anyhow::{Context, Result};
use diffdyn::test_utils::{
    make_chain, make_forked_skeleton, make_prismatic_box, make_two_link_arm, FloorSolver,
};
use diffdyn::{BodyProperties, JointProperties, JointType, Skeleton, World};
use na::{DVector, Vector3};
use serde::{Deserialize, Serialize};

/// Skeletons shipped with the library.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Preset {
    TwoLinkArm,
    Box,
    Forked,
    Chain(usize),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JointConfig {
    pub name: String,
    pub kind: JointType,
    #[serde(default)]
    pub offset: [f64; 3],
    #[serde(default)]
    pub damping: f64,
    /// Stiffness and rest position.
    #[serde(default)]
    pub spring: Option<(f64, f64)>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BodyConfig {
    pub name: String,
    #[serde(default)]
    pub parent: Option<usize>,
    pub joint: JointConfig,
    pub mass: f64,
    #[serde(default)]
    pub com: [f64; 3],
    #[serde(default = "default_inertia")]
    pub inertia: [f64; 3],
    #[serde(default)]
    pub mass_limits: Option<(f64, f64)>,
    #[serde(default)]
    pub support_points: Vec<[f64; 3]>,
}

fn default_inertia() -> [f64; 3] {
    [1.0; 3]
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomSkeleton {
    pub name: String,
    pub bodies: Vec<BodyConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SkeletonConfig {
    Preset(Preset),
    Custom(CustomSkeleton),
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FloorConfig {
    pub height: f64,
    pub restitution: f64,
}

/// Everything needed to build and drive a world.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SceneConfig {
    pub time_step: f64,
    #[serde(default = "default_gravity")]
    pub gravity: [f64; 3],
    #[serde(default)]
    pub floor: Option<FloorConfig>,
    pub skeletons: Vec<SkeletonConfig>,
    #[serde(default)]
    pub positions: Option<Vec<f64>>,
    #[serde(default)]
    pub velocities: Option<Vec<f64>>,
    /// Joint forces held constant for the whole run.
    #[serde(default)]
    pub forces: Option<Vec<f64>>,
    /// Link masses of the simulated plant in estimation runs. The estimator
    /// starts from the masses in the skeleton descriptions.
    #[serde(default)]
    pub plant_masses: Option<Vec<f64>>,
    #[serde(default = "default_planning_history")]
    pub planning_history_millis: i64,
}

fn default_gravity() -> [f64; 3] {
    [0.0, 0.0, -9.81]
}

fn default_planning_history() -> i64 {
    300
}

impl SceneConfig {
    pub fn load_from_ron(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scene config: {}", path.display()))?;
        ron::from_str(&contents)
            .with_context(|| format!("Failed to parse scene config: {}", path.display()))
    }

    /// Build the world in its initial state.
    pub fn build_world(&self) -> Result<World> {
        let mut world = World::new();
        world.set_time_step(self.time_step)?;
        world.set_gravity(Vector3::from(self.gravity));
        for config in self.skeletons.iter() {
            world.add_skeleton(build_skeleton(config)?)?;
        }
        if let Some(floor) = self.floor {
            let solver = FloorSolver::new(floor.height, floor.restitution);
            world.set_constraint_solver(Box::new(solver));
        }
        if let Some(positions) = self.positions.as_ref() {
            world.set_positions(&DVector::from_column_slice(positions))?;
        }
        if let Some(velocities) = self.velocities.as_ref() {
            world.set_velocities(&DVector::from_column_slice(velocities))?;
        }
        if let Some(forces) = self.forces.as_ref() {
            world.set_forces(&DVector::from_column_slice(forces))?;
        }
        Ok(world)
    }

    /// Build the world with the plant masses applied.
    pub fn build_plant(&self) -> Result<World> {
        let mut world = self.build_world()?;
        if let Some(masses) = self.plant_masses.as_ref() {
            world.set_masses(&DVector::from_column_slice(masses))?;
        }
        Ok(world)
    }
}

fn build_skeleton(config: &SkeletonConfig) -> Result<Skeleton> {
    let custom = match config {
        SkeletonConfig::Preset(preset) => {
            return Ok(match preset {
                Preset::TwoLinkArm => make_two_link_arm(),
                Preset::Box => make_prismatic_box(),
                Preset::Forked => make_forked_skeleton(),
                Preset::Chain(links) => make_chain("chain", *links),
            })
        }
        SkeletonConfig::Custom(custom) => custom,
    };

    let mut skel = Skeleton::new(custom.name.clone());
    for body in custom.bodies.iter() {
        let mut joint = JointProperties::new(body.joint.name.clone(), body.joint.kind)
            .with_offset(body.joint.offset)
            .with_damping(body.joint.damping);
        if let Some((stiffness, rest)) = body.joint.spring {
            joint = joint.with_spring(stiffness, rest);
        }
        let mut props = BodyProperties::new(body.name.clone(), body.mass)
            .with_local_com(body.com)
            .with_principal_inertia(body.inertia)
            .with_support_points(body.support_points.iter().map(|&p| Vector3::from(p)).collect());
        if let Some((lower, upper)) = body.mass_limits {
            props = props.with_mass_limits(lower, upper);
        }
        skel.add_body(body.parent, joint, props)
            .with_context(|| format!("Failed to add body {:?} to {:?}", body.name, custom.name))?;
    }
    Ok(skel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_custom_pendulum() {
        let scene: SceneConfig = ron::from_str(
            r#"(
                time_step: 0.01,
                skeletons: [
                    Preset(Box),
                    Custom((
                        name: "pendulum",
                        bodies: [(
                            name: "bob",
                            joint: (
                                name: "pivot",
                                kind: Revolute(axis: (0.0, 1.0, 0.0)),
                                damping: 0.1,
                            ),
                            mass: 2.0,
                            com: (0.0, 0.0, -1.0),
                        )],
                    )),
                ],
                positions: Some([0.5, 0.2]),
            )"#,
        )
        .unwrap();
        assert_eq!(scene.gravity, [0.0, 0.0, -9.81]);
        let world = scene.build_world().unwrap();
        assert_eq!(world.num_dofs(), 2);
        assert_eq!(world.positions()[1], 0.2);
        assert_eq!(world.skeleton_by_name("pendulum").unwrap().total_mass(), 2.0);
    }

    #[test]
    fn bundled_scenes_build() {
        for contents in [
            include_str!("../scenes/bouncing_box.ron"),
            include_str!("../scenes/arm_and_pendulum.ron"),
            include_str!("../scenes/estimate_box_mass.ron"),
        ] {
            let scene: SceneConfig = ron::from_str(contents).unwrap();
            scene.build_world().unwrap();
            scene.build_plant().unwrap();
        }
    }

    #[test]
    fn plant_masses_must_match() {
        let scene = SceneConfig {
            time_step: 0.01,
            gravity: default_gravity(),
            floor: None,
            skeletons: vec![SkeletonConfig::Preset(Preset::Box)],
            positions: None,
            velocities: None,
            forces: None,
            plant_masses: Some(vec![1.0, 2.0]),
            planning_history_millis: 100,
        };
        assert!(scene.build_plant().is_err());
    }
}
