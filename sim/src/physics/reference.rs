//! Deterministic reference engine.
//!
//! A point-mass integrator (semi-implicit Euler) with joints modelled as
//! spring-dampers between their anchor points. There is no contact handling
//! beyond an optional ground plane. It exists so the bonding layer can be
//! exercised end to end without an external solver.

use super::{
    ActorDesc, ActorHandle, ActorKind, D6Axis, D6Motion, Geometry, JointDesc, JointHandle,
    JointKind, Material, PhysicsEngine, PhysicsScene, Pose,
};
use crate::error::{SimError, SimResult};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tuning for [`ReferenceScene`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceSceneConfig {
    /// Gravity acceleration.
    pub gravity: Vec3,
    /// Fraction of linear velocity removed per second.
    pub linear_damping: f32,
    /// Fraction of angular velocity removed per second.
    pub angular_damping: f32,
    /// Height of an infinite ground plane (normal +Y), if any.
    pub ground_height: Option<f32>,
    /// Spring stiffness used for anchor-locking joints.
    pub joint_stiffness: f32,
    /// Spring damping used for anchor-locking joints.
    pub joint_damping: f32,
}

impl Default for ReferenceSceneConfig {
    fn default() -> Self {
        Self {
            gravity: Vec3::ZERO,       // Free space unless asked otherwise
            linear_damping: 0.0,
            angular_damping: 0.05,
            ground_height: None,
            joint_stiffness: 500.0,
            joint_damping: 5.0,
        }
    }
}

impl ReferenceSceneConfig {
    /// Earth gravity with a ground plane at y = 0.
    pub fn with_ground() -> Self {
        Self {
            gravity: Vec3::new(0.0, -9.81, 0.0),
            linear_damping: 0.1,
            ground_height: Some(0.0),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
struct Body {
    kind: ActorKind,
    geometry: Geometry,
    material: Material,
    mass: f32,
    pose: Pose,
    linear_velocity: Vec3,
    angular_velocity: Vec3,
}

#[derive(Debug, Clone)]
struct Joint {
    desc: JointDesc,
    broken: bool,
}

/// In-memory scene driven by [`ReferenceSceneConfig`].
#[derive(Debug)]
pub struct ReferenceScene {
    config: ReferenceSceneConfig,
    bodies: BTreeMap<u64, Body>,
    joints: BTreeMap<u64, Joint>,
    next_actor: u64,
    next_joint: u64,
    time: f32,
}

impl Default for ReferenceScene {
    fn default() -> Self {
        Self::new(ReferenceSceneConfig::default())
    }
}

impl ReferenceScene {
    pub fn new(config: ReferenceSceneConfig) -> Self {
        Self {
            config,
            bodies: BTreeMap::new(),
            joints: BTreeMap::new(),
            next_actor: 1,
            next_joint: 1,
            time: 0.0,
        }
    }

    pub fn config(&self) -> &ReferenceSceneConfig {
        &self.config
    }

    /// Elapsed simulated time.
    pub fn time(&self) -> f32 {
        self.time
    }

    pub fn actor_count(&self) -> usize {
        self.bodies.len()
    }

    /// Joints that still link two actors.
    pub fn active_joint_count(&self) -> usize {
        self.joints
            .keys()
            .filter(|&&id| self.joint_actors(JointHandle(id)).is_some())
            .count()
    }

    /// Sever a joint as if its break threshold had been exceeded.
    pub fn break_joint(&mut self, joint: JointHandle) -> bool {
        match self.joints.get_mut(&joint.0) {
            Some(j) if !j.broken => {
                j.broken = true;
                true
            }
            _ => false,
        }
    }

    pub fn set_actor_pose(&mut self, actor: ActorHandle, pose: Pose) -> bool {
        match self.bodies.get_mut(&actor.0) {
            Some(body) => {
                body.pose = pose;
                true
            }
            None => false,
        }
    }

    pub fn set_linear_velocity(&mut self, actor: ActorHandle, velocity: Vec3) -> bool {
        match self.bodies.get_mut(&actor.0) {
            Some(body) if body.kind == ActorKind::Dynamic => {
                body.linear_velocity = velocity;
                true
            }
            _ => false,
        }
    }

    pub fn joint_desc(&self, joint: JointHandle) -> Option<&JointDesc> {
        self.joints.get(&joint.0).map(|j| &j.desc)
    }

    fn validate(desc: &ActorDesc) -> SimResult<()> {
        let geometry_ok = match desc.geometry {
            Geometry::Sphere { radius } => radius > 0.0,
            Geometry::Box { half_extents } => half_extents.min_element() > 0.0,
            Geometry::Capsule { radius, half_height } => radius > 0.0 && half_height >= 0.0,
        };
        if !geometry_ok {
            return Err(SimError::InvalidActor(format!(
                "non-positive geometry {:?}",
                desc.geometry
            )));
        }
        if desc.kind == ActorKind::Dynamic && desc.density <= 0.0 {
            return Err(SimError::InvalidActor(format!(
                "dynamic actor needs positive density, got {}",
                desc.density
            )));
        }
        if !desc.pose.position.is_finite() || !desc.pose.rotation.is_finite() {
            return Err(SimError::InvalidActor("non-finite pose".into()));
        }
        Ok(())
    }

    /// Linear axes a joint leaves unconstrained, as (world axis, optional limits).
    fn free_linear_axes(kind: &JointKind, frame_rotation: Quat) -> Vec<(Vec3, Option<(f32, f32)>)> {
        let axis_of = |axis: &D6Axis, local: Vec3| match axis.motion {
            D6Motion::Locked => None,
            D6Motion::Limited => Some((frame_rotation * local, Some((axis.limit_lower, axis.limit_upper)))),
            D6Motion::Free => Some((frame_rotation * local, None)),
        };
        match kind {
            JointKind::Prismatic { limits } => vec![(frame_rotation * Vec3::X, *limits)],
            JointKind::D6(cfg) => [
                axis_of(&cfg.linear_x, Vec3::X),
                axis_of(&cfg.linear_y, Vec3::Y),
                axis_of(&cfg.linear_z, Vec3::Z),
            ]
            .into_iter()
            .flatten()
            .collect(),
            _ => Vec::new(),
        }
    }

    /// Spring force on actor 1 (actor 2 receives the opposite), or `None`
    /// if the joint cannot act this step.
    fn joint_force(&self, joint: &Joint, dt: f32) -> Option<Vec3> {
        let b1 = self.bodies.get(&joint.desc.actor1.0)?;
        let b2 = self.bodies.get(&joint.desc.actor2.0)?;

        let inv_mass = |b: &Body| if b.kind == ActorKind::Dynamic && b.mass > 0.0 { 1.0 / b.mass } else { 0.0 };
        let inv_sum = inv_mass(b1) + inv_mass(b2);
        if inv_sum <= 0.0 {
            return None;
        }
        let reduced_mass = 1.0 / inv_sum;
        // Keep the explicit spring stable for the given step.
        let max_stiffness = reduced_mass / (dt * dt);
        let max_damping = 0.5 * reduced_mass / dt;

        let anchor1 = b1.pose.transform_point(joint.desc.frame1.position);
        let anchor2 = b2.pose.transform_point(joint.desc.frame2.position);
        let delta = anchor2 - anchor1;
        let rel_vel = b2.linear_velocity - b1.linear_velocity;

        let force = match joint.desc.kind {
            JointKind::Distance {
                min_distance,
                max_distance,
                stiffness,
                damping,
            } => {
                let len = delta.length();
                if len < 1e-6 {
                    return Some(Vec3::ZERO);
                }
                let upper = if max_distance > 0.0 { max_distance } else { f32::INFINITY };
                let target = len.clamp(min_distance.min(upper), upper);
                let stretch = len - target;
                if stretch == 0.0 {
                    Vec3::ZERO
                } else {
                    let dir = delta / len;
                    let k = stiffness.min(max_stiffness);
                    let c = damping.min(max_damping);
                    dir * (k * stretch + c * rel_vel.dot(dir))
                }
            }
            ref kind => {
                let k = self.config.joint_stiffness.min(max_stiffness);
                let c = self.config.joint_damping.min(max_damping);
                let frame_rotation = b1.pose.rotation * joint.desc.frame1.rotation;
                let mut error = delta;
                let mut damped_vel = rel_vel;
                for (axis, limits) in Self::free_linear_axes(kind, frame_rotation) {
                    let along = error.dot(axis);
                    let allowed = match limits {
                        Some((lo, hi)) => along.clamp(lo, hi),
                        None => along,
                    };
                    error -= axis * allowed;
                    damped_vel -= axis * damped_vel.dot(axis);
                }
                error * k + damped_vel * c
            }
        };
        Some(force)
    }
}

impl PhysicsScene for ReferenceScene {
    fn create_actor(&mut self, desc: &ActorDesc) -> SimResult<ActorHandle> {
        Self::validate(desc)?;
        let id = self.next_actor;
        self.next_actor += 1;
        let dynamic = desc.kind == ActorKind::Dynamic;
        self.bodies.insert(
            id,
            Body {
                kind: desc.kind,
                geometry: desc.geometry,
                material: desc.material,
                mass: desc.mass(),
                pose: desc.pose,
                linear_velocity: if dynamic { desc.linear_velocity } else { Vec3::ZERO },
                angular_velocity: if dynamic { desc.angular_velocity } else { Vec3::ZERO },
            },
        );
        Ok(ActorHandle(id))
    }

    fn remove_actor(&mut self, actor: ActorHandle) -> bool {
        if self.bodies.remove(&actor.0).is_none() {
            return false;
        }
        self.joints.retain(|_, j| j.desc.actor1 != actor && j.desc.actor2 != actor);
        true
    }

    fn actor_pose(&self, actor: ActorHandle) -> Option<Pose> {
        self.bodies.get(&actor.0).map(|b| b.pose)
    }

    fn linear_velocity(&self, actor: ActorHandle) -> Option<Vec3> {
        self.bodies.get(&actor.0).map(|b| b.linear_velocity)
    }

    fn angular_velocity(&self, actor: ActorHandle) -> Option<Vec3> {
        self.bodies.get(&actor.0).map(|b| b.angular_velocity)
    }

    fn mass(&self, actor: ActorHandle) -> Option<f32> {
        self.bodies.get(&actor.0).map(|b| b.mass)
    }

    fn is_dynamic(&self, actor: ActorHandle) -> bool {
        self.bodies
            .get(&actor.0)
            .map_or(false, |b| b.kind == ActorKind::Dynamic)
    }

    fn dynamic_actors(&self) -> Vec<ActorHandle> {
        self.bodies
            .iter()
            .filter(|(_, b)| b.kind == ActorKind::Dynamic)
            .map(|(&id, _)| ActorHandle(id))
            .collect()
    }

    fn create_joint(&mut self, desc: &JointDesc) -> Option<JointHandle> {
        if desc.actor1 == desc.actor2
            || !self.bodies.contains_key(&desc.actor1.0)
            || !self.bodies.contains_key(&desc.actor2.0)
        {
            return None;
        }
        let id = self.next_joint;
        self.next_joint += 1;
        self.joints.insert(
            id,
            Joint {
                desc: *desc,
                broken: false,
            },
        );
        Some(JointHandle(id))
    }

    fn release_joint(&mut self, joint: JointHandle) -> bool {
        self.joints.remove(&joint.0).is_some()
    }

    fn joint_actors(&self, joint: JointHandle) -> Option<(ActorHandle, ActorHandle)> {
        let j = self.joints.get(&joint.0)?;
        if j.broken
            || !self.bodies.contains_key(&j.desc.actor1.0)
            || !self.bodies.contains_key(&j.desc.actor2.0)
        {
            return None;
        }
        Some((j.desc.actor1, j.desc.actor2))
    }

    fn step(&mut self, dt: f32) {
        if dt <= 0.0 {
            return;
        }

        // Accumulate joint forces
        let mut forces: BTreeMap<u64, Vec3> = BTreeMap::new();
        let mut newly_broken = Vec::new();
        for (&id, joint) in &self.joints {
            if joint.broken {
                continue;
            }
            let Some(force) = self.joint_force(joint, dt) else {
                continue;
            };
            if let Some((break_force, _)) = joint.desc.break_limits {
                if force.length() > break_force {
                    newly_broken.push(id);
                    continue;
                }
            }
            *forces.entry(joint.desc.actor1.0).or_insert(Vec3::ZERO) += force;
            *forces.entry(joint.desc.actor2.0).or_insert(Vec3::ZERO) -= force;
        }
        for id in newly_broken {
            if let Some(joint) = self.joints.get_mut(&id) {
                joint.broken = true;
            }
        }

        // Integrate dynamic bodies
        let gravity = self.config.gravity;
        let linear_keep = (1.0 - self.config.linear_damping * dt).max(0.0);
        let angular_keep = (1.0 - self.config.angular_damping * dt).max(0.0);
        let ground = self.config.ground_height;

        for (id, body) in self.bodies.iter_mut() {
            if body.kind != ActorKind::Dynamic {
                continue;
            }
            let force = forces.get(id).copied().unwrap_or(Vec3::ZERO);
            body.linear_velocity += (force / body.mass + gravity) * dt;
            body.linear_velocity *= linear_keep;
            body.pose.position += body.linear_velocity * dt;

            body.angular_velocity *= angular_keep;
            let spin = Quat::from_scaled_axis(body.angular_velocity * dt);
            body.pose.rotation = (spin * body.pose.rotation).normalize();

            if let Some(height) = ground {
                let floor = height + body.geometry.bottom_extent();
                if body.pose.position.y < floor {
                    body.pose.position.y = floor;
                    if body.linear_velocity.y < 0.0 {
                        body.linear_velocity.y *= -body.material.restitution;
                    }
                }
            }
        }

        self.time += dt;
    }
}

/// Engine handing out fresh [`ReferenceScene`]s.
#[derive(Debug, Clone, Default)]
pub struct ReferenceEngine {
    pub config: ReferenceSceneConfig,
}

impl ReferenceEngine {
    pub fn new(config: ReferenceSceneConfig) -> Self {
        Self { config }
    }
}

impl PhysicsEngine for ReferenceEngine {
    fn create_scene(&self) -> SimResult<Box<dyn PhysicsScene>> {
        Ok(Box::new(ReferenceScene::new(self.config.clone())))
    }
}
