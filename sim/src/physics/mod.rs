//! Physics capability boundary.
//!
//! The bond manager never integrates motion or solves constraints itself. It
//! talks to a physics engine through [`PhysicsScene`], using opaque handles for
//! actors and joints. [`reference`] provides a small deterministic engine that
//! satisfies the contract for tests, demos and benchmarks.

pub mod reference;

use crate::error::SimResult;
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

pub use reference::{ReferenceEngine, ReferenceScene, ReferenceSceneConfig};

/// Opaque handle to a rigid actor owned by a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorHandle(pub u64);

/// Opaque handle to a joint owned by a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JointHandle(pub u64);

// ============================================================================
// TRANSFORMS
// ============================================================================

/// Rigid transform: rotation followed by translation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
    };

    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
        }
    }

    /// Transform a point from local to world space.
    #[inline]
    pub fn transform_point(&self, local: Vec3) -> Vec3 {
        self.position + self.rotation * local
    }

    /// Rotate a direction from local to world space.
    #[inline]
    pub fn rotate(&self, local: Vec3) -> Vec3 {
        self.rotation * local
    }
}

// ============================================================================
// ACTOR DESCRIPTIONS
// ============================================================================

/// Whether an actor is moved by the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorKind {
    Static,
    Dynamic,
}

/// Collision shape of an actor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    Sphere { radius: f32 },
    Box { half_extents: Vec3 },
    Capsule { radius: f32, half_height: f32 },
}

impl Geometry {
    /// Shape volume, used to derive mass from density.
    pub fn volume(&self) -> f32 {
        use std::f32::consts::PI;
        match *self {
            Geometry::Sphere { radius } => 4.0 / 3.0 * PI * radius.powi(3),
            Geometry::Box { half_extents } => 8.0 * half_extents.x * half_extents.y * half_extents.z,
            Geometry::Capsule { radius, half_height } => {
                PI * radius * radius * (2.0 * half_height) + 4.0 / 3.0 * PI * radius.powi(3)
            }
        }
    }

    /// Distance from the actor origin to its lowest point along -Y when upright.
    pub fn bottom_extent(&self) -> f32 {
        match *self {
            Geometry::Sphere { radius } => radius,
            Geometry::Box { half_extents } => half_extents.y,
            Geometry::Capsule { radius, half_height } => radius + half_height,
        }
    }
}

/// Surface material of an actor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Material {
    pub static_friction: f32,
    pub dynamic_friction: f32,
    pub restitution: f32,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            static_friction: 0.5,
            dynamic_friction: 0.5,
            restitution: 0.6,
        }
    }
}

/// Everything a scene needs to create a rigid actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorDesc {
    pub kind: ActorKind,
    pub geometry: Geometry,
    pub material: Material,
    pub density: f32,
    pub pose: Pose,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
}

impl Default for ActorDesc {
    fn default() -> Self {
        Self {
            kind: ActorKind::Dynamic,
            geometry: Geometry::Sphere { radius: 0.5 },
            material: Material::default(),
            density: 1.0,
            pose: Pose::IDENTITY,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
        }
    }
}

impl ActorDesc {
    pub fn sphere(radius: f32, position: Vec3) -> Self {
        Self {
            geometry: Geometry::Sphere { radius },
            pose: Pose::from_position(position),
            ..Default::default()
        }
    }

    /// Mass implied by density and shape. Static actors report zero.
    pub fn mass(&self) -> f32 {
        match self.kind {
            ActorKind::Static => 0.0,
            ActorKind::Dynamic => self.density * self.geometry.volume(),
        }
    }
}

// ============================================================================
// JOINT DESCRIPTIONS
// ============================================================================

/// Motion allowed on a single D6 axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum D6Motion {
    Locked,
    Limited,
    Free,
}

/// Configuration of one D6 degree of freedom.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct D6Axis {
    pub motion: D6Motion,
    pub limit_lower: f32,
    pub limit_upper: f32,
    pub drive_stiffness: f32,
    pub drive_damping: f32,
}

impl Default for D6Axis {
    fn default() -> Self {
        Self {
            motion: D6Motion::Locked,
            limit_lower: 0.0,
            limit_upper: 0.0,
            drive_stiffness: 0.0,
            drive_damping: 0.0,
        }
    }
}

impl D6Axis {
    pub fn free() -> Self {
        Self {
            motion: D6Motion::Free,
            ..Default::default()
        }
    }

    pub fn limited(lower: f32, upper: f32) -> Self {
        Self {
            motion: D6Motion::Limited,
            limit_lower: lower,
            limit_upper: upper,
            ..Default::default()
        }
    }
}

/// Per-axis configuration of a D6 joint: three linear axes plus twist and two swings.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct D6Config {
    pub linear_x: D6Axis,
    pub linear_y: D6Axis,
    pub linear_z: D6Axis,
    pub twist: D6Axis,
    pub swing1: D6Axis,
    pub swing2: D6Axis,
}

impl D6Config {
    /// Number of linear axes that are not locked.
    pub fn free_linear_axes(&self) -> usize {
        [self.linear_x, self.linear_y, self.linear_z]
            .iter()
            .filter(|a| a.motion != D6Motion::Locked)
            .count()
    }
}

/// Constraint family and its family-specific parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JointKind {
    Fixed,
    Distance {
        min_distance: f32,
        max_distance: f32,
        stiffness: f32,
        damping: f32,
    },
    Revolute {
        limits: Option<(f32, f32)>,
    },
    Spherical {
        cone_limit: Option<f32>,
    },
    Prismatic {
        limits: Option<(f32, f32)>,
    },
    D6(D6Config),
}

/// Everything a scene needs to create a joint between two actors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointDesc {
    pub actor1: ActorHandle,
    pub frame1: Pose,
    pub actor2: ActorHandle,
    pub frame2: Pose,
    pub kind: JointKind,
    /// Break thresholds, present only for breakable joints.
    pub break_limits: Option<(f32, f32)>,
    pub enable_collision: bool,
}

// ============================================================================
// CAPABILITY TRAITS
// ============================================================================

/// A physics scene: owns actors and joints and advances them in time.
pub trait PhysicsScene: Send + Sync {
    /// Create and add a rigid actor.
    fn create_actor(&mut self, desc: &ActorDesc) -> SimResult<ActorHandle>;

    /// Remove an actor. Joints attached to it stop linking anything.
    fn remove_actor(&mut self, actor: ActorHandle) -> bool;

    /// Current world pose, `None` if the actor does not exist.
    fn actor_pose(&self, actor: ActorHandle) -> Option<Pose>;

    fn linear_velocity(&self, actor: ActorHandle) -> Option<Vec3>;

    fn angular_velocity(&self, actor: ActorHandle) -> Option<Vec3>;

    fn mass(&self, actor: ActorHandle) -> Option<f32>;

    fn is_dynamic(&self, actor: ActorHandle) -> bool;

    /// All dynamic actors, in creation order.
    fn dynamic_actors(&self) -> Vec<ActorHandle>;

    /// Create a joint. `None` if the engine refuses it.
    fn create_joint(&mut self, desc: &JointDesc) -> Option<JointHandle>;

    /// Release a joint. Returns false if it was already gone.
    fn release_joint(&mut self, joint: JointHandle) -> bool;

    /// Actors linked by a joint, or `None` once it is broken or released
    /// or either actor is gone.
    fn joint_actors(&self, joint: JointHandle) -> Option<(ActorHandle, ActorHandle)>;

    /// Advance the scene by `dt` seconds and fetch results synchronously.
    fn step(&mut self, dt: f32);
}

/// Factory for independent scenes, one per batch replicate.
pub trait PhysicsEngine: Send + Sync {
    fn create_scene(&self) -> SimResult<Box<dyn PhysicsScene>>;
}
