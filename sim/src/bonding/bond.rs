//! Bonds, their construction parameters and lifecycle events.

use super::{BondId, EntityId, SiteId};
use crate::physics::{JointHandle, PhysicsScene};
use serde::{Deserialize, Serialize};

/// One end of a bond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BondEndpoint {
    pub entity_id: EntityId,
    pub site_id: SiteId,
}

impl BondEndpoint {
    pub fn new(entity_id: EntityId, site_id: SiteId) -> Self {
        Self { entity_id, site_id }
    }
}

/// Per-bond construction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BondConfig {
    /// Whether the engine may sever the bond under load.
    pub breakable: bool,
    pub break_force: f32,
    pub break_torque: f32,
    /// Spring stiffness for compliant bonds (0 = bond type default).
    pub stiffness: f32,
    /// Spring damping for compliant bonds (0 = bond type default).
    pub damping: f32,
    /// Rest length (0 = current site separation).
    pub rest_length: f32,
    /// Minimum length (0 = 90% of rest length).
    pub min_distance: f32,
    /// Maximum length (0 = 110% of rest length).
    pub max_distance: f32,
    /// Collision between the two bonded actors.
    pub enable_collision: bool,
}

impl Default for BondConfig {
    fn default() -> Self {
        Self {
            breakable: false,
            break_force: f32::MAX,
            break_torque: f32::MAX,
            stiffness: 1000.0,
            damping: 10.0,
            rest_length: 0.0,
            min_distance: 0.0,
            max_distance: 0.0,
            enable_collision: false,
        }
    }
}

impl BondConfig {
    pub fn breakable(break_force: f32, break_torque: f32) -> Self {
        Self {
            breakable: true,
            break_force,
            break_torque,
            ..Default::default()
        }
    }

    /// Break thresholds to hand to the engine, if breakable.
    pub fn break_limits(&self) -> Option<(f32, f32)> {
        self.breakable.then_some((self.break_force, self.break_torque))
    }
}

/// A live bond between two sites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bond {
    pub bond_id: BondId,
    pub endpoint1: BondEndpoint,
    pub endpoint2: BondEndpoint,
    /// Name of the bond type that built the joint.
    pub bond_type: String,
    /// Engine-owned constraint; `None` once released.
    pub joint: Option<JointHandle>,
    /// Simulation time at formation.
    pub formation_time: f32,
    pub pending_removal: bool,
}

impl Bond {
    pub fn involves_entity(&self, entity_id: EntityId) -> bool {
        self.endpoint1.entity_id == entity_id || self.endpoint2.entity_id == entity_id
    }

    pub fn involves_site(&self, entity_id: EntityId, site_id: SiteId) -> bool {
        let ep = BondEndpoint::new(entity_id, site_id);
        self.endpoint1 == ep || self.endpoint2 == ep
    }

    /// The endpoint on the far side from `entity_id`.
    pub fn other_endpoint(&self, entity_id: EntityId) -> Option<BondEndpoint> {
        if self.endpoint1.entity_id == entity_id {
            Some(self.endpoint2)
        } else if self.endpoint2.entity_id == entity_id {
            Some(self.endpoint1)
        } else {
            None
        }
    }

    /// Whether the joint still links two live actors.
    pub fn is_valid(&self, scene: &dyn PhysicsScene) -> bool {
        !self.pending_removal && self.joint.map_or(false, |j| scene.joint_actors(j).is_some())
    }
}

/// Bond lifecycle notification, queued by the manager and drained by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum BondEvent {
    Formed {
        bond: Bond,
        time: f32,
    },
    Broken {
        bond: Bond,
        time: f32,
        /// True when the engine severed the joint, false for `break_bond`.
        by_force: bool,
    },
}

impl BondEvent {
    pub fn bond(&self) -> &Bond {
        match self {
            BondEvent::Formed { bond, .. } | BondEvent::Broken { bond, .. } => bond,
        }
    }

    pub fn time(&self) -> f32 {
        match self {
            BondEvent::Formed { time, .. } | BondEvent::Broken { time, .. } => *time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bond() -> Bond {
        Bond {
            bond_id: 1,
            endpoint1: BondEndpoint::new(10, 0),
            endpoint2: BondEndpoint::new(20, 1),
            bond_type: "rigid".into(),
            joint: None,
            formation_time: 0.5,
            pending_removal: false,
        }
    }

    #[test]
    fn test_endpoint_queries() {
        let b = bond();
        assert!(b.involves_entity(10));
        assert!(b.involves_entity(20));
        assert!(!b.involves_entity(30));
        assert!(b.involves_site(20, 1));
        assert!(!b.involves_site(20, 0));
        assert_eq!(b.other_endpoint(10), Some(BondEndpoint::new(20, 1)));
        assert_eq!(b.other_endpoint(30), None);
    }

    #[test]
    fn test_break_limits() {
        assert_eq!(BondConfig::default().break_limits(), None);
        assert_eq!(BondConfig::breakable(5.0, 2.0).break_limits(), Some((5.0, 2.0)));
    }
}
