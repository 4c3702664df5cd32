//! Dynamic bonding layer.
//!
//! Entities carry bonding sites. The [`DynamicBondManager`] searches for
//! nearby compatible site pairs, scores them through a rule chain and commits
//! the best ones as joints in the physics scene.

pub mod bond;
pub mod bond_types;
pub mod entity;
pub mod manager;
pub mod properties;
pub mod rules;
pub mod site;

pub use bond::{Bond, BondConfig, BondEndpoint, BondEvent};
pub use bond_types::{
    default_bond_types, BallSocketBondType, BondType, CompliantBondType, D6BondType,
    HingedBondType, JointAttachment, JointDef, PrismaticBondType, RigidBondType,
};
pub use entity::{BondableEntity, BondableEntityDef};
pub use manager::{BondCandidate, BondManagerStats, DynamicBondManager, DynamicBondManagerConfig};
pub use properties::{PropertyMap, PropertyValue};
pub use rules::{
    default_rules, molecular_rules, ring_formation_rules, AlignmentMode, AngleConstraintRule,
    BondFormationRule, CompositeRule, CoplanarityRule, DirectionalAlignmentRule,
    NoDuplicateBondRule, NoSelfBondingRule, ProximityRule, TypeCompatibilityRule, ValencyRule,
};
pub use site::BondingSiteDef;

pub type EntityId = u64;
pub type BondId = u64;
pub type SiteId = u32;

/// Monotonic id source. Ids start at 1; 0 is never handed out.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    next: u64,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl IdGenerator {
    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    pub fn reset(&mut self) {
        self.next = 1;
    }
}
