//! Bondable entity definitions and their runtime state.

use super::bond::Bond;
use super::properties::PropertyMap;
use super::site::BondingSiteDef;
use super::{BondId, EntityId, SiteId};
use crate::physics::{ActorDesc, ActorHandle, Geometry, PhysicsScene, Pose};
use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// DEFINITION
// ============================================================================

/// Static description of an entity: its actor, sites, type and properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BondableEntityDef {
    /// Shape, material and initial state of the backing actor.
    pub actor: ActorDesc,
    pub bonding_sites: Vec<BondingSiteDef>,
    /// Classification string, e.g. "monomer".
    pub entity_type: String,
    /// Assigned at registration; 0 until then.
    pub entity_id: EntityId,
    #[serde(default)]
    pub properties: PropertyMap,
}

impl Default for BondableEntityDef {
    fn default() -> Self {
        Self {
            actor: ActorDesc::default(),
            bonding_sites: Vec::new(),
            entity_type: "particle".to_string(),
            entity_id: 0,
            properties: PropertyMap::new(),
        }
    }
}

impl BondableEntityDef {
    /// Sphere with two valency-1 sites on opposite sides along ±X.
    ///
    /// A non-positive `site_offset` places the sites on the surface.
    pub fn dimer(radius: f32, site_offset: f32) -> Self {
        let offset = if site_offset > 0.0 { site_offset } else { radius };
        Self {
            actor: ActorDesc {
                geometry: Geometry::Sphere { radius },
                ..Default::default()
            },
            bonding_sites: vec![
                BondingSiteDef::new(0, Vec3::new(offset, 0.0, 0.0), Vec3::X),
                BondingSiteDef::new(1, Vec3::new(-offset, 0.0, 0.0), Vec3::NEG_X),
            ],
            entity_type: "dimer".to_string(),
            ..Default::default()
        }
    }

    /// Sphere with four valency-1 sites at tetrahedral directions.
    pub fn tetrahedral(radius: f32) -> Self {
        let a = 1.0 / 3f32.sqrt();
        let dirs = [
            Vec3::new(a, a, a),
            Vec3::new(a, -a, -a),
            Vec3::new(-a, a, -a),
            Vec3::new(-a, -a, a),
        ];
        Self {
            actor: ActorDesc {
                geometry: Geometry::Sphere { radius },
                ..Default::default()
            },
            bonding_sites: dirs
                .iter()
                .enumerate()
                .map(|(i, &d)| BondingSiteDef::new(i as SiteId, d * radius, d))
                .collect(),
            entity_type: "tetrahedral".to_string(),
            ..Default::default()
        }
    }

    pub fn at_position(mut self, position: Vec3) -> Self {
        self.actor.pose.position = position;
        self
    }

    pub fn find_site(&self, site_id: SiteId) -> Option<&BondingSiteDef> {
        self.bonding_sites.iter().find(|s| s.site_id == site_id)
    }

    /// Sum of all sites' valencies.
    pub fn total_valency(&self) -> u32 {
        self.bonding_sites.iter().map(|s| s.max_valency).sum()
    }
}

// ============================================================================
// RUNTIME ENTITY
// ============================================================================

/// A registered entity. Holds a non-owning handle to its actor and tracks
/// which bonds occupy each site. Position is always read from the scene.
#[derive(Debug, Clone)]
pub struct BondableEntity {
    entity_id: EntityId,
    entity_type: String,
    actor: ActorHandle,
    definition: BondableEntityDef,
    properties: PropertyMap,
    site_bonds: BTreeMap<SiteId, BTreeSet<BondId>>,
}

impl BondableEntity {
    pub fn new(entity_id: EntityId, mut definition: BondableEntityDef, actor: ActorHandle) -> Self {
        definition.entity_id = entity_id;
        let site_bonds = definition
            .bonding_sites
            .iter()
            .map(|s| (s.site_id, BTreeSet::new()))
            .collect();
        Self {
            entity_id,
            entity_type: definition.entity_type.clone(),
            actor,
            properties: definition.properties.clone(),
            definition,
            site_bonds,
        }
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn actor(&self) -> ActorHandle {
        self.actor
    }

    pub fn definition(&self) -> &BondableEntityDef {
        &self.definition
    }

    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut PropertyMap {
        &mut self.properties
    }

    // --- Sites -------------------------------------------------------------

    pub fn site_def(&self, site_id: SiteId) -> Option<&BondingSiteDef> {
        self.definition.find_site(site_id)
    }

    pub fn sites(&self) -> &[BondingSiteDef] {
        &self.definition.bonding_sites
    }

    pub fn bond_count_at(&self, site_id: SiteId) -> u32 {
        self.site_bonds.get(&site_id).map_or(0, |b| b.len() as u32)
    }

    pub fn max_valency_at(&self, site_id: SiteId) -> u32 {
        self.site_def(site_id).map_or(0, |s| s.max_valency)
    }

    /// Whether the site exists and has spare valency.
    pub fn can_bond_at(&self, site_id: SiteId) -> bool {
        self.site_def(site_id)
            .map_or(false, |s| self.bond_count_at(site_id) < s.max_valency)
    }

    pub fn available_sites(&self) -> Vec<SiteId> {
        self.definition
            .bonding_sites
            .iter()
            .map(|s| s.site_id)
            .filter(|&id| self.can_bond_at(id))
            .collect()
    }

    pub fn is_fully_saturated(&self) -> bool {
        self.definition
            .bonding_sites
            .iter()
            .all(|s| !self.can_bond_at(s.site_id))
    }

    pub fn total_valency(&self) -> u32 {
        self.definition.total_valency()
    }

    // --- Bond bookkeeping --------------------------------------------------

    pub fn bonds_at(&self, site_id: SiteId) -> impl Iterator<Item = BondId> + '_ {
        self.site_bonds.get(&site_id).into_iter().flatten().copied()
    }

    /// Distinct bond ids across all sites, ascending.
    pub fn all_bond_ids(&self) -> Vec<BondId> {
        let all: BTreeSet<BondId> = self.site_bonds.values().flatten().copied().collect();
        all.into_iter().collect()
    }

    pub fn total_bond_count(&self) -> usize {
        self.all_bond_ids().len()
    }

    pub fn has_bond_at(&self, site_id: SiteId, bond_id: BondId) -> bool {
        self.site_bonds
            .get(&site_id)
            .map_or(false, |b| b.contains(&bond_id))
    }

    /// Ids of entities on the far side of this entity's bonds, ascending.
    pub fn bonded_entities(&self, bonds: &BTreeMap<BondId, Bond>) -> Vec<EntityId> {
        let partners: BTreeSet<EntityId> = self
            .all_bond_ids()
            .iter()
            .filter_map(|id| bonds.get(id))
            .filter_map(|b| b.other_endpoint(self.entity_id))
            .map(|ep| ep.entity_id)
            .collect();
        partners.into_iter().collect()
    }

    /// Record a bond at a site. Refuses unknown sites and full sites.
    pub(crate) fn record_bond(&mut self, site_id: SiteId, bond_id: BondId) -> bool {
        let Some(max) = self.site_def(site_id).map(|s| s.max_valency) else {
            return false;
        };
        let bonds = self.site_bonds.entry(site_id).or_default();
        if bonds.len() as u32 >= max {
            return false;
        }
        bonds.insert(bond_id)
    }

    pub(crate) fn remove_bond(&mut self, site_id: SiteId, bond_id: BondId) -> bool {
        self.site_bonds
            .get_mut(&site_id)
            .map_or(false, |b| b.remove(&bond_id))
    }

    pub(crate) fn clear_all_bonds(&mut self) {
        for bonds in self.site_bonds.values_mut() {
            bonds.clear();
        }
    }

    // --- World-space queries -----------------------------------------------

    pub fn world_pose(&self, scene: &dyn PhysicsScene) -> Option<Pose> {
        scene.actor_pose(self.actor)
    }

    pub fn site_world_position(&self, scene: &dyn PhysicsScene, site_id: SiteId) -> Option<Vec3> {
        let site = self.site_def(site_id)?;
        Some(site.world_position(&self.world_pose(scene)?))
    }

    pub fn site_world_direction(&self, scene: &dyn PhysicsScene, site_id: SiteId) -> Option<Vec3> {
        let site = self.site_def(site_id)?;
        Some(site.world_direction(&self.world_pose(scene)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bonding::bond::BondEndpoint;
    use crate::physics::ReferenceScene;
    use approx::assert_relative_eq;

    #[test]
    fn test_dimer_layout() {
        let def = BondableEntityDef::dimer(0.5, 0.0);
        assert_eq!(def.bonding_sites.len(), 2);
        assert_eq!(def.total_valency(), 2);
        assert_eq!(def.find_site(1).unwrap().local_position, Vec3::new(-0.5, 0.0, 0.0));
        assert_eq!(def.find_site(1).unwrap().local_direction, Vec3::NEG_X);
    }

    #[test]
    fn test_tetrahedral_sites_are_unit() {
        let def = BondableEntityDef::tetrahedral(1.0);
        assert_eq!(def.bonding_sites.len(), 4);
        for site in &def.bonding_sites {
            assert_relative_eq!(site.local_direction.length(), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_valency_enforced() {
        let mut entity = BondableEntity::new(7, BondableEntityDef::dimer(0.5, 0.0), ActorHandle(1));
        assert_eq!(entity.definition().entity_id, 7);
        assert!(entity.can_bond_at(0));
        assert!(entity.record_bond(0, 100));
        assert!(!entity.can_bond_at(0));
        assert!(!entity.record_bond(0, 101));
        assert!(!entity.record_bond(9, 102));
        assert_eq!(entity.available_sites(), vec![1]);

        assert!(entity.record_bond(1, 103));
        assert!(entity.is_fully_saturated());
        assert_eq!(entity.all_bond_ids(), vec![100, 103]);

        let bonds: BTreeMap<BondId, Bond> = [(
            100,
            Bond {
                bond_id: 100,
                endpoint1: BondEndpoint::new(7, 0),
                endpoint2: BondEndpoint::new(3, 1),
                bond_type: "rigid".into(),
                joint: None,
                formation_time: 0.0,
                pending_removal: false,
            },
        )]
        .into_iter()
        .collect();
        assert_eq!(entity.bonded_entities(&bonds), vec![3]);

        assert!(entity.remove_bond(0, 100));
        assert!(!entity.is_fully_saturated());
        entity.clear_all_bonds();
        assert_eq!(entity.total_bond_count(), 0);
    }

    #[test]
    fn test_site_world_position_follows_actor() {
        let mut scene = ReferenceScene::default();
        let def = BondableEntityDef::dimer(0.5, 0.0).at_position(Vec3::new(3.0, 0.0, 0.0));
        let actor = scene.create_actor(&def.actor).unwrap();
        let entity = BondableEntity::new(1, def, actor);

        let p = entity.site_world_position(&scene, 0).unwrap();
        assert_relative_eq!(p.x, 3.5, epsilon = 1e-6);
        assert!(entity.site_world_position(&scene, 5).is_none());

        scene.remove_actor(actor);
        assert!(entity.site_world_position(&scene, 0).is_none());
    }
}
