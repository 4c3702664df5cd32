//! Dynamic bond manager.
//!
//! Each tick the manager sweeps bonds whose joints the engine has severed, and
//! every `proximity_check_interval` seconds it rebuilds the site hash, scores
//! candidate site pairs and greedily commits the best ones as joints.

use super::bond::{Bond, BondConfig, BondEndpoint, BondEvent};
use super::bond_types::{default_bond_types, BondType, JointAttachment, JointDef};
use super::entity::{BondableEntity, BondableEntityDef};
use super::rules::{default_rules, evaluate_chain, insert_by_priority, BondFormationRule};
use super::{BondId, EntityId, IdGenerator, SiteId};
use crate::error::{SimError, SimResult};
use crate::physics::{ActorHandle, PhysicsScene, Pose};
use crate::profiler::{TickPhase, TickProfiler};
use crate::spatial::SiteSpatialHash;
use bevy_ecs::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Tuning for [`DynamicBondManager`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicBondManagerConfig {
    pub proximity_check_interval: f32,
    pub capture_distance: f32,
    pub max_bonds_per_frame: usize,
    pub enable_spatial_hashing: bool,
    pub spatial_cell_size: f32,
    pub default_bond_type: String,
    pub default_bond_config: BondConfig,
    /// Multiplier applied when a soft rule scores negative.
    pub soft_violation_factor: f32,
}

impl Default for DynamicBondManagerConfig {
    fn default() -> Self {
        Self {
            proximity_check_interval: 0.1,  // Seconds between candidate searches
            capture_distance: 2.0,
            max_bonds_per_frame: 10,
            enable_spatial_hashing: true,
            spatial_cell_size: 5.0,         // Raised to capture_distance if smaller
            default_bond_type: "rigid".to_string(),
            default_bond_config: BondConfig::default(),
            soft_violation_factor: 0.1,
        }
    }
}

impl DynamicBondManagerConfig {
    /// Cell size actually used by the hash.
    pub fn effective_cell_size(&self) -> f32 {
        self.spatial_cell_size.max(self.capture_distance)
    }
}

/// Snapshot of manager state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BondManagerStats {
    pub entity_count: usize,
    pub bond_count: usize,
    pub available_site_count: usize,
    pub saturated_entity_count: usize,
    pub bonds_formed_this_frame: usize,
    pub bonds_broken_this_frame: usize,
    /// Simulation time of the last update.
    pub last_update_time: f32,
}

/// A scored, uncommitted site pair. `(entity1, site1) < (entity2, site2)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BondCandidate {
    pub entity1: EntityId,
    pub site1: SiteId,
    pub entity2: EntityId,
    pub site2: SiteId,
    pub score: f32,
}

impl BondCandidate {
    fn key(&self) -> (EntityId, SiteId, EntityId, SiteId) {
        (self.entity1, self.site1, self.entity2, self.site2)
    }
}

type BondObserver = Box<dyn FnMut(&BondEvent) + Send + Sync>;

// ============================================================================
// MANAGER
// ============================================================================

/// Owns entities and bonds by id and drives bond formation and breakage.
///
/// The manager never owns the physics scene; every operation that touches
/// actors or joints takes the scene explicitly.
#[derive(Resource)]
pub struct DynamicBondManager {
    config: DynamicBondManagerConfig,
    entities: BTreeMap<EntityId, BondableEntity>,
    bonds: BTreeMap<BondId, Bond>,
    bond_configs: BTreeMap<BondId, BondConfig>,
    rules: Vec<Box<dyn BondFormationRule>>,
    bond_types: BTreeMap<String, Box<dyn BondType>>,
    spatial_hash: SiteSpatialHash,
    entity_ids: IdGenerator,
    bond_ids: IdGenerator,
    events: Vec<BondEvent>,
    observers: Vec<BondObserver>,
    profiler: Option<TickProfiler>,

    simulation_time: f32,
    time_since_check: f32,
    bonds_formed_this_frame: usize,
    bonds_broken_this_frame: usize,
}

impl Default for DynamicBondManager {
    fn default() -> Self {
        Self::new(DynamicBondManagerConfig::default())
    }
}

impl DynamicBondManager {
    pub fn new(config: DynamicBondManagerConfig) -> Self {
        let bond_types = default_bond_types()
            .into_iter()
            .map(|t| (t.name().to_string(), t))
            .collect();
        let mut manager = Self {
            rules: Vec::new(),
            spatial_hash: SiteSpatialHash::new(config.effective_cell_size()),
            config,
            entities: BTreeMap::new(),
            bonds: BTreeMap::new(),
            bond_configs: BTreeMap::new(),
            bond_types,
            entity_ids: IdGenerator::default(),
            bond_ids: IdGenerator::default(),
            events: Vec::new(),
            observers: Vec::new(),
            profiler: cfg!(feature = "profile").then(TickProfiler::new),
            simulation_time: 0.0,
            time_since_check: 0.0,
            bonds_formed_this_frame: 0,
            bonds_broken_this_frame: 0,
        };
        manager.set_rules(default_rules(manager.config.capture_distance));
        manager
    }

    pub fn config(&self) -> &DynamicBondManagerConfig {
        &self.config
    }

    /// Replace the configuration. Clears the spatial hash and pushes the new
    /// capture distance into the installed rules.
    pub fn set_config(&mut self, config: DynamicBondManagerConfig) {
        self.spatial_hash.set_cell_size(config.effective_cell_size());
        for rule in self.rules.iter_mut() {
            rule.set_capture_distance(config.capture_distance);
        }
        self.config = config;
    }

    pub fn simulation_time(&self) -> f32 {
        self.simulation_time
    }

    // --- Profiling ---------------------------------------------------------

    pub fn set_profiling(&mut self, enabled: bool) {
        match (enabled, self.profiler.is_some()) {
            (true, false) => self.profiler = Some(TickProfiler::new()),
            (false, true) => self.profiler = None,
            _ => {}
        }
    }

    pub fn profiler(&self) -> Option<&TickProfiler> {
        self.profiler.as_ref()
    }

    fn start_phase(&mut self, phase: TickPhase) {
        if let Some(profiler) = self.profiler.as_mut() {
            profiler.start(phase);
        }
    }

    fn stop_phase(&mut self) {
        if let Some(profiler) = self.profiler.as_mut() {
            profiler.stop();
        }
    }

    // --- Entities ----------------------------------------------------------

    /// Create the backing actor from `def.actor` and register the entity.
    pub fn register_entity(&mut self, scene: &mut dyn PhysicsScene, def: BondableEntityDef) -> SimResult<EntityId> {
        let actor = scene.create_actor(&def.actor)?;
        self.insert_entity(def, actor)
    }

    /// Register an entity around an actor the caller already created.
    pub fn register_entity_with_actor(
        &mut self,
        scene: &dyn PhysicsScene,
        def: BondableEntityDef,
        actor: ActorHandle,
    ) -> SimResult<EntityId> {
        if scene.actor_pose(actor).is_none() {
            return Err(SimError::ActorNotFound(actor));
        }
        self.insert_entity(def, actor)
    }

    fn insert_entity(&mut self, def: BondableEntityDef, actor: ActorHandle) -> SimResult<EntityId> {
        let id = self.entity_ids.next_id();
        debug!(entity = id, sites = def.bonding_sites.len(), "entity registered");
        self.entities.insert(id, BondableEntity::new(id, def, actor));
        Ok(id)
    }

    /// Break every bond of the entity, remove its actor and forget it.
    pub fn unregister_entity(&mut self, scene: &mut dyn PhysicsScene, entity_id: EntityId) -> SimResult<()> {
        let bond_ids = self
            .entities
            .get(&entity_id)
            .ok_or(SimError::EntityNotFound(entity_id))?
            .all_bond_ids();
        for bond_id in bond_ids {
            self.break_bond(scene, bond_id)?;
        }
        if let Some(entity) = self.entities.remove(&entity_id) {
            scene.remove_actor(entity.actor());
        }
        Ok(())
    }

    pub fn entity(&self, entity_id: EntityId) -> Option<&BondableEntity> {
        self.entities.get(&entity_id)
    }

    pub fn entity_mut(&mut self, entity_id: EntityId) -> Option<&mut BondableEntity> {
        self.entities.get_mut(&entity_id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &BondableEntity> {
        self.entities.values()
    }

    /// Registered ids, ascending.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    // --- Bonds -------------------------------------------------------------

    pub fn bond(&self, bond_id: BondId) -> Option<&Bond> {
        self.bonds.get(&bond_id)
    }

    pub fn bonds(&self) -> impl Iterator<Item = &Bond> {
        self.bonds.values()
    }

    pub(crate) fn bond_map(&self) -> &BTreeMap<BondId, Bond> {
        &self.bonds
    }

    pub fn bond_count(&self) -> usize {
        self.bonds.len()
    }

    pub fn bonds_for_entity(&self, entity_id: EntityId) -> Vec<&Bond> {
        self.entities
            .get(&entity_id)
            .map(|e| e.all_bond_ids().iter().filter_map(|id| self.bonds.get(id)).collect())
            .unwrap_or_default()
    }

    /// Serializable description of the joint behind a bond.
    pub fn joint_def(&self, bond_id: BondId) -> SimResult<JointDef> {
        let bond = self.bonds.get(&bond_id).ok_or(SimError::BondNotFound(bond_id))?;
        let bond_type = self
            .bond_types
            .get(&bond.bond_type)
            .ok_or_else(|| SimError::UnknownBondType(bond.bond_type.clone()))?;
        let config = self
            .bond_configs
            .get(&bond_id)
            .unwrap_or(&self.config.default_bond_config);
        Ok(bond_type.joint_def(bond, config))
    }

    /// Form a bond directly, bypassing the rule chain.
    ///
    /// Validates that both sites exist, are distinct, have spare valency and
    /// are not already bonded to each other. `None` arguments fall back to the
    /// configured defaults.
    pub fn create_bond(
        &mut self,
        scene: &mut dyn PhysicsScene,
        entity1: EntityId,
        site1: SiteId,
        entity2: EntityId,
        site2: SiteId,
        bond_type: Option<&str>,
        config: Option<BondConfig>,
    ) -> SimResult<BondId> {
        for (entity_id, site_id) in [(entity1, site1), (entity2, site2)] {
            let entity = self
                .entities
                .get(&entity_id)
                .ok_or(SimError::EntityNotFound(entity_id))?;
            if entity.site_def(site_id).is_none() {
                return Err(SimError::SiteNotFound {
                    entity: entity_id,
                    site: site_id,
                });
            }
            if !entity.can_bond_at(site_id) {
                return Err(SimError::SiteUnavailable {
                    entity: entity_id,
                    site: site_id,
                    reason: "valency exhausted",
                });
            }
        }
        if entity1 == entity2 && site1 == site2 {
            return Err(SimError::SiteUnavailable {
                entity: entity1,
                site: site1,
                reason: "cannot bond a site to itself",
            });
        }
        if self.sites_bonded(entity1, site1, entity2, site2) {
            return Err(SimError::SiteUnavailable {
                entity: entity1,
                site: site1,
                reason: "sites already bonded",
            });
        }

        let type_name = bond_type.unwrap_or(&self.config.default_bond_type).to_string();
        let config = config.unwrap_or_else(|| self.config.default_bond_config.clone());
        let bond_id = self.create_bond_internal(scene, entity1, site1, entity2, site2, &type_name, config)?;
        self.bonds_formed_this_frame += 1;
        Ok(bond_id)
    }

    /// Release the joint and remove the bond from both endpoints.
    pub fn break_bond(&mut self, scene: &mut dyn PhysicsScene, bond_id: BondId) -> SimResult<()> {
        let bond = self.detach_bond(scene, bond_id)?;
        debug!(bond = bond_id, "bond broken");
        self.bonds_broken_this_frame += 1;
        self.emit(BondEvent::Broken {
            bond,
            time: self.simulation_time,
            by_force: false,
        });
        Ok(())
    }

    /// Release every joint and clear all bonds. No events fire.
    pub fn release_all_bonds(&mut self, scene: &mut dyn PhysicsScene) {
        for bond in self.bonds.values() {
            if let Some(joint) = bond.joint {
                scene.release_joint(joint);
            }
        }
        for entity in self.entities.values_mut() {
            entity.clear_all_bonds();
        }
        self.bonds.clear();
        self.bond_configs.clear();
    }

    /// Release all bonds and remove every entity and its actor. No events fire.
    pub fn release_all(&mut self, scene: &mut dyn PhysicsScene) {
        self.release_all_bonds(scene);
        for entity in self.entities.values() {
            scene.remove_actor(entity.actor());
        }
        self.entities.clear();
        self.spatial_hash.clear();
    }

    fn sites_bonded(&self, entity1: EntityId, site1: SiteId, entity2: EntityId, site2: SiteId) -> bool {
        let (Some(e1), Some(e2)) = (self.entities.get(&entity1), self.entities.get(&entity2)) else {
            return false;
        };
        e1.bonds_at(site1).any(|b| e2.has_bond_at(site2, b))
    }

    /// Take a bond out of the map and both endpoints, releasing its joint.
    fn detach_bond(&mut self, scene: &mut dyn PhysicsScene, bond_id: BondId) -> SimResult<Bond> {
        let mut bond = self.bonds.remove(&bond_id).ok_or(SimError::BondNotFound(bond_id))?;
        self.bond_configs.remove(&bond_id);
        if let Some(joint) = bond.joint.take() {
            scene.release_joint(joint);
        }
        for ep in [bond.endpoint1, bond.endpoint2] {
            if let Some(entity) = self.entities.get_mut(&ep.entity_id) {
                entity.remove_bond(ep.site_id, bond_id);
            }
        }
        Ok(bond)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_bond_internal(
        &mut self,
        scene: &mut dyn PhysicsScene,
        entity1: EntityId,
        site1: SiteId,
        entity2: EntityId,
        site2: SiteId,
        type_name: &str,
        config: BondConfig,
    ) -> SimResult<BondId> {
        let bond_type = match self.bond_types.get(type_name) {
            Some(t) => t,
            None => {
                warn!(bond_type = type_name, "unknown bond type, using default");
                self.bond_types
                    .get(&self.config.default_bond_type)
                    .ok_or_else(|| SimError::UnknownBondType(type_name.to_string()))?
            }
        };

        let e1 = self.entities.get(&entity1).ok_or(SimError::EntityNotFound(entity1))?;
        let e2 = self.entities.get(&entity2).ok_or(SimError::EntityNotFound(entity2))?;
        let frame = |entity: &BondableEntity, site: SiteId| {
            entity
                .site_def(site)
                .map(|s| Pose::from_position(s.local_position))
                .ok_or(SimError::SiteNotFound {
                    entity: entity.entity_id(),
                    site,
                })
        };
        let attachment = JointAttachment {
            actor1: e1.actor(),
            frame1: frame(e1, site1)?,
            actor2: e2.actor(),
            frame2: frame(e2, site2)?,
        };

        let mut bond = Bond {
            bond_id: 0,
            endpoint1: BondEndpoint::new(entity1, site1),
            endpoint2: BondEndpoint::new(entity2, site2),
            bond_type: bond_type.name().to_string(),
            joint: None,
            formation_time: self.simulation_time,
            pending_removal: false,
        };
        let Some(joint) = bond_type.create_joint(scene, attachment, &bond, &config) else {
            warn!(entity1, site1, entity2, site2, bond_type = bond.bond_type.as_str(), "joint creation failed");
            return Err(SimError::JointCreationFailed(bond.bond_type));
        };

        let bond_id = self.bond_ids.next_id();
        bond.bond_id = bond_id;
        bond.joint = Some(joint);

        let recorded1 = self
            .entities
            .get_mut(&entity1)
            .map_or(false, |e| e.record_bond(site1, bond_id));
        let recorded2 = recorded1
            && self
                .entities
                .get_mut(&entity2)
                .map_or(false, |e| e.record_bond(site2, bond_id));
        if !recorded2 {
            if recorded1 {
                if let Some(e) = self.entities.get_mut(&entity1) {
                    e.remove_bond(site1, bond_id);
                }
            }
            scene.release_joint(joint);
            return Err(SimError::SiteUnavailable {
                entity: if recorded1 { entity2 } else { entity1 },
                site: if recorded1 { site2 } else { site1 },
                reason: "valency exhausted",
            });
        }

        debug!(bond = bond_id, entity1, site1, entity2, site2, "bond formed");
        self.bonds.insert(bond_id, bond.clone());
        self.bond_configs.insert(bond_id, config);
        self.emit(BondEvent::Formed {
            bond,
            time: self.simulation_time,
        });
        Ok(bond_id)
    }

    // --- Rules -------------------------------------------------------------

    /// Add a rule, keeping descending priority order.
    pub fn add_rule(&mut self, rule: Box<dyn BondFormationRule>) {
        insert_by_priority(&mut self.rules, rule);
    }

    /// Replace the rule chain.
    pub fn set_rules(&mut self, rules: Vec<Box<dyn BondFormationRule>>) {
        self.rules.clear();
        for rule in rules {
            self.add_rule(rule);
        }
    }

    /// Remove every rule with the given name. Returns whether any was removed.
    pub fn remove_rule(&mut self, name: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.name() != name);
        self.rules.len() != before
    }

    pub fn clear_rules(&mut self) {
        self.rules.clear();
    }

    pub fn rules(&self) -> &[Box<dyn BondFormationRule>] {
        &self.rules
    }

    /// Score a candidate with the installed rule chain.
    pub fn evaluate_rules(
        &self,
        scene: &dyn PhysicsScene,
        e1: &BondableEntity,
        s1: SiteId,
        e2: &BondableEntity,
        s2: SiteId,
    ) -> f32 {
        evaluate_chain(&self.rules, scene, e1, s1, e2, s2, Some(self.config.soft_violation_factor))
    }

    // --- Bond types --------------------------------------------------------

    /// Register a bond type under its name, replacing any previous one.
    pub fn register_bond_type(&mut self, bond_type: Box<dyn BondType>) {
        self.bond_types.insert(bond_type.name().to_string(), bond_type);
    }

    pub fn bond_type(&self, name: &str) -> Option<&dyn BondType> {
        self.bond_types.get(name).map(|t| t.as_ref())
    }

    pub fn bond_type_names(&self) -> Vec<&str> {
        self.bond_types.keys().map(|k| k.as_str()).collect()
    }

    /// Ignored with a warning if no such type is registered.
    pub fn set_default_bond_type(&mut self, name: &str) {
        if self.bond_types.contains_key(name) {
            self.config.default_bond_type = name.to_string();
        } else {
            warn!(bond_type = name, "cannot set unknown bond type as default");
        }
    }

    pub fn set_default_bond_config(&mut self, config: BondConfig) {
        self.config.default_bond_config = config;
    }

    // --- Events ------------------------------------------------------------

    /// Register an observer called for every event as it happens.
    pub fn on_event(&mut self, observer: impl FnMut(&BondEvent) + Send + Sync + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Take all queued events, oldest first.
    pub fn drain_events(&mut self) -> Vec<BondEvent> {
        std::mem::take(&mut self.events)
    }

    fn emit(&mut self, event: BondEvent) {
        for observer in self.observers.iter_mut() {
            observer(&event);
        }
        self.events.push(event);
    }

    // --- Tick --------------------------------------------------------------

    /// Advance manager time by `dt`: sweep broken bonds every call and run a
    /// candidate search and commit once per check interval.
    pub fn update(&mut self, scene: &mut dyn PhysicsScene, dt: f32) {
        self.bonds_formed_this_frame = 0;
        self.bonds_broken_this_frame = 0;
        self.simulation_time += dt;
        self.time_since_check += dt;

        self.start_phase(TickPhase::BrokenSweep);
        self.sweep_broken_bonds(scene);
        self.stop_phase();

        let mut scored = 0;
        if self.time_since_check >= self.config.proximity_check_interval {
            self.time_since_check = 0.0;
            let candidates = self.find_candidates(scene);
            scored = candidates.len();
            self.start_phase(TickPhase::Commit);
            self.commit_candidates(scene, &candidates);
            self.stop_phase();
        }

        if let Some(profiler) = self.profiler.as_mut() {
            profiler.finish_tick(scored);
        }
    }

    /// Remove bonds whose joint no longer links two live actors.
    fn sweep_broken_bonds(&mut self, scene: &mut dyn PhysicsScene) {
        let broken: Vec<BondId> = self
            .bonds
            .iter()
            .filter(|(_, b)| !b.is_valid(&*scene))
            .map(|(&id, _)| id)
            .collect();
        for bond_id in broken {
            if let Ok(bond) = self.detach_bond(scene, bond_id) {
                debug!(bond = bond_id, "bond severed by engine");
                self.bonds_broken_this_frame += 1;
                self.emit(BondEvent::Broken {
                    bond,
                    time: self.simulation_time,
                    by_force: true,
                });
            }
        }
    }

    /// Rebuild the site hash and return positively scored candidates,
    /// best first with ties ordered by `(entity1, site1, entity2, site2)`.
    pub fn find_candidates(&mut self, scene: &dyn PhysicsScene) -> Vec<BondCandidate> {
        let use_hash = self.config.enable_spatial_hashing;
        if use_hash {
            self.start_phase(TickPhase::SpatialHash);
            self.rebuild_spatial_hash(scene);
            self.stop_phase();
        }

        self.start_phase(TickPhase::CandidateSearch);
        let mut candidates = if use_hash {
            self.hashed_candidates(scene)
        } else {
            self.brute_force_candidates(scene)
        };
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.key().cmp(&b.key())));
        self.stop_phase();

        debug!(count = candidates.len(), time = self.simulation_time, "candidates found");
        candidates
    }

    fn rebuild_spatial_hash(&mut self, scene: &dyn PhysicsScene) {
        self.spatial_hash.clear();
        for (&id, entity) in &self.entities {
            for site in entity.available_sites() {
                if let Some(p) = entity.site_world_position(scene, site) {
                    self.spatial_hash.insert(id, site, p);
                }
            }
        }
    }

    fn score(&self, scene: &dyn PhysicsScene, e1: &BondableEntity, s1: SiteId, e2: &BondableEntity, s2: SiteId) -> Option<BondCandidate> {
        let score = self.evaluate_rules(scene, e1, s1, e2, s2);
        (score > 0.0).then_some(BondCandidate {
            entity1: e1.entity_id(),
            site1: s1,
            entity2: e2.entity_id(),
            site2: s2,
            score,
        })
    }

    fn hashed_candidates(&self, scene: &dyn PhysicsScene) -> Vec<BondCandidate> {
        let mut candidates = Vec::new();
        for (&id1, e1) in &self.entities {
            for s1 in e1.available_sites() {
                let Some(p1) = e1.site_world_position(scene, s1) else {
                    continue;
                };
                for entry in self.spatial_hash.neighbors(p1) {
                    if (id1, s1) >= (entry.entity, entry.site) {
                        continue;
                    }
                    let Some(e2) = self.entities.get(&entry.entity) else {
                        continue;
                    };
                    candidates.extend(self.score(scene, e1, s1, e2, entry.site));
                }
            }
        }
        candidates
    }

    fn brute_force_candidates(&self, scene: &dyn PhysicsScene) -> Vec<BondCandidate> {
        let sites: Vec<(&BondableEntity, SiteId)> = self
            .entities
            .values()
            .flat_map(|e| e.available_sites().into_iter().map(move |s| (e, s)))
            .collect();
        let mut candidates = Vec::new();
        for (i, &(e1, s1)) in sites.iter().enumerate() {
            for &(e2, s2) in &sites[i + 1..] {
                candidates.extend(self.score(scene, e1, s1, e2, s2));
            }
        }
        candidates
    }

    /// Commit candidates in order, re-checking sites that earlier commits
    /// in the same pass may have filled.
    fn commit_candidates(&mut self, scene: &mut dyn PhysicsScene, candidates: &[BondCandidate]) {
        for c in candidates {
            if self.bonds_formed_this_frame >= self.config.max_bonds_per_frame {
                break;
            }
            let open = |id: EntityId, site: SiteId| self.entities.get(&id).map_or(false, |e| e.can_bond_at(site));
            if !open(c.entity1, c.site1) || !open(c.entity2, c.site2) {
                continue;
            }
            if self.sites_bonded(c.entity1, c.site1, c.entity2, c.site2) {
                continue;
            }
            let type_name = self.config.default_bond_type.clone();
            let config = self.config.default_bond_config.clone();
            if self
                .create_bond_internal(scene, c.entity1, c.site1, c.entity2, c.site2, &type_name, config)
                .is_ok()
            {
                self.bonds_formed_this_frame += 1;
            }
        }
    }

    // --- Stats -------------------------------------------------------------

    pub fn stats(&self) -> BondManagerStats {
        BondManagerStats {
            entity_count: self.entities.len(),
            bond_count: self.bonds.len(),
            available_site_count: self.entities.values().map(|e| e.available_sites().len()).sum(),
            saturated_entity_count: self.entities.values().filter(|e| e.is_fully_saturated()).count(),
            bonds_formed_this_frame: self.bonds_formed_this_frame,
            bonds_broken_this_frame: self.bonds_broken_this_frame,
            last_update_time: self.simulation_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bonding::rules::{molecular_rules, AlignmentMode, DirectionalAlignmentRule};
    use crate::physics::{JointKind, ReferenceScene};
    use glam::Vec3;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn manager() -> DynamicBondManager {
        let mut manager = DynamicBondManager::default();
        manager.set_rules(molecular_rules(2.0, 0.5));
        manager
    }

    fn dimer_at(x: f32) -> BondableEntityDef {
        BondableEntityDef::dimer(0.5, 0.0).at_position(Vec3::new(x, 0.0, 0.0))
    }

    /// Dimers along X, `spacing` apart; site 0 of each faces site 1 of the next.
    fn dimer_row(manager: &mut DynamicBondManager, scene: &mut ReferenceScene, count: usize, spacing: f32) -> Vec<EntityId> {
        (0..count)
            .map(|i| manager.register_entity(scene, dimer_at(i as f32 * spacing)).unwrap())
            .collect()
    }

    fn assert_consistent(manager: &DynamicBondManager) {
        for entity in manager.entities() {
            for site in entity.sites() {
                assert!(entity.bond_count_at(site.site_id) <= site.max_valency);
            }
            for bond_id in entity.all_bond_ids() {
                assert!(manager.bond(bond_id).is_some());
            }
        }
        for bond in manager.bonds() {
            for ep in [bond.endpoint1, bond.endpoint2] {
                assert!(manager.entity(ep.entity_id).unwrap().has_bond_at(ep.site_id, bond.bond_id));
            }
        }
    }

    #[test]
    fn test_defaults() {
        let manager = DynamicBondManager::default();
        assert_eq!(manager.rules().len(), 5);
        assert_eq!(manager.rules()[0].name(), "proximity");
        assert_eq!(
            manager.bond_type_names(),
            ["ball_socket", "compliant", "d6", "hinged", "prismatic", "rigid"]
        );
        assert_eq!(manager.config().effective_cell_size(), 5.0);
    }

    #[test]
    fn test_close_sites_bond_within_one_interval() {
        let mut scene = ReferenceScene::default();
        let mut manager = manager();
        let ids = dimer_row(&mut manager, &mut scene, 2, 2.0);

        manager.update(&mut scene, 0.1);

        assert_eq!(manager.bond_count(), 1);
        let bond = manager.bonds().next().unwrap();
        assert_eq!(bond.endpoint1, BondEndpoint::new(ids[0], 0));
        assert_eq!(bond.endpoint2, BondEndpoint::new(ids[1], 1));
        assert_eq!(bond.bond_type, "rigid");
        assert_eq!(manager.stats().bonds_formed_this_frame, 1);
        assert!(matches!(manager.drain_events()[..], [BondEvent::Formed { .. }]));
        assert!(manager.drain_events().is_empty());
    }

    #[test]
    fn test_distant_sites_never_bond() {
        let mut scene = ReferenceScene::default();
        let mut manager = manager();
        dimer_row(&mut manager, &mut scene, 2, 6.0);

        for _ in 0..20 {
            manager.update(&mut scene, 0.1);
        }
        assert_eq!(manager.bond_count(), 0);
        assert_eq!(manager.stats().available_site_count, 4);
    }

    #[test]
    fn test_search_waits_for_interval() {
        let mut scene = ReferenceScene::default();
        let mut manager = manager();
        dimer_row(&mut manager, &mut scene, 2, 2.0);

        manager.update(&mut scene, 0.05);
        assert_eq!(manager.bond_count(), 0);
        manager.update(&mut scene, 0.05);
        assert_eq!(manager.bond_count(), 1);
    }

    #[test]
    fn test_break_and_resaturate() {
        let mut scene = ReferenceScene::default();
        let mut manager = manager();
        let ids = dimer_row(&mut manager, &mut scene, 2, 2.0);
        manager.update(&mut scene, 0.1);
        let bond_id = manager.bonds().next().unwrap().bond_id;
        manager.drain_events();

        manager.break_bond(&mut scene, bond_id).unwrap();
        assert_eq!(manager.entity(ids[0]).unwrap().bond_count_at(0), 0);
        assert_eq!(manager.entity(ids[1]).unwrap().bond_count_at(1), 0);
        assert_eq!(scene.active_joint_count(), 0);
        assert!(matches!(
            manager.drain_events()[..],
            [BondEvent::Broken { by_force: false, .. }]
        ));
        assert!(matches!(manager.break_bond(&mut scene, bond_id), Err(SimError::BondNotFound(_))));

        // Move the old partner away and offer a new one at its place.
        let old = manager.entity(ids[1]).unwrap().actor();
        scene.set_actor_pose(old, Pose::from_position(Vec3::new(50.0, 0.0, 0.0)));
        let newcomer = manager.register_entity(&mut scene, dimer_at(2.0)).unwrap();

        manager.update(&mut scene, 0.1);
        assert_eq!(manager.bond_count(), 1);
        let bond = manager.bonds().next().unwrap();
        assert!(bond.involves_site(ids[0], 0));
        assert!(bond.involves_site(newcomer, 1));
        assert_consistent(&manager);
    }

    #[test]
    fn test_row_forms_chain_respecting_valency() {
        let mut scene = ReferenceScene::default();
        let mut manager = manager();
        dimer_row(&mut manager, &mut scene, 6, 2.0);

        manager.update(&mut scene, 0.1);
        assert_eq!(manager.bond_count(), 5);
        assert_consistent(&manager);

        let stats = manager.stats();
        assert_eq!(stats.available_site_count, 2);
        assert_eq!(stats.saturated_entity_count, 4);
    }

    #[test]
    fn test_max_bonds_per_frame_commits_in_key_order() {
        let mut scene = ReferenceScene::default();
        let mut manager = manager();
        let ids = dimer_row(&mut manager, &mut scene, 6, 2.0);
        let mut config = manager.config().clone();
        config.max_bonds_per_frame = 2;
        manager.set_config(config);

        manager.update(&mut scene, 0.1);
        let pairs: Vec<(EntityId, EntityId)> = manager
            .bonds()
            .map(|b| (b.endpoint1.entity_id, b.endpoint2.entity_id))
            .collect();
        assert_eq!(pairs, vec![(ids[0], ids[1]), (ids[1], ids[2])]);

        manager.update(&mut scene, 0.1);
        manager.update(&mut scene, 0.1);
        assert_eq!(manager.bond_count(), 5);
    }

    #[test]
    fn test_set_config_moves_proximity_gate() {
        let mut scene = ReferenceScene::default();
        let mut manager = DynamicBondManager::default();
        // Facing sites 3.5 apart; every other site pair is beyond 4.
        manager.register_entity(&mut scene, dimer_at(0.0)).unwrap();
        manager.register_entity(&mut scene, dimer_at(4.5)).unwrap();

        let mut config = manager.config().clone();
        config.capture_distance = 4.0;
        manager.set_config(config);
        assert!(manager.rules()[0].description().starts_with("Sites must be within 4.00"));

        manager.update(&mut scene, 0.1);
        assert_eq!(manager.bond_count(), 1);
    }

    #[test]
    fn test_hashing_matches_brute_force() {
        let positions = [0.0, 2.0, 4.1, 9.0, 10.5, 12.4, 30.0];
        let run = |hashing: bool| {
            let mut scene = ReferenceScene::default();
            let mut manager = manager();
            let mut config = manager.config().clone();
            config.enable_spatial_hashing = hashing;
            config.spatial_cell_size = 1.0;
            manager.set_config(config);
            for &x in &positions {
                manager.register_entity(&mut scene, dimer_at(x)).unwrap();
            }
            let candidates = manager.find_candidates(&scene);
            manager.update(&mut scene, 0.1);
            let bonds: BTreeSet<_> = manager.bonds().map(|b| (b.endpoint1, b.endpoint2)).collect();
            (candidates, bonds)
        };
        let (hashed, hashed_bonds) = run(true);
        let (brute, brute_bonds) = run(false);
        assert!(!hashed.is_empty());
        assert_eq!(hashed, brute);
        assert_eq!(hashed_bonds, brute_bonds);
    }

    #[test]
    fn test_hard_veto_blocks_bonding() {
        let mut scene = ReferenceScene::default();
        let mut manager = manager();
        dimer_row(&mut manager, &mut scene, 2, 2.0);
        manager.add_rule(Box::new(DirectionalAlignmentRule::new(AlignmentMode::Parallel, 0.1)));

        for _ in 0..5 {
            manager.update(&mut scene, 0.1);
        }
        assert_eq!(manager.bond_count(), 0);

        assert!(manager.remove_rule("directional_alignment"));
        manager.add_rule(Box::new(DirectionalAlignmentRule::new(AlignmentMode::Antiparallel, 0.5)));
        manager.update(&mut scene, 0.1);
        assert_eq!(manager.bond_count(), 1);
    }

    #[test]
    fn test_engine_break_is_swept() {
        let mut scene = ReferenceScene::default();
        let mut manager = manager();
        let ids = dimer_row(&mut manager, &mut scene, 2, 2.0);
        manager.update(&mut scene, 0.1);
        let joint = manager.bonds().next().unwrap().joint.unwrap();
        manager.drain_events();

        scene.break_joint(joint);
        manager.update(&mut scene, 0.05);

        assert_eq!(manager.bond_count(), 0);
        assert_eq!(manager.stats().bonds_broken_this_frame, 1);
        assert!(manager.entity(ids[0]).unwrap().can_bond_at(0));
        assert!(matches!(
            manager.drain_events()[..],
            [BondEvent::Broken { by_force: true, .. }]
        ));
    }

    #[test]
    fn test_unregister_breaks_bonds() {
        let mut scene = ReferenceScene::default();
        let mut manager = manager();
        let ids = dimer_row(&mut manager, &mut scene, 3, 2.0);
        manager.update(&mut scene, 0.1);
        assert_eq!(manager.bond_count(), 2);

        manager.unregister_entity(&mut scene, ids[1]).unwrap();
        assert_eq!(manager.bond_count(), 0);
        assert_eq!(manager.entity_ids(), vec![ids[0], ids[2]]);
        assert_eq!(scene.actor_count(), 2);
        assert_eq!(manager.stats().bonds_broken_this_frame, 2);
        assert!(matches!(
            manager.unregister_entity(&mut scene, ids[1]),
            Err(SimError::EntityNotFound(_))
        ));
        assert_consistent(&manager);
    }

    #[test]
    fn test_manual_bond_validation() {
        let mut scene = ReferenceScene::default();
        let mut manager = manager();
        let ids = dimer_row(&mut manager, &mut scene, 3, 10.0);

        let bond_id = manager
            .create_bond(&mut scene, ids[0], 0, ids[1], 1, Some("compliant"), None)
            .unwrap();
        assert_eq!(manager.bond(bond_id).unwrap().bond_type, "compliant");
        assert!(matches!(
            manager.joint_def(bond_id).unwrap().kind,
            JointKind::Distance { .. }
        ));

        assert!(matches!(
            manager.create_bond(&mut scene, ids[0], 0, ids[2], 1, None, None),
            Err(SimError::SiteUnavailable { .. })
        ));
        assert!(matches!(
            manager.create_bond(&mut scene, ids[0], 4, ids[2], 1, None, None),
            Err(SimError::SiteNotFound { .. })
        ));
        assert!(matches!(
            manager.create_bond(&mut scene, 99, 0, ids[2], 1, None, None),
            Err(SimError::EntityNotFound(99))
        ));
        assert_eq!(manager.bonds_for_entity(ids[1]).len(), 1);
    }

    #[test]
    fn test_unknown_type_falls_back_to_default() {
        let mut scene = ReferenceScene::default();
        let mut manager = manager();
        let ids = dimer_row(&mut manager, &mut scene, 2, 2.0);
        manager.set_default_bond_type("glue");
        assert_eq!(manager.config().default_bond_type, "rigid");

        let bond_id = manager
            .create_bond(&mut scene, ids[0], 0, ids[1], 1, Some("glue"), None)
            .unwrap();
        assert_eq!(manager.bond(bond_id).unwrap().bond_type, "rigid");
    }

    #[test]
    fn test_observers_see_every_event() {
        let mut scene = ReferenceScene::default();
        let mut manager = manager();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        manager.on_event(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let ids = dimer_row(&mut manager, &mut scene, 2, 2.0);

        manager.update(&mut scene, 0.1);
        manager.unregister_entity(&mut scene, ids[0]).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(manager.drain_events().len(), 2);
    }

    #[test]
    fn test_release_all_is_silent() {
        let mut scene = ReferenceScene::default();
        let mut manager = manager();
        dimer_row(&mut manager, &mut scene, 4, 2.0);
        manager.update(&mut scene, 0.1);
        manager.drain_events();

        manager.release_all_bonds(&mut scene);
        assert_eq!(manager.bond_count(), 0);
        assert_eq!(manager.stats().available_site_count, 8);

        manager.release_all(&mut scene);
        assert_eq!(manager.entity_count(), 0);
        assert_eq!(scene.actor_count(), 0);
        assert!(manager.drain_events().is_empty());
    }

    #[test]
    fn test_register_with_existing_actor() {
        let mut scene = ReferenceScene::default();
        let mut manager = DynamicBondManager::default();
        let def = dimer_at(0.0);
        let actor = scene.create_actor(&def.actor).unwrap();
        let id = manager.register_entity_with_actor(&scene, def.clone(), actor).unwrap();
        assert_eq!(id, 1);
        assert_eq!(manager.entity(id).unwrap().actor(), actor);
        assert!(matches!(
            manager.register_entity_with_actor(&scene, def, ActorHandle(999)),
            Err(SimError::ActorNotFound(_))
        ));
    }

    #[test]
    fn test_profiling_records_phases() {
        let mut scene = ReferenceScene::default();
        let mut manager = manager();
        manager.set_profiling(true);
        dimer_row(&mut manager, &mut scene, 2, 2.0);
        manager.update(&mut scene, 0.1);

        manager.update(&mut scene, 0.05);

        let profiler = manager.profiler().unwrap();
        assert_eq!(profiler.phase(TickPhase::BrokenSweep).runs, 2);
        for phase in [TickPhase::SpatialHash, TickPhase::CandidateSearch, TickPhase::Commit] {
            assert_eq!(profiler.phase(phase).runs, 1, "{}", phase.name());
        }
        assert_eq!(profiler.ticks(), 2);
        assert_eq!(profiler.candidates_scored(), 1);
        assert!(profiler.report().contains("2 ticks, 1 candidates scored"));

        manager.set_profiling(false);
        assert!(manager.profiler().is_none());
    }
}
