//! Demo scenes and a standard batch preset.
//!
//! Every scene function has the [`SceneFactory`](crate::batch::SceneFactory)
//! signature and draws all randomness from the replicate seed. The scenes
//! place entities above y = 0 and are meant for an engine built with
//! [`ReferenceSceneConfig::with_ground`](crate::physics::ReferenceSceneConfig::with_ground).

use crate::batch::{
    AvailableSiteCountMetric, BatchConfig, BatchSimulationRunner, BondCountMetric, EntityCountMetric,
    KineticEnergyMetric, SteadyStateCondition,
};
use crate::bonding::{
    molecular_rules, ring_formation_rules, AlignmentMode, BondFormationRule, BondableEntityDef,
    DirectionalAlignmentRule, DynamicBondManager, NoDuplicateBondRule, NoSelfBondingRule, ProximityRule,
    ValencyRule,
};
use crate::error::SimResult;
use crate::physics::{PhysicsEngine, PhysicsScene};
use glam::{Quat, Vec3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use std::f32::consts::{PI, TAU};
use std::sync::Arc;
use tracing::debug;

pub const MOLECULAR_PARTICLES: usize = 20;
pub const CHAIN_MONOMERS: usize = 30;

fn setup_manager(
    manager: &mut DynamicBondManager,
    capture_distance: f32,
    rules: Vec<Box<dyn BondFormationRule>>,
    bond_type: &str,
) {
    let mut config = manager.config().clone();
    config.capture_distance = capture_distance;
    manager.set_config(config);
    manager.set_rules(rules);
    manager.set_default_bond_type(bond_type);
}

/// Twenty dimers drifting in a loose layer, joined by compliant bonds when
/// their sites face each other.
pub fn molecular_scene(
    _engine: &dyn PhysicsEngine,
    scene: &mut dyn PhysicsScene,
    manager: &mut DynamicBondManager,
    seed: u64,
) -> SimResult<()> {
    let mut rng = ChaCha12Rng::seed_from_u64(seed);
    setup_manager(manager, 2.0, molecular_rules(2.0, 0.5), "compliant");

    for _ in 0..MOLECULAR_PARTICLES {
        let mut def = BondableEntityDef::dimer(0.5, 0.0);
        def.entity_type = "monomer".into();
        def.actor.pose.position = Vec3::new(
            rng.gen_range(-10.0..10.0),
            5.0 + rng.gen_range(-10.0..10.0) * 0.3,
            rng.gen_range(-10.0..10.0),
        );
        def.actor.linear_velocity = Vec3::new(rng.gen_range(-2.0..2.0), 0.0, rng.gen_range(-2.0..2.0));
        manager.register_entity(scene, def)?;
    }

    debug!(particles = MOLECULAR_PARTICLES, seed, "molecular scene created");
    Ok(())
}

/// `3 × target_size` dimers in a plane whose bond-angle rule favours closed
/// rings of `target_size` members.
pub fn ring_scene(
    target_size: usize,
) -> impl Fn(&dyn PhysicsEngine, &mut dyn PhysicsScene, &mut DynamicBondManager, u64) -> SimResult<()>
       + Send
       + Sync
       + 'static {
    move |_engine, scene, manager, seed| {
        let mut rng = ChaCha12Rng::seed_from_u64(seed);
        let n = target_size.max(3);
        let target_angle = PI * (1.0 - 2.0 / n as f32);
        setup_manager(manager, 0.8, ring_formation_rules(0.8, target_angle, 0.1), "compliant");

        let count = n * 3;
        for _ in 0..count {
            let mut def = BondableEntityDef::dimer(0.4, 0.0);
            def.entity_type = "ring_monomer".into();
            def.actor.pose.position = Vec3::new(rng.gen_range(-5.0..5.0), 5.0, rng.gen_range(-5.0..5.0));
            def.actor.pose.rotation = Quat::from_rotation_y(rng.gen_range(0.0..TAU));
            def.actor.material.restitution = 0.3;
            manager.register_entity(scene, def)?;
        }

        debug!(monomers = count, target_size = n, seed, "ring scene created");
        Ok(())
    }
}

/// Thirty small dimers stacked in five layers, forming rigid linear chains.
pub fn chain_scene(
    _engine: &dyn PhysicsEngine,
    scene: &mut dyn PhysicsScene,
    manager: &mut DynamicBondManager,
    seed: u64,
) -> SimResult<()> {
    let mut rng = ChaCha12Rng::seed_from_u64(seed);
    let rules: Vec<Box<dyn BondFormationRule>> = vec![
        Box::new(NoSelfBondingRule),
        Box::new(NoDuplicateBondRule),
        Box::new(ValencyRule),
        Box::new(ProximityRule::new(1.5, 0.0)),
        Box::new(DirectionalAlignmentRule::new(AlignmentMode::Antiparallel, 0.8)),
    ];
    setup_manager(manager, 1.5, rules, "rigid");

    for i in 0..CHAIN_MONOMERS {
        let mut def = BondableEntityDef::dimer(0.3, 0.0);
        def.entity_type = "chain_monomer".into();
        def.actor.pose.position = Vec3::new(
            rng.gen_range(-8.0..8.0),
            3.0 + (i % 5) as f32,
            rng.gen_range(-8.0..8.0),
        );
        manager.register_entity(scene, def)?;
    }

    debug!(monomers = CHAIN_MONOMERS, seed, "chain scene created");
    Ok(())
}

/// Runner with the usual observables: bond count and kinetic energy (both
/// recorded over time), entity and available-site counts, the config
/// timeout and a kinetic-energy steady-state stop.
pub fn standard_runner(engine: Arc<dyn PhysicsEngine>, num_replicates: usize, max_time: f32) -> BatchSimulationRunner {
    let config = BatchConfig {
        num_replicates,
        max_simulation_time: max_time,
        ..Default::default()
    };
    let mut runner = BatchSimulationRunner::with_config(engine, config);
    runner.add_metric(Box::new(BondCountMetric::new(true)));
    runner.add_metric(Box::new(KineticEnergyMetric::new(true)));
    runner.add_metric(Box::new(EntityCountMetric::default()));
    runner.add_metric(Box::new(AvailableSiteCountMetric::default()));
    runner.add_termination_condition(Box::new(SteadyStateCondition::new(0.1, 2.0)));
    runner
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::{ReferenceEngine, ReferenceSceneConfig};

    fn populate(
        factory: impl Fn(&dyn PhysicsEngine, &mut dyn PhysicsScene, &mut DynamicBondManager, u64) -> SimResult<()>,
        seed: u64,
    ) -> (Box<dyn PhysicsScene>, DynamicBondManager) {
        let engine = ReferenceEngine::new(ReferenceSceneConfig::with_ground());
        let mut scene = engine.create_scene().unwrap();
        let mut manager = DynamicBondManager::default();
        factory(&engine, scene.as_mut(), &mut manager, seed).unwrap();
        (scene, manager)
    }

    fn positions(scene: &dyn PhysicsScene) -> Vec<Vec3> {
        scene
            .dynamic_actors()
            .into_iter()
            .filter_map(|a| scene.actor_pose(a))
            .map(|p| p.position)
            .collect()
    }

    #[test]
    fn test_molecular_scene_setup() {
        let (scene, manager) = populate(molecular_scene, 42);
        assert_eq!(manager.entity_count(), MOLECULAR_PARTICLES);
        assert_eq!(manager.config().default_bond_type, "compliant");
        assert_eq!(manager.rules().len(), 6);
        for p in positions(scene.as_ref()) {
            assert!(p.x >= -10.0 && p.x < 10.0);
            assert!(p.y >= 2.0 && p.y <= 8.0);
        }
    }

    #[test]
    fn test_scenes_are_seeded() {
        let (a, _) = populate(molecular_scene, 7);
        let (b, _) = populate(molecular_scene, 7);
        let (c, _) = populate(molecular_scene, 8);
        assert_eq!(positions(a.as_ref()), positions(b.as_ref()));
        assert_ne!(positions(a.as_ref()), positions(c.as_ref()));
    }

    #[test]
    fn test_ring_scene_setup() {
        let (scene, manager) = populate(ring_scene(4), 1);
        assert_eq!(manager.entity_count(), 12);
        assert_eq!(manager.config().capture_distance, 0.8);
        assert!(manager.rules().iter().any(|r| r.name() == "coplanarity"));
        assert!(positions(scene.as_ref()).iter().all(|p| p.y == 5.0));
    }

    #[test]
    fn test_chain_scene_setup() {
        let (scene, manager) = populate(chain_scene, 3);
        assert_eq!(manager.entity_count(), CHAIN_MONOMERS);
        assert_eq!(manager.config().default_bond_type, "rigid");
        assert_eq!(manager.config().effective_cell_size(), 5.0);
        let heights: Vec<f32> = positions(scene.as_ref()).iter().map(|p| p.y).collect();
        assert_eq!(&heights[..5], &[3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_standard_runner_over_chain_scene() {
        let engine = Arc::new(ReferenceEngine::new(ReferenceSceneConfig::with_ground()));
        let mut runner = standard_runner(engine, 2, 0.5);
        assert_eq!(runner.metrics().len(), 4);
        assert_eq!(runner.termination_conditions().len(), 2);

        runner.set_scene_factory(chain_scene);
        let results = runner.run_batch().unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(
            results[0].metric("entity_count").and_then(|v| v.as_f64()),
            Some(CHAIN_MONOMERS as f64)
        );
    }
}
