//! Batch runner: many seeded replicates of one experiment.
//!
//! ## Replicate loop
//!
//! Each replicate gets a fresh scene from the engine, a fresh bond manager,
//! and clones of the registered metrics and termination conditions. The
//! scene factory populates it from the replicate seed (`base_seed + index`).
//! The state then lives in an ECS `World` as resources and one tick is a
//! chained schedule:
//!
//! physics step → bond update → clock advance → metrics → termination
//!
//! The loop stops at the first condition that fires (in registration order),
//! at the `max_simulation_time` safety cap, or on cancellation.
//!
//! ## Failures
//!
//! Errors and panics inside a replicate are caught and recorded as
//! `success = false`; the batch moves on to the next replicate.

use super::conditions::{TerminationCondition, TimeoutCondition};
use super::metrics::{Metric, SimContext};
use super::results::{write_csv, write_csv_file, write_json, write_json_file, BatchSummary, SimulationResult};
use crate::bonding::{DynamicBondManager, DynamicBondManagerConfig};
use crate::error::{SimError, SimResult};
use crate::physics::{PhysicsEngine, PhysicsScene};
use bevy_ecs::prelude::*;
use bevy_ecs::schedule::ExecutorKind;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Reason recorded when the safety cap ends a replicate.
pub const MAX_TIME_REACHED: &str = "max_time_reached";
/// Reason recorded for a replicate stopped by [`BatchSimulationRunner::cancel`].
pub const CANCELLED: &str = "cancelled";
/// Reason recorded for a replicate that errored or panicked.
pub const FAILED: &str = "error";

/// Populates a fresh replicate: `(engine, scene, manager, seed)`.
pub type SceneFactory = Arc<
    dyn Fn(&dyn PhysicsEngine, &mut dyn PhysicsScene, &mut DynamicBondManager, u64) -> SimResult<()>
        + Send
        + Sync,
>;

/// Called after each replicate with `(completed, total)`.
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub num_replicates: usize,
    pub base_seed: u64,
    pub timestep: f32,
    /// Hard cap on simulated seconds per replicate
    pub max_simulation_time: f32,
    /// Seconds between metric updates, 0 = every tick
    pub metric_update_interval: f32,
    /// Run replicates on the rayon pool (needs the `parallel` feature)
    pub parallel: bool,
    /// Configuration for each replicate's bond manager
    pub bond_manager: DynamicBondManagerConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            num_replicates: 10,
            base_seed: 42,
            timestep: 1.0 / 60.0,       // 60 Hz
            max_simulation_time: 60.0,
            metric_update_interval: 0.0,
            parallel: false,
            bond_manager: DynamicBondManagerConfig::default(),
        }
    }
}

impl BatchConfig {
    pub fn from_json_str(json: &str) -> SimResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_pretty(&self) -> SimResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

// ============================================================================
// REPLICATE RESOURCES AND SYSTEMS
// ============================================================================

#[derive(Resource)]
struct ReplicateScene(Box<dyn PhysicsScene>);

#[derive(Resource)]
struct ReplicateMetrics(Vec<Box<dyn Metric>>);

#[derive(Resource)]
struct ReplicateConditions(Vec<Box<dyn TerminationCondition>>);

#[derive(Resource, Debug, Clone)]
struct ReplicateClock {
    time: f32,
    dt: f32,
    max_time: f32,
    metric_interval: f32,
    since_metrics: f32,
    ticks: u64,
}

#[derive(Resource, Debug, Default)]
struct ReplicateOutcome {
    reason: Option<String>,
}

#[derive(Resource)]
struct CancelFlag(Arc<AtomicBool>);

fn physics_step_system(clock: Res<ReplicateClock>, mut scene: ResMut<ReplicateScene>) {
    scene.0.step(clock.dt);
}

fn bond_update_system(
    clock: Res<ReplicateClock>,
    mut scene: ResMut<ReplicateScene>,
    mut manager: ResMut<DynamicBondManager>,
) {
    manager.update(scene.0.as_mut(), clock.dt);
    let events = manager.drain_events();
    if !events.is_empty() {
        debug!(count = events.len(), time = clock.time, "bond events");
    }
}

fn clock_system(mut clock: ResMut<ReplicateClock>) {
    clock.time += clock.dt;
    clock.since_metrics += clock.dt;
    clock.ticks += 1;
}

fn metrics_system(
    mut clock: ResMut<ReplicateClock>,
    scene: Res<ReplicateScene>,
    manager: Res<DynamicBondManager>,
    mut metrics: ResMut<ReplicateMetrics>,
) {
    if clock.metric_interval > 0.0 && clock.since_metrics < clock.metric_interval {
        return;
    }
    sample_metrics(&mut clock, scene.0.as_ref(), &manager, &mut metrics.0);
}

/// Runs once after the loop so final values reflect the last tick even when
/// the interval had not elapsed yet.
fn final_metrics_system(
    mut clock: ResMut<ReplicateClock>,
    scene: Res<ReplicateScene>,
    manager: Res<DynamicBondManager>,
    mut metrics: ResMut<ReplicateMetrics>,
) {
    if clock.since_metrics <= 0.0 {
        return;
    }
    sample_metrics(&mut clock, scene.0.as_ref(), &manager, &mut metrics.0);
}

fn sample_metrics(
    clock: &mut ReplicateClock,
    scene: &dyn PhysicsScene,
    manager: &DynamicBondManager,
    metrics: &mut [Box<dyn Metric>],
) {
    let dt = clock.since_metrics;
    clock.since_metrics = 0.0;

    let ctx = SimContext { scene, manager };
    for metric in metrics.iter_mut() {
        metric.update(&ctx, clock.time, dt);
    }
}

fn termination_system(
    clock: Res<ReplicateClock>,
    scene: Res<ReplicateScene>,
    manager: Res<DynamicBondManager>,
    cancel: Res<CancelFlag>,
    mut conditions: ResMut<ReplicateConditions>,
    mut outcome: ResMut<ReplicateOutcome>,
) {
    if outcome.reason.is_some() {
        return;
    }
    if cancel.0.load(Ordering::Relaxed) {
        outcome.reason = Some(CANCELLED.to_string());
        return;
    }

    let ctx = SimContext {
        scene: scene.0.as_ref(),
        manager: &manager,
    };
    for condition in conditions.0.iter_mut() {
        if condition.should_terminate(&ctx, clock.time) {
            outcome.reason = Some(condition.name().to_string());
            return;
        }
    }

    if clock.time >= clock.max_time {
        outcome.reason = Some(MAX_TIME_REACHED.to_string());
    }
}

fn replicate_schedule() -> Schedule {
    let mut schedule = Schedule::default();
    schedule.set_executor_kind(ExecutorKind::SingleThreaded);
    schedule.add_systems(
        (
            physics_step_system,
            bond_update_system,
            clock_system,
            metrics_system,
            termination_system,
        )
            .chain(),
    );
    schedule
}

/// Everything a replicate reads from the runner. Shared across rayon workers.
struct ReplicateJob<'a> {
    engine: &'a dyn PhysicsEngine,
    config: &'a BatchConfig,
    metrics: &'a [Box<dyn Metric>],
    conditions: &'a [Box<dyn TerminationCondition>],
    factory: &'a SceneFactory,
    cancel: &'a Arc<AtomicBool>,
}

impl ReplicateJob<'_> {
    fn run(&self, replicate_id: usize, seed: u64) -> SimulationResult {
        info!(replicate_id, seed, "replicate started");

        let result = match panic::catch_unwind(AssertUnwindSafe(|| self.execute(replicate_id, seed))) {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => failed(replicate_id, seed, err.to_string()),
            Err(payload) => failed(
                replicate_id,
                seed,
                SimError::ReplicatePanic(panic_message(payload.as_ref())).to_string(),
            ),
        };

        if result.success {
            info!(
                replicate_id,
                total_time = result.total_time,
                reason = %result.termination_reason,
                "replicate finished"
            );
        } else if let Some(message) = &result.error_message {
            error!(replicate_id, seed, %message, "replicate failed");
        } else {
            info!(replicate_id, reason = %result.termination_reason, "replicate stopped");
        }
        result
    }

    fn execute(&self, replicate_id: usize, seed: u64) -> SimResult<SimulationResult> {
        let mut scene = self.engine.create_scene()?;
        let mut manager = DynamicBondManager::new(self.config.bond_manager.clone());
        (self.factory)(self.engine, scene.as_mut(), &mut manager, seed)?;

        let metrics: Vec<Box<dyn Metric>> = self
            .metrics
            .iter()
            .map(|m| {
                let mut m = m.box_clone();
                m.reset();
                m
            })
            .collect();
        let conditions: Vec<Box<dyn TerminationCondition>> = self
            .conditions
            .iter()
            .map(|c| {
                let mut c = c.box_clone();
                c.reset();
                c
            })
            .collect();

        let mut world = World::new();
        world.insert_resource(ReplicateScene(scene));
        world.insert_resource(manager);
        world.insert_resource(ReplicateMetrics(metrics));
        world.insert_resource(ReplicateConditions(conditions));
        world.insert_resource(ReplicateClock {
            time: 0.0,
            dt: self.config.timestep,
            max_time: self.config.max_simulation_time,
            metric_interval: self.config.metric_update_interval,
            since_metrics: 0.0,
            ticks: 0,
        });
        world.insert_resource(ReplicateOutcome::default());
        world.insert_resource(CancelFlag(Arc::clone(self.cancel)));

        let mut schedule = replicate_schedule();
        let reason = loop {
            schedule.run(&mut world);
            if let Some(reason) = world.resource::<ReplicateOutcome>().reason.clone() {
                break reason;
            }
        };
        let mut finish = Schedule::default();
        finish.set_executor_kind(ExecutorKind::SingleThreaded);
        finish.add_systems(final_metrics_system);
        finish.run(&mut world);

        let clock = world.resource::<ReplicateClock>();
        debug!(replicate_id, ticks = clock.ticks, "replicate loop done");
        let metrics = &world.resource::<ReplicateMetrics>().0;

        let cancelled = reason == CANCELLED;
        Ok(SimulationResult {
            replicate_id,
            seed,
            total_time: clock.time,
            termination_reason: reason,
            success: !cancelled,
            error_message: None,
            final_metrics: metrics
                .iter()
                .map(|m| (m.name().to_string(), m.value()))
                .collect(),
            time_series: metrics
                .iter()
                .map(|m| (m.name().to_string(), m.time_series()))
                .filter(|(_, series)| !series.is_empty())
                .collect(),
        })
    }
}

fn failed(replicate_id: usize, seed: u64, message: String) -> SimulationResult {
    SimulationResult {
        replicate_id,
        seed,
        termination_reason: FAILED.to_string(),
        success: false,
        error_message: Some(message),
        ..Default::default()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ============================================================================
// RUNNER
// ============================================================================

/// Cancels a running batch from another thread.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    cancel: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// Runs replicates of one experiment and aggregates the outcome.
pub struct BatchSimulationRunner {
    engine: Arc<dyn PhysicsEngine>,
    config: BatchConfig,
    metrics: Vec<Box<dyn Metric>>,
    conditions: Vec<Box<dyn TerminationCondition>>,
    /// `conditions[0]` is the timeout installed from the config
    has_default_timeout: bool,
    scene_factory: Option<SceneFactory>,
    progress: Option<ProgressCallback>,
    results: Vec<SimulationResult>,
    cancel: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl BatchSimulationRunner {
    pub fn new(engine: Arc<dyn PhysicsEngine>) -> Self {
        Self::with_config(engine, BatchConfig::default())
    }

    pub fn with_config(engine: Arc<dyn PhysicsEngine>, config: BatchConfig) -> Self {
        let timeout: Box<dyn TerminationCondition> = Box::new(TimeoutCondition::new(config.max_simulation_time));
        Self {
            engine,
            config,
            metrics: Vec::new(),
            conditions: vec![timeout],
            has_default_timeout: true,
            scene_factory: None,
            progress: None,
            results: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the configuration, keeping the default timeout in sync.
    pub fn configure(&mut self, config: BatchConfig) {
        if self.has_default_timeout {
            self.conditions[0] = Box::new(TimeoutCondition::new(config.max_simulation_time));
        }
        self.config = config;
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn add_metric(&mut self, metric: Box<dyn Metric>) {
        self.metrics.push(metric);
    }

    pub fn add_termination_condition(&mut self, condition: Box<dyn TerminationCondition>) {
        self.conditions.push(condition);
    }

    pub fn clear_metrics(&mut self) {
        self.metrics.clear();
    }

    /// Remove every condition, including the default timeout. The safety cap
    /// still applies.
    pub fn clear_termination_conditions(&mut self) {
        self.conditions.clear();
        self.has_default_timeout = false;
    }

    pub fn metrics(&self) -> &[Box<dyn Metric>] {
        &self.metrics
    }

    pub fn termination_conditions(&self) -> &[Box<dyn TerminationCondition>] {
        &self.conditions
    }

    pub fn set_scene_factory(
        &mut self,
        factory: impl Fn(&dyn PhysicsEngine, &mut dyn PhysicsScene, &mut DynamicBondManager, u64) -> SimResult<()>
            + Send
            + Sync
            + 'static,
    ) {
        self.scene_factory = Some(Arc::new(factory));
    }

    pub fn set_progress_callback(&mut self, callback: impl Fn(usize, usize) + Send + Sync + 'static) {
        self.progress = Some(Arc::new(callback));
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Handle for cancelling from another thread while `run_batch` holds
    /// the runner.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            cancel: Arc::clone(&self.cancel),
            running: Arc::clone(&self.running),
        }
    }

    pub fn results(&self) -> &[SimulationResult] {
        &self.results
    }

    /// Run every replicate. Stops early on cancellation; the results of
    /// replicates that ran are kept.
    pub fn run_batch(&mut self) -> SimResult<&[SimulationResult]> {
        let factory = self.scene_factory.clone().ok_or(SimError::MissingSceneFactory)?;

        self.cancel.store(false, Ordering::Relaxed);
        self.running.store(true, Ordering::Relaxed);
        self.results.clear();

        let total = self.config.num_replicates;
        info!(replicates = total, base_seed = self.config.base_seed, "batch started");

        let job = ReplicateJob {
            engine: self.engine.as_ref(),
            config: &self.config,
            metrics: &self.metrics,
            conditions: &self.conditions,
            factory: &factory,
            cancel: &self.cancel,
        };
        let base_seed = self.config.base_seed;
        let progress = self.progress.clone();
        let completed = AtomicUsize::new(0);
        let run_one = |i: usize| -> Option<SimulationResult> {
            if job.cancel.load(Ordering::Relaxed) {
                return None;
            }
            let result = job.run(i, base_seed.wrapping_add(i as u64));
            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(progress) = &progress {
                progress(done, total);
            }
            Some(result)
        };

        let results: Vec<SimulationResult> = if self.config.parallel {
            run_parallel(total, &run_one)
        } else {
            (0..total).map_while(&run_one).collect()
        };

        self.results = results;
        self.running.store(false, Ordering::Relaxed);

        let summary = self.calculate_summary();
        info!(
            completed = summary.total_replicates,
            successful = summary.successful_replicates,
            mean_time = summary.mean_time,
            "batch finished"
        );
        Ok(&self.results)
    }

    /// Run one replicate with an explicit seed.
    pub fn run_single(&mut self, replicate_id: usize, seed: u64) -> SimResult<SimulationResult> {
        let factory = self.scene_factory.clone().ok_or(SimError::MissingSceneFactory)?;
        self.cancel.store(false, Ordering::Relaxed);
        self.running.store(true, Ordering::Relaxed);

        let job = ReplicateJob {
            engine: self.engine.as_ref(),
            config: &self.config,
            metrics: &self.metrics,
            conditions: &self.conditions,
            factory: &factory,
            cancel: &self.cancel,
        };
        let result = job.run(replicate_id, seed);
        self.running.store(false, Ordering::Relaxed);
        Ok(result)
    }

    pub fn calculate_summary(&self) -> BatchSummary {
        BatchSummary::from_results(&self.results)
    }

    pub fn export_csv<W: Write>(&self, out: W) -> SimResult<()> {
        write_csv(&self.results, out)
    }

    pub fn export_json<W: Write>(&self, out: W) -> SimResult<()> {
        write_json(&self.results, out)
    }

    pub fn export_csv_to_file(&self, path: impl AsRef<Path>) -> SimResult<()> {
        write_csv_file(&self.results, path)
    }

    pub fn export_json_to_file(&self, path: impl AsRef<Path>) -> SimResult<()> {
        write_json_file(&self.results, path)
    }
}

#[cfg(feature = "parallel")]
fn run_parallel<F>(total: usize, run_one: &F) -> Vec<SimulationResult>
where
    F: Fn(usize) -> Option<SimulationResult> + Sync,
{
    use rayon::prelude::*;
    (0..total).into_par_iter().filter_map(run_one).collect()
}

#[cfg(not(feature = "parallel"))]
fn run_parallel<F>(total: usize, run_one: &F) -> Vec<SimulationResult>
where
    F: Fn(usize) -> Option<SimulationResult> + Sync,
{
    tracing::warn!("parallel replicates requested without the `parallel` feature; running sequentially");
    (0..total).map_while(run_one).collect()
}
