//! Batch experiment over the demo bonding scenes.
//!
//! Run with: cargo run --example batch_demo

use bondsim::batch::{RingFormationCondition, RingFormationMetric, ClusterSizeMetric};
use bondsim::physics::{ReferenceEngine, ReferenceSceneConfig};
use bondsim::scenes::{chain_scene, ring_scene, standard_runner};
use bondsim::{BatchSimulationRunner, SimResult};
use std::sync::Arc;

fn main() -> SimResult<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    println!("=== Bondsim - Batch Demo ===\n");
    let engine = Arc::new(ReferenceEngine::new(ReferenceSceneConfig::with_ground()));

    // Ring formation: stop when a 4-ring closes
    println!("--- Ring formation (target size 4) ---\n");
    let mut runner = standard_runner(engine.clone(), 5, 20.0);
    runner.add_metric(Box::new(RingFormationMetric::new(4)));
    runner.add_termination_condition(Box::new(RingFormationCondition::new(4)));
    runner.set_scene_factory(ring_scene(4));
    runner.set_progress_callback(|done, total| println!("  replicate {}/{} done", done, total));
    runner.run_batch()?;
    print_summary(&runner)?;

    // Chain growth with cluster statistics
    println!("\n--- Chain formation ---\n");
    let mut runner = standard_runner(engine, 5, 10.0);
    runner.add_metric(Box::new(ClusterSizeMetric::new()));
    runner.set_scene_factory(chain_scene);
    runner.run_batch()?;
    print_summary(&runner)?;

    println!("\n=== Chain results (CSV) ===\n");
    runner.export_csv(std::io::stdout())?;
    Ok(())
}

fn print_summary(runner: &BatchSimulationRunner) -> SimResult<()> {
    let summary = runner.calculate_summary();
    println!("\n  Total replicates: {}", summary.total_replicates);
    println!("  Successful: {}", summary.successful_replicates);
    println!("  Mean time: {:.2} +/- {:.2} s", summary.mean_time, summary.std_dev_time);
    println!("  Time range: [{:.2}, {:.2}] s", summary.min_time, summary.max_time);
    println!("  Termination reasons:");
    for (reason, count) in &summary.termination_reasons {
        println!("    {}: {}", reason, count);
    }
    println!("\n{}", summary.to_json_pretty()?);
    Ok(())
}
