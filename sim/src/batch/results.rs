//! Per-replicate results, batch summaries and export.

use super::metrics::MetricValue;
use crate::error::SimResult;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Outcome of one replicate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub replicate_id: usize,
    pub seed: u64,
    /// Simulated seconds at termination
    pub total_time: f32,
    /// Name of the condition that ended the run
    pub termination_reason: String,
    pub success: bool,
    pub error_message: Option<String>,
    /// Final metric values in registration order
    pub final_metrics: Vec<(String, MetricValue)>,
    /// Recorded `(time, value)` samples per metric
    pub time_series: Vec<(String, Vec<(f32, MetricValue)>)>,
}

impl SimulationResult {
    pub fn metric(&self, name: &str) -> Option<&MetricValue> {
        self.final_metrics
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn series(&self, name: &str) -> Option<&[(f32, MetricValue)]> {
        self.time_series
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.as_slice())
    }

    fn to_json_value(&self) -> Value {
        let metrics: Map<String, Value> = self
            .final_metrics
            .iter()
            .map(|(name, value)| (name.clone(), json!(value)))
            .collect();
        let series: Map<String, Value> = self
            .time_series
            .iter()
            .map(|(name, samples)| {
                let pairs: Vec<Value> = samples.iter().map(|(t, v)| json!([t, v])).collect();
                (name.clone(), Value::Array(pairs))
            })
            .collect();

        let mut obj = Map::new();
        obj.insert("replicate_id".into(), json!(self.replicate_id));
        obj.insert("seed".into(), json!(self.seed));
        obj.insert("total_time".into(), json!(self.total_time));
        obj.insert("termination_reason".into(), json!(self.termination_reason));
        obj.insert("success".into(), json!(self.success));
        if let Some(message) = &self.error_message {
            obj.insert("error_message".into(), json!(message));
        }
        obj.insert("metrics".into(), Value::Object(metrics));
        obj.insert("time_series".into(), Value::Object(series));
        Value::Object(obj)
    }
}

// ============================================================================
// SUMMARY
// ============================================================================

/// Aggregate statistics over a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_replicates: usize,
    pub successful_replicates: usize,
    pub mean_time: f32,
    /// Population standard deviation
    pub std_dev_time: f32,
    pub min_time: f32,
    pub max_time: f32,
    /// Replicates per termination reason, over all replicates
    pub termination_reasons: BTreeMap<String, usize>,
    /// Mean of each numeric metric over successful replicates
    pub metric_means: BTreeMap<String, f64>,
}

impl BatchSummary {
    pub fn from_results(results: &[SimulationResult]) -> Self {
        let mut summary = BatchSummary {
            total_replicates: results.len(),
            ..Default::default()
        };

        for result in results {
            *summary
                .termination_reasons
                .entry(result.termination_reason.clone())
                .or_default() += 1;
        }

        let successful: Vec<&SimulationResult> = results.iter().filter(|r| r.success).collect();
        summary.successful_replicates = successful.len();
        if successful.is_empty() {
            return summary;
        }

        let n = successful.len() as f32;
        let times: Vec<f32> = successful.iter().map(|r| r.total_time).collect();
        summary.mean_time = times.iter().sum::<f32>() / n;
        summary.std_dev_time = (times
            .iter()
            .map(|t| (t - summary.mean_time) * (t - summary.mean_time))
            .sum::<f32>()
            / n)
            .sqrt();
        summary.min_time = times.iter().copied().fold(f32::INFINITY, f32::min);
        summary.max_time = times.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        for result in &successful {
            for (name, value) in &result.final_metrics {
                if let Some(v) = value.as_f64() {
                    let entry = sums.entry(name.clone()).or_default();
                    entry.0 += v;
                    entry.1 += 1;
                }
            }
        }
        summary.metric_means = sums
            .into_iter()
            .map(|(name, (sum, count))| (name, sum / count as f64))
            .collect();

        summary
    }

    pub fn to_json_pretty(&self) -> SimResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

// ============================================================================
// EXPORT
// ============================================================================

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// One row per replicate. Metric columns follow the first result.
pub fn write_csv<W: Write>(results: &[SimulationResult], mut out: W) -> SimResult<()> {
    let metric_names: Vec<&str> = results
        .first()
        .map(|r| r.final_metrics.iter().map(|(n, _)| n.as_str()).collect())
        .unwrap_or_default();

    let mut header = vec!["replicate_id", "seed", "total_time", "termination_reason", "success"];
    header.extend(metric_names.iter().copied());
    writeln!(out, "{}", header.iter().map(|h| csv_field(h)).collect::<Vec<_>>().join(","))?;

    for result in results {
        let mut row = vec![
            result.replicate_id.to_string(),
            result.seed.to_string(),
            result.total_time.to_string(),
            csv_field(&result.termination_reason),
            result.success.to_string(),
        ];
        for name in &metric_names {
            row.push(
                result
                    .metric(name)
                    .map(|v| csv_field(&v.to_string()))
                    .unwrap_or_default(),
            );
        }
        writeln!(out, "{}", row.join(","))?;
    }
    out.flush()?;
    Ok(())
}

/// `{"results": [...]}` with metrics and time series nested per replicate.
pub fn write_json<W: Write>(results: &[SimulationResult], mut out: W) -> SimResult<()> {
    let doc = json!({
        "results": results.iter().map(SimulationResult::to_json_value).collect::<Vec<_>>(),
    });
    serde_json::to_writer_pretty(&mut out, &doc)?;
    out.flush()?;
    Ok(())
}

pub fn write_csv_file(results: &[SimulationResult], path: impl AsRef<Path>) -> SimResult<()> {
    write_csv(results, BufWriter::new(File::create(path)?))
}

pub fn write_json_file(results: &[SimulationResult], path: impl AsRef<Path>) -> SimResult<()> {
    write_json(results, BufWriter::new(File::create(path)?))
}
