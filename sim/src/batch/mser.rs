//! MSER steady-state detection.
//!
//! Marginal Standard Error Rule: for a series of `n` samples, pick the
//! truncation point `d` minimising `var(samples[d..]) / (n - d)`. The
//! retained tail is treated as steady state once its coefficient of
//! variation drops below a threshold.

use super::conditions::TerminationCondition;
use super::metrics::{KineticEnergyMetric, Metric, SimContext};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MserConfig {
    /// Samples collected before the first convergence check
    pub min_samples: usize,
    /// Samples between convergence checks
    pub check_interval: usize,
    /// Coefficient of variation below which the tail counts as converged
    pub convergence_threshold: f64,
    /// Seconds the converged state must persist
    pub hold_time: f32,
}

impl Default for MserConfig {
    fn default() -> Self {
        Self {
            min_samples: 100,
            check_interval: 10,
            convergence_threshold: 0.01,
            hold_time: 1.0,
        }
    }
}

/// Terminates once an owned metric's series has converged for `hold_time`.
pub struct MserSteadyStateCondition {
    metric: Box<dyn Metric>,
    config: MserConfig,
    samples: Vec<f64>,
    truncation_point: usize,
    reached_steady_state: bool,
    steady_state_mean: f64,
    time_in_steady_state: f32,
    last_time: f32,
}

impl MserSteadyStateCondition {
    pub fn new(metric: Box<dyn Metric>, config: MserConfig) -> Self {
        Self {
            metric,
            config,
            samples: Vec::new(),
            truncation_point: 0,
            reached_steady_state: false,
            steady_state_mean: 0.0,
            time_in_steady_state: 0.0,
            last_time: 0.0,
        }
    }

    /// MSER over total kinetic energy.
    pub fn kinetic_energy(config: MserConfig) -> Self {
        Self::new(Box::new(KineticEnergyMetric::new(false)), config)
    }

    pub fn config(&self) -> &MserConfig {
        &self.config
    }

    pub fn truncation_point(&self) -> usize {
        self.truncation_point
    }

    pub fn has_reached_steady_state(&self) -> bool {
        self.reached_steady_state
    }

    pub fn steady_state_mean(&self) -> f64 {
        self.steady_state_mean
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Feed one sample taken at `time`; returns true once converged for the
    /// configured hold time.
    pub fn observe(&mut self, value: f64, time: f32) -> bool {
        self.samples.push(value);
        let dt = time - self.last_time;
        self.last_time = time;

        let n = self.samples.len();
        if n < self.config.min_samples {
            return false;
        }

        if n % self.config.check_interval.max(1) == 0 {
            if self.check_convergence() {
                self.time_in_steady_state += dt;
            } else {
                self.time_in_steady_state = 0.0;
            }
        } else if self.reached_steady_state {
            self.time_in_steady_state += dt;
        }

        self.time_in_steady_state >= self.config.hold_time
    }

    fn check_convergence(&mut self) -> bool {
        let d = mser_truncation(&self.samples);
        let tail = &self.samples[d..];
        let (mean, variance) = mean_variance(tail);

        self.truncation_point = d;
        self.steady_state_mean = mean;

        let std_dev = variance.sqrt();
        let cv = if mean.abs() > 1e-10 { std_dev / mean.abs() } else { std_dev };
        self.reached_steady_state = cv < self.config.convergence_threshold;
        self.reached_steady_state
    }
}

/// Truncation point minimising the marginal standard error, searched over
/// the first half of the series. Ties keep the earliest point.
pub fn mser_truncation(samples: &[f64]) -> usize {
    let n = samples.len();
    if n < 2 {
        return 0;
    }

    // Suffix sums from the back so each candidate costs O(1).
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut suffix = vec![(0.0, 0.0); n + 1];
    for i in (0..n).rev() {
        sum += samples[i];
        sum_sq += samples[i] * samples[i];
        suffix[i] = (sum, sum_sq);
    }

    let mut best = 0;
    let mut best_mser = f64::MAX;
    for d in 0..=n / 2 {
        let m = (n - d) as f64;
        let mser = if n - d < 2 {
            f64::MAX
        } else {
            let (s, sq) = suffix[d];
            let variance = ((sq - s * s / m) / (m - 1.0)).max(0.0);
            variance / m
        };
        if mser < best_mser {
            best_mser = mser;
            best = d;
        }
    }
    best
}

/// Mean and sample variance (n - 1 denominator).
fn mean_variance(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0);
    (mean, variance)
}

impl TerminationCondition for MserSteadyStateCondition {
    fn name(&self) -> &str {
        "mser_steady_state"
    }

    fn description(&self) -> String {
        format!(
            "Terminates when {} reaches MSER steady state (cv < {}) for {} seconds",
            self.metric.name(),
            self.config.convergence_threshold,
            self.config.hold_time
        )
    }

    fn should_terminate(&mut self, ctx: &SimContext<'_>, time: f32) -> bool {
        self.metric.update(ctx, time, time - self.last_time);
        match self.metric.value().as_f64() {
            Some(value) => self.observe(value, time),
            None => false,
        }
    }

    fn reset(&mut self) {
        self.metric.reset();
        self.samples.clear();
        self.truncation_point = 0;
        self.reached_steady_state = false;
        self.steady_state_mean = 0.0;
        self.time_in_steady_state = 0.0;
        self.last_time = 0.0;
    }

    fn box_clone(&self) -> Box<dyn TerminationCondition> {
        Box::new(Self::new(self.metric.box_clone(), self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_truncation_skips_transient() {
        let mut samples: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 20.0 } else { 0.0 }).collect();
        samples.extend(std::iter::repeat(10.0).take(70));
        let d = mser_truncation(&samples);
        assert!(d >= 29, "truncation {} inside transient", d);
        assert!(d <= 50);
    }

    #[test]
    fn test_settles_within_min_samples_plus_interval() {
        let config = MserConfig::default();
        let mut condition = MserSteadyStateCondition::kinetic_energy(config);
        let settle = 50;

        let mut stopped = None;
        for i in 0..400 {
            let value = if i < settle {
                10.0 + if i % 2 == 0 { 5.0 } else { -5.0 }
            } else {
                10.0
            };
            let time = (i + 1) as f32 * 0.1;
            condition.observe(value, time);
            if condition.has_reached_steady_state() && stopped.is_none() {
                stopped = Some(i + 1);
            }
        }

        let reached_at = stopped.expect("never converged");
        assert!(reached_at <= settle + config.min_samples + config.check_interval);
        assert!(condition.truncation_point() >= settle - 1);
        assert_relative_eq!(condition.steady_state_mean(), 10.0, epsilon = 1e-9);
        assert_eq!(condition.sample_count(), 400);
    }

    #[test]
    fn test_hold_time_gates_termination() {
        let config = MserConfig {
            min_samples: 20,
            check_interval: 5,
            hold_time: 0.45,
            ..Default::default()
        };
        let mut condition = MserSteadyStateCondition::kinetic_energy(config);
        let mut fired = None;
        for i in 0..100 {
            if condition.observe(3.0, (i + 1) as f32 * 0.1) {
                fired = Some(i + 1);
                break;
            }
        }
        // Converged at sample 20, then four more 0.1 s samples.
        assert_eq!(fired, Some(24));
    }

    #[test]
    fn test_noisy_series_never_converges() {
        let mut condition = MserSteadyStateCondition::kinetic_energy(MserConfig::default());
        for i in 0..300 {
            let value = if i % 2 == 0 { 0.0 } else { 10.0 };
            assert!(!condition.observe(value, (i + 1) as f32 * 0.1));
        }
        assert!(!condition.has_reached_steady_state());
    }

    #[test]
    fn test_reset_clears_samples() {
        let mut condition = MserSteadyStateCondition::kinetic_energy(MserConfig::default());
        for i in 0..10 {
            condition.observe(1.0, i as f32);
        }
        condition.reset();
        assert_eq!(condition.sample_count(), 0);
        assert_eq!(condition.truncation_point(), 0);
    }
}
