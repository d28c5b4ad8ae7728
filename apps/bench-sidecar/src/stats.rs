//! Per-channel statistics for finalized sessions.

use crate::ingest::Sample;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub const DEFAULT_Z_THRESHOLD: f64 = 2.0;
pub const DEFAULT_WARMUP_SECS: f64 = 1.0;
pub const DEFAULT_PASS_THRESHOLD_PERCENT: f64 = 50.0;

const MAD_TO_SIGMA: f64 = 1.4826;
const IQR_TO_SIGMA: f64 = 1.349;
const SCALE_EPSILON: f64 = 1e-9;

/// How the z-score of each sample is measured before outliers are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierMethod {
    /// Raw mean centre, population stddev scale.
    #[default]
    Classical,
    /// Median centre, MAD (then IQR, then population stddev) scale.
    Robust,
}

impl FromStr for OutlierMethod {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "robust" => Ok(OutlierMethod::Robust),
            "classical" | "stddev" => Ok(OutlierMethod::Classical),
            other => Err(format!("unknown outlier method '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateParams {
    pub baseline: Option<f64>,
    pub z_threshold: f64,
    pub min_elapsed: f64,
    pub method: OutlierMethod,
}

impl Default for AggregateParams {
    fn default() -> Self {
        Self {
            baseline: None,
            z_threshold: DEFAULT_Z_THRESHOLD,
            min_elapsed: DEFAULT_WARMUP_SECS,
            method: OutlierMethod::Classical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub mean: f64,
    /// Population stddev of the post-warm-up set, before rejection.
    pub stddev: f64,
    pub baseline_percentage: Option<f64>,
    pub used: usize,
    pub rejected: usize,
    pub insufficient_data: bool,
}

impl ChannelStats {
    fn insufficient(baseline: Option<f64>) -> Self {
        Self {
            mean: 0.0,
            stddev: 0.0,
            baseline_percentage: baseline.map(|_| 0.0),
            used: 0,
            rejected: 0,
            insufficient_data: true,
        }
    }
}

/// Mean of the post-warm-up samples after z-score rejection against the
/// raw mean and population stddev.
pub fn summarize(
    samples: &[Sample],
    baseline: f64,
    z_threshold: f64,
    min_elapsed: f64,
) -> ChannelStats {
    summarize_with(
        samples,
        &AggregateParams {
            baseline: Some(baseline),
            z_threshold,
            min_elapsed,
            method: OutlierMethod::Classical,
        },
    )
}

pub fn summarize_with(samples: &[Sample], params: &AggregateParams) -> ChannelStats {
    let mut values: Vec<f64> = samples
        .iter()
        .filter(|sample| sample.elapsed_secs >= params.min_elapsed)
        .map(|sample| sample.value)
        .collect();
    if values.is_empty() {
        return ChannelStats::insufficient(params.baseline);
    }
    // Sorting first makes every sum below independent of arrival order.
    values.sort_by(|a, b| a.total_cmp(b));

    let raw_mean = mean(&values);
    let stddev = population_stddev(&values, raw_mean);

    let (center, scale) = match params.method {
        OutlierMethod::Classical => (raw_mean, stddev),
        OutlierMethod::Robust => robust_scale(&values).unwrap_or((raw_mean, stddev)),
    };

    let survivors: Vec<f64> = if scale.is_finite() && scale > 0.0 {
        values
            .iter()
            .copied()
            .filter(|value| (value - center).abs() / scale <= params.z_threshold)
            .collect()
    } else {
        values.clone()
    };

    let (final_mean, used) = if survivors.is_empty() {
        (raw_mean, values.len())
    } else {
        (mean(&survivors), survivors.len())
    };

    ChannelStats {
        mean: final_mean,
        stddev,
        baseline_percentage: params.baseline.map(|baseline| final_mean / baseline * 100.0),
        used,
        rejected: values.len() - used,
        insufficient_data: false,
    }
}

/// True when the channel should be flagged for replacement: below the
/// pass threshold, a zero mean, or no usable data.
pub fn needs_replacement(stats: &ChannelStats, pass_threshold_percent: f64) -> bool {
    if stats.insufficient_data || stats.mean == 0.0 {
        return true;
    }
    match stats.baseline_percentage {
        Some(percentage) => !(percentage >= pass_threshold_percent),
        None => false,
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn population_stddev(values: &[f64], mean: f64) -> f64 {
    let variance = values
        .iter()
        .map(|value| {
            let delta = value - mean;
            delta * delta
        })
        .sum::<f64>()
        / values.len() as f64;
    variance.max(0.0).sqrt()
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

fn quantile_of_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() as f64 - 1.0);
    let idx = pos.floor() as usize;
    let frac = pos - idx as f64;
    let a = sorted[idx];
    let b = sorted[(idx + 1).min(sorted.len() - 1)];
    a + (b - a) * frac
}

/// Median and a stddev-like scale, or None when the set is too small or
/// too flat for a robust estimate.
fn robust_scale(sorted: &[f64]) -> Option<(f64, f64)> {
    if sorted.len() < 3 {
        return None;
    }
    let center = median_of_sorted(sorted);
    let mut deviations: Vec<f64> = sorted.iter().map(|value| (value - center).abs()).collect();
    deviations.sort_by(|a, b| a.total_cmp(b));
    let mad = median_of_sorted(&deviations);
    if mad > SCALE_EPSILON {
        return Some((center, mad * MAD_TO_SIGMA));
    }

    let iqr = (quantile_of_sorted(sorted, 0.75) - quantile_of_sorted(sorted, 0.25)).abs();
    if iqr > SCALE_EPSILON {
        return Some((center, iqr / IQR_TO_SIGMA));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{Channel, ChannelKind};
    use chrono::Utc;

    fn samples(points: &[(f64, f64)]) -> Vec<Sample> {
        let channel = Channel::new("relay1", ChannelKind::Pressure);
        points
            .iter()
            .map(|(elapsed_secs, value)| Sample {
                channel: channel.clone(),
                elapsed_secs: *elapsed_secs,
                value: *value,
                received_at: Utc::now(),
            })
            .collect()
    }

    #[test]
    fn empty_input_is_insufficient_not_nan() {
        let stats = summarize(&[], 15.0, 2.0, 1.0);
        assert!(stats.insufficient_data);
        assert_eq!(stats.mean, 0.0);
        assert_eq!(stats.stddev, 0.0);
        assert_eq!(stats.baseline_percentage, Some(0.0));
        assert!(needs_replacement(&stats, 50.0));
    }

    #[test]
    fn warm_up_samples_are_ignored() {
        let input = samples(&[(0.2, 500.0), (0.9, 400.0), (1.0, 10.0), (2.0, 12.0)]);
        let stats = summarize(&input, 10.0, 2.0, 1.0);
        assert_eq!(stats.used, 2);
        assert!((stats.mean - 11.0).abs() < 1e-9);
    }

    #[test]
    fn only_warm_up_samples_is_insufficient() {
        let input = samples(&[(0.1, 14.0), (0.5, 15.0)]);
        let stats = summarize(&input, 15.0, 2.0, 1.0);
        assert!(stats.insufficient_data);
    }

    fn robust(baseline: f64, min_elapsed: f64) -> AggregateParams {
        AggregateParams {
            baseline: Some(baseline),
            z_threshold: 2.0,
            min_elapsed,
            method: OutlierMethod::Robust,
        }
    }

    #[test]
    fn robust_method_rejects_gross_outlier_in_three_points() {
        let input = samples(&[(1.0, 10.0), (2.0, 12.0), (3.0, 1000.0)]);
        let stats = summarize_with(&input, &robust(10.0, 0.0));
        assert_eq!(stats.rejected, 1);
        assert!((stats.mean - 11.0).abs() < 1e-9);
        assert!((stats.baseline_percentage.unwrap() - 110.0).abs() < 1e-9);
    }

    #[test]
    fn result_does_not_depend_on_order() {
        let forward = samples(&[(1.0, 10.0), (2.0, 12.0), (3.0, 1000.0), (4.0, 11.3)]);
        let mut reversed = forward.clone();
        reversed.reverse();
        assert_eq!(
            summarize(&forward, 10.0, 2.0, 0.0),
            summarize(&reversed, 10.0, 2.0, 0.0)
        );
    }

    #[test]
    fn healthy_channel_scenario() {
        let input = samples(&[(1.5, 14.8), (2.5, 15.1), (3.5, 14.9), (4.5, 15.0)]);
        let stats = summarize(&input, 15.0, 2.0, 1.0);
        assert_eq!(stats.rejected, 0);
        assert!((stats.mean - 14.95).abs() < 1e-9);
        let percentage = stats.baseline_percentage.unwrap();
        assert!((percentage - 99.7).abs() < 0.05);
        assert!(!needs_replacement(&stats, 50.0));
    }

    #[test]
    fn constant_series_falls_back_to_raw_mean() {
        let input = samples(&[(1.0, 5.0), (2.0, 5.0), (3.0, 5.0)]);
        let stats = summarize(&input, 10.0, 2.0, 0.0);
        assert_eq!(stats.mean, 5.0);
        assert_eq!(stats.stddev, 0.0);
        assert_eq!(stats.rejected, 0);
        assert!(!needs_replacement(&stats, 50.0));
        assert!(needs_replacement(&stats, 60.0));
    }

    #[test]
    fn classical_rejects_gross_outlier_with_enough_points() {
        let input = samples(&[
            (1.0, 10.0),
            (2.0, 11.0),
            (3.0, 10.5),
            (4.0, 10.0),
            (5.0, 11.0),
            (6.0, 10.5),
            (7.0, 1000.0),
        ]);
        let stats = summarize(&input, 10.0, 2.0, 0.0);
        assert_eq!(stats.rejected, 1);
        assert!((stats.mean - 10.5).abs() < 1e-9);
    }

    #[test]
    fn classical_default_keeps_in_range_points() {
        let input = samples(&[(1.0, 10.0), (2.0, 10.0), (3.0, 10.0), (4.0, 11.0), (5.0, 12.0)]);
        let classical = summarize(&input, 10.0, 2.0, 1.0);
        assert_eq!(classical.rejected, 0);
        assert!((classical.mean - 10.6).abs() < 1e-9);
        assert_eq!(
            summarize_with(&input, &AggregateParams { baseline: Some(10.0), ..AggregateParams::default() }),
            classical
        );

        let robust = summarize_with(&input, &robust(10.0, 1.0));
        assert_eq!(robust.rejected, 1);
        assert!((robust.mean - 10.25).abs() < 1e-9);
    }

    #[test]
    fn flat_majority_uses_interquartile_scale() {
        let input = samples(&[(1.0, 5.0), (2.0, 5.0), (3.0, 5.0), (4.0, 100.0)]);
        let stats = summarize_with(&input, &robust(5.0, 0.0));
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.mean, 5.0);
    }

    #[test]
    fn classical_method_keeps_small_sample_outlier() {
        let input = samples(&[(1.0, 10.0), (2.0, 12.0), (3.0, 1000.0)]);
        let stats = summarize(&input, 10.0, 2.0, 0.0);
        // Three points can never exceed a population z-score of sqrt(2).
        assert_eq!(stats.rejected, 0);
        assert!((stats.mean - 340.666_666).abs() < 1e-3);
    }

    #[test]
    fn no_baseline_means_no_percentage() {
        let input = samples(&[(1.0, 3.0), (2.0, 4.0)]);
        let stats = summarize_with(
            &input,
            &AggregateParams {
                min_elapsed: 0.0,
                ..AggregateParams::default()
            },
        );
        assert_eq!(stats.baseline_percentage, None);
        assert!((stats.mean - 3.5).abs() < 1e-9);
        assert!(!needs_replacement(&stats, 50.0));
    }

    #[test]
    fn low_percentage_needs_replacement() {
        let input = samples(&[(1.0, 6.0), (2.0, 7.0), (3.0, 6.5)]);
        let stats = summarize(&input, 15.0, 2.0, 0.0);
        assert!(stats.baseline_percentage.unwrap() < 50.0);
        assert!(needs_replacement(&stats, 50.0));
    }
}
