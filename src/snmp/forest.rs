//! Isolation forest outlier detection over SNMP feature vectors.
//!
//! Anomalies are easier to isolate and therefore terminate at shallower
//! depths across the randomized trees; the score is `2^(-E[h(x)] / c(n))`
//! with the usual expected-path-length normalizer. The decision threshold
//! is calibrated at fit time so that roughly the configured contamination
//! share of the training sample scores above it.
//!
//! Models are fitted offline (`fabricmon train-model`), persisted with
//! bincode, and loaded read-only at startup. The model carries the feature
//! schema hash it was trained with; vectors with a different hash are
//! rejected, never scored.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::event::{Severity, SnmpAnomaly};
use crate::snmp::features::SnmpFeatureVector;

/// Euler-Mascheroni constant, for the expected path length normalizer.
const EULER_GAMMA: f64 = 0.577_215_664_9;

/// Largest number of contributing features attached to an anomaly.
const MAX_ATTRIBUTED_FEATURES: usize = 5;

/// Severity bucket offsets above the calibrated threshold.
const CRITICAL_MARGIN: f64 = 0.15;
const ERROR_MARGIN: f64 = 0.07;

#[derive(Debug, Clone)]
pub struct ForestConfig {
    pub num_trees: usize,
    pub sample_size: usize,
    /// Expected share of outliers in the training data; drives threshold
    /// calibration.
    pub contamination: f64,
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self { num_trees: 150, sample_size: 256, contamination: 0.02, seed: 42 }
    }
}

/// Calibration and schema metadata persisted with the trees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub schema_hash: String,
    pub feature_names: Vec<String>,
    pub feature_means: Vec<f64>,
    pub feature_stds: Vec<f64>,
    /// Decision threshold τ, calibrated to the contamination rate.
    pub threshold: f64,
    pub contamination: f64,
    pub trained_samples: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ForestStats {
    pub vectors_scored: u64,
    pub anomalies_emitted: u64,
    pub schema_mismatches: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum TreeNode {
    Split {
        feature: usize,
        value: f64,
        below: Box<TreeNode>,
        above: Box<TreeNode>,
    },
    Leaf {
        size: usize,
    },
}

impl TreeNode {
    fn isolation_depth(&self, x: &[f64], depth: f64) -> f64 {
        match self {
            TreeNode::Leaf { size } => depth + expected_path_length(*size),
            TreeNode::Split { feature, value, below, above } => {
                let v = x.get(*feature).copied().unwrap_or(0.0);
                if v < *value {
                    below.isolation_depth(x, depth + 1.0)
                } else {
                    above.isolation_depth(x, depth + 1.0)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IsolationTree {
    root: TreeNode,
}

impl IsolationTree {
    fn grow(samples: &[&[f64]], n_features: usize, max_depth: usize, rng: &mut StdRng) -> Self {
        Self { root: Self::grow_node(samples, n_features, 0, max_depth, rng) }
    }

    fn grow_node(
        samples: &[&[f64]],
        n_features: usize,
        depth: usize,
        max_depth: usize,
        rng: &mut StdRng,
    ) -> TreeNode {
        if depth >= max_depth || samples.len() <= 1 {
            return TreeNode::Leaf { size: samples.len() };
        }

        let feature = rng.random_range(0..n_features);
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for s in samples {
            let v = s.get(feature).copied().unwrap_or(0.0);
            lo = lo.min(v);
            hi = hi.max(v);
        }
        if !(hi - lo).is_finite() || hi - lo < f64::EPSILON {
            return TreeNode::Leaf { size: samples.len() };
        }

        let value = rng.random_range(lo..hi);
        let (below_samples, above_samples): (Vec<&[f64]>, Vec<&[f64]>) = samples
            .iter()
            .copied()
            .partition(|s| s.get(feature).copied().unwrap_or(0.0) < value);

        TreeNode::Split {
            feature,
            value,
            below: Box::new(Self::grow_node(&below_samples, n_features, depth + 1, max_depth, rng)),
            above: Box::new(Self::grow_node(&above_samples, n_features, depth + 1, max_depth, rng)),
        }
    }
}

/// Expected path length of an unsuccessful BST search over `n` items; the
/// c(n) normalizer from the isolation forest paper.
fn expected_path_length(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let n = n as f64;
    2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
}

/// A fitted isolation forest plus its calibration metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestModel {
    trees: Vec<IsolationTree>,
    sample_size: usize,
    pub metadata: ModelMetadata,
    #[serde(skip)]
    stats: ForestStats,
}

impl ForestModel {
    /// Fit a forest on training vectors. Randomness is fully determined by
    /// the config seed.
    pub fn fit(
        data: &[Vec<f64>],
        feature_names: &[String],
        schema_hash: &str,
        config: &ForestConfig,
    ) -> Result<Self> {
        if data.len() < 10 {
            bail!("insufficient training data: {} samples (minimum 10)", data.len());
        }
        let n_features = feature_names.len();
        if data.iter().any(|row| row.len() != n_features) {
            bail!("training rows do not all have {n_features} features");
        }
        if !(0.0 < config.contamination && config.contamination < 0.5) {
            bail!("contamination must be in (0, 0.5), got {}", config.contamination);
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let sample_size = config.sample_size.min(data.len());
        let max_depth = (sample_size as f64).log2().ceil() as usize;

        let mut trees = Vec::with_capacity(config.num_trees);
        for _ in 0..config.num_trees {
            let sample: Vec<&[f64]> = (0..sample_size)
                .map(|_| data[rng.random_range(0..data.len())].as_slice())
                .collect();
            trees.push(IsolationTree::grow(&sample, n_features, max_depth, &mut rng));
        }

        let mut means = vec![0.0; n_features];
        let mut stds = vec![0.0; n_features];
        for row in data {
            for (i, v) in row.iter().enumerate() {
                means[i] += v;
            }
        }
        for m in &mut means {
            *m /= data.len() as f64;
        }
        for row in data {
            for (i, v) in row.iter().enumerate() {
                stds[i] += (v - means[i]).powi(2);
            }
        }
        for s in &mut stds {
            *s = (*s / data.len() as f64).sqrt();
        }

        let mut model = Self {
            trees,
            sample_size,
            metadata: ModelMetadata {
                schema_hash: schema_hash.to_string(),
                feature_names: feature_names.to_vec(),
                feature_means: means,
                feature_stds: stds,
                threshold: 0.0,
                contamination: config.contamination,
                trained_samples: data.len(),
            },
            stats: ForestStats::default(),
        };

        // Calibrate τ so that ~contamination of the training set is flagged.
        let mut scores: Vec<f64> = data.iter().map(|row| model.score(row)).collect();
        scores.sort_by(|a, b| a.total_cmp(b));
        let rank = (((1.0 - config.contamination) * scores.len() as f64).ceil() as usize)
            .clamp(1, scores.len());
        model.metadata.threshold = scores[rank - 1];

        info!(
            trees = model.trees.len(),
            samples = data.len(),
            threshold = model.metadata.threshold,
            "isolation forest fitted"
        );
        Ok(model)
    }

    /// Anomaly score of a feature row, in (0, 1]; higher is more anomalous.
    pub fn score(&self, x: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.5;
        }
        let total: f64 = self.trees.iter().map(|t| t.root.isolation_depth(x, 0.0)).sum();
        let mean_depth = total / self.trees.len() as f64;
        let normalizer = expected_path_length(self.sample_size).max(f64::EPSILON);
        2f64.powf(-mean_depth / normalizer)
    }

    /// Score a vector against the model; `Some` iff the vector is an
    /// outlier at or above the calibrated threshold.
    pub fn predict(&mut self, vector: &SnmpFeatureVector) -> Option<SnmpAnomaly> {
        if vector.schema_hash != self.metadata.schema_hash {
            self.stats.schema_mismatches += 1;
            warn!(
                device = %vector.device,
                got = %vector.schema_hash,
                expected = %self.metadata.schema_hash,
                "rejecting SNMP vector with mismatched feature schema"
            );
            return None;
        }
        self.stats.vectors_scored += 1;

        let score = self.score(&vector.values);
        let severity = severity_for_score(score, self.metadata.threshold)?;
        let contributing = self.contributing_features(&vector.values);

        self.stats.anomalies_emitted += 1;
        debug!(device = %vector.device, score, severity = %severity, "SNMP outlier detected");
        Some(SnmpAnomaly {
            ts: vector.ts,
            device: vector.device.clone(),
            confidence: score.clamp(0.0, 1.0),
            severity,
            score,
            contributing_features: contributing,
        })
    }

    /// Features ranked by |z-score| against the training baseline, capped.
    fn contributing_features(&self, x: &[f64]) -> Vec<String> {
        let mut ranked: Vec<(f64, &String)> = self
            .metadata
            .feature_names
            .iter()
            .enumerate()
            .filter_map(|(i, name)| {
                let std = self.metadata.feature_stds.get(i).copied().unwrap_or(0.0);
                if std < f64::EPSILON {
                    return None;
                }
                let mean = self.metadata.feature_means.get(i).copied().unwrap_or(0.0);
                let z = ((x.get(i).copied().unwrap_or(0.0) - mean) / std).abs();
                (z > 0.0).then_some((z, name))
            })
            .collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
        ranked
            .into_iter()
            .take(MAX_ATTRIBUTED_FEATURES)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(&path)
            .with_context(|| format!("failed to create model file: {}", path.as_ref().display()))?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .context("failed to serialize isolation forest model")?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)
            .with_context(|| format!("failed to open model file: {}", path.as_ref().display()))?;
        let mut reader = BufReader::new(file);
        let model: Self =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
                .context("failed to deserialize isolation forest model")?;
        if model.metadata.feature_names.is_empty() || model.trees.is_empty() {
            bail!("model file carries no trees or feature schema");
        }
        Ok(model)
    }

    pub fn stats(&self) -> &ForestStats {
        &self.stats
    }
}

/// Deterministic severity from score buckets above the threshold.
pub fn severity_for_score(score: f64, threshold: f64) -> Option<Severity> {
    if score >= threshold + CRITICAL_MARGIN {
        Some(Severity::Critical)
    } else if score >= threshold + ERROR_MARGIN {
        Some(Severity::Error)
    } else if score >= threshold {
        Some(Severity::Warning)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snmp::features::{schema_hash, FEATURE_NAMES, NUM_FEATURES};

    fn feature_names() -> Vec<String> {
        FEATURE_NAMES.iter().map(|s| s.to_string()).collect()
    }

    /// Clustered baseline with mild deterministic variation.
    fn training_data(rows: usize) -> Vec<Vec<f64>> {
        (0..rows)
            .map(|k| {
                (0..NUM_FEATURES)
                    .map(|j| 0.2 + 0.05 * (((k + j) % 7) as f64 / 7.0))
                    .collect()
            })
            .collect()
    }

    fn fitted() -> ForestModel {
        let config = ForestConfig { num_trees: 60, sample_size: 128, ..Default::default() };
        ForestModel::fit(&training_data(300), &feature_names(), &schema_hash(), &config).unwrap()
    }

    fn vector(values: Vec<f64>) -> SnmpFeatureVector {
        SnmpFeatureVector {
            ts: 1_700_000_000_000,
            device: "spine-01".to_string(),
            values,
            schema_hash: schema_hash(),
        }
    }

    #[test]
    fn test_expected_path_length() {
        assert_eq!(expected_path_length(1), 0.0);
        assert!(expected_path_length(100) > expected_path_length(10));
    }

    #[test]
    fn test_fit_is_deterministic() {
        let config = ForestConfig { num_trees: 20, sample_size: 64, ..Default::default() };
        let data = training_data(100);
        let a = ForestModel::fit(&data, &feature_names(), &schema_hash(), &config).unwrap();
        let b = ForestModel::fit(&data, &feature_names(), &schema_hash(), &config).unwrap();
        assert_eq!(a.metadata.threshold, b.metadata.threshold);
        assert_eq!(a.score(&[0.9; NUM_FEATURES]), b.score(&[0.9; NUM_FEATURES]));
    }

    #[test]
    fn test_outlier_scores_above_inlier() {
        let model = fitted();
        let inlier = model.score(&[0.22; NUM_FEATURES]);
        let outlier = model.score(&[0.95; NUM_FEATURES]);
        assert!(outlier > inlier, "outlier {outlier} <= inlier {inlier}");
        assert!(outlier > model.metadata.threshold);
    }

    #[test]
    fn test_predict_flags_outlier_with_attribution() {
        let mut model = fitted();
        // Everything somewhat above baseline, interface errors far above.
        let mut values = vec![0.3; NUM_FEATURES];
        values[6] = 0.95;
        let anomaly = model.predict(&vector(values)).expect("outlier should be flagged");
        assert_eq!(anomaly.contributing_features[0], "interface_error_rate");
        assert!(anomaly.contributing_features.len() <= 5);
        assert!(anomaly.score >= model.metadata.threshold);
        assert!(anomaly.confidence >= 0.0 && anomaly.confidence <= 1.0);
    }

    #[test]
    fn test_predict_passes_inlier() {
        let mut model = fitted();
        assert!(model.predict(&vector(vec![0.22; NUM_FEATURES])).is_none());
    }

    #[test]
    fn test_schema_mismatch_rejected() {
        let mut model = fitted();
        let mut v = vector(vec![0.95; NUM_FEATURES]);
        v.schema_hash = "0000000000000000".to_string();
        assert!(model.predict(&v).is_none());
        assert_eq!(model.stats().schema_mismatches, 1);
        assert_eq!(model.stats().vectors_scored, 0);
    }

    #[test]
    fn test_severity_buckets() {
        let t = 0.6;
        assert_eq!(severity_for_score(0.76, t), Some(Severity::Critical));
        assert_eq!(severity_for_score(0.68, t), Some(Severity::Error));
        assert_eq!(severity_for_score(0.61, t), Some(Severity::Warning));
        assert_eq!(severity_for_score(0.59, t), None);
    }

    #[test]
    fn test_save_load_round_trip() {
        let model = fitted();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forest.bin");
        model.save(&path).unwrap();
        let loaded = ForestModel::load(&path).unwrap();
        assert_eq!(loaded.metadata.schema_hash, model.metadata.schema_hash);
        assert_eq!(loaded.metadata.threshold, model.metadata.threshold);
        let probe = [0.9; NUM_FEATURES];
        assert_eq!(loaded.score(&probe), model.score(&probe));
    }

    #[test]
    fn test_fit_rejects_tiny_datasets() {
        let config = ForestConfig::default();
        let err = ForestModel::fit(&training_data(5), &feature_names(), &schema_hash(), &config);
        assert!(err.is_err());
    }
}
