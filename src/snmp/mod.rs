//! SNMP device-metrics path: feature extraction and isolation forest scoring.

pub mod features;
pub mod forest;

pub use features::{
    schema_hash, ExtractorConfig, ExtractorStats, SnmpFeatureExtractor, SnmpFeatureVector,
    FEATURE_NAMES, NUM_FEATURES,
};
pub use forest::{ForestConfig, ForestModel, ForestStats, ModelMetadata};
