//! BGP control-plane path: update aggregation and discord detection.
//!
//! Updates flow through the [`aggregator`] into fixed-length feature bins,
//! and the [`detector`] maintains per-device rings over those bins,
//! flagging discords with a streaming matrix profile.

pub mod aggregator;
pub mod detector;
pub mod profile;

pub use aggregator::{AggregatorConfig, AggregatorStats, FeatureAggregator, FeatureBin};
pub use detector::{MatrixProfileDetector, MpDetectorConfig, MpStats};
