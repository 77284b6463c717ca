//! Core data model shared by the detectors and the correlator.

pub mod event;
pub mod record;

pub use event::{BgpAnomaly, BgpSeries, FailureKind, JoinKind, Priority, Severity, SnmpAnomaly};
pub use record::{BgpMessageKind, BgpUpdate, SnmpSample};
