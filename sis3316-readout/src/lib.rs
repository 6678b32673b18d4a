//! Post-processing pipeline over parsed events: per-channel readers
//! (§4.F), a k-way time-merge (§4.G), a coincidence engine (§4.H), and
//! per-event integration (§4.I). `sis3316-device` produces the raw files
//! this crate reads.

pub mod coincidence;
pub mod integration;
pub mod merge;
pub mod reader;

pub use coincidence::{filter_group, CoincidenceEngine, FilteredCoincidence};
pub use integration::{integrate, BaselineEstimator, IntegrationConfig, IntegrationError, IntegrationResult, SampleRange};
pub use merge::{DelayTable, EndBehavior, Merger};
pub use reader::ChannelReader;
