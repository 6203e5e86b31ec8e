//! Job metrics: sample recording, queue aggregation, decayed baselines,
//! worker heartbeats and queue health for a background job system.

pub mod aggregator;
pub mod baseline;
pub mod config;
pub mod discovery;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod recorder;
mod series;
pub mod service;
pub mod sweeps;
pub mod transforms;

pub use aggregator::{AggregationReport, WindowedAggregator};
pub use baseline::BaselineEstimator;
pub use config::MetricsConfig;
pub use discovery::{DiscoveryMarker, QueueDiscovery};
pub use error::{MetricsError, MetricsResult};
pub use health::{
    HealthScorer, HealthStatus, HealthThresholds, QueueDepth, QueueHealth, QueueInspector,
    StaticQueueInspector,
};
pub use heartbeat::WorkerHeartbeatTracker;
pub use recorder::{JobStatistics, SampleRecorder};
pub use service::MetricsService;
pub use sweeps::{AggregationTask, BaselineTask, CleanupTask, StaleWorkerTask};
pub use transforms::{SampleTransform, TransformPipeline};
