//! Ordered rewrites applied to completed samples before they are stored.

use std::fmt;
use std::sync::Arc;

use jobmetrics_core::CompletedSample;

/// A pure rewrite of one completed sample.
pub type SampleTransform = Arc<dyn Fn(CompletedSample) -> CompletedSample + Send + Sync>;

/// Transforms sorted by ascending priority. Equal priorities keep
/// registration order.
#[derive(Clone, Default)]
pub struct TransformPipeline {
    stages: Vec<(i32, SampleTransform)>,
}

impl TransformPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, priority: i32, transform: F) -> &mut Self
    where
        F: Fn(CompletedSample) -> CompletedSample + Send + Sync + 'static,
    {
        self.stages.push((priority, Arc::new(transform)));
        // `sort_by_key` is stable.
        self.stages.sort_by_key(|(priority, _)| *priority);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn apply(&self, sample: CompletedSample) -> CompletedSample {
        self.stages
            .iter()
            .fold(sample, |sample, (_, transform)| transform(sample))
    }
}

impl fmt::Debug for TransformPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformPipeline")
            .field(
                "priorities",
                &self.stages.iter().map(|(p, _)| *p).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use jobmetrics_core::JobIdentity;

    use super::*;

    fn sample() -> CompletedSample {
        CompletedSample {
            job_id: "1".to_string(),
            identity: JobIdentity::new("redis", "default", "X").expect("identity"),
            duration_ms: 10.0,
            memory_mb: 1.0,
            cpu_time_ms: 1.0,
            completed_at: Utc::now(),
            hostname: None,
        }
    }

    #[test]
    fn runs_in_priority_order() {
        let mut pipeline = TransformPipeline::new();
        pipeline
            .register(20, |mut s| {
                s.duration_ms *= 2.0;
                s
            })
            .register(10, |mut s| {
                s.duration_ms += 5.0;
                s
            });
        // (10 + 5) * 2
        assert_eq!(pipeline.apply(sample()).duration_ms, 30.0);
    }

    #[test]
    fn equal_priorities_keep_registration_order() {
        let mut pipeline = TransformPipeline::new();
        pipeline
            .register(0, |mut s| {
                s.duration_ms = 1.0;
                s
            })
            .register(0, |mut s| {
                s.duration_ms += 100.0;
                s
            });
        assert_eq!(pipeline.apply(sample()).duration_ms, 101.0);
        assert_eq!(pipeline.len(), 2);
    }

    #[test]
    fn empty_pipeline_is_identity() {
        let original = sample();
        assert_eq!(TransformPipeline::new().apply(original.clone()), original);
    }
}
