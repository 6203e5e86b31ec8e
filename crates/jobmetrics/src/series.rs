//! Reads and member encoding for the per-identity sample series.
//!
//! Members are `"{job_id}|{value}"` scored by completion time in unix
//! seconds, so a redelivered completion overwrites its own entry instead of
//! adding a second one.

use chrono::{DateTime, Utc};
use jobmetrics_core::time::to_score;
use jobmetrics_kv_store::{KeyValueStore, ScoredMember};
use tracing::warn;

use crate::error::MetricsResult;

pub(crate) fn encode_member(job_id: &str, value: f64) -> String {
    format!("{job_id}|{value}")
}

fn decode_value(member: &str) -> Option<f64> {
    let (_, value) = member.rsplit_once('|')?;
    value.parse().ok().filter(|value: &f64| value.is_finite())
}

fn values(key: &str, members: Vec<ScoredMember>) -> Vec<f64> {
    members
        .into_iter()
        .filter_map(|entry| {
            let value = decode_value(&entry.member);
            if value.is_none() {
                warn!(key = %key, member = %entry.member, "skipping malformed sample");
            }
            value
        })
        .collect()
}

/// Up to `limit` newest values, newest first.
pub(crate) async fn newest(
    store: &dyn KeyValueStore,
    key: &str,
    limit: usize,
) -> MetricsResult<Vec<f64>> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let members = store.sorted_newest(key, limit).await?;
    Ok(values(key, members))
}

/// Values recorded within `[from, to]`, oldest first.
pub(crate) async fn window(
    store: &dyn KeyValueStore,
    key: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> MetricsResult<Vec<f64>> {
    let members = store
        .sorted_range_by_score(key, to_score(from), to_score(to))
        .await?;
    Ok(values(key, members))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn member_encoding_survives_pipes_in_job_ids() {
        let member = encode_member("batch|7", 12.5);
        assert_eq!(member, "batch|7|12.5");
        assert_eq!(decode_value(&member), Some(12.5));
    }

    #[test]
    fn malformed_members_decode_to_none() {
        assert_eq!(decode_value("no-separator"), None);
        assert_eq!(decode_value("job|NaN"), None);
        assert_eq!(decode_value("job|abc"), None);
    }

    proptest! {
        #[test]
        fn finite_values_decode_exactly(job_id in ".*", value in proptest::num::f64::NORMAL) {
            prop_assert_eq!(decode_value(&encode_member(&job_id, value)), Some(value));
        }
    }
}
