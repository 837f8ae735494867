//! Backlog projection over outstanding work, for reporting endpoints.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::store::{MessageStore, RetryBand, StoreError};

/// Outstanding work for one event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacklogEntry {
    pub event_type: String,
    pub count: usize,
    pub oldest_created_date: DateTime<Utc>,
    /// Records older than the SLA.
    pub past_sla: usize,
    pub max_retry_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacklogReport {
    pub generated_at: DateTime<Utc>,
    pub sla_seconds: i64,
    pub total: usize,
    /// Sorted by event type name.
    pub entries: Vec<BacklogEntry>,
}

/// Summarise every unprocessed record by event type.
pub fn backlog_report<S>(
    store: &S,
    now: DateTime<Utc>,
    sla: Duration,
) -> Result<BacklogReport, StoreError>
where
    S: MessageStore + ?Sized,
{
    let records = store.find_unprocessed_by_retry_band(RetryBand::at_least(0))?;

    let mut entries: BTreeMap<String, BacklogEntry> = BTreeMap::new();
    for record in &records {
        let late = record.age(now) > sla;
        let key = record.event_type.to_string();
        entries
            .entry(key.clone())
            .and_modify(|e| {
                e.count += 1;
                e.oldest_created_date = e.oldest_created_date.min(record.created_date);
                e.past_sla += usize::from(late);
                e.max_retry_count = e.max_retry_count.max(record.retry_count);
            })
            .or_insert_with(|| BacklogEntry {
                event_type: key,
                count: 1,
                oldest_created_date: record.created_date,
                past_sla: usize::from(late),
                max_retry_count: record.retry_count,
            });
    }

    Ok(BacklogReport {
        generated_at: now,
        sla_seconds: sla.num_seconds(),
        total: records.len(),
        entries: entries.into_values().collect(),
    })
}
