use crate::prelude::*;
use crate::storage::{list_objects, ObjectStore, RemoteObject};
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age_days: u32,
}

impl RetentionPolicy {
    pub fn new(max_age_days: u32) -> Self {
        Self { max_age_days }
    }

    /// Whole days elapsed since `last_modified`, rounded down. Timestamps in
    /// the future give zero or a negative age.
    pub fn age_in_days(last_modified: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
        (now - last_modified).num_days()
    }

    /// Objects exactly `max_age_days` old are kept.
    pub fn is_expired(&self, last_modified: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        Self::age_in_days(last_modified, now) > i64::from(self.max_age_days)
    }

    /// Objects last modified at or before this instant are past the window.
    /// `None` when the window reaches beyond the representable calendar.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        Duration::try_days(i64::from(self.max_age_days) + 1)
            .and_then(|window| now.checked_sub_signed(window))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub listed: usize,
    pub retained: usize,
    pub deleted: Vec<String>,
    /// Key and error text of every deletion that failed.
    pub failed: Vec<(String, String)>,
    /// Objects without a last-modified timestamp; they are never deleted.
    pub undated: Vec<String>,
}

impl SweepReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn into_result(self) -> Result<Self> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(Error::PartialSweep {
                deleted: self.deleted.len(),
                failed: self.failed.into_iter().map(|(key, _)| key).collect(),
            })
        }
    }
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "listed {}, retained {}, deleted {}, failed {}",
            self.listed,
            self.retained,
            self.deleted.len(),
            self.failed.len()
        )?;
        if !self.undated.is_empty() {
            write!(f, ", undated {}", self.undated.len())?;
        }
        Ok(())
    }
}

/// Deletes every object in a container whose age exceeds the policy.
pub struct RetentionSweeper<'a> {
    store: &'a dyn ObjectStore,
    policy: RetentionPolicy,
    concurrency: usize,
}

impl<'a> RetentionSweeper<'a> {
    pub fn new(store: &'a dyn ObjectStore, policy: RetentionPolicy, concurrency: usize) -> Self {
        Self {
            store,
            policy,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Lists the whole container once, then deletes the expired objects of
    /// that snapshot. A failed deletion is recorded and the others proceed.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        info!(
            "Removing objects older than {} days from container: {}",
            self.policy.max_age_days,
            self.store.container()
        );
        match self.policy.cutoff(now) {
            Some(cutoff) => info!("Cutoff date: {}", cutoff),
            None => info!("No cutoff date: every dated object is within the window"),
        }

        let snapshot = self.snapshot().await?;
        let mut report = SweepReport {
            listed: snapshot.len(),
            ..SweepReport::default()
        };

        let mut expired = Vec::new();
        for object in snapshot.into_values() {
            match object.last_modified {
                Some(last_modified) if self.policy.is_expired(last_modified, now) => {
                    expired.push((object.key, last_modified))
                }
                Some(_) => report.retained += 1,
                None => {
                    warn!("Object {} has no last-modified time, keeping it", object.key);
                    report.undated.push(object.key);
                }
            }
        }

        let store = self.store;
        let outcomes: Vec<(String, Result<()>)> = stream::iter(expired)
            .map(|(key, last_modified)| async move {
                info!("Deleting object: {}, Last Modified: {}", key, last_modified);
                let outcome = store.delete(&key).await;
                (key, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (key, outcome) in outcomes {
            match outcome {
                Ok(()) => report.deleted.push(key),
                Err(e) => {
                    error!("Failed to delete object {}: {}", key, e);
                    report.failed.push((key, e.to_string()));
                }
            }
        }
        report.deleted.sort();
        report.failed.sort();

        if report.is_complete() {
            info!("Retention sweep finished: {}", report);
        } else {
            warn!("Retention sweep partially failed: {}", report);
        }
        Ok(report)
    }

    /// Drains every listing page. A key seen twice (pages shifting under
    /// concurrent writes) is kept once.
    async fn snapshot(&self) -> Result<BTreeMap<String, RemoteObject>> {
        let (snapshot, pages) = list_objects(self.store)
            .try_fold(
                (BTreeMap::new(), 0usize),
                |(mut snapshot, pages), page| async move {
                    for object in page {
                        snapshot.entry(object.key.clone()).or_insert(object);
                    }
                    Ok::<_, Error>((snapshot, pages + 1))
                },
            )
            .await?;

        info!(
            "Listed {} objects in {} page(s) from container: {}",
            snapshot.len(),
            pages,
            self.store.container()
        );
        Ok(snapshot)
    }
}
