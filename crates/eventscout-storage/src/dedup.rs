//! Identity-resolving upsert shared by every [`crate::EventStore`].
//!
//! Resolution per normalized candidate:
//! 1. a row with the same identity hash is updated in place;
//! 2. otherwise a row with the same raw website is updated in place;
//! 3. otherwise the row is inserted, and a hash conflict on insert degrades
//!    to an update.

use async_trait::async_trait;
use eventscout_core::{EventCandidate, NewEvent};
use tracing::{debug, warn};

use crate::{BatchOutcome, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RowWrite {
    Inserted(i64),
    Updated(i64),
}

/// Row-level primitives a backend provides to the upsert engine.
#[async_trait]
pub(crate) trait UpsertTarget: Send {
    async fn find_by_hash(&mut self, hash: &str) -> Result<Option<i64>, StoreError>;

    async fn find_by_website(&mut self, website: &str) -> Result<Option<i64>, StoreError>;

    /// Overwrites the mutable fields. `hash`, `platform` and `created_at` stay.
    async fn update_event(&mut self, id: i64, event: &NewEvent) -> Result<(), StoreError>;

    async fn insert_event(&mut self, event: &NewEvent) -> Result<RowWrite, StoreError>;

    /// Opens an atomic unit for one row. Backends without partial writes can
    /// keep the defaults.
    async fn begin_row(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn commit_row(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn rollback_row(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

pub(crate) async fn write_row<T>(target: &mut T, event: &NewEvent) -> Result<RowWrite, StoreError>
where
    T: UpsertTarget + ?Sized,
{
    if let Some(id) = target.find_by_hash(&event.hash).await? {
        target.update_event(id, event).await?;
        debug!(id, hash = %event.hash, "updated event by hash");
        return Ok(RowWrite::Updated(id));
    }

    if !event.website.is_empty() {
        if let Some(id) = target.find_by_website(&event.website).await? {
            target.update_event(id, event).await?;
            debug!(id, website = %event.website, "updated event by website");
            return Ok(RowWrite::Updated(id));
        }
    }

    target.insert_event(event).await
}

pub(crate) async fn upsert_all<T>(target: &mut T, candidates: Vec<EventCandidate>) -> BatchOutcome
where
    T: UpsertTarget + ?Sized,
{
    let mut outcome = BatchOutcome::default();

    for candidate in candidates {
        let event = match candidate.normalize() {
            Ok(event) => event,
            Err(err) => {
                debug!(error = %err, "skipping invalid candidate");
                outcome.skipped += 1;
                continue;
            }
        };

        if let Err(err) = target.begin_row().await {
            warn!(error = %err, name = %event.name, "could not open row savepoint");
            outcome.skipped += 1;
            continue;
        }

        let written = match write_row(target, &event).await {
            Ok(written) => target.commit_row().await.map(|_| written),
            Err(err) => Err(err),
        };

        match written {
            Ok(RowWrite::Inserted(_)) => outcome.inserted += 1,
            Ok(RowWrite::Updated(_)) => outcome.updated += 1,
            Err(err) => {
                warn!(error = %err, name = %event.name, platform = %event.platform, "skipping event row");
                if let Err(rollback_err) = target.rollback_row().await {
                    warn!(error = %rollback_err, "row rollback failed");
                }
                outcome.skipped += 1;
            }
        }
    }

    outcome
}
