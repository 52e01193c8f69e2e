//! Rebuilds aggregate state from a snapshot and the events after it.
use serde::{Serialize, de::DeserializeOwned};
use tracing::instrument;

use crate::{Aggregate, EventLog, Result, SnapshotStore, StoredEvent};

/// The result of a rehydration: the folded state and the version it reflects.
#[derive(Debug, Clone, PartialEq)]
pub struct Rehydrated<S> {
    /// The folded state.
    pub state: S,
    /// The version of the last folded event, or of the snapshot if no events
    /// followed it, or `0` for an aggregate with no history.
    pub version: i64,
}

/// Reconstructs aggregate state by folding events over an optional snapshot.
///
/// The rehydrator only reads. Persisting a new snapshot is a separate,
/// explicit call to [`Rehydrator::snapshot`].
#[derive(Debug, Clone, Copy)]
pub struct Rehydrator<'a> {
    events: &'a EventLog,
    snapshots: &'a SnapshotStore,
}

impl<'a> Rehydrator<'a> {
    /// Creates a new `Rehydrator` over the given stores.
    pub fn new(events: &'a EventLog, snapshots: &'a SnapshotStore) -> Self {
        Self { events, snapshots }
    }

    /// Folds the aggregate's history into a state.
    ///
    /// Starts from the stored snapshot when there is a readable one, otherwise
    /// from `seed` at version 0, then applies every later event in version
    /// order. `fold` must be pure so that any snapshot point yields the same
    /// result as a full replay.
    #[instrument(skip(self, seed, fold))]
    pub async fn rehydrate<S, F>(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        seed: S,
        mut fold: F,
    ) -> Result<Rehydrated<S>>
    where
        S: DeserializeOwned + Send,
        F: FnMut(S, &StoredEvent) -> S + Send,
    {
        // Prefer the snapshot so only the delta of events needs replaying.
        let (start, start_version) = match self.snapshots.load(aggregate_type, aggregate_id).await? {
            Some(snapshot) => match serde_json::from_value::<S>(snapshot.state) {
                Ok(state) => (state, snapshot.version),
                Err(error) => {
                    tracing::warn!(%error, version = snapshot.version, "Snapshot does not match state type, replaying from seed");
                    (seed, 0)
                }
            },
            None => (seed, 0),
        };

        let events = self
            .events
            .events(aggregate_type, aggregate_id, start_version)
            .await?;
        let version = events.last().map_or(start_version, StoredEvent::version);
        let state = events.iter().fold(start, |state, event| fold(state, event));

        tracing::debug!(start_version, version, replayed = events.len(), "Rehydrated aggregate");
        Ok(Rehydrated { state, version })
    }

    /// Loads an [`Aggregate`] by folding its events with [`Aggregate::apply`].
    pub async fn load<A: Aggregate>(&self, aggregate_id: &str) -> Result<Rehydrated<A>> {
        self.rehydrate(A::AGGREGATE_TYPE, aggregate_id, A::default(), |mut aggregate, event| {
            aggregate.apply(event);
            aggregate
        })
        .await
    }

    /// Persists a rehydration result as the aggregate's snapshot.
    ///
    /// Nothing is written for version 0, since no event backs that state.
    /// Returns whether a snapshot was saved.
    pub async fn snapshot<S: Serialize>(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        rehydrated: &Rehydrated<S>,
    ) -> Result<bool> {
        if rehydrated.version == 0 {
            return Ok(false);
        }
        self.snapshots
            .save(aggregate_type, aggregate_id, rehydrated.version, &rehydrated.state)
            .await?;
        Ok(true)
    }
}
