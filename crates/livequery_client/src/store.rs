//! Local reactive store.
//!
//! Holds the last authoritative result of every subscribed query, versioned
//! by log position, plus the optimistic overlays of pending mutations.
//! What callers see is the baseline with every overlay re-applied in
//! request order.

use livequery_codec::Value;
use livequery_protocol::{
    DocumentChange, LogPosition, QueryId, QueryIdentity, RequestId, StateModification,
    DOCUMENT_ID_FIELD,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;
use tracing::debug;

/// The state of one query result.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum QueryResult {
    /// No result received yet.
    #[default]
    Loading,
    /// The query returned a value.
    Value(Value),
    /// The query function failed on the server.
    Error(String),
}

impl QueryResult {
    /// Returns true if no result has arrived yet.
    pub fn is_loading(&self) -> bool {
        matches!(self, QueryResult::Loading)
    }

    /// The value, if the query succeeded.
    pub fn value(&self) -> Option<&Value> {
        match self {
            QueryResult::Value(value) => Some(value),
            _ => None,
        }
    }

    /// The error message, if the query failed.
    pub fn error(&self) -> Option<&str> {
        match self {
            QueryResult::Error(message) => Some(message),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            QueryResult::Loading => "loading",
            QueryResult::Value(value) => value.type_name(),
            QueryResult::Error(_) => "failed",
        }
    }
}

/// What a listener or `get_result` sees for one query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QuerySnapshot {
    /// Result with pending optimistic updates applied.
    pub result: QueryResult,
    /// True while the value comes from a previous connection session and
    /// has not been refreshed yet.
    pub stale: bool,
}

impl QuerySnapshot {
    /// A fresh loading snapshot.
    pub fn loading() -> Self {
        Self::default()
    }

    /// Shorthand for `self.result.value()`.
    pub fn value(&self) -> Option<&Value> {
        self.result.value()
    }
}

/// A transition the store cannot apply. Both variants force a resync.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// The transition does not directly follow the current position.
    #[error("transition out of order: expected {expected}, got {actual}")]
    OutOfOrder {
        /// The only acceptable position.
        expected: LogPosition,
        /// Position carried by the transition.
        actual: LogPosition,
    },

    /// A patch targeted a result that is not a document array.
    #[error("cannot patch query {query_id}: {reason}")]
    InvalidPatch {
        /// Query the patch was for.
        query_id: QueryId,
        /// What was wrong.
        reason: String,
    },
}

/// Re-runnable optimistic update of a pending mutation.
pub type OptimisticUpdate = Box<dyn Fn(&mut LocalQueryView<'_>) + Send>;

struct Entry {
    function_path: String,
    args: Value,
    baseline: QueryResult,
    stale: bool,
    visible: QueryResult,
}

struct Overlay {
    request_id: RequestId,
    update: OptimisticUpdate,
    touched: BTreeSet<QueryId>,
}

/// Mutable view over query results handed to optimistic updates.
///
/// Reads see the authoritative results with earlier overlays applied.
/// Writes only affect queries that are currently subscribed.
pub struct LocalQueryView<'a> {
    ids: &'a HashMap<QueryIdentity, QueryId>,
    entries: &'a BTreeMap<QueryId, Entry>,
    results: &'a mut BTreeMap<QueryId, QueryResult>,
    touched: &'a mut BTreeSet<QueryId>,
}

impl LocalQueryView<'_> {
    fn lookup(&self, function_path: &str, args: &Value) -> Option<QueryId> {
        let identity = QueryIdentity::new(function_path, args).ok()?;
        self.ids.get(&identity).copied()
    }

    /// Current value of a subscribed query. `None` while loading, failed
    /// or not subscribed.
    pub fn get(&self, function_path: &str, args: &Value) -> Option<&Value> {
        let query_id = self.lookup(function_path, args)?;
        self.results.get(&query_id).and_then(QueryResult::value)
    }

    /// Arguments and current values of every subscribed query of a
    /// function.
    pub fn get_all(&self, function_path: &str) -> Vec<(&Value, Option<&Value>)> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.function_path == function_path)
            .map(|(query_id, entry)| {
                (
                    &entry.args,
                    self.results.get(query_id).and_then(QueryResult::value),
                )
            })
            .collect()
    }

    /// Replaces the local value of a subscribed query. Returns false (and
    /// does nothing) if the query is not subscribed.
    pub fn set(&mut self, function_path: &str, args: &Value, value: Value) -> bool {
        let Some(query_id) = self.lookup(function_path, args) else {
            return false;
        };
        self.results.insert(query_id, QueryResult::Value(value));
        self.touched.insert(query_id);
        true
    }
}

#[derive(Default)]
pub(crate) struct LocalStore {
    position: LogPosition,
    entries: BTreeMap<QueryId, Entry>,
    ids: HashMap<QueryIdentity, QueryId>,
    overlays: Vec<Overlay>,
    dirty: BTreeSet<QueryId>,
}

impl LocalStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn position(&self) -> LogPosition {
        self.position
    }

    /// Starts a new session at the initial position.
    pub(crate) fn reset_position(&mut self) {
        self.position = LogPosition::INITIAL;
    }

    /// Adds a loading entry for a new subscription.
    pub(crate) fn insert(&mut self, query_id: QueryId, identity: QueryIdentity, args: Value) {
        let function_path = identity.function_path().to_string();
        self.ids.insert(identity, query_id);
        self.entries.insert(
            query_id,
            Entry {
                function_path,
                args,
                baseline: QueryResult::Loading,
                stale: false,
                visible: QueryResult::Loading,
            },
        );
    }

    /// Drops an entry immediately.
    pub(crate) fn remove(&mut self, query_id: QueryId) {
        if self.entries.remove(&query_id).is_some() {
            self.ids.retain(|_, id| *id != query_id);
        }
        self.dirty.remove(&query_id);
    }

    pub(crate) fn snapshot(&self, query_id: QueryId) -> Option<QuerySnapshot> {
        self.entries.get(&query_id).map(|entry| QuerySnapshot {
            result: entry.visible.clone(),
            stale: entry.stale,
        })
    }

    pub(crate) fn get(&self, identity: &QueryIdentity) -> Option<QuerySnapshot> {
        self.ids.get(identity).and_then(|id| self.snapshot(*id))
    }

    /// Applies a transition atomically: either every modification lands
    /// and the position advances, or nothing changes.
    ///
    /// Overlays are not re-run here; call [`Self::recompute`] once the
    /// surrounding event is fully handled.
    pub(crate) fn apply_transition(
        &mut self,
        position: LogPosition,
        modifications: Vec<StateModification>,
    ) -> Result<usize, TransitionError> {
        let expected = self.position.successor();
        if position != expected {
            return Err(TransitionError::OutOfOrder {
                expected,
                actual: position,
            });
        }

        let mut staged: BTreeMap<QueryId, QueryResult> = BTreeMap::new();
        for modification in modifications {
            let query_id = modification.query_id();
            if let StateModification::Removed { .. } = modification {
                continue;
            }
            let Some(entry) = self.entries.get(&query_id) else {
                debug!(query_id = %query_id, kind = modification.kind_name(), "modification for unknown query ignored");
                continue;
            };
            let current = staged
                .remove(&query_id)
                .unwrap_or_else(|| entry.baseline.clone());
            let next = match modification {
                StateModification::Updated { value, .. } => QueryResult::Value(value),
                StateModification::Patched { changes, .. } => {
                    apply_patch(query_id, current, changes)?
                }
                StateModification::Failed { message, .. } => QueryResult::Error(message),
                StateModification::Removed { .. } => current,
            };
            staged.insert(query_id, next);
        }

        let mut applied = 0;
        for (query_id, result) in staged {
            if let Some(entry) = self.entries.get_mut(&query_id) {
                entry.baseline = result;
                entry.stale = false;
                self.dirty.insert(query_id);
                applied += 1;
            }
        }
        self.position = position;
        Ok(applied)
    }

    /// Flags every non-loading entry as stale.
    pub(crate) fn mark_stale(&mut self) {
        for (query_id, entry) in &mut self.entries {
            if !entry.baseline.is_loading() && !entry.stale {
                entry.stale = true;
                self.dirty.insert(*query_id);
            }
        }
    }

    /// Drops every cached result back to loading.
    pub(crate) fn reset_to_loading(&mut self) {
        for (query_id, entry) in &mut self.entries {
            if !entry.baseline.is_loading() || entry.stale {
                entry.baseline = QueryResult::Loading;
                entry.stale = false;
                self.dirty.insert(*query_id);
            }
        }
    }

    /// Layers a new overlay on top of the existing ones.
    pub(crate) fn push_overlay(&mut self, request_id: RequestId, update: OptimisticUpdate) {
        self.overlays.push(Overlay {
            request_id,
            update,
            touched: BTreeSet::new(),
        });
    }

    /// Removes an overlay. Returns false if it was already gone.
    pub(crate) fn remove_overlay(&mut self, request_id: RequestId) -> bool {
        let Some(index) = self
            .overlays
            .iter()
            .position(|overlay| overlay.request_id == request_id)
        else {
            return false;
        };
        let overlay = self.overlays.remove(index);
        self.dirty.extend(overlay.touched);
        true
    }

    pub(crate) fn overlay_count(&self) -> usize {
        self.overlays.len()
    }

    /// Queries the overlay of a request wrote on its last run.
    pub(crate) fn touched_by(&self, request_id: RequestId) -> Option<&BTreeSet<QueryId>> {
        self.overlays
            .iter()
            .find(|overlay| overlay.request_id == request_id)
            .map(|overlay| &overlay.touched)
    }

    /// Re-runs every overlay in request order over the current baselines
    /// and marks entries whose visible result changed.
    pub(crate) fn recompute(&mut self) {
        let mut results: BTreeMap<QueryId, QueryResult> = self
            .entries
            .iter()
            .map(|(query_id, entry)| (*query_id, entry.baseline.clone()))
            .collect();

        for overlay in &mut self.overlays {
            let mut touched = BTreeSet::new();
            let mut view = LocalQueryView {
                ids: &self.ids,
                entries: &self.entries,
                results: &mut results,
                touched: &mut touched,
            };
            (overlay.update)(&mut view);
            overlay.touched = touched;
        }

        for (query_id, result) in results {
            if let Some(entry) = self.entries.get_mut(&query_id) {
                if entry.visible != result {
                    entry.visible = result;
                    self.dirty.insert(query_id);
                }
            }
        }
    }

    /// Queries whose snapshot may have changed since the last call.
    pub(crate) fn take_dirty(&mut self) -> Vec<QueryId> {
        std::mem::take(&mut self.dirty).into_iter().collect()
    }
}

fn document_id(document: &Value) -> Option<&str> {
    document.get(DOCUMENT_ID_FIELD).and_then(Value::as_str)
}

fn apply_patch(
    query_id: QueryId,
    current: QueryResult,
    changes: Vec<DocumentChange>,
) -> Result<QueryResult, TransitionError> {
    let invalid = |reason: String| TransitionError::InvalidPatch { query_id, reason };
    let mut documents = match current {
        QueryResult::Value(Value::Array(documents)) => documents,
        other => return Err(invalid(format!("result is {}, not an array", other.kind()))),
    };
    for change in changes {
        match change {
            DocumentChange::Upsert { id, document } => {
                if let Some(found) = document_id(&document) {
                    if found != id {
                        return Err(invalid(format!(
                            "upsert for {id:?} carries document {found:?}"
                        )));
                    }
                }
                match documents
                    .iter_mut()
                    .find(|existing| document_id(existing) == Some(id.as_str()))
                {
                    Some(slot) => *slot = document,
                    None => documents.push(document),
                }
            }
            DocumentChange::Remove { id } => {
                documents.retain(|existing| document_id(existing) != Some(id.as_str()));
            }
        }
    }
    Ok(QueryResult::Value(Value::Array(documents)))
}
