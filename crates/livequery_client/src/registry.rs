//! Query subscription registry.
//!
//! Deduplicates subscriptions by [`QueryIdentity`]: every distinct
//! identity owns one record with one server-side query id, shared by any
//! number of listeners.

use crate::store::QuerySnapshot;
use livequery_codec::Value;
use livequery_protocol::{QueryId, QueryIdentity, QuerySubscription};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Callback receiving every new snapshot of a subscribed query.
pub type Listener = Box<dyn FnMut(&QuerySnapshot) + Send>;

/// Identifies one listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    query_id: QueryId,
    listener_id: u64,
}

impl SubscriptionHandle {
    /// The query this listener is attached to.
    pub fn query_id(&self) -> QueryId {
        self.query_id
    }
}

struct SubscriptionRecord {
    identity: QueryIdentity,
    function_path: String,
    args: Value,
    listeners: Vec<(u64, Listener)>,
}

/// Outcome of [`SubscriptionRegistry::subscribe`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Subscribed {
    /// A new record was created; the server must be told.
    New(QuerySubscription),
    /// The listener joined an existing record.
    Existing,
}

/// Outcome of [`SubscriptionRegistry::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Unsubscribed {
    /// The handle did not match a live listener.
    Unknown,
    /// The listener was removed; others remain.
    ListenerRemoved,
    /// The last listener was removed and the record dropped.
    RecordRemoved(QueryId),
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    next_query_id: u32,
    next_listener_id: u64,
    by_identity: HashMap<QueryIdentity, QueryId>,
    records: BTreeMap<QueryId, SubscriptionRecord>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(
        &mut self,
        identity: QueryIdentity,
        args: Value,
        listener: Listener,
    ) -> (SubscriptionHandle, Subscribed) {
        let listener_id = self.next_listener_id;
        self.next_listener_id += 1;

        if let Some(&query_id) = self.by_identity.get(&identity) {
            if let Some(record) = self.records.get_mut(&query_id) {
                record.listeners.push((listener_id, listener));
                debug!(query_id = %query_id, listeners = record.listeners.len(), "listener joined");
                return (
                    SubscriptionHandle {
                        query_id,
                        listener_id,
                    },
                    Subscribed::Existing,
                );
            }
        }

        let query_id = QueryId::new(self.next_query_id);
        self.next_query_id = self.next_query_id.wrapping_add(1);
        let function_path = identity.function_path().to_string();
        debug!(query_id = %query_id, identity = %identity, "new subscription");
        self.by_identity.insert(identity.clone(), query_id);
        self.records.insert(
            query_id,
            SubscriptionRecord {
                identity,
                function_path: function_path.clone(),
                args: args.clone(),
                listeners: vec![(listener_id, listener)],
            },
        );
        (
            SubscriptionHandle {
                query_id,
                listener_id,
            },
            Subscribed::New(QuerySubscription::new(query_id, function_path, args)),
        )
    }

    pub(crate) fn unsubscribe(&mut self, handle: SubscriptionHandle) -> Unsubscribed {
        let Some(record) = self.records.get_mut(&handle.query_id) else {
            return Unsubscribed::Unknown;
        };
        let before = record.listeners.len();
        record.listeners.retain(|(id, _)| *id != handle.listener_id);
        if record.listeners.len() == before {
            return Unsubscribed::Unknown;
        }
        if !record.listeners.is_empty() {
            return Unsubscribed::ListenerRemoved;
        }
        if let Some(record) = self.records.remove(&handle.query_id) {
            self.by_identity.remove(&record.identity);
        }
        debug!(query_id = %handle.query_id, "last listener gone, subscription removed");
        Unsubscribed::RecordRemoved(handle.query_id)
    }

    pub(crate) fn query_id(&self, identity: &QueryIdentity) -> Option<QueryId> {
        self.by_identity.get(identity).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    /// Every live subscription, in query id order.
    pub(crate) fn all_subscriptions(&self) -> Vec<QuerySubscription> {
        self.records
            .iter()
            .map(|(query_id, record)| {
                QuerySubscription::new(*query_id, record.function_path.clone(), record.args.clone())
            })
            .collect()
    }

    /// Calls every listener of a query. Returns the number of calls.
    pub(crate) fn notify(&mut self, query_id: QueryId, snapshot: &QuerySnapshot) -> usize {
        let Some(record) = self.records.get_mut(&query_id) else {
            return 0;
        };
        for (_, listener) in &mut record.listeners {
            listener(snapshot);
        }
        record.listeners.len()
    }

    /// Calls a single listener.
    pub(crate) fn notify_one(&mut self, handle: SubscriptionHandle, snapshot: &QuerySnapshot) {
        if let Some(record) = self.records.get_mut(&handle.query_id) {
            if let Some((_, listener)) = record
                .listeners
                .iter_mut()
                .find(|(id, _)| *id == handle.listener_id)
            {
                listener(snapshot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn identity(channel: &str) -> (QueryIdentity, Value) {
        let args = Value::object([("channel", Value::from(channel))]);
        (QueryIdentity::new("messages.list", &args).unwrap(), args)
    }

    fn noop() -> Listener {
        Box::new(|_: &QuerySnapshot| {})
    }

    #[test]
    fn same_identity_shares_record() {
        let mut registry = SubscriptionRegistry::new();
        let (id, args) = identity("general");

        let (first, outcome) = registry.subscribe(id.clone(), args.clone(), noop());
        assert!(matches!(outcome, Subscribed::New(_)));
        let (second, outcome) = registry.subscribe(id.clone(), args, noop());
        assert_eq!(outcome, Subscribed::Existing);

        assert_eq!(first.query_id(), second.query_id());
        assert_ne!(first, second);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.query_id(&id), Some(first.query_id()));
    }

    #[test]
    fn last_unsubscribe_removes_record_once() {
        let mut registry = SubscriptionRegistry::new();
        let (id, args) = identity("general");
        let (a, _) = registry.subscribe(id.clone(), args.clone(), noop());
        let (b, _) = registry.subscribe(id, args, noop());

        assert_eq!(registry.unsubscribe(a), Unsubscribed::ListenerRemoved);
        assert_eq!(registry.unsubscribe(a), Unsubscribed::Unknown);
        assert_eq!(registry.unsubscribe(b), Unsubscribed::RecordRemoved(b.query_id()));
        assert_eq!(registry.unsubscribe(b), Unsubscribed::Unknown);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn query_ids_never_reused() {
        let mut registry = SubscriptionRegistry::new();
        let (id, args) = identity("general");
        let (a, _) = registry.subscribe(id.clone(), args.clone(), noop());
        registry.unsubscribe(a);
        let (b, _) = registry.subscribe(id, args, noop());
        assert_ne!(a.query_id(), b.query_id());
    }

    #[test]
    fn notify_reaches_all_listeners() {
        let mut registry = SubscriptionRegistry::new();
        let (id, args) = identity("general");
        let calls = Arc::new(Mutex::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let (handle, _) = registry.subscribe(
                id.clone(),
                args.clone(),
                Box::new(move |_: &QuerySnapshot| *calls.lock() += 1),
            );
            handles.push(handle);
        }

        let snapshot = QuerySnapshot::loading();
        assert_eq!(registry.notify(handles[0].query_id(), &snapshot), 3);
        registry.notify_one(handles[1], &snapshot);
        assert_eq!(*calls.lock(), 4);
    }

    #[test]
    fn replay_lists_every_record() {
        let mut registry = SubscriptionRegistry::new();
        for channel in ["a", "b", "c"] {
            let (id, args) = identity(channel);
            registry.subscribe(id, args, noop());
        }
        let all = registry.all_subscriptions();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|s| s.function_path == "messages.list"));
    }
}
