//! Optimistic mutation queue.
//!
//! Tracks every outgoing mutation and action from creation to resolution.
//! A request moves Queued -> InFlight -> (AwaitingTransition) -> resolved
//! and is never retried. Overlay bookkeeping lives in the store; the queue
//! reports which requests' overlays must go.

use crate::error::{ClientError, ClientResult};
use livequery_codec::Value;
use livequery_protocol::{LogPosition, Outcome, RequestId};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Kind of outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Transactional write whose effects arrive as a transition.
    Mutation,
    /// Non-transactional call; resolves on its response alone.
    Action,
}

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Buffered, not yet transmitted.
    Queued,
    /// Transmitted, no response yet.
    InFlight,
    /// Succeeded; waiting for the store to reach this position.
    AwaitingTransition(LogPosition),
}

struct PendingRequest {
    kind: RequestKind,
    function_path: String,
    state: RequestState,
    value: Option<Value>,
    sender: oneshot::Sender<ClientResult<Value>>,
}

/// Eventual result of a mutation or action.
///
/// Await it from async code, or poll it with [`PendingResult::try_result`].
#[derive(Debug)]
pub struct PendingResult {
    request_id: RequestId,
    receiver: oneshot::Receiver<ClientResult<Value>>,
    done: Option<ClientResult<Value>>,
}

impl PendingResult {
    /// ID of the underlying request.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Returns the result if the request is resolved.
    pub fn try_result(&mut self) -> Option<ClientResult<Value>> {
        if self.done.is_none() {
            match self.receiver.try_recv() {
                Ok(result) => self.done = Some(result),
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.done = Some(Err(ClientError::EngineStopped));
                }
            }
        }
        self.done.clone()
    }

    /// Returns true once the request is resolved.
    pub fn is_resolved(&mut self) -> bool {
        self.try_result().is_some()
    }
}

impl Future for PendingResult {
    type Output = ClientResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(done) = self.done.take() {
            return Poll::Ready(done);
        }
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ClientError::EngineStopped)))
    }
}

/// What a response did to its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseEffect {
    /// No matching request; ignored.
    Unknown,
    /// Resolved or rejected now.
    Resolved,
    /// Waiting for the store to reach the position.
    Awaiting,
}

#[derive(Default)]
pub(crate) struct MutationQueue {
    next_id: u64,
    requests: BTreeMap<RequestId, PendingRequest>,
    resolved: u64,
    rejected: u64,
}

impl MutationQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enqueue(
        &mut self,
        kind: RequestKind,
        function_path: &str,
    ) -> (RequestId, PendingResult) {
        let request_id = RequestId::new(self.next_id);
        self.next_id += 1;
        let (sender, receiver) = oneshot::channel();
        self.requests.insert(
            request_id,
            PendingRequest {
                kind,
                function_path: function_path.to_string(),
                state: RequestState::Queued,
                value: None,
                sender,
            },
        );
        (
            request_id,
            PendingResult {
                request_id,
                receiver,
                done: None,
            },
        )
    }

    pub(crate) fn mark_in_flight(&mut self, ids: &[RequestId]) {
        for id in ids {
            if let Some(request) = self.requests.get_mut(id) {
                if request.state == RequestState::Queued {
                    request.state = RequestState::InFlight;
                }
            }
        }
    }

    pub(crate) fn state(&self, id: RequestId) -> Option<RequestState> {
        self.requests.get(&id).map(|request| request.state)
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }

    pub(crate) fn count(&self, state: RequestState) -> usize {
        self.requests.values().filter(|r| r.state == state).count()
    }

    pub(crate) fn resolved_count(&self) -> u64 {
        self.resolved
    }

    pub(crate) fn rejected_count(&self) -> u64 {
        self.rejected
    }

    fn finish(&mut self, id: RequestId, result: ClientResult<Value>) {
        if let Some(request) = self.requests.remove(&id) {
            if result.is_ok() {
                self.resolved += 1;
            } else {
                self.rejected += 1;
            }
            debug!(request_id = %id, path = %request.function_path, ok = result.is_ok(), "request finished");
            // The caller may have dropped the pending result.
            let _ = request.sender.send(result);
        }
    }

    /// Handles a mutation response given the store's current position.
    pub(crate) fn on_mutation_response(
        &mut self,
        id: RequestId,
        outcome: Outcome,
        position: Option<LogPosition>,
        current: LogPosition,
    ) -> ResponseEffect {
        let Some(request) = self.requests.get_mut(&id) else {
            warn!(request_id = %id, "mutation response for unknown request ignored");
            return ResponseEffect::Unknown;
        };
        if request.kind != RequestKind::Mutation || request.state != RequestState::InFlight {
            warn!(request_id = %id, state = ?request.state, "unexpected mutation response ignored");
            return ResponseEffect::Unknown;
        }
        match (outcome, position) {
            (Err(failure), _) => {
                self.finish(id, Err(failure.into()));
                ResponseEffect::Resolved
            }
            (Ok(value), Some(position)) if position > current => {
                request.state = RequestState::AwaitingTransition(position);
                request.value = Some(value);
                ResponseEffect::Awaiting
            }
            (Ok(value), _) => {
                self.finish(id, Ok(value));
                ResponseEffect::Resolved
            }
        }
    }

    /// Handles an action response.
    pub(crate) fn on_action_response(&mut self, id: RequestId, outcome: Outcome) -> ResponseEffect {
        match self.requests.get(&id) {
            Some(request)
                if request.kind == RequestKind::Action
                    && request.state == RequestState::InFlight => {}
            _ => {
                warn!(request_id = %id, "action response for unknown request ignored");
                return ResponseEffect::Unknown;
            }
        }
        self.finish(id, outcome.map_err(ClientError::from));
        ResponseEffect::Resolved
    }

    /// Resolves every request whose transition the store has reached.
    pub(crate) fn resolve_reached(&mut self, position: LogPosition) -> Vec<RequestId> {
        let reached: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, r)| matches!(r.state, RequestState::AwaitingTransition(p) if p <= position))
            .map(|(id, _)| *id)
            .collect();
        for id in &reached {
            let value = self
                .requests
                .get_mut(id)
                .and_then(|r| r.value.take())
                .unwrap_or_default();
            self.finish(*id, Ok(value));
        }
        reached
    }

    /// The connection dropped. In-flight requests are rejected, requests
    /// waiting for their transition are resolved, queued ones stay.
    /// Returns every finished request.
    pub(crate) fn on_connection_lost(&mut self) -> Vec<RequestId> {
        let affected: Vec<(RequestId, RequestState)> = self
            .requests
            .iter()
            .filter(|(_, r)| r.state != RequestState::Queued)
            .map(|(id, r)| (*id, r.state))
            .collect();
        for (id, state) in &affected {
            if *state == RequestState::InFlight {
                self.finish(*id, Err(ClientError::ConnectionLost));
            } else {
                let value = self
                    .requests
                    .get_mut(id)
                    .and_then(|r| r.value.take())
                    .unwrap_or_default();
                self.finish(*id, Ok(value));
            }
        }
        affected.into_iter().map(|(id, _)| id).collect()
    }

    /// Rejects every outstanding request.
    pub(crate) fn reject_all(&mut self, error: &ClientError) -> Vec<RequestId> {
        let ids: Vec<RequestId> = self.requests.keys().copied().collect();
        for id in &ids {
            self.finish(*id, Err(error.clone()));
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livequery_protocol::ServerFailure;

    #[test]
    fn request_ids_are_monotonic() {
        let mut queue = MutationQueue::new();
        let (a, _) = queue.enqueue(RequestKind::Mutation, "a");
        let (b, _) = queue.enqueue(RequestKind::Action, "b");
        assert!(b > a);
        assert_eq!(queue.state(a), Some(RequestState::Queued));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn success_waits_for_position() {
        let mut queue = MutationQueue::new();
        let (id, mut pending) = queue.enqueue(RequestKind::Mutation, "messages.send");
        queue.mark_in_flight(&[id]);

        let effect = queue.on_mutation_response(
            id,
            Ok(Value::from("m1")),
            Some(LogPosition::new(3)),
            LogPosition::new(1),
        );
        assert_eq!(effect, ResponseEffect::Awaiting);
        assert_eq!(pending.try_result(), None);
        assert_eq!(
            queue.state(id),
            Some(RequestState::AwaitingTransition(LogPosition::new(3)))
        );

        assert!(queue.resolve_reached(LogPosition::new(2)).is_empty());
        assert_eq!(queue.resolve_reached(LogPosition::new(3)), vec![id]);
        assert_eq!(pending.try_result(), Some(Ok(Value::from("m1"))));
        // Stays resolved.
        assert_eq!(pending.try_result(), Some(Ok(Value::from("m1"))));
    }

    #[test]
    fn success_at_reached_position_resolves_now() {
        let mut queue = MutationQueue::new();
        let (id, mut pending) = queue.enqueue(RequestKind::Mutation, "f");
        queue.mark_in_flight(&[id]);
        let effect = queue.on_mutation_response(
            id,
            Ok(Value::Null),
            Some(LogPosition::new(2)),
            LogPosition::new(2),
        );
        assert_eq!(effect, ResponseEffect::Resolved);
        assert!(pending.is_resolved());
    }

    #[test]
    fn error_rejects_and_duplicates_ignored() {
        let mut queue = MutationQueue::new();
        let (id, mut pending) = queue.enqueue(RequestKind::Mutation, "f");
        queue.mark_in_flight(&[id]);

        let failure = ServerFailure::new("denied");
        assert_eq!(
            queue.on_mutation_response(id, Err(failure.clone()), None, LogPosition::INITIAL),
            ResponseEffect::Resolved
        );
        assert_eq!(
            queue.on_mutation_response(id, Ok(Value::Null), None, LogPosition::INITIAL),
            ResponseEffect::Unknown
        );
        assert_eq!(pending.try_result(), Some(Err(ClientError::from(failure))));
        assert_eq!(queue.rejected_count(), 1);
    }

    #[test]
    fn connection_loss_partitions_by_state() {
        let mut queue = MutationQueue::new();
        let (queued, mut queued_result) = queue.enqueue(RequestKind::Mutation, "q");
        let (in_flight, mut in_flight_result) = queue.enqueue(RequestKind::Mutation, "i");
        let (awaiting, mut awaiting_result) = queue.enqueue(RequestKind::Mutation, "a");
        queue.mark_in_flight(&[in_flight, awaiting]);
        queue.on_mutation_response(
            awaiting,
            Ok(Value::from(1)),
            Some(LogPosition::new(9)),
            LogPosition::INITIAL,
        );

        let finished = queue.on_connection_lost();
        assert_eq!(finished, vec![in_flight, awaiting]);
        assert_eq!(in_flight_result.try_result(), Some(Err(ClientError::ConnectionLost)));
        assert_eq!(awaiting_result.try_result(), Some(Ok(Value::from(1))));
        assert_eq!(queued_result.try_result(), None);
        assert_eq!(queue.state(queued), Some(RequestState::Queued));
    }

    #[test]
    fn actions_resolve_on_response() {
        let mut queue = MutationQueue::new();
        let (id, mut pending) = queue.enqueue(RequestKind::Action, "email.send");
        queue.mark_in_flight(&[id]);
        assert_eq!(
            queue.on_mutation_response(id, Ok(Value::Null), None, LogPosition::INITIAL),
            ResponseEffect::Unknown
        );
        assert_eq!(
            queue.on_action_response(id, Ok(Value::from(true))),
            ResponseEffect::Resolved
        );
        assert_eq!(pending.try_result(), Some(Ok(Value::from(true))));
    }

    #[test]
    fn reject_all_on_close() {
        let mut queue = MutationQueue::new();
        let (_, mut a) = queue.enqueue(RequestKind::Mutation, "a");
        let (_, mut b) = queue.enqueue(RequestKind::Action, "b");
        assert_eq!(queue.reject_all(&ClientError::EngineClosed).len(), 2);
        assert_eq!(a.try_result(), Some(Err(ClientError::EngineClosed)));
        assert_eq!(b.try_result(), Some(Err(ClientError::EngineClosed)));
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn pending_result_is_a_future() {
        let mut queue = MutationQueue::new();
        let (id, pending) = queue.enqueue(RequestKind::Action, "f");
        queue.mark_in_flight(&[id]);
        queue.on_action_response(id, Ok(Value::from(7)));
        assert_eq!(pending.await, Ok(Value::from(7)));

        let (_, orphan) = queue.enqueue(RequestKind::Action, "g");
        drop(queue);
        assert_eq!(orphan.await, Err(ClientError::EngineStopped));
    }
}
