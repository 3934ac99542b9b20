//! Tokio driver for the sync engine.
//!
//! One task owns the [`SyncEngine`]. Application code talks to it through
//! a cloneable [`Client`] that sends commands over a channel; transport
//! events arrive on a second channel, and the task sleeps until the
//! engine's next timer deadline in between.

use crate::clock::SystemClock;
use crate::config::ClientConfig;
use crate::connection::{ConnectionState, StateObserver};
use crate::engine::{AuthErrorHandler, ClientStats, SyncEngine};
use crate::error::{ClientError, ClientResult};
use crate::mutations::PendingResult;
use crate::registry::{Listener, SubscriptionHandle};
use crate::store::{LocalQueryView, OptimisticUpdate, QuerySnapshot};
use crate::transport::{Transport, TransportEvents};
use crate::ws::WebSocketTransport;
use livequery_codec::Value;
use livequery_protocol::QueryId;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

enum Command {
    Subscribe {
        function_path: String,
        args: Value,
        listener: Listener,
        reply: oneshot::Sender<ClientResult<SubscriptionHandle>>,
    },
    Mutate {
        function_path: String,
        args: Value,
        update: Option<OptimisticUpdate>,
        reply: oneshot::Sender<ClientResult<PendingResult>>,
    },
    Action {
        function_path: String,
        args: Value,
        reply: oneshot::Sender<ClientResult<PendingResult>>,
    },
    SetAuth {
        token: Option<String>,
        on_error: Option<AuthErrorHandler>,
        reply: oneshot::Sender<()>,
    },
    Observe {
        observer: StateObserver,
        reply: oneshot::Sender<()>,
    },
    GetResult {
        function_path: String,
        args: Value,
        reply: oneshot::Sender<Option<QuerySnapshot>>,
    },
    Stats {
        reply: oneshot::Sender<ClientStats>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running sync engine. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::Sender<Command>,
    releases: mpsc::UnboundedSender<SubscriptionHandle>,
}

impl Client {
    /// Connects to `config.url` over WebSocket.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a non-WebSocket URL.
    pub fn connect(config: ClientConfig) -> ClientResult<Self> {
        let (transport, events) = WebSocketTransport::new(config.url.clone())?;
        Ok(Self::spawn(config, transport, events))
    }

    /// Spawns the engine task over any transport and starts connecting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<T: Transport>(config: ClientConfig, transport: T, events: TransportEvents) -> Self {
        let (commands, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let (releases, release_rx) = mpsc::unbounded_channel();
        let engine = SyncEngine::new(&config, transport);
        tokio::spawn(run(engine, command_rx, release_rx, events));
        Self { commands, releases }
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> ClientResult<R> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| ClientError::EngineStopped)?;
        response.await.map_err(|_| ClientError::EngineStopped)
    }

    /// Subscribes `listener` to `function_path(args)`.
    ///
    /// The listener runs on the engine task. Dropping the returned
    /// [`Subscription`] unsubscribes.
    pub async fn subscribe<F>(
        &self,
        function_path: &str,
        args: Value,
        listener: F,
    ) -> ClientResult<Subscription>
    where
        F: FnMut(&QuerySnapshot) + Send + 'static,
    {
        let handle = self
            .request(|reply| Command::Subscribe {
                function_path: function_path.to_string(),
                args,
                listener: Box::new(listener),
                reply,
            })
            .await??;
        Ok(Subscription {
            handle,
            releases: self.releases.clone(),
        })
    }

    /// Subscribes and returns a stream of snapshots.
    pub async fn watch(&self, function_path: &str, args: Value) -> ClientResult<QueryWatch> {
        let (tx, updates) = mpsc::unbounded_channel();
        let subscription = self
            .subscribe(function_path, args, move |snapshot| {
                let _ = tx.send(snapshot.clone());
            })
            .await?;
        Ok(QueryWatch {
            subscription,
            updates,
        })
    }

    /// Runs a mutation and waits for its confirmed result.
    pub async fn mutate(&self, function_path: &str, args: Value) -> ClientResult<Value> {
        self.start_mutation(function_path, args, None).await?.await
    }

    /// Runs a mutation with an optimistic update and waits for its
    /// confirmed result.
    pub async fn mutate_with<F>(
        &self,
        function_path: &str,
        args: Value,
        optimistic_update: F,
    ) -> ClientResult<Value>
    where
        F: Fn(&mut LocalQueryView<'_>) + Send + 'static,
    {
        self.start_mutation(function_path, args, Some(Box::new(optimistic_update)))
            .await?
            .await
    }

    /// Queues a mutation and returns its pending result without waiting.
    pub async fn start_mutation(
        &self,
        function_path: &str,
        args: Value,
        optimistic_update: Option<OptimisticUpdate>,
    ) -> ClientResult<PendingResult> {
        self.request(|reply| Command::Mutate {
            function_path: function_path.to_string(),
            args,
            update: optimistic_update,
            reply,
        })
        .await?
    }

    /// Runs an action and waits for its result.
    pub async fn action(&self, function_path: &str, args: Value) -> ClientResult<Value> {
        self.request(|reply| Command::Action {
            function_path: function_path.to_string(),
            args,
            reply,
        })
        .await??
        .await
    }

    /// Sets the auth token, optionally with a rejection callback.
    pub async fn set_auth_token(
        &self,
        token: impl Into<String>,
        on_error: Option<AuthErrorHandler>,
    ) -> ClientResult<()> {
        let token = token.into();
        self.request(|reply| Command::SetAuth {
            token: Some(token),
            on_error,
            reply,
        })
        .await
    }

    /// Clears the auth token.
    pub async fn clear_auth(&self) -> ClientResult<()> {
        self.request(|reply| Command::SetAuth {
            token: None,
            on_error: None,
            reply,
        })
        .await
    }

    /// Registers a connection state observer. It runs on the engine task.
    pub async fn on_connection_state_change<F>(&self, observer: F) -> ClientResult<()>
    where
        F: FnMut(ConnectionState) + Send + 'static,
    {
        self.request(|reply| Command::Observe {
            observer: Box::new(observer),
            reply,
        })
        .await
    }

    /// Current snapshot of a subscribed query.
    pub async fn get_result(
        &self,
        function_path: &str,
        args: Value,
    ) -> ClientResult<Option<QuerySnapshot>> {
        self.request(|reply| Command::GetResult {
            function_path: function_path.to_string(),
            args,
            reply,
        })
        .await
    }

    /// Current engine statistics.
    pub async fn stats(&self) -> ClientResult<ClientStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Current connection state.
    pub async fn connection_state(&self) -> ClientResult<ConnectionState> {
        Ok(self.stats().await?.connection_state)
    }

    /// Closes the engine. Pending requests are rejected with
    /// `EngineClosed`.
    pub async fn close(&self) -> ClientResult<()> {
        self.request(|reply| Command::Close { reply }).await
    }
}

/// A live subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    handle: SubscriptionHandle,
    releases: mpsc::UnboundedSender<SubscriptionHandle>,
}

impl Subscription {
    /// The engine-level handle.
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    /// The query this subscription listens to.
    pub fn query_id(&self) -> QueryId {
        self.handle.query_id()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.releases.send(self.handle);
    }
}

/// Stream of snapshots for one subscription.
#[derive(Debug)]
pub struct QueryWatch {
    subscription: Subscription,
    updates: mpsc::UnboundedReceiver<QuerySnapshot>,
}

impl QueryWatch {
    /// Waits for the next snapshot.
    pub async fn next(&mut self) -> Option<QuerySnapshot> {
        self.updates.recv().await
    }

    /// Waits until a snapshot with a value arrives and returns the value.
    pub async fn next_value(&mut self) -> Option<Value> {
        loop {
            if let Some(value) = self.next().await?.result.value() {
                return Some(value.clone());
            }
        }
    }

    /// The underlying subscription.
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

fn handle_command<T: Transport>(engine: &mut SyncEngine<T, SystemClock>, command: Command) {
    match command {
        Command::Subscribe {
            function_path,
            args,
            listener,
            reply,
        } => {
            let _ = reply.send(engine.subscribe(&function_path, args, listener));
        }
        Command::Mutate {
            function_path,
            args,
            update,
            reply,
        } => {
            let _ = reply.send(engine.mutate(&function_path, args, update));
        }
        Command::Action {
            function_path,
            args,
            reply,
        } => {
            let _ = reply.send(engine.action(&function_path, args));
        }
        Command::SetAuth {
            token,
            on_error,
            reply,
        } => {
            match token {
                Some(token) => engine.set_auth_token(token, on_error),
                None => engine.clear_auth(),
            }
            let _ = reply.send(());
        }
        Command::Observe { observer, reply } => {
            engine.on_connection_state_change(observer);
            let _ = reply.send(());
        }
        Command::GetResult {
            function_path,
            args,
            reply,
        } => {
            let _ = reply.send(engine.get_result(&function_path, &args));
        }
        Command::Stats { reply } => {
            let _ = reply.send(engine.stats());
        }
        Command::Close { reply } => {
            engine.close();
            let _ = reply.send(());
        }
    }
}

async fn run<T: Transport>(
    mut engine: SyncEngine<T, SystemClock>,
    mut commands: mpsc::Receiver<Command>,
    mut releases: mpsc::UnboundedReceiver<SubscriptionHandle>,
    mut events: TransportEvents,
) {
    info!("sync engine task started");
    engine.connect();
    loop {
        let deadline = engine.next_deadline();
        tokio::select! {
            // Releases first so a dropped subscription is handled before
            // later commands from the same caller.
            biased;
            Some(handle) = releases.recv() => {
                engine.unsubscribe(handle);
            }
            command = commands.recv() => match command {
                Some(command) => handle_command(&mut engine, command),
                None => break,
            },
            Some(event) = events.recv() => engine.handle_transport_event(event),
            () = sleep_until(deadline) => engine.tick(),
        }
    }
    debug!("all client handles dropped");
    engine.close();
    info!("sync engine task stopped");
}
