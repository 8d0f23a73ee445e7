//! Relay supervisor.
//!
//! Builds the session worker, the gateway and the dispatcher, wires them
//! together with channels and owns the process-wide cancellation token. A
//! session worker that panics is started again on the same command queue.
//!
//! ```text
//! client ─► ClientGateway ─(commands)─► UpstreamSession ─► upstream
//!   ▲                                        │
//!   └──────── EventDispatcher ◄──(events)────┘
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use super::dispatcher::{EventDispatcher, RoutingMode};
use super::gateway::{ClientGateway, NotConnectedPolicy};
use super::registry::ClientRegistry;
use crate::core::realtime::{
    CommandQueue, ConnectionState, RealtimeError, RealtimeResult, SessionConfig, StateObserver,
    UpstreamConfig, UpstreamSession,
};

/// Default time allowed for the worker tasks to stop.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause before a panicked worker is started again.
const WORKER_RESTART_DELAY: Duration = Duration::from_millis(500);

/// Everything needed to start a relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upstream endpoint, credential and reconnection policy
    pub upstream: UpstreamConfig,
    /// Default session configuration for every upstream connection
    pub session: SessionConfig,
    /// Which clients receive upstream events
    pub routing: RoutingMode,
    /// Behaviour for audio arriving while disconnected
    pub not_connected: NotConnectedPolicy,
    /// Capacity of the gateway -> session worker queue
    pub command_queue_capacity: usize,
    /// Capacity of the session worker -> dispatcher queue
    pub event_queue_capacity: usize,
    /// Capacity of each client's outbound channel
    pub client_channel_capacity: usize,
    /// Open the upstream connection at startup. Always on under
    /// [`NotConnectedPolicy::Drop`].
    pub eager_connect: bool,
    /// Send `turn_done` messages to clients
    pub notify_turn_done: bool,
    /// Time allowed for the worker tasks to stop
    pub shutdown_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            session: SessionConfig::default(),
            routing: RoutingMode::default(),
            not_connected: NotConnectedPolicy::default(),
            command_queue_capacity: 256,
            event_queue_capacity: 256,
            client_channel_capacity: 1024,
            eager_connect: true,
            notify_turn_done: true,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Running relay.
pub struct RelaySupervisor {
    gateway: ClientGateway,
    observer: StateObserver,
    shutdown: CancellationToken,
    session_task: JoinHandle<()>,
    dispatcher_task: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl RelaySupervisor {
    /// Spawn the session worker and the dispatcher.
    ///
    /// Must be called inside a tokio runtime. Cancelling `shutdown` stops
    /// every task; [`shutdown`](Self::shutdown) also waits for them.
    pub fn start(config: RelayConfig, shutdown: CancellationToken) -> RealtimeResult<Self> {
        if config.command_queue_capacity == 0 || config.event_queue_capacity == 0 {
            return Err(RealtimeError::InvalidConfiguration(
                "queue capacities must be greater than zero".to_string(),
            ));
        }

        // Never run itself; every worker run starts from a replica
        let template = UpstreamSession::new(config.upstream)?;
        let observer = template.observer();

        let (command_tx, command_rx) = mpsc::channel(config.command_queue_capacity);
        let commands: CommandQueue = Arc::new(Mutex::new(command_rx));
        let (event_tx, event_rx) = mpsc::channel(config.event_queue_capacity);

        let clients = Arc::new(ClientRegistry::new());
        let session_config = Arc::new(config.session);

        let gateway = ClientGateway::new(
            Arc::clone(&clients),
            command_tx,
            Arc::clone(&session_config),
            config.not_connected,
            config.client_channel_capacity,
            shutdown.clone(),
        );
        let dispatcher = EventDispatcher::new(clients, config.routing, config.notify_turn_done);

        // Under the drop policy no client audio ever opens a connection, so
        // the worker holds one open on its own
        let keep_open = config.not_connected == NotConnectedPolicy::Drop;
        let eager_connect = config.eager_connect || keep_open;
        let eager = eager_connect.then(|| Arc::clone(&session_config));

        let worker_shutdown = shutdown.clone();
        let session_task = tokio::spawn(supervise("session worker", shutdown.clone(), move || {
            template.replica().run(
                Arc::clone(&commands),
                event_tx.clone(),
                worker_shutdown.clone(),
                eager.clone(),
                keep_open,
            )
        }));
        // Stops once the session worker drops its event sender
        let dispatcher_task = tokio::spawn(dispatcher.run(event_rx));

        info!(
            routing = %config.routing,
            not_connected = %config.not_connected,
            eager_connect,
            keep_open,
            "Relay started"
        );

        Ok(Self {
            gateway,
            observer,
            shutdown,
            session_task,
            dispatcher_task,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    pub fn gateway(&self) -> &ClientGateway {
        &self.gateway
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.observer.current()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.observer.watch()
    }

    /// Every upstream state transition published from now on.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.observer.subscribe_transitions()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel all work, wait for the worker and dispatcher, then close every
    /// client session.
    pub async fn shutdown(self) {
        info!("Shutting down relay");
        self.shutdown.cancel();

        let deadline = Instant::now() + self.shutdown_timeout;
        join_with_deadline("session worker", self.session_task, deadline).await;
        join_with_deadline("event dispatcher", self.dispatcher_task, deadline).await;

        self.gateway.close_all("relay shutting down");
        info!("Relay stopped");
    }
}

/// Run the task built by `spawn` until it returns, building and starting it
/// again whenever it panics. No restart happens once `shutdown` fires.
async fn supervise<F, Fut>(name: &'static str, shutdown: CancellationToken, mut spawn: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut restarts: u32 = 0;

    loop {
        // Aborted along with this task if shutdown gives up waiting
        match AbortOnDropHandle::new(tokio::spawn(spawn())).await {
            Ok(()) => return,
            Err(e) if e.is_panic() => {
                error!(task = name, restarts, "Task panicked");
            }
            Err(e) => {
                warn!(task = name, error = %e, "Task cancelled");
                return;
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(WORKER_RESTART_DELAY) => {}
        }

        restarts += 1;
        info!(task = name, restarts, "Restarting task");
    }
}

async fn join_with_deadline(name: &'static str, mut handle: JoinHandle<()>, deadline: Instant) {
    match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(Ok(())) => debug!(task = name, "Task stopped"),
        Ok(Err(e)) => error!(task = name, error = %e, "Task failed"),
        Err(_) => {
            warn!(task = name, "Task did not stop in time, aborting");
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::core::realtime::{ApiKey, ClientId, ReconnectionConfig};
    use crate::core::relay::ClientRoute;

    fn offline_config() -> RelayConfig {
        RelayConfig {
            upstream: UpstreamConfig {
                api_key: ApiKey::new("test_key"),
                endpoint: "ws://127.0.0.1:1/v1/realtime".to_string(),
                reconnection: ReconnectionConfig {
                    initial_delay_ms: 60_000,
                    ..Default::default()
                },
                ..Default::default()
            },
            eager_connect: false,
            shutdown_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_requires_api_key() {
        let mut config = offline_config();
        config.upstream.api_key = ApiKey::default();

        let result = RelaySupervisor::start(config, CancellationToken::new());
        assert!(matches!(result, Err(RealtimeError::AuthenticationFailed(_))));
    }

    #[tokio::test]
    async fn test_zero_capacity_rejected() {
        let mut config = offline_config();
        config.command_queue_capacity = 0;

        let result = RelaySupervisor::start(config, CancellationToken::new());
        assert!(matches!(result, Err(RealtimeError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let supervisor = RelaySupervisor::start(offline_config(), CancellationToken::new()).unwrap();
        assert_eq!(supervisor.connection_state(), ConnectionState::Disconnected);

        let mut rx = supervisor
            .gateway()
            .on_client_connect(ClientId::new_v4())
            .unwrap();
        let token = supervisor.shutdown_token();

        tokio::time::timeout(Duration::from_secs(5), supervisor.shutdown())
            .await
            .expect("shutdown should complete");

        assert!(token.is_cancelled());
        let mut saw_close = false;
        while let Some(route) = rx.recv().await {
            if route == ClientRoute::Close {
                saw_close = true;
            }
        }
        assert!(saw_close);
    }

    #[tokio::test]
    async fn test_eager_connect_backoff_interrupted_by_shutdown() {
        let mut config = offline_config();
        config.eager_connect = true;
        let supervisor = RelaySupervisor::start(config, CancellationToken::new()).unwrap();

        // Give the eager attempt time to fail and enter its 60s backoff
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(5), supervisor.shutdown())
            .await
            .expect("shutdown should not wait for the backoff delay");
    }

    #[tokio::test]
    async fn test_drop_policy_connects_at_startup() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = offline_config();
        config.upstream.endpoint = format!("ws://{}/v1/realtime", listener.local_addr().unwrap());
        config.not_connected = NotConnectedPolicy::Drop;
        let supervisor = RelaySupervisor::start(config, CancellationToken::new()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("worker should connect without client audio")
            .unwrap();

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicked_task_restarted_on_same_queue() {
        let (tx, rx) = mpsc::channel::<u8>(4);
        let queue = Arc::new(Mutex::new(rx));
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        let task = tokio::spawn(supervise("test worker", CancellationToken::new(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let queue = Arc::clone(&queue);
            let seen = seen_tx.clone();
            async move {
                let mut queue = queue.lock().await;
                while let Some(n) = queue.recv().await {
                    if n == 0 {
                        panic!("worker failure");
                    }
                    let _ = seen.send(n);
                }
            }
        }));

        tx.send(0).await.unwrap();
        tx.send(7).await.unwrap();
        let seen = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .expect("restarted task should drain the queue");
        assert_eq!(seen, Some(7));

        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("task should stop once the queue closes")
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_restart_after_shutdown() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        tokio::time::timeout(
            Duration::from_secs(5),
            supervise("test worker", shutdown, move || {
                let run = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if run < 10 {
                        panic!("worker failure");
                    }
                }
            }),
        )
        .await
        .expect("supervise should return");

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
