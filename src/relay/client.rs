use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::messages::Frame;
use super::types::{InboundEvent, RELAY_CONNECTED, RelayError, Signaling, SubscriptionId};
use crate::config::RelayConfig;

/// Commands sent to the connection task
pub(crate) enum RelayCommand {
    Emit {
        event: String,
        data: Value,
    },
    Request {
        event: String,
        data: Value,
        reply: oneshot::Sender<Result<Value, RelayError>>,
    },
    Subscribe {
        id: SubscriptionId,
        events: Vec<String>,
        sink: async_channel::Sender<InboundEvent>,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
}

pub struct RelayClient;

impl RelayClient {
    /// Spawn the connection task and return a handle to it.
    ///
    /// The task keeps reconnecting until every handle has been dropped.
    pub fn connect(config: &RelayConfig) -> RelayHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(relay_task(config.clone(), rx));
        RelayHandle {
            tx,
            next_subscription: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// Handle to communicate with the connection task
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<RelayCommand>,
    next_subscription: Arc<AtomicU64>,
}

impl Signaling for RelayHandle {
    fn emit(&self, event: &str, payload: Value) -> Result<(), RelayError> {
        self.tx
            .send(RelayCommand::Emit {
                event: event.to_string(),
                data: payload,
            })
            .map_err(|_| RelayError::Closed)
    }

    fn request(
        &self,
        event: &str,
        payload: Value,
    ) -> impl Future<Output = Result<Value, RelayError>> + Send {
        let (reply, reply_rx) = oneshot::channel();
        let sent = self
            .tx
            .send(RelayCommand::Request {
                event: event.to_string(),
                data: payload,
                reply,
            })
            .map_err(|_| RelayError::Closed);
        async move {
            sent?;
            reply_rx.await.map_err(|_| RelayError::ConnectionLost)?
        }
    }

    fn subscribe(
        &self,
        events: &[&str],
        sink: async_channel::Sender<InboundEvent>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let sent = self.tx.send(RelayCommand::Subscribe {
            id,
            events: events.iter().map(|e| e.to_string()).collect(),
            sink,
        });
        if sent.is_err() {
            warn!("Relay task stopped, subscription {} will stay silent", id);
        }
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let _ = self.tx.send(RelayCommand::Unsubscribe { id });
    }
}

struct Subscription {
    events: Vec<String>,
    sink: async_channel::Sender<InboundEvent>,
}

/// Subscriber table; outlives individual connections
#[derive(Default)]
struct Registry {
    subscriptions: HashMap<SubscriptionId, Subscription>,
}

impl Registry {
    fn dispatch(&mut self, event: InboundEvent) {
        let mut closed = Vec::new();
        for (id, sub) in &self.subscriptions {
            if !sub.events.iter().any(|e| *e == event.name) {
                continue;
            }
            match sub.sink.try_send(event.clone()) {
                Ok(()) => {}
                Err(async_channel::TrySendError::Full(_)) => {
                    warn!("Subscriber {} lagging, dropped '{}'", id, event.name);
                }
                Err(async_channel::TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            debug!("Subscriber {} gone", id);
            self.subscriptions.remove(&id);
        }
    }

    /// Apply a command while no socket is open
    fn handle_offline(&mut self, cmd: RelayCommand) {
        match cmd {
            RelayCommand::Emit { event, .. } => {
                warn!("Dropping '{}' while disconnected", event);
            }
            RelayCommand::Request { event, reply, .. } => {
                debug!("Rejecting '{}' request while disconnected", event);
                let _ = reply.send(Err(RelayError::NotConnected));
            }
            other => self.handle_subscription(other),
        }
    }

    fn handle_subscription(&mut self, cmd: RelayCommand) {
        match cmd {
            RelayCommand::Subscribe { id, events, sink } => {
                self.subscriptions.insert(id, Subscription { events, sink });
            }
            RelayCommand::Unsubscribe { id } => {
                self.subscriptions.remove(&id);
            }
            _ => {}
        }
    }
}

/// Doubling reconnect delay, capped
struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}

async fn relay_task(config: RelayConfig, mut rx: mpsc::UnboundedReceiver<RelayCommand>) {
    let mut registry = Registry::default();
    let mut backoff = Backoff::new(config.reconnect_base_delay, config.reconnect_max_delay);

    loop {
        let connect = tokio_tungstenite::connect_async(config.server_url.as_str());
        let Some(result) = drive_offline(connect, &mut rx, &mut registry).await else {
            break;
        };

        match result {
            Ok((ws_stream, _)) => {
                info!("Connected to signaling server {}", config.server_url);
                backoff.reset();
                registry.dispatch(InboundEvent::new(RELAY_CONNECTED, Value::Null));

                if run_connection(ws_stream, &mut rx, &mut registry).await.is_none() {
                    break;
                }
                warn!("Signaling connection lost, reconnecting");
            }
            Err(e) => {
                debug!("Connect to {} failed: {}", config.server_url, e);
            }
        }

        let delay = backoff.next_delay();
        let sleep = tokio::time::sleep(delay);
        if drive_offline(sleep, &mut rx, &mut registry).await.is_none() {
            break;
        }
    }

    info!("Relay task stopped");
}

/// Poll `fut` while servicing commands in offline mode.
/// Returns `None` once every handle is gone.
async fn drive_offline<F: Future>(
    fut: F,
    rx: &mut mpsc::UnboundedReceiver<RelayCommand>,
    registry: &mut Registry,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Some(out),
            cmd = rx.recv() => match cmd {
                Some(cmd) => registry.handle_offline(cmd),
                None => return None,
            },
        }
    }
}

/// Pump one live socket. `Some(())` means the socket closed and the caller
/// should reconnect; `None` means every handle is gone.
async fn run_connection<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    rx: &mut mpsc::UnboundedReceiver<RelayCommand>,
    registry: &mut Registry,
) -> Option<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    // Dropping this map fails every outstanding request with ConnectionLost
    let mut pending: HashMap<u64, oneshot::Sender<Result<Value, RelayError>>> = HashMap::new();
    let mut next_ack: u64 = 1;

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let frame = match cmd {
                    None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return None;
                    }
                    Some(RelayCommand::Emit { event, data }) => Frame::event(event, data),
                    Some(RelayCommand::Request { event, data, reply }) => {
                        let id = next_ack;
                        next_ack += 1;
                        pending.insert(id, reply);
                        Frame::request(event, data, id)
                    }
                    Some(other) => {
                        registry.handle_subscription(other);
                        continue;
                    }
                };

                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode frame: {}", e);
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    return Some(());
                }
            }

            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        return Some(());
                    }
                    None => return Some(()),
                };

                match msg {
                    Message::Text(text) => {
                        let frame: Frame = match serde_json::from_str(text.as_str()) {
                            Ok(f) => f,
                            Err(e) => {
                                warn!("Ignoring malformed frame: {}", e);
                                continue;
                            }
                        };
                        match frame {
                            Frame::Event { event, data, ack } => {
                                if let Some(id) = ack {
                                    let reply = Frame::Ack { id, data: Value::Null };
                                    if let Ok(text) = serde_json::to_string(&reply)
                                        && ws_tx.send(Message::Text(text.into())).await.is_err()
                                    {
                                        return Some(());
                                    }
                                }
                                registry.dispatch(InboundEvent::new(event, data));
                            }
                            Frame::Ack { id, data } => match pending.remove(&id) {
                                Some(reply) => {
                                    let _ = reply.send(Ok(data));
                                }
                                None => debug!("Ack {} has no pending request", id),
                            },
                        }
                    }
                    Message::Close(_) => {
                        info!("Close received from signaling server");
                        return Some(());
                    }
                    _ => {}
                }
            }
        }
    }
}
