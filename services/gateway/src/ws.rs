//! WebSocket implementation of the server link.
//!
//! # Protocol
//! 1. Connect to `url` (ws:// or wss://)
//! 2. Drain the priority queues into the socket, firing `onTrySend` before
//!    and `onSent` after each successful write
//! 3. Classify every received message into request/response/ack/other
//!    listener events
//!
//! A broken link never drops queued messages: a message is popped from its
//! queue only after the socket write succeeded, so everything still queued
//! is replayed over the next connection.

use crate::connector::{
    ConnectorError, GwsConnector, GwsEventSource, GwsListener, GwsPriorityAssigner,
    PriorityOutputs,
};
use futures_util::{SinkExt, StreamExt};
use gateway_core::dispatch::AsyncExecutor;
use gw_protocol::GWMessage;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// WebSocket URL of the server endpoint, e.g. `wss://gw.example.com/ws`.
    pub url: String,
    /// Delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Number of priority output queues.
    pub outputs_count: usize,
}

impl Default for ConnectorConfig {
    fn default() -> ConnectorConfig {
        ConnectorConfig {
            url: "ws://localhost:8850".to_string(),
            reconnect_delay: Duration::from_secs(10),
            outputs_count: 4,
        }
    }
}

// ---------------------------------------------------------------------------
// GwsServerConnector
// ---------------------------------------------------------------------------

pub struct GwsServerConnector {
    config: ConnectorConfig,
    outputs: PriorityOutputs,
    assigner: Arc<dyn GwsPriorityAssigner>,
    events: GwsEventSource,
    updated: tokio::sync::Notify,
    stop_notify: tokio::sync::Notify,
    stopped: AtomicBool,
}

impl GwsServerConnector {
    pub fn new(
        config: ConnectorConfig,
        assigner: Arc<dyn GwsPriorityAssigner>,
        events_executor: Arc<dyn AsyncExecutor>,
    ) -> GwsServerConnector {
        let outputs = PriorityOutputs::new(config.outputs_count);
        GwsServerConnector {
            config,
            outputs,
            assigner,
            events: GwsEventSource::new(events_executor),
            updated: tokio::sync::Notify::new(),
            stop_notify: tokio::sync::Notify::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Connect-and-serve loop; reconnects with a delay until stopped.
    pub async fn run(self: Arc<Self>) {
        info!(url = %self.config.url, "starting server connector");

        while !self.stopped.load(Ordering::SeqCst) {
            match connect_async(&self.config.url).await {
                Ok((ws, _response)) => {
                    info!(url = %self.config.url, "connected to server");
                    self.events.fire_connected(&self.config.url);

                    if let Err(e) = self.run_session(ws).await {
                        warn!(error = %e, "server session ended");
                    }
                    self.events.fire_disconnected(&self.config.url);
                }
                Err(e) => {
                    warn!(url = %self.config.url, error = %e, "cannot connect to server");
                }
            }

            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                () = self.stop_notify.notified() => {}
                () = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        info!("server connector has stopped");
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    async fn run_session(&self, mut ws: WsStream) -> Result<(), ConnectorError> {
        // replay whatever queued up while disconnected
        self.drain_outputs(&mut ws).await?;

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                let _ = ws.close(None).await;
                return Ok(());
            }

            tokio::select! {
                incoming = ws.next() => match incoming {
                    None => return Err(ConnectorError::Connection("connection closed".into())),
                    Some(Err(e)) => return Err(ConnectorError::Connection(e.to_string())),
                    Some(Ok(Message::Text(text))) => self.handle_incoming(text.as_ref()),
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        return Err(ConnectorError::Connection("server closed the link".into()));
                    }
                    Some(Ok(_)) => {}
                },
                () = self.updated.notified() => self.drain_outputs(&mut ws).await?,
                () = self.stop_notify.notified() => {
                    let _ = ws.close(None).await;
                    return Ok(());
                }
            }
        }
    }

    async fn drain_outputs(&self, ws: &mut WsStream) -> Result<(), ConnectorError> {
        while let Some(index) = self.outputs.select() {
            let Some(message) = self.outputs.front(index) else {
                continue;
            };
            let message = Arc::new(message);

            self.events.fire_try_send(&message);

            let json = serde_json::to_string(message.as_ref())
                .map_err(|e| ConnectorError::Protocol(e.to_string()))?;
            ws.send(Message::Text(json.into()))
                .await
                .map_err(|e| ConnectorError::Connection(e.to_string()))?;

            // popped only after the write succeeded — a failed write keeps
            // the message queued for replay
            self.outputs.pop(index);
            self.outputs.mark_used(index);
            self.events.fire_sent(&message);
        }
        Ok(())
    }

    fn handle_incoming(&self, text: &str) {
        match serde_json::from_str::<GWMessage>(text) {
            Ok(message) => {
                let message = Arc::new(message);
                debug!(message = %message.brief(), "received message");
                self.events.fire_received(&message);
            }
            Err(e) => warn!(error = %e, "unparseable message from server"),
        }
    }
}

impl GwsConnector for GwsServerConnector {
    fn send(&self, message: GWMessage) -> Result<(), ConnectorError> {
        let priority = self.assigner.assign(&message);
        debug!(message = %message.brief(), priority, "enqueueing message");
        self.outputs.push(priority, message);
        self.updated.notify_one();
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn GwsListener>) {
        self.events.add_listener(listener);
    }
}
