use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::Frame;
use crate::config::WsTransportConfig;
use crate::tokio_tools::spawn_named_task;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const LOG_TARGET: &str = "tablesync::channel::transport";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("transport is not connected")]
    NotConnected,

    #[error("failed to encode {event} frame: {source}")]
    Encode {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

/// What the socket reports to the channel driving it.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Fired on the first connect and after every reconnect.
    Connected,
    Disconnected,
    Frame(Frame),
}

/// Outbound half of a client socket. Inbound traffic and connection changes
/// arrive separately as [`TransportEvent`]s.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn emit(&self, frame: Frame) -> Result<(), TransportError>;
}

/// Reconnecting websocket carrying `{"event", "payload"}` text frames.
///
/// Frames emitted while disconnected are refused with
/// [`TransportError::NotConnected`] rather than queued; the action channel
/// replays what matters on the next [`TransportEvent::Connected`].
pub struct WsTransport {
    outbound: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
}

impl WsTransport {
    pub fn spawn(
        cfg: WsTransportConfig,
        stop: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<TransportEvent>, JoinHandle<Result<()>>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(cfg.event_capacity);
        let connected = Arc::new(AtomicBool::new(false));
        let pump = WsPump {
            cfg,
            outbound: outbound_rx,
            events: events_tx,
            connected: Arc::clone(&connected),
            stop,
        };
        let handle = spawn_named_task("action-transport", pump.run());
        (
            Arc::new(Self {
                outbound,
                connected,
            }),
            events_rx,
            handle,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn emit(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let text = serde_json::to_string(&frame).map_err(|source| TransportError::Encode {
            event: frame.event.clone(),
            source,
        })?;
        self.outbound.send(text).map_err(|_| TransportError::Closed)
    }
}

struct WsPump {
    cfg: WsTransportConfig,
    outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    stop: CancellationToken,
}

impl WsPump {
    async fn run(mut self) -> Result<()> {
        info!(target: LOG_TARGET, url = %self.cfg.url, "starting action transport");
        while !self.stop.is_cancelled() {
            match self.connect().await {
                Ok(stream) => match self.pump(stream).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => {
                        self.connected.store(false, Ordering::Release);
                        warn!(target: LOG_TARGET, error = %err, "socket ended with error");
                        if self.events.send(TransportEvent::Disconnected).await.is_err() {
                            break;
                        }
                    }
                },
                Err(err) => {
                    warn!(target: LOG_TARGET, error = %err, "failed to connect socket");
                }
            }

            if self.stop.is_cancelled() {
                break;
            }

            let delay = self.reconnect_delay();
            debug!(
                target: LOG_TARGET,
                delay_ms = delay.as_millis() as u64,
                "waiting before reconnect attempt"
            );
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.connected.store(false, Ordering::Release);
        info!(target: LOG_TARGET, "action transport stopped");
        Ok(())
    }

    fn reconnect_delay(&self) -> Duration {
        let jitter_ms = self.cfg.reconnect_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.cfg.reconnect_delay + Duration::from_millis(jitter)
    }

    async fn connect(&self) -> Result<WsStream> {
        let (stream, _) = timeout(self.cfg.handshake_timeout, connect_async(self.cfg.url.as_str()))
            .await
            .context("socket handshake timed out")?
            .context("socket handshake failed")?;
        Ok(stream)
    }

    /// Runs one connection. Returns `Ok(true)` when the socket dropped and a
    /// reconnect should follow, `Ok(false)` when the pump should stop.
    async fn pump(&mut self, stream: WsStream) -> Result<bool> {
        let (mut sink, mut source) = stream.split();

        // Frames accepted before a previous disconnect was noticed are stale.
        while self.outbound.try_recv().is_ok() {}

        self.connected.store(true, Ordering::Release);
        info!(target: LOG_TARGET, "socket connected");
        if self.events.send(TransportEvent::Connected).await.is_err() {
            return Ok(false);
        }

        let reconnect = loop {
            tokio::select! {
                _ = self.stop.cancelled() => break false,
                outbound = self.outbound.recv() => {
                    let Some(text) = outbound else { break false };
                    sink.send(Message::Text(text))
                        .await
                        .context("failed to send frame")?;
                }
                msg = source.next() => {
                    match msg {
                        Some(Ok(Message::Text(txt))) => match serde_json::from_str::<Frame>(&txt) {
                            Ok(frame) => {
                                if self.events.send(TransportEvent::Frame(frame)).await.is_err() {
                                    break false;
                                }
                            }
                            Err(err) => {
                                warn!(target: LOG_TARGET, error = %err, "dropping undecodable frame");
                            }
                        },
                        Some(Ok(Message::Ping(payload))) => {
                            sink.send(Message::Pong(payload)).await.ok();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(target: LOG_TARGET, ?frame, "socket closed by server");
                            break true;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(target: LOG_TARGET, error = %err, "websocket error");
                            break true;
                        }
                        None => {
                            debug!(target: LOG_TARGET, "websocket stream ended");
                            break true;
                        }
                    }
                }
            }
        };

        self.connected.store(false, Ordering::Release);
        let _ = sink.close().await;
        if reconnect {
            info!(target: LOG_TARGET, "socket disconnected");
            if self.events.send(TransportEvent::Disconnected).await.is_err() {
                return Ok(false);
            }
        }
        Ok(reconnect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use url::Url;

    async fn next_event(events: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event within timeout")
            .expect("event channel open")
    }

    #[tokio::test]
    async fn emit_before_connect_is_refused() {
        let cfg = WsTransportConfig::new(Url::parse("ws://127.0.0.1:9/unused").unwrap());
        let stop = CancellationToken::new();
        let (transport, _events, handle) = WsTransport::spawn(cfg, stop.clone());
        let err = transport
            .emit(Frame::new("action", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        stop.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn frames_flow_both_ways_and_close_reports_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let inbound = loop {
                match ws.next().await.unwrap().unwrap() {
                    Message::Text(txt) => break txt,
                    _ => continue,
                }
            };
            ws.send(Message::Text(
                r#"{"event":"action:ack","payload":{"actionId":"a-1"}}"#.to_string(),
            ))
            .await
            .unwrap();
            ws.close(None).await.unwrap();
            inbound
        });

        let mut cfg = WsTransportConfig::new(Url::parse(&format!("ws://{addr}/socket")).unwrap());
        cfg.reconnect_delay = Duration::from_secs(60);
        let stop = CancellationToken::new();
        let (transport, mut events, handle) = WsTransport::spawn(cfg, stop.clone());

        assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
        assert!(transport.is_connected());
        transport
            .emit(Frame::new("action", json!({ "actionId": "a-1" })))
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Frame(Frame::new("action:ack", json!({ "actionId": "a-1" })))
        );
        assert_eq!(next_event(&mut events).await, TransportEvent::Disconnected);
        assert!(!transport.is_connected());

        let sent: Frame = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(sent, Frame::new("action", json!({ "actionId": "a-1" })));

        stop.cancel();
        handle.await.unwrap().unwrap();
    }
}
