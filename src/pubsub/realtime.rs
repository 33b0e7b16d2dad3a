use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{PubSub, PubSubError};
use crate::config::RealtimeConfig;
use crate::tokio_tools::spawn_named_task;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures::stream::SplitSink<WsStream, Message>;

const LOG_TARGET: &str = "tablesync::pubsub::realtime";
const BROADCAST_EVENT: &str = "message";

enum Outbound {
    Join(String),
    Broadcast { channel: String, payload: Value },
}

/// Broadcast bus over a Phoenix-protocol realtime socket.
///
/// Each bus topic maps to the channel `realtime:<topic>`. Joined channels are
/// rejoined after every reconnect; frames published while disconnected are
/// queued and flushed once the socket is back.
pub struct RealtimePubSub {
    cfg: RealtimeConfig,
    subscribers: Arc<DashMap<String, broadcast::Sender<String>>>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl RealtimePubSub {
    pub fn spawn(
        cfg: RealtimeConfig,
        stop: CancellationToken,
    ) -> (Arc<Self>, JoinHandle<Result<()>>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let subscribers = Arc::new(DashMap::new());
        let pump = RealtimePump {
            cfg: cfg.clone(),
            subscribers: Arc::clone(&subscribers),
            outbound: outbound_rx,
            stop,
        };
        let handle = spawn_named_task("realtime-pubsub", pump.run());
        let bus = Arc::new(Self {
            cfg,
            subscribers,
            outbound,
        });
        (bus, handle)
    }
}

#[async_trait]
impl PubSub for RealtimePubSub {
    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<String>, PubSubError> {
        let channel = self.cfg.channel(topic);
        let mut created = false;
        let receiver = self
            .subscribers
            .entry(channel.clone())
            .or_insert_with(|| {
                created = true;
                broadcast::channel(self.cfg.broadcast_capacity).0
            })
            .subscribe();
        if created {
            self.outbound
                .send(Outbound::Join(channel))
                .map_err(|_| PubSubError::Closed)?;
        }
        Ok(receiver)
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<(), PubSubError> {
        let payload = serde_json::from_str(&payload).map_err(|source| PubSubError::Encode {
            topic: topic.to_string(),
            source,
        })?;
        self.outbound
            .send(Outbound::Broadcast {
                channel: self.cfg.channel(topic),
                payload,
            })
            .map_err(|_| PubSubError::Closed)
    }
}

struct RealtimePump {
    cfg: RealtimeConfig,
    subscribers: Arc<DashMap<String, broadcast::Sender<String>>>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    stop: CancellationToken,
}

impl RealtimePump {
    async fn run(mut self) -> Result<()> {
        info!(target: LOG_TARGET, url = %self.cfg.realtime_url, "starting realtime pub/sub");
        while !self.stop.is_cancelled() {
            match self.connect().await {
                Ok(stream) => {
                    if let Err(err) = self.pump(stream).await {
                        warn!(target: LOG_TARGET, error = %err, "realtime stream ended with error");
                    }
                }
                Err(err) => {
                    warn!(target: LOG_TARGET, error = %err, "failed to connect to realtime endpoint");
                }
            }

            if self.stop.is_cancelled() {
                break;
            }

            debug!(
                target: LOG_TARGET,
                delay_secs = self.cfg.reconnect_delay.as_secs_f32(),
                "waiting before reconnect attempt"
            );
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = sleep(self.cfg.reconnect_delay) => {}
            }
        }

        info!(target: LOG_TARGET, "realtime pub/sub stopped");
        Ok(())
    }

    async fn connect(&self) -> Result<WsStream> {
        let mut url = self.cfg.realtime_url.clone();
        url.query_pairs_mut()
            .append_pair("apikey", &self.cfg.api_key)
            .append_pair("vsn", "1.0.0");
        let (stream, _) = timeout(self.cfg.handshake_timeout, connect_async(url.as_str()))
            .await
            .context("realtime handshake timed out")?
            .context("realtime handshake failed")?;
        Ok(stream)
    }

    async fn pump(&mut self, stream: WsStream) -> Result<()> {
        let (mut sink, mut source) = stream.split();
        let mut refs = FrameRefs::default();
        let mut joined = HashSet::new();

        let channels: Vec<String> = self.subscribers.iter().map(|e| e.key().clone()).collect();
        for channel in channels {
            self.join(&mut sink, &mut refs, &mut joined, channel).await?;
        }

        let mut heartbeat = interval(self.cfg.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => {
                    debug!(target: LOG_TARGET, "shutdown signal received");
                    break;
                }
                _ = heartbeat.tick() => {
                    let frame = encode_frame("phoenix", "heartbeat", refs.next(), Value::Object(Default::default()))?;
                    if let Err(err) = sink.send(Message::Text(frame)).await {
                        warn!(target: LOG_TARGET, error = %err, "heartbeat send failed, ending loop");
                        break;
                    }
                }
                outbound = self.outbound.recv() => {
                    match outbound {
                        Some(Outbound::Join(channel)) => {
                            self.join(&mut sink, &mut refs, &mut joined, channel).await?;
                        }
                        Some(Outbound::Broadcast { channel, payload }) => {
                            let body = serde_json::json!({
                                "type": "broadcast",
                                "event": BROADCAST_EVENT,
                                "payload": payload,
                            });
                            let frame = encode_frame(&channel, "broadcast", refs.next(), body)?;
                            sink.send(Message::Text(frame))
                                .await
                                .context("failed to send broadcast frame")?;
                        }
                        None => break,
                    }
                }
                msg = source.next() => {
                    match msg {
                        Some(Ok(Message::Text(txt))) => {
                            if let Err(err) = self.handle_text(&txt) {
                                warn!(target: LOG_TARGET, error = %err, "failed to handle realtime frame");
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            sink.send(Message::Pong(payload)).await.ok();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(target: LOG_TARGET, ?frame, "socket closed by server");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(target: LOG_TARGET, error = %err, "websocket error");
                            break;
                        }
                        None => {
                            debug!(target: LOG_TARGET, "websocket stream ended");
                            break;
                        }
                    }
                }
            }
        }

        let _ = sink.close().await;
        Ok(())
    }

    async fn join(
        &self,
        sink: &mut WsSink,
        refs: &mut FrameRefs,
        joined: &mut HashSet<String>,
        channel: String,
    ) -> Result<()> {
        if joined.contains(&channel) {
            return Ok(());
        }
        let payload = serde_json::json!({
            "access_token": self.cfg.api_key,
            "config": { "broadcast": { "self": false, "ack": false } },
        });
        let frame = encode_frame(&channel, "phx_join", refs.next(), payload)?;
        sink.send(Message::Text(frame))
            .await
            .with_context(|| format!("failed to join {channel}"))?;
        debug!(target: LOG_TARGET, %channel, "joined channel");
        joined.insert(channel);
        Ok(())
    }

    fn handle_text(&self, txt: &str) -> Result<()> {
        let frame: IncomingFrame =
            serde_json::from_str(txt).context("failed to deserialize realtime frame")?;

        match frame.event.as_str() {
            "broadcast" => {
                let Some(payload) = frame.payload else {
                    return Ok(());
                };
                let body: BroadcastBody = serde_json::from_value(payload)
                    .context("failed to decode broadcast body")?;
                if body.event != BROADCAST_EVENT {
                    return Ok(());
                }
                if let Some(sender) = self.subscribers.get(&frame.topic) {
                    let _ = sender.send(body.payload.to_string());
                }
            }
            "phx_reply" => {
                let status = frame
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("status"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                if status != "ok" {
                    warn!(target: LOG_TARGET, topic = %frame.topic, status, "channel request rejected");
                }
            }
            other => {
                debug!(target: LOG_TARGET, event = other, "ignoring realtime event");
            }
        }

        Ok(())
    }
}

#[derive(Default)]
struct FrameRefs(u64);

impl FrameRefs {
    fn next(&mut self) -> String {
        self.0 += 1;
        self.0.to_string()
    }
}

fn encode_frame(topic: &str, event: &str, reference: String, payload: Value) -> Result<String> {
    let envelope = PhoenixEnvelope {
        topic,
        event,
        reference,
        payload,
    };
    serde_json::to_string(&envelope).context("failed to serialize realtime frame")
}

#[derive(serde::Serialize)]
struct PhoenixEnvelope<'a> {
    topic: &'a str,
    event: &'a str,
    #[serde(rename = "ref")]
    reference: String,
    payload: Value,
}

#[derive(Debug, serde::Deserialize)]
struct IncomingFrame {
    topic: String,
    event: String,
    payload: Option<Value>,
}

#[derive(Debug, serde::Deserialize)]
struct BroadcastBody {
    event: String,
    #[serde(default)]
    payload: Value,
}
