//! Client-side delivery of player actions.
//!
//! An [`ActionChannel`] owns one socket connection and at most one pending
//! action. The action is retried on ack timeout, replayed after a reconnect
//! and resolved exactly once: by its ack, by retry exhaustion or by a newer
//! action superseding it.

pub mod protocol;
pub mod transport;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ActionChannelConfig, WsTransportConfig};
use crate::tokio_tools::spawn_named_task;

pub use protocol::{
    ack_event_for, ActionKind, ClockMessage, Frame, ResumeRequest, StateMessage, ACTION_ID_KEY,
    RESUME_EVENT, SERVER_CLOCK_EVENT, STATE_EVENT, VERSION_KEY,
};
pub use transport::{Transport, TransportError, TransportEvent, WsTransport};

const LOG_TARGET: &str = "tablesync::channel";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActionError {
    #[error("no ack received for {event} action {action_id} after {attempts} attempts")]
    NoAck {
        event: String,
        action_id: Uuid,
        attempts: u32,
    },

    #[error("payload for {event} must be a JSON object")]
    InvalidPayload { event: String },

    #[error("action {action_id} was superseded by a newer action")]
    Superseded { action_id: Uuid },

    #[error("action channel is closed")]
    ChannelClosed,
}

/// User-facing notices. Delivery failures are surfaced here as well as to
/// the caller so a UI can block on them.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelNotice {
    DeliveryFailed {
        event: String,
        action_id: Uuid,
        attempts: u32,
    },
}

struct SendRequest {
    action_id: Uuid,
    frame: Frame,
    ack_event: String,
    retries: u32,
    reply: oneshot::Sender<Result<(), ActionError>>,
}

struct PendingAction {
    action_id: Uuid,
    frame: Frame,
    ack_event: String,
    retries_left: u32,
    attempts: u32,
    deadline: Instant,
    reply: oneshot::Sender<Result<(), ActionError>>,
}

impl PendingAction {
    fn acked_by(&self, frame: &Frame) -> bool {
        frame.event == self.ack_event
            && frame
                .action_id()
                .is_some_and(|id| id == self.action_id.to_string())
    }
}

/// Handle to one connection's action pipeline.
pub struct ActionChannel {
    cfg: ActionChannelConfig,
    commands: mpsc::UnboundedSender<SendRequest>,
    last_tick: watch::Receiver<Option<u64>>,
    clock_offset_ms: Arc<Mutex<Option<i64>>>,
    states: broadcast::Sender<StateMessage>,
    notices: broadcast::Sender<ChannelNotice>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    transport_task: Mutex<Option<JoinHandle<anyhow::Result<()>>>>,
}

impl ActionChannel {
    /// Drives `transport`, consuming its connection events from `events`.
    pub fn spawn(
        cfg: ActionChannelConfig,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        Self::spawn_with_stop(cfg, transport, events, CancellationToken::new())
    }

    /// Opens a reconnecting websocket to `ws` and drives it. The socket is
    /// closed when the channel shuts down.
    pub fn connect(cfg: ActionChannelConfig, ws: WsTransportConfig) -> Self {
        let stop = CancellationToken::new();
        let (transport, events, transport_task) = WsTransport::spawn(ws, stop.child_token());
        let channel = Self::spawn_with_stop(cfg, transport, events, stop);
        *channel.transport_task.lock() = Some(transport_task);
        channel
    }

    fn spawn_with_stop(
        cfg: ActionChannelConfig,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
        stop: CancellationToken,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (last_tick_tx, last_tick) = watch::channel(None);
        let clock_offset_ms = Arc::new(Mutex::new(None));
        let (states, _) = broadcast::channel(cfg.notice_capacity);
        let (notices, _) = broadcast::channel(cfg.notice_capacity);

        let driver = Driver {
            protocol_version: cfg.protocol_version,
            ack_timeout: cfg.ack_timeout,
            transport,
            events,
            commands: commands_rx,
            pending: None,
            last_tick: last_tick_tx,
            clock_offset_ms: Arc::clone(&clock_offset_ms),
            states: states.clone(),
            notices: notices.clone(),
            stop: stop.clone(),
        };
        let task = spawn_named_task("action-channel", driver.run());

        Self {
            cfg,
            commands,
            last_tick,
            clock_offset_ms,
            states,
            notices,
            stop,
            task: Mutex::new(Some(task)),
            transport_task: Mutex::new(None),
        }
    }

    /// Sends `payload` as `event` and waits for the matching `ack_event`.
    ///
    /// `actionId` and `version` are merged into the payload. Up to `retries`
    /// re-emits follow, one per ack timeout.
    pub async fn send(
        &self,
        event: &str,
        payload: Value,
        ack_event: &str,
        retries: u32,
    ) -> Result<(), ActionError> {
        let Value::Object(mut body) = payload else {
            return Err(ActionError::InvalidPayload {
                event: event.to_string(),
            });
        };
        let action_id = Uuid::new_v4();
        body.insert(ACTION_ID_KEY.into(), Value::String(action_id.to_string()));
        body.insert(VERSION_KEY.into(), Value::from(self.cfg.protocol_version));

        let (reply, settled) = oneshot::channel();
        self.commands
            .send(SendRequest {
                action_id,
                frame: Frame::new(event, Value::Object(body)),
                ack_event: ack_event.to_string(),
                retries,
                reply,
            })
            .map_err(|_| ActionError::ChannelClosed)?;
        settled.await.map_err(|_| ActionError::ChannelClosed)?
    }

    /// Sends one of the ack-gated table actions with the default retry count.
    pub async fn send_action(&self, kind: ActionKind, payload: Value) -> Result<(), ActionError> {
        self.send(
            kind.event(),
            payload,
            &kind.ack_event(),
            self.cfg.default_retries,
        )
        .await
    }

    /// Tick of the last accepted `state` message.
    pub fn last_tick(&self) -> Option<u64> {
        *self.last_tick.borrow()
    }

    /// Server clock minus local clock, in milliseconds.
    pub fn clock_offset_ms(&self) -> Option<i64> {
        *self.clock_offset_ms.lock()
    }

    /// Local time corrected by the last `server:Clock` reading.
    pub fn server_now(&self) -> Option<DateTime<Utc>> {
        self.clock_offset_ms()
            .map(|offset| Utc::now() + chrono::Duration::milliseconds(offset))
    }

    pub fn states(&self) -> broadcast::Receiver<StateMessage> {
        self.states.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<ChannelNotice> {
        self.notices.subscribe()
    }

    /// Stops the driver. A pending action settles with `ChannelClosed`.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(target: LOG_TARGET, error = %err, "action channel task failed");
            }
        }
        let transport_task = self.transport_task.lock().take();
        if let Some(task) = transport_task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(target: LOG_TARGET, error = %err, "transport ended with error"),
                Err(err) => warn!(target: LOG_TARGET, error = %err, "transport task failed"),
            }
        }
    }
}

impl Drop for ActionChannel {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

enum Rearm {
    Yes,
    No,
}

struct Driver {
    protocol_version: u32,
    ack_timeout: std::time::Duration,
    transport: Arc<dyn Transport>,
    events: mpsc::Receiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<SendRequest>,
    pending: Option<PendingAction>,
    last_tick: watch::Sender<Option<u64>>,
    clock_offset_ms: Arc<Mutex<Option<i64>>>,
    states: broadcast::Sender<StateMessage>,
    notices: broadcast::Sender<ChannelNotice>,
    stop: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let deadline = self.pending.as_ref().map(|pending| pending.deadline);
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        info!(target: LOG_TARGET, "transport event stream ended");
                        break;
                    }
                },
                request = self.commands.recv() => match request {
                    Some(request) => self.start(request).await,
                    None => break,
                },
                _ = wait_until(deadline) => self.on_deadline().await,
            }
        }

        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(Err(ActionError::ChannelClosed));
        }
        debug!(target: LOG_TARGET, "action channel stopped");
    }

    async fn start(&mut self, request: SendRequest) {
        if let Some(previous) = self.pending.take() {
            info!(
                target: LOG_TARGET,
                action_id = %previous.action_id,
                event = %previous.frame.event,
                "pending action superseded"
            );
            let _ = previous.reply.send(Err(ActionError::Superseded {
                action_id: previous.action_id,
            }));
        }

        debug!(
            target: LOG_TARGET,
            action_id = %request.action_id,
            event = %request.frame.event,
            retries = request.retries,
            "sending action"
        );
        self.pending = Some(PendingAction {
            action_id: request.action_id,
            frame: request.frame,
            ack_event: request.ack_event,
            retries_left: request.retries,
            attempts: 0,
            deadline: Instant::now() + self.ack_timeout,
            reply: request.reply,
        });
        self.emit_pending(Rearm::Yes).await;
    }

    /// Emits the pending action. Only first sends and retries push the ack
    /// deadline out; a replay after reconnect keeps it, so reconnects cannot
    /// postpone exhaustion.
    async fn emit_pending(&mut self, rearm: Rearm) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        pending.attempts += 1;
        if let Rearm::Yes = rearm {
            pending.deadline = Instant::now() + self.ack_timeout;
        }
        let frame = pending.frame.clone();
        let action_id = pending.action_id;
        let attempt = pending.attempts;
        if let Err(err) = self.transport.emit(frame).await {
            warn!(
                target: LOG_TARGET,
                %action_id,
                attempt,
                error = %err,
                "emit failed, waiting for retry"
            );
        }
    }

    async fn on_deadline(&mut self) {
        let retry = match self.pending.as_mut() {
            None => return,
            Some(pending) if pending.retries_left > 0 => {
                pending.retries_left -= 1;
                warn!(
                    target: LOG_TARGET,
                    action_id = %pending.action_id,
                    event = %pending.frame.event,
                    attempt = pending.attempts + 1,
                    "no ack before timeout, retrying"
                );
                true
            }
            Some(_) => false,
        };
        if retry {
            self.emit_pending(Rearm::Yes).await;
            return;
        }

        if let Some(pending) = self.pending.take() {
            error!(
                target: LOG_TARGET,
                action_id = %pending.action_id,
                event = %pending.frame.event,
                attempts = pending.attempts,
                "no ack received, giving up"
            );
            let _ = self.notices.send(ChannelNotice::DeliveryFailed {
                event: pending.frame.event.clone(),
                action_id: pending.action_id,
                attempts: pending.attempts,
            });
            let _ = pending.reply.send(Err(ActionError::NoAck {
                event: pending.frame.event,
                action_id: pending.action_id,
                attempts: pending.attempts,
            }));
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connected().await,
            TransportEvent::Disconnected => {
                info!(
                    target: LOG_TARGET,
                    pending = self.pending.is_some(),
                    "transport disconnected"
                );
            }
            TransportEvent::Frame(frame) => self.handle_frame(frame),
        }
    }

    async fn on_connected(&mut self) {
        let last_tick = *self.last_tick.borrow();
        info!(
            target: LOG_TARGET,
            pending = self.pending.is_some(),
            ?last_tick,
            "transport connected"
        );
        // Pending action goes out before the resume request.
        self.emit_pending(Rearm::No).await;

        let resume = ResumeRequest {
            version: self.protocol_version,
            tick: last_tick,
        };
        let payload = match serde_json::to_value(&resume) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target: LOG_TARGET, ?last_tick, error = %err, "failed to encode resume");
                return;
            }
        };
        if let Err(err) = self.transport.emit(Frame::new(RESUME_EVENT, payload)).await {
            warn!(target: LOG_TARGET, ?last_tick, error = %err, "failed to emit resume");
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        if self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.acked_by(&frame))
        {
            if let Some(pending) = self.pending.take() {
                debug!(
                    target: LOG_TARGET,
                    action_id = %pending.action_id,
                    attempts = pending.attempts,
                    "action acknowledged"
                );
                let _ = pending.reply.send(Ok(()));
            }
            return;
        }

        match frame.event.as_str() {
            STATE_EVENT => self.handle_state(frame.payload),
            SERVER_CLOCK_EVENT => match serde_json::from_value::<ClockMessage>(frame.payload) {
                Ok(clock) => {
                    let offset = clock.now - Utc::now().timestamp_millis();
                    *self.clock_offset_ms.lock() = Some(offset);
                    debug!(target: LOG_TARGET, offset_ms = offset, "server clock updated");
                }
                Err(err) => debug!(target: LOG_TARGET, error = %err, "ignoring malformed clock"),
            },
            other => debug!(target: LOG_TARGET, event = other, "ignoring frame"),
        }
    }

    fn handle_state(&mut self, payload: Value) {
        let message: StateMessage = match serde_json::from_value(payload) {
            Ok(message) => message,
            Err(err) => {
                debug!(target: LOG_TARGET, error = %err, "ignoring malformed state");
                return;
            }
        };
        if message.version != self.protocol_version {
            debug!(
                target: LOG_TARGET,
                version = message.version,
                expected = self.protocol_version,
                "ignoring state with other version"
            );
            return;
        }
        self.last_tick.send_replace(Some(message.tick));
        let _ = self.states.send(message);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Records emitted frames and forwards each one to the test.
    struct MockTransport {
        emitted: mpsc::UnboundedSender<Frame>,
        connected: Mutex<bool>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn emit(&self, frame: Frame) -> Result<(), TransportError> {
            if !*self.connected.lock() {
                return Err(TransportError::NotConnected);
            }
            self.emitted
                .send(frame)
                .map_err(|_| TransportError::Closed)
        }
    }

    struct Harness {
        channel: Arc<ActionChannel>,
        transport: Arc<MockTransport>,
        events: mpsc::Sender<TransportEvent>,
        emitted: mpsc::UnboundedReceiver<Frame>,
    }

    impl Harness {
        async fn new() -> Self {
            let (emitted_tx, emitted) = mpsc::unbounded_channel();
            let transport = Arc::new(MockTransport {
                emitted: emitted_tx,
                connected: Mutex::new(true),
            });
            let (events, events_rx) = mpsc::channel(16);
            let cfg = ActionChannelConfig {
                ack_timeout: TIMEOUT,
                ..ActionChannelConfig::default()
            };
            let channel = Arc::new(ActionChannel::spawn(cfg, transport.clone(), events_rx));
            let mut harness = Self {
                channel,
                transport,
                events,
                emitted,
            };
            harness.push(TransportEvent::Connected).await;
            let resume = harness.next_emit().await;
            assert_eq!(resume.event, RESUME_EVENT);
            harness
        }

        fn send(&self, retries: u32) -> JoinHandle<Result<(), ActionError>> {
            let channel = Arc::clone(&self.channel);
            tokio::spawn(async move {
                channel
                    .send("action", json!({ "kind": "bet", "amount": 10 }), "action:ack", retries)
                    .await
            })
        }

        async fn next_emit(&mut self) -> Frame {
            self.emitted.recv().await.unwrap()
        }

        async fn push(&self, event: TransportEvent) {
            self.events.send(event).await.unwrap();
        }

        async fn push_state(&self, version: u32, tick: u64) {
            self.push(TransportEvent::Frame(Frame::new(
                STATE_EVENT,
                json!({ "version": version, "tick": tick, "state": { "tick": tick } }),
            )))
            .await;
        }

        async fn ack(&self, frame: &Frame) {
            let id = frame.action_id().unwrap().to_string();
            self.push(TransportEvent::Frame(Frame::new(
                "action:ack",
                json!({ "actionId": id }),
            )))
            .await;
        }

        /// Lets the driver drain everything queued so far.
        async fn settle(&self) {
            for _ in 0..8 {
                tokio::task::yield_now().await;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ack_resolves_and_clears_pending() {
        let mut h = Harness::new().await;
        let sent = h.send(1);
        let frame = h.next_emit().await;
        assert_eq!(frame.event, "action");
        assert_eq!(frame.payload["kind"], "bet");
        assert_eq!(frame.payload[VERSION_KEY], 1);
        assert!(Uuid::parse_str(frame.action_id().unwrap()).is_ok());

        h.ack(&frame).await;
        assert_eq!(sent.await.unwrap(), Ok(()));

        tokio::time::sleep(TIMEOUT * 3).await;
        assert!(h.emitted.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn one_retry_means_two_attempts_before_rejection() {
        let mut h = Harness::new().await;
        let mut notices = h.channel.notices();
        let sent = h.send(1);

        let first = h.next_emit().await;
        let second = h.next_emit().await;
        assert_eq!(first, second);

        let err = sent.await.unwrap().unwrap_err();
        match err {
            ActionError::NoAck {
                event, attempts, ..
            } => {
                assert_eq!(event, "action");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(h.emitted.try_recv().is_err());
        assert!(matches!(
            notices.recv().await.unwrap(),
            ChannelNotice::DeliveryFailed { attempts: 2, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn ack_after_retry_resolves_once() {
        let mut h = Harness::new().await;
        let sent = h.send(1);
        let first = h.next_emit().await;
        let _retry = h.next_emit().await;

        h.ack(&first).await;
        assert_eq!(sent.await.unwrap(), Ok(()));

        // A duplicate ack for a settled action is ignored.
        h.ack(&first).await;
        tokio::time::sleep(TIMEOUT * 3).await;
        assert!(h.emitted.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ack_for_other_action_id_is_ignored() {
        let mut h = Harness::new().await;
        let sent = h.send(0);
        let _frame = h.next_emit().await;
        h.push(TransportEvent::Frame(Frame::new(
            "action:ack",
            json!({ "actionId": Uuid::new_v4().to_string() }),
        )))
        .await;
        assert!(matches!(
            sent.await.unwrap(),
            Err(ActionError::NoAck { attempts: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_replays_pending_then_resumes() {
        let mut h = Harness::new().await;
        h.push_state(1, 41).await;
        h.settle().await;
        assert_eq!(h.channel.last_tick(), Some(41));

        let sent = h.send(1);
        let original = h.next_emit().await;

        *h.transport.connected.lock() = false;
        h.push(TransportEvent::Disconnected).await;
        *h.transport.connected.lock() = true;
        h.push(TransportEvent::Connected).await;

        let replayed = h.next_emit().await;
        assert_eq!(replayed, original);
        let resume = h.next_emit().await;
        assert_eq!(resume.event, RESUME_EVENT);
        assert_eq!(resume.payload, json!({ "version": 1, "tick": 41 }));

        h.ack(&original).await;
        assert_eq!(sent.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_replay_keeps_retry_deadline() {
        let mut h = Harness::new().await;
        let started = Instant::now();
        let sent = h.send(1);
        let _original = h.next_emit().await;

        tokio::time::sleep(TIMEOUT - Duration::from_millis(10)).await;
        h.push(TransportEvent::Connected).await;
        let _replayed = h.next_emit().await;
        assert_eq!(h.next_emit().await.event, RESUME_EVENT);

        let _retry = h.next_emit().await;
        assert!(started.elapsed() >= TIMEOUT);
        assert!(started.elapsed() < TIMEOUT + Duration::from_millis(1));
        assert!(matches!(
            sent.await.unwrap(),
            Err(ActionError::NoAck { attempts: 3, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn flapping_connection_cannot_postpone_exhaustion() {
        let mut h = Harness::new().await;
        let channel = Arc::clone(&h.channel);
        let started = Instant::now();
        let sent = tokio::spawn(async move {
            let result = channel
                .send("action", json!({ "kind": "fold" }), "action:ack", 0)
                .await;
            (result, Instant::now())
        });
        let _original = h.next_emit().await;

        for _ in 0..5 {
            tokio::time::sleep(TIMEOUT - Duration::from_secs(1)).await;
            h.push(TransportEvent::Disconnected).await;
            h.push(TransportEvent::Connected).await;
        }

        let (result, settled_at) = sent.await.unwrap();
        assert!(matches!(result, Err(ActionError::NoAck { .. })));
        assert!(settled_at - started <= TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_without_tick_resumes_from_unknown_tick() {
        let mut h = Harness::new().await;
        h.push(TransportEvent::Connected).await;
        assert_eq!(
            h.next_emit().await,
            Frame::new(RESUME_EVENT, json!({ "version": 1, "tick": null }))
        );
        h.settle().await;
        assert!(h.emitted.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn state_with_other_version_is_ignored() {
        let h = Harness::new().await;
        let mut states = h.channel.states();
        h.push_state(1, 3).await;
        h.push_state(2, 9).await;
        h.push(TransportEvent::Frame(Frame::new(STATE_EVENT, json!("garbage"))))
            .await;
        h.settle().await;

        assert_eq!(h.channel.last_tick(), Some(3));
        assert_eq!(states.recv().await.unwrap().tick, 3);
        assert!(states.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn new_send_supersedes_pending() {
        let mut h = Harness::new().await;
        let first = h.send(1);
        let first_frame = h.next_emit().await;
        let second = h.send(1);
        let second_frame = h.next_emit().await;
        assert_ne!(first_frame.action_id(), second_frame.action_id());

        let first_id = Uuid::parse_str(first_frame.action_id().unwrap()).unwrap();
        assert_eq!(
            first.await.unwrap(),
            Err(ActionError::Superseded {
                action_id: first_id
            })
        );

        // The superseded ack no longer matches anything.
        h.ack(&first_frame).await;
        h.ack(&second_frame).await;
        assert_eq!(second.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn non_object_payload_is_rejected() {
        let mut h = Harness::new().await;
        let err = h
            .channel
            .send("action", json!([1, 2]), "action:ack", 1)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ActionError::InvalidPayload {
                event: "action".into()
            }
        );
        h.settle().await;
        assert!(h.emitted.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn emit_failure_is_retried_like_a_lost_packet() {
        let mut h = Harness::new().await;
        *h.transport.connected.lock() = false;
        let sent = h.send(1);
        tokio::time::sleep(TIMEOUT / 2).await;
        assert!(h.emitted.try_recv().is_err());
        *h.transport.connected.lock() = true;

        let retry = h.next_emit().await;
        h.ack(&retry).await;
        assert_eq!(sent.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn server_clock_records_offset() {
        let h = Harness::new().await;
        let ahead = Utc::now().timestamp_millis() + 60_000;
        h.push(TransportEvent::Frame(Frame::new(
            SERVER_CLOCK_EVENT,
            json!({ "now": ahead }),
        )))
        .await;
        h.settle().await;

        let offset = h.channel.clock_offset_ms().unwrap();
        assert!((59_000..=61_000).contains(&offset), "offset {offset}");
        assert!(h.channel.server_now().unwrap() > Utc::now());
    }

    #[tokio::test(start_paused = true)]
    async fn typed_actions_use_their_ack_event() {
        let mut h = Harness::new().await;
        let channel = Arc::clone(&h.channel);
        let sent = tokio::spawn(async move {
            channel
                .send_action(ActionKind::BuyIn, json!({ "amount": 100 }))
                .await
        });
        let frame = h.next_emit().await;
        assert_eq!(frame.event, "buy-in");
        h.push(TransportEvent::Frame(Frame::new(
            "buy-in:ack",
            json!({ "actionId": frame.action_id().unwrap() }),
        )))
        .await;
        assert_eq!(sent.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_settles_pending_as_closed() {
        let mut h = Harness::new().await;
        let sent = h.send(1);
        let _frame = h.next_emit().await;
        h.channel.shutdown().await;
        assert_eq!(sent.await.unwrap(), Err(ActionError::ChannelClosed));
        assert_eq!(
            h.channel.send("action", json!({}), "action:ack", 0).await,
            Err(ActionError::ChannelClosed)
        );
    }
}
