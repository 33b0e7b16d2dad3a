use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::log::{Applied, LogEntry, ReplicaLog};
use super::protocol::{
    ReplicaEnvelope, ReplicaEvent, ReplicaRequest, ReplicaResponse, ReplicaUpdate, ResponseBody,
};
use super::store::{PersistedReplica, SharedReplicaStore};
use super::ReplicaError;
use crate::config::ReplicaConfig;
use crate::delta::compute_delta;
use crate::pubsub::{diffs_topic, snapshot_ack_topic, PubSub};
use crate::tokio_tools::spawn_table_task;

const LOG_TARGET: &str = "tablesync::replica";
const RESTART_BACKOFF: Duration = Duration::from_millis(100);

/// Owner-side ends of the channels shared by every incarnation of a replica.
struct ReplicaChannels {
    requests: mpsc::Receiver<ReplicaEnvelope>,
    responses: mpsc::Sender<ReplicaResponse>,
    updates: broadcast::Sender<ReplicaUpdate>,
}

/// One incarnation of a table replica: in-memory log, its diff subscription
/// and the writer that persists it.
struct Replica {
    table_id: String,
    log: ReplicaLog,
    diffs: broadcast::Receiver<String>,
    bus: Arc<dyn PubSub>,
    persist_tx: watch::Sender<PersistedReplica>,
    writer: JoinHandle<()>,
}

enum Flow {
    Continue,
    Stop,
}

impl Replica {
    async fn bootstrap(
        table_id: &str,
        store: SharedReplicaStore,
        bus: Arc<dyn PubSub>,
    ) -> Result<Self, ReplicaError> {
        let log = match store.load(table_id).await {
            Ok(Some(persisted)) => {
                let log = ReplicaLog::from(persisted);
                info!(target: LOG_TARGET, table = table_id, entries = log.len(), "replica restored from disk");
                log
            }
            Ok(None) => {
                debug!(target: LOG_TARGET, table = table_id, "no persisted replica, starting empty");
                ReplicaLog::new()
            }
            Err(err) => {
                warn!(target: LOG_TARGET, table = table_id, error = %err, "persisted replica unreadable, starting empty");
                ReplicaLog::new()
            }
        };

        let topic = diffs_topic(table_id);
        let diffs = bus
            .subscribe(&topic)
            .await
            .map_err(|source| ReplicaError::Subscribe { topic, source })?;

        let (persist_tx, persist_rx) = watch::channel(log.to_persisted());
        let writer = spawn_table_task(
            "persist",
            table_id,
            run_writer(table_id.to_string(), store, persist_rx),
        );

        Ok(Self {
            table_id: table_id.to_string(),
            log,
            diffs,
            bus,
            persist_tx,
            writer,
        })
    }

    async fn run(
        mut self,
        channels: &mut ReplicaChannels,
        stop: &CancellationToken,
    ) -> Result<(), ReplicaError> {
        let result = self.pump(channels, stop).await;
        // Dropping the sender lets the writer save the newest document and exit.
        drop(self.persist_tx);
        if let Err(err) = self.writer.await {
            warn!(target: LOG_TARGET, table = %self.table_id, error = %err, "persistence writer panicked");
        }
        result
    }

    async fn pump(
        &mut self,
        channels: &mut ReplicaChannels,
        stop: &CancellationToken,
    ) -> Result<(), ReplicaError> {
        info!(target: LOG_TARGET, table = %self.table_id, "replica subscribed");
        loop {
            let flow = tokio::select! {
                biased;
                _ = stop.cancelled() => Flow::Stop,
                request = channels.requests.recv() => match request {
                    Some(envelope) => self.handle_request(envelope, channels).await,
                    None => Flow::Stop,
                },
                message = self.diffs.recv() => match message {
                    Ok(raw) => {
                        self.apply_message(&raw, &channels.updates)?;
                        Flow::Continue
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        return Err(ReplicaError::Lagged {
                            table_id: self.table_id.clone(),
                            skipped,
                        });
                    }
                    Err(RecvError::Closed) => {
                        return Err(ReplicaError::BroadcastClosed {
                            table_id: self.table_id.clone(),
                        });
                    }
                },
            };
            if let Flow::Stop = flow {
                info!(target: LOG_TARGET, table = %self.table_id, "replica stopping");
                return Ok(());
            }
        }
    }

    /// Applies one `[index, state]` broadcast. A message that does not decode
    /// ends this incarnation.
    fn apply_message(
        &mut self,
        raw: &str,
        updates: &broadcast::Sender<ReplicaUpdate>,
    ) -> Result<(), ReplicaError> {
        let LogEntry(index, state) =
            serde_json::from_str(raw).map_err(|source| ReplicaError::MalformedMessage {
                table_id: self.table_id.clone(),
                source,
            })?;

        let delta = match self.log.apply(index, state.clone()) {
            Applied::Advanced(previous) => Some(compute_delta(previous.as_ref(), &state)),
            Applied::Backfilled => {
                debug!(target: LOG_TARGET, table = %self.table_id, index, "late entry backfilled");
                None
            }
        };
        self.persist();

        debug!(target: LOG_TARGET, table = %self.table_id, index, "applied broadcast");
        let _ = updates.send(ReplicaUpdate {
            index,
            state,
            delta,
        });
        Ok(())
    }

    async fn handle_request(
        &mut self,
        ReplicaEnvelope { seq, request }: ReplicaEnvelope,
        channels: &ReplicaChannels,
    ) -> Flow {
        debug!(target: LOG_TARGET, table = %self.table_id, seq, kind = request.kind(), "handling request");
        let body = match request {
            ReplicaRequest::Snapshot { log } => {
                self.load_snapshot(log).await;
                ResponseBody::ok()
            }
            ReplicaRequest::GetState | ReplicaRequest::Replay => ResponseBody::State {
                state: self.log.current().cloned(),
            },
            ReplicaRequest::Resume { from } => ResponseBody::States {
                states: self.log.resume(from),
            },
            ReplicaRequest::Ping => ResponseBody::ok(),
        };

        match channels.responses.send(ReplicaResponse { seq, body }).await {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Stop,
        }
    }

    async fn load_snapshot(&mut self, entries: Vec<LogEntry>) {
        self.log.load_snapshot(entries);
        self.persist();

        let length = self.log.len();
        info!(target: LOG_TARGET, table = %self.table_id, length, "snapshot loaded");
        let topic = snapshot_ack_topic(&self.table_id);
        if let Err(err) = self.bus.publish(&topic, length.to_string()).await {
            warn!(target: LOG_TARGET, table = %self.table_id, error = %err, "failed to announce snapshot");
        }
    }

    fn persist(&self) {
        if self.persist_tx.send(self.log.to_persisted()).is_err() {
            warn!(target: LOG_TARGET, table = %self.table_id, "persistence writer gone, keeping state in memory");
        }
    }
}

/// Saves the newest document each time it changes. Documents replaced while
/// a write is in flight are never written. Failures are logged and dropped.
async fn run_writer(
    table_id: String,
    store: SharedReplicaStore,
    mut latest: watch::Receiver<PersistedReplica>,
) {
    while latest.changed().await.is_ok() {
        let document = latest.borrow_and_update().clone();
        if let Err(err) = store.save(&table_id, &document).await {
            warn!(target: LOG_TARGET, table = %table_id, error = %err, "failed to persist replica");
        }
    }
}

async fn supervise(
    table_id: String,
    max_restarts: u32,
    store: SharedReplicaStore,
    bus: Arc<dyn PubSub>,
    mut channels: ReplicaChannels,
    stop: CancellationToken,
    events: broadcast::Sender<ReplicaEvent>,
) -> Result<(), ReplicaError> {
    let mut restarts = 0u32;
    loop {
        let result = match Replica::bootstrap(&table_id, Arc::clone(&store), Arc::clone(&bus)).await
        {
            Ok(replica) => replica.run(&mut channels, &stop).await,
            Err(err) => Err(err),
        };

        let err = match result {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if stop.is_cancelled() {
            return Err(err);
        }
        if restarts >= max_restarts {
            error!(target: LOG_TARGET, table = %table_id, error = %err, restarts, "replica failed permanently");
            let _ = events.send(ReplicaEvent::Failed {
                table_id: table_id.clone(),
                reason: err.to_string(),
            });
            return Err(err);
        }

        restarts += 1;
        warn!(target: LOG_TARGET, table = %table_id, error = %err, attempt = restarts, "restarting replica");
        let _ = events.send(ReplicaEvent::Restarted {
            table_id: table_id.clone(),
            attempt: restarts,
            reason: err.to_string(),
        });
        tokio::select! {
            _ = stop.cancelled() => return Err(err),
            _ = tokio::time::sleep(RESTART_BACKOFF * restarts) => {}
        }
    }
}

async fn dispatch_responses(
    mut responses: mpsc::Receiver<ReplicaResponse>,
    pending: Arc<DashMap<u64, oneshot::Sender<ResponseBody>>>,
) {
    while let Some(ReplicaResponse { seq, body }) = responses.recv().await {
        match pending.remove(&seq) {
            Some((_, waiter)) => {
                let _ = waiter.send(body);
            }
            None => debug!(target: LOG_TARGET, seq, "response for unknown seq"),
        }
    }
    // Replica is gone; dropping the waiters wakes every caller with an error.
    pending.clear();
}

/// Owner's handle to a supervised table replica.
///
/// Requests are correlated by `seq`; a replica that restarts keeps the same
/// handle, queued requests are served by the next incarnation.
pub struct ReplicaHandle {
    table_id: String,
    requests: mpsc::Sender<ReplicaEnvelope>,
    pending: Arc<DashMap<u64, oneshot::Sender<ResponseBody>>>,
    next_seq: AtomicU64,
    updates: broadcast::Sender<ReplicaUpdate>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<Result<(), ReplicaError>>>>,
}

impl ReplicaHandle {
    pub fn spawn(
        table_id: impl Into<String>,
        cfg: &ReplicaConfig,
        store: SharedReplicaStore,
        bus: Arc<dyn PubSub>,
        events: broadcast::Sender<ReplicaEvent>,
    ) -> Self {
        let table_id = table_id.into();
        let (requests_tx, requests_rx) = mpsc::channel(cfg.request_capacity);
        let (responses_tx, responses_rx) = mpsc::channel(cfg.request_capacity);
        let (updates, _) = broadcast::channel(cfg.broadcast_capacity);
        let pending = Arc::new(DashMap::new());
        let stop = CancellationToken::new();

        let channels = ReplicaChannels {
            requests: requests_rx,
            responses: responses_tx,
            updates: updates.clone(),
        };
        let task = spawn_table_task(
            "replica",
            &table_id,
            supervise(
                table_id.clone(),
                cfg.max_restarts,
                store,
                bus,
                channels,
                stop.clone(),
                events,
            ),
        );
        spawn_table_task(
            "replica-responses",
            &table_id,
            dispatch_responses(responses_rx, Arc::clone(&pending)),
        );

        Self {
            table_id,
            requests: requests_tx,
            pending,
            next_seq: AtomicU64::new(1),
            updates,
            stop,
            task: Mutex::new(Some(task)),
        }
    }

    #[instrument(skip(self, request), level = "debug", target = "tablesync::replica", fields(table = %self.table_id, kind = request.kind()))]
    pub async fn request(&self, request: ReplicaRequest) -> Result<ResponseBody, ReplicaError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);

        if self
            .requests
            .send(ReplicaEnvelope { seq, request })
            .await
            .is_err()
        {
            self.pending.remove(&seq);
            return Err(self.closed());
        }
        rx.await.map_err(|_| self.closed())
    }

    pub async fn load_snapshot(&self, log: Vec<LogEntry>) -> Result<(), ReplicaError> {
        match self.request(ReplicaRequest::Snapshot { log }).await? {
            ResponseBody::Ok { ok: true } => Ok(()),
            _ => Err(ReplicaError::UnexpectedResponse { request: "snapshot" }),
        }
    }

    pub async fn get_state(&self) -> Result<Option<Value>, ReplicaError> {
        match self.request(ReplicaRequest::GetState).await? {
            ResponseBody::State { state } => Ok(state),
            _ => Err(ReplicaError::UnexpectedResponse { request: "getState" }),
        }
    }

    pub async fn resume(&self, from: u64) -> Result<Vec<LogEntry>, ReplicaError> {
        match self.request(ReplicaRequest::Resume { from }).await? {
            ResponseBody::States { states } => Ok(states),
            _ => Err(ReplicaError::UnexpectedResponse { request: "resume" }),
        }
    }

    pub async fn replay(&self) -> Result<Option<Value>, ReplicaError> {
        match self.request(ReplicaRequest::Replay).await? {
            ResponseBody::State { state } => Ok(state),
            _ => Err(ReplicaError::UnexpectedResponse { request: "replay" }),
        }
    }

    /// Liveness check. A successful ping also means the replica finished
    /// bootstrapping and is subscribed to its diff topic.
    pub async fn ping(&self) -> Result<(), ReplicaError> {
        match self.request(ReplicaRequest::Ping).await? {
            ResponseBody::Ok { ok: true } => Ok(()),
            _ => Err(ReplicaError::UnexpectedResponse { request: "ping" }),
        }
    }

    pub fn updates(&self) -> broadcast::Receiver<ReplicaUpdate> {
        self.updates.subscribe()
    }

    /// Updates as a stream; gaps from a slow listener are skipped.
    pub fn update_stream(&self) -> impl Stream<Item = ReplicaUpdate> + Send + 'static {
        BroadcastStream::new(self.updates.subscribe())
            .filter_map(|update| futures::future::ready(update.ok()))
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stops the replica, waits for its last persistence write and returns how
    /// the replica ended.
    pub async fn shutdown(&self) -> Result<(), ReplicaError> {
        self.stop.cancel();
        let task = self.task.lock().take();
        match task {
            Some(task) => task.await?,
            None => Ok(()),
        }
    }

    fn closed(&self) -> ReplicaError {
        ReplicaError::Closed {
            table_id: self.table_id.clone(),
        }
    }
}

impl Drop for ReplicaHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
