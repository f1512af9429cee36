//! Size- and time-bounded batching.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use logship_config::{BackoffConfiguration, ClientConfiguration};
use logship_core::{
    task::spawn_traced_named, DeliveryAck, DeliveryReceipt, DestinationKey, LabelSet, LogClient, LogEntry,
    TENANT_LABEL,
};
use logship_error::GenericError;
use tokio::{
    select,
    sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
    time::{interval, sleep, timeout, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    push::{PushClient, PushRequest, PushStream},
    telemetry::ClientTelemetry,
    ClientError,
};

mod backoff;
pub use self::backoff::{ExponentialBackoff, RetryState};

const CHANNEL_CAPACITY: usize = 1024;
const MAX_IN_FLIGHT_BATCHES: usize = 32;
const MIN_WAIT_CHECK_FREQUENCY: Duration = Duration::from_millis(10);
const MAX_WAIT_CHECK_FREQUENCY: Duration = Duration::from_secs(1);

struct Envelope {
    entry: LogEntry,
    ack: Option<DeliveryAck>,
}

struct Batch {
    entries: Vec<(DateTime<Utc>, String)>,
    acks: Vec<DeliveryAck>,
    size_bytes: usize,
    created: Instant,
}

impl Batch {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            acks: Vec::new(),
            size_bytes: 0,
            created: Instant::now(),
        }
    }

    fn push(&mut self, timestamp: DateTime<Utc>, line: String, ack: Option<DeliveryAck>) {
        self.size_bytes += line.len();
        self.entries.push((timestamp, line));
        self.acks.extend(ack);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Batches entries per label set and pushes them with bounded retries.
///
/// Entries are accumulated per label set. A batch is flushed when adding an entry would push it over the configured
/// batch size, or once it is older than the configured batch wait. Failed pushes that are worth retrying are retried
/// with exponential backoff, and batches are dropped once the retry budget is exhausted.
///
/// Flushed batches are pushed in the background, so a batch backing off never holds up the others. Batches of the
/// same label set are still pushed one after the other, in the order they were flushed. At most a fixed number of
/// batches is in flight at once, after which the client stops accepting entries until one completes.
///
/// The destination's tenant is taken from the reserved tenant label when present (which is never pushed as a label),
/// and from the statically configured tenant otherwise.
pub struct BatchingClient {
    destination: DestinationKey,
    sender: Mutex<Option<mpsc::Sender<Envelope>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    graceful_shutdown_timeout: Duration,
    telemetry: ClientTelemetry,
}

impl BatchingClient {
    /// Creates a new `BatchingClient` pushing through `push`, and spawns its flush worker.
    ///
    /// The worker is cancelled when `shutdown` is cancelled.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        destination: DestinationKey, config: &ClientConfiguration, push: Arc<dyn PushClient>, tenant: Option<String>,
        shutdown: &CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = shutdown.child_token();
        let telemetry = ClientTelemetry::for_destination(&destination);

        let pusher = Pusher {
            destination: destination.clone(),
            push,
            backoff: config.backoff.clone(),
            sort_by_timestamp: config.sort_by_timestamp,
            tenant: tenant.filter(|tenant| !tenant.is_empty()),
            cancel: cancel.clone(),
            telemetry: telemetry.clone(),
        };
        let worker = Worker {
            destination: destination.clone(),
            batch_size: config.batch_size,
            batch_wait: config.batch_wait,
            external_labels: config.external_labels.clone(),
            batches: HashMap::new(),
            pusher: Arc::new(pusher),
            permits: Arc::new(Semaphore::new(MAX_IN_FLIGHT_BATCHES)),
            in_flight: HashMap::new(),
            cancel: cancel.clone(),
            telemetry: telemetry.clone(),
        };
        let worker = spawn_traced_named(format!("batch-{}", destination), worker.run(receiver));

        Self {
            destination,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            cancel,
            graceful_shutdown_timeout: config.graceful_shutdown_timeout,
            telemetry,
        }
    }

    fn stopped(&self) -> ClientError {
        ClientError::Stopped {
            destination: self.destination.to_string(),
        }
    }

    async fn enqueue(&self, envelope: Envelope) -> Result<(), GenericError> {
        let sender = self.sender.lock().await.clone();
        let Some(sender) = sender.filter(|_| !self.cancel.is_cancelled()) else {
            self.telemetry.track_stopped_drop(1);
            return Err(self.stopped().into());
        };

        if sender.send(envelope).await.is_err() {
            self.telemetry.track_stopped_drop(1);
            return Err(self.stopped().into());
        }

        Ok(())
    }

    async fn join_worker(&self, worker: JoinHandle<()>) {
        if let Err(e) = worker.await {
            error!(destination = %self.destination, error = %e, "Batch worker failed.");
        }
    }
}

#[async_trait]
impl LogClient for BatchingClient {
    async fn handle(&self, labels: LabelSet, timestamp: DateTime<Utc>, line: String) -> Result<(), GenericError> {
        let entry = LogEntry::new(labels, timestamp, line);
        self.enqueue(Envelope { entry, ack: None }).await
    }

    async fn handle_acknowledged(
        &self, labels: LabelSet, timestamp: DateTime<Utc>, line: String,
    ) -> Result<DeliveryReceipt, GenericError> {
        let (ack, receipt) = DeliveryReceipt::pending();
        let entry = LogEntry::new(labels, timestamp, line);
        self.enqueue(Envelope { entry, ack: Some(ack) }).await?;
        Ok(receipt)
    }

    async fn stop(&self) {
        self.sender.lock().await.take();
        self.cancel.cancel();

        if let Some(worker) = self.worker.lock().await.take() {
            self.join_worker(worker).await;
        }
    }

    async fn stop_wait(&self) {
        // Dropping the sender lets the worker drain the channel and flush everything it holds.
        self.sender.lock().await.take();

        if let Some(mut worker) = self.worker.lock().await.take() {
            match timeout(self.graceful_shutdown_timeout, &mut worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(destination = %self.destination, error = %e, "Batch worker failed."),
                Err(_) => {
                    warn!(
                        destination = %self.destination,
                        timeout = ?self.graceful_shutdown_timeout,
                        "Timed out flushing pending batches. Discarding remaining entries."
                    );
                    self.cancel.cancel();
                    self.join_worker(worker).await;
                }
            }
        }

        self.cancel.cancel();
    }
}

struct Worker {
    destination: DestinationKey,
    batch_size: usize,
    batch_wait: Duration,
    external_labels: LabelSet,
    batches: HashMap<LabelSet, Batch>,
    pusher: Arc<Pusher>,
    permits: Arc<Semaphore>,
    in_flight: HashMap<LabelSet, JoinHandle<()>>,
    cancel: CancellationToken,
    telemetry: ClientTelemetry,
}

impl Worker {
    async fn run(mut self, mut entries: mpsc::Receiver<Envelope>) {
        let check_frequency = (self.batch_wait / 10).clamp(MIN_WAIT_CHECK_FREQUENCY, MAX_WAIT_CHECK_FREQUENCY);
        let mut ticker = interval(check_frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(destination = %self.destination, "Batch worker started.");

        loop {
            select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.discard_pending();
                    self.join_in_flight().await;
                    debug!(destination = %self.destination, "Batch worker stopped.");
                    return;
                }
                maybe_envelope = entries.recv() => match maybe_envelope {
                    Some(envelope) => self.add(envelope).await,
                    None => break,
                },
                _ = ticker.tick() => self.flush_expired().await,
            }
        }

        // Every sender is gone: flush whatever is left before exiting.
        let pending = self.batches.drain().collect::<Vec<_>>();
        for (labels, batch) in pending {
            self.dispatch(labels, batch).await;
        }
        self.join_in_flight().await;

        debug!(destination = %self.destination, "Batch worker stopped after flushing pending batches.");
    }

    async fn add(&mut self, envelope: Envelope) {
        let Envelope {
            entry: LogEntry {
                mut labels,
                timestamp,
                line,
            },
            ack,
        } = envelope;
        labels.merge_missing(&self.external_labels);

        let would_overflow = self
            .batches
            .get(&labels)
            .is_some_and(|batch| !batch.is_empty() && batch.size_bytes + line.len() > self.batch_size);
        if would_overflow {
            if let Some(batch) = self.batches.remove(&labels) {
                self.dispatch(labels.clone(), batch).await;
            }
        }

        self.batches.entry(labels).or_insert_with(Batch::new).push(timestamp, line, ack);
    }

    async fn flush_expired(&mut self) {
        self.in_flight.retain(|_, push| !push.is_finished());

        let batch_wait = self.batch_wait;
        let expired = self
            .batches
            .iter()
            .filter(|(_, batch)| batch.created.elapsed() >= batch_wait)
            .map(|(labels, _)| labels.clone())
            .collect::<Vec<_>>();

        for labels in expired {
            if let Some(batch) = self.batches.remove(&labels) {
                self.dispatch(labels, batch).await;
            }
        }
    }

    fn discard_pending(&mut self) {
        let discarded = self.batches.drain().map(|(_, batch)| batch.len()).sum::<usize>();
        if discarded > 0 {
            self.telemetry.track_stopped_drop(discarded);
            warn!(destination = %self.destination, entries = discarded, "Discarded pending entries on stop.");
        }
    }

    /// Hands a batch off to a background push, waiting for an in-flight slot first.
    async fn dispatch(&mut self, labels: LabelSet, batch: Batch) {
        if batch.is_empty() {
            return;
        }

        let permit = select! {
            biased;

            _ = self.cancel.cancelled() => None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            self.telemetry.track_stopped_drop(batch.len());
            return;
        };

        let previous = self.in_flight.remove(&labels);
        let pusher = Arc::clone(&self.pusher);
        let push = spawn_traced_named(
            format!("push-{}", self.destination),
            pusher.run(labels.clone(), batch, previous, permit),
        );
        self.in_flight.insert(labels, push);
    }

    async fn join_in_flight(&mut self) {
        for (_, push) in self.in_flight.drain() {
            if let Err(e) = push.await {
                error!(destination = %self.destination, error = %e, "Batch push task failed.");
            }
        }
    }
}

struct Pusher {
    destination: DestinationKey,
    push: Arc<dyn PushClient>,
    backoff: BackoffConfiguration,
    sort_by_timestamp: bool,
    tenant: Option<String>,
    cancel: CancellationToken,
    telemetry: ClientTelemetry,
}

impl Pusher {
    async fn run(
        self: Arc<Self>, labels: LabelSet, batch: Batch, previous: Option<JoinHandle<()>>,
        _permit: OwnedSemaphorePermit,
    ) {
        // Batches of the same label set go out in order.
        if let Some(previous) = previous {
            if let Err(e) = previous.await {
                error!(destination = %self.destination, error = %e, "Batch push task failed.");
            }
        }

        // Acknowledgements that are dropped unresolved report their entries as dropped.
        let Batch { entries, acks, .. } = batch;
        if self.send(labels, entries).await {
            for ack in acks {
                ack.delivered();
            }
        }
    }

    /// Pushes a batch, retrying with backoff. Returns `true` if the batch was delivered.
    async fn send(&self, mut labels: LabelSet, mut entries: Vec<(DateTime<Utc>, String)>) -> bool {
        let tenant = labels.remove(TENANT_LABEL).or_else(|| self.tenant.clone());
        if self.sort_by_timestamp {
            entries.sort_by_key(|(timestamp, _)| *timestamp);
        }

        let request = PushRequest {
            tenant,
            streams: vec![PushStream { labels, entries }],
        };
        let entry_count = request.entry_count();
        let mut retry = RetryState::new(&self.backoff);

        loop {
            let result = select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.telemetry.track_stopped_drop(entry_count);
                    return false;
                }
                result = self.push.push(&request) => result,
            };

            let error = match result {
                Ok(()) => {
                    self.telemetry.track_sent(entry_count);
                    debug!(destination = %self.destination, entries = entry_count, "Pushed batch.");
                    return true;
                }
                Err(e) => e,
            };

            let delay = if error.is_retryable() { retry.record_failure() } else { None };
            let Some(delay) = delay else {
                self.telemetry.track_failed_batch(entry_count);
                error!(
                    destination = %self.destination,
                    entries = entry_count,
                    attempts = retry.attempt() + 1,
                    error = %error,
                    "Failed to push batch. Dropping it."
                );
                return false;
            };

            warn!(
                destination = %self.destination,
                attempt = retry.attempt(),
                error = %error,
                "Failed to push batch. Retrying in {:?}.",
                delay
            );

            select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.telemetry.track_stopped_drop(entry_count);
                    return false;
                }
                _ = sleep(delay) => {}
            }
        }
    }
}
