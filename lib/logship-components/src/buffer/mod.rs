//! Durable buffering in front of a delivery client.

use std::{
    collections::VecDeque,
    future,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use logship_config::ClientConfiguration;
use logship_core::{task::spawn_traced_named, Delivery, DeliveryReceipt, DestinationKey, LabelSet, LogClient, LogEntry};
use logship_error::GenericError;
use snafu::ResultExt as _;
use tokio::{
    select,
    sync::{Mutex, Notify},
    task::JoinHandle,
    time::{sleep, timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{telemetry::ClientTelemetry, ClientError, Queue};

mod queue;
pub use self::queue::{DiskQueue, QueuePosition};

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const MAX_UNACKNOWLEDGED_ENTRIES: usize = 1024;

/// Buffers entries in a durable on-disk queue before handing them to an inner client.
///
/// `handle` returns once the entry has been written to the queue. A background worker drains the queue in order and
/// forwards each entry to the inner client, and an entry only leaves the queue once the inner client reports it as
/// delivered. When the inner client refuses an entry or gives up on it, every entry not yet reported as delivered is
/// forwarded again after a fixed interval, so nothing is dropped while the destination is unavailable. Entries may be
/// delivered more than once as a result.
pub struct BufferedClient {
    destination: DestinationKey,
    queue: Arc<Mutex<DiskQueue<LogEntry>>>,
    notify: Arc<Notify>,
    inner: Arc<dyn LogClient>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    finish: CancellationToken,
    stopped: AtomicBool,
    graceful_shutdown_timeout: Duration,
    telemetry: ClientTelemetry,
}

impl BufferedClient {
    /// Opens the queue for `destination` and spawns the drain worker forwarding to `inner`.
    ///
    /// The queue lives in `<QueueDir>/<QueueName>-<destination>`. The worker is cancelled when `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// If the queue cannot be opened, an error is returned.
    pub async fn open(
        destination: DestinationKey, config: &ClientConfiguration, inner: Arc<dyn LogClient>,
        shutdown: &CancellationToken,
    ) -> Result<Self, GenericError> {
        Self::open_with_retry_interval(destination, config, inner, shutdown, DEFAULT_RETRY_INTERVAL).await
    }

    /// Like [`open`][Self::open], with a custom interval between delivery attempts of a failing entry.
    pub async fn open_with_retry_interval(
        destination: DestinationKey, config: &ClientConfiguration, inner: Arc<dyn LogClient>,
        shutdown: &CancellationToken, retry_interval: Duration,
    ) -> Result<Self, GenericError> {
        let queue_config = &config.buffer.queue;
        let root_path = queue_path(&queue_config.dir, &queue_config.name, &destination);
        let queue = DiskQueue::open(root_path, queue_config.segment_size, queue_config.sync).await?;
        if !queue.is_empty() {
            debug!(destination = %destination, entries = queue.len(), "Resuming delivery of buffered entries.");
        }

        let queue = Arc::new(Mutex::new(queue));
        let notify = Arc::new(Notify::new());
        let cancel = shutdown.child_token();
        let finish = CancellationToken::new();
        let telemetry = ClientTelemetry::for_destination(&destination);

        let drainer = Drainer {
            destination: destination.clone(),
            queue: Arc::clone(&queue),
            notify: Arc::clone(&notify),
            inner: Arc::clone(&inner),
            cancel: cancel.clone(),
            finish: finish.clone(),
            retry_interval,
        };
        let worker = spawn_traced_named(format!("buffer-{}", destination), drainer.run());

        Ok(Self {
            destination,
            queue,
            notify,
            inner,
            worker: Mutex::new(Some(worker)),
            cancel,
            finish,
            stopped: AtomicBool::new(false),
            graceful_shutdown_timeout: config.graceful_shutdown_timeout,
            telemetry,
        })
    }

    async fn join_worker(&self, worker: JoinHandle<()>) {
        if let Err(e) = worker.await {
            error!(destination = %self.destination, error = %e, "Buffer drain worker failed.");
        }
    }
}

#[async_trait]
impl LogClient for BufferedClient {
    async fn handle(&self, labels: LabelSet, timestamp: DateTime<Utc>, line: String) -> Result<(), GenericError> {
        if self.stopped.load(SeqCst) || self.cancel.is_cancelled() {
            self.telemetry.track_stopped_drop(1);
            return Err(ClientError::Stopped {
                destination: self.destination.to_string(),
            }
            .into());
        }

        let entry = LogEntry::new(labels, timestamp, line);
        self.queue.lock().await.push(&entry).await.context(Queue {
            destination: self.destination.to_string(),
        })?;
        self.telemetry.track_enqueued();
        self.notify.notify_one();

        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, SeqCst);
        self.cancel.cancel();
        if let Some(worker) = self.worker.lock().await.take() {
            self.join_worker(worker).await;
        }

        self.inner.stop().await;
    }

    async fn stop_wait(&self) {
        self.stopped.store(true, SeqCst);
        self.finish.cancel();

        // Draining the buffer and stopping the inner client share a single deadline.
        let deadline = Instant::now() + self.graceful_shutdown_timeout;

        if let Some(mut worker) = self.worker.lock().await.take() {
            if timeout_at(deadline, &mut worker).await.is_err() {
                let remaining = self.queue.lock().await.len();
                warn!(
                    destination = %self.destination,
                    entries = remaining,
                    "Timed out draining the buffer. Remaining entries stay queued on disk."
                );
                self.cancel.cancel();
                self.join_worker(worker).await;
                self.inner.stop().await;
                return;
            }
        }

        if timeout_at(deadline, self.inner.stop_wait()).await.is_err() {
            warn!(destination = %self.destination, "Timed out stopping the delivery client gracefully.");
            self.inner.stop().await;
        }
    }
}

type InFlight = VecDeque<(QueuePosition, DeliveryReceipt)>;

enum Forwarded {
    Sent,
    Empty,
    Failed,
}

struct Drainer {
    destination: DestinationKey,
    queue: Arc<Mutex<DiskQueue<LogEntry>>>,
    notify: Arc<Notify>,
    inner: Arc<dyn LogClient>,
    cancel: CancellationToken,
    finish: CancellationToken,
    retry_interval: Duration,
}

impl Drainer {
    async fn run(self) {
        debug!(destination = %self.destination, "Buffer drain worker started.");

        let mut in_flight = InFlight::new();
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if in_flight.len() < MAX_UNACKNOWLEDGED_ENTRIES {
                match self.forward_next(&mut in_flight).await {
                    Forwarded::Sent => continue,
                    Forwarded::Empty => {}
                    Forwarded::Failed => {
                        if !self.wait_before_retry().await {
                            break;
                        }
                        continue;
                    }
                }
            }

            // Nothing is left to read, and everything read has been delivered.
            if in_flight.is_empty() && self.finish.is_cancelled() {
                break;
            }

            let window_open = in_flight.len() < MAX_UNACKNOWLEDGED_ENTRIES;
            let idle = in_flight.is_empty();
            let outcome = select! {
                biased;

                _ = self.cancel.cancelled() => break,
                delivery = oldest_outcome(&mut in_flight) => Some(delivery),
                _ = self.notify.notified(), if window_open => None,
                _ = self.finish.cancelled(), if idle => None,
            };

            match outcome {
                Some(Delivery::Delivered) => {
                    if let Some((position, _)) = in_flight.pop_front() {
                        if let Err(e) = self.queue.lock().await.acknowledge(position).await {
                            error!(
                                destination = %self.destination,
                                error = %e,
                                "Failed to acknowledge buffered entry."
                            );
                        }
                    }
                }
                Some(Delivery::Dropped) => {
                    warn!(
                        destination = %self.destination,
                        entries = in_flight.len(),
                        "Buffered entry was not delivered. Forwarding unacknowledged entries again in {:?}.",
                        self.retry_interval
                    );
                    self.rewind(&mut in_flight).await;
                    if !self.wait_before_retry().await {
                        break;
                    }
                }
                None => {}
            }
        }

        debug!(destination = %self.destination, "Buffer drain worker stopped.");
    }

    async fn forward_next(&self, in_flight: &mut InFlight) -> Forwarded {
        let next = self.queue.lock().await.read_next().await;
        let (position, entry) = match next {
            Ok(Some(next)) => next,
            Ok(None) => return Forwarded::Empty,
            Err(e) => {
                error!(destination = %self.destination, error = %e, "Failed to read from buffer.");
                return Forwarded::Failed;
            }
        };

        let LogEntry { labels, timestamp, line } = entry;
        match self.inner.handle_acknowledged(labels, timestamp, line).await {
            Ok(receipt) => {
                in_flight.push_back((position, receipt));
                Forwarded::Sent
            }
            Err(e) => {
                warn!(
                    destination = %self.destination,
                    error = %e,
                    "Failed to forward buffered entry. Retrying in {:?}.",
                    self.retry_interval
                );
                self.rewind(in_flight).await;
                Forwarded::Failed
            }
        }
    }

    async fn rewind(&self, in_flight: &mut InFlight) {
        in_flight.clear();
        self.queue.lock().await.rewind();
    }

    /// Waits out the retry interval, returning `false` if the worker was cancelled in the meantime.
    async fn wait_before_retry(&self) -> bool {
        select! {
            biased;

            _ = self.cancel.cancelled() => false,
            _ = sleep(self.retry_interval) => true,
        }
    }
}

async fn oldest_outcome(in_flight: &mut InFlight) -> Delivery {
    match in_flight.front_mut() {
        Some((_, receipt)) => receipt.wait().await,
        None => future::pending().await,
    }
}

fn queue_path(dir: &Path, name: &str, destination: &DestinationKey) -> PathBuf {
    let destination = destination
        .to_string()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect::<String>();
    dir.join(format!("{}-{}", name, destination))
}
