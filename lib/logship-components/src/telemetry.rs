use logship_core::DestinationKey;
use metrics::{counter, Counter};

/// Per-destination delivery telemetry.
///
/// Without an installed recorder, every counter is a no-op.
#[derive(Clone)]
pub struct ClientTelemetry {
    entries_sent: Counter,
    entries_dropped_delivery: Counter,
    entries_dropped_admission: Counter,
    entries_dropped_stopped: Counter,
    batches_failed: Counter,
    buffer_enqueued: Counter,
}

impl ClientTelemetry {
    /// Creates a new `ClientTelemetry` whose counters are tagged with the given destination.
    pub fn for_destination(destination: &DestinationKey) -> Self {
        let destination = destination.to_string();
        Self {
            entries_sent: counter!("logship_entries_sent_total", "destination" => destination.clone()),
            entries_dropped_delivery: counter!(
                "logship_entries_dropped_total",
                "destination" => destination.clone(),
                "reason" => "delivery"
            ),
            entries_dropped_admission: counter!(
                "logship_entries_dropped_total",
                "destination" => destination.clone(),
                "reason" => "admission"
            ),
            entries_dropped_stopped: counter!(
                "logship_entries_dropped_total",
                "destination" => destination.clone(),
                "reason" => "stopped"
            ),
            batches_failed: counter!("logship_batches_failed_total", "destination" => destination.clone()),
            buffer_enqueued: counter!("logship_buffer_enqueued_total", "destination" => destination),
        }
    }

    /// Tracks entries that were pushed successfully.
    pub fn track_sent(&self, entries: usize) {
        self.entries_sent.increment(entries as u64);
    }

    /// Tracks a batch that was dropped after failing to be delivered.
    pub fn track_failed_batch(&self, entries: usize) {
        self.batches_failed.increment(1);
        self.entries_dropped_delivery.increment(entries as u64);
    }

    /// Tracks an entry discarded by the admission gate.
    pub fn track_admission_drop(&self) {
        self.entries_dropped_admission.increment(1);
    }

    /// Tracks entries discarded because their client was stopped.
    pub fn track_stopped_drop(&self, entries: usize) {
        self.entries_dropped_stopped.increment(entries as u64);
    }

    /// Tracks an entry written to the on-disk queue.
    pub fn track_enqueued(&self) {
        self.buffer_enqueued.increment(1);
    }
}
