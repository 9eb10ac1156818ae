//! Bounded recorder of sent and received messages.
//!
//! Recording never blocks: records are handed to a persister task through a
//! queue sized after the trace capacity. The persister keeps records in
//! arrival order until the capacity is reached and silently drops the rest.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use vppapi_protocol::Message;

/// Extra queue slots for flush requests.
const FLUSH_SLOTS: usize = 16;

/// Records preallocated up front.
const INITIAL_RECORDS: usize = 1024;

/// One traced message.
#[derive(Debug, Clone)]
pub struct Record {
    pub message: Arc<dyn Message>,
    pub timestamp: DateTime<Utc>,
    pub is_received: bool,
    pub channel_id: u16,
}

enum TraceCommand {
    Record(Record),
    Flush(oneshot::Sender<()>),
}

/// Call tracer shared by a connection and its channels.
pub struct Trace {
    enabled: AtomicBool,
    tx: mpsc::Sender<TraceCommand>,
    records: Arc<Mutex<Vec<Record>>>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
}

impl Trace {
    /// Creates a tracer and spawns its persister. Must be called within a
    /// Tokio runtime.
    pub fn new(capacity: usize, enabled: bool) -> Self {
        // a record only misses the queue once `capacity` records are ahead
        // of it, in which case the persister would discard it anyway
        let (tx, rx) = mpsc::channel(capacity.saturating_add(FLUSH_SLOTS));
        let records = Arc::new(Mutex::new(Vec::with_capacity(capacity.min(INITIAL_RECORDS))));
        let dropped = Arc::new(AtomicU64::new(0));
        tokio::spawn(persist(rx, records.clone(), dropped.clone(), capacity));
        Self {
            enabled: AtomicBool::new(enabled),
            tx,
            records,
            dropped,
            capacity,
        }
    }

    pub fn enable(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        tracing::debug!("call tracing {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records discarded because the trace was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn record(&self, message: Arc<dyn Message>, channel_id: u16, is_received: bool) {
        if !self.is_enabled() {
            return;
        }
        let record = Record {
            message,
            timestamp: Utc::now(),
            is_received,
            channel_id,
        };
        if self.tx.try_send(TraceCommand::Record(record)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Waits until every record queued so far has been persisted.
    async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(TraceCommand::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Returns all stored records sorted by timestamp.
    pub async fn get_records(&self) -> Vec<Record> {
        self.flush().await;
        let mut records = self.records.lock().clone();
        records.sort_by_key(|r| r.timestamp);
        records
    }

    /// Returns the stored records of one channel sorted by timestamp.
    pub async fn get_records_for_channel(&self, channel_id: u16) -> Vec<Record> {
        let mut records = self.get_records().await;
        records.retain(|r| r.channel_id == channel_id);
        records
    }

    /// Drops every stored record.
    pub async fn clear(&self) {
        self.flush().await;
        self.records.lock().clear();
    }
}

async fn persist(
    mut rx: mpsc::Receiver<TraceCommand>,
    records: Arc<Mutex<Vec<Record>>>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            TraceCommand::Record(record) => {
                let mut records = records.lock();
                if records.len() < capacity {
                    records.push(record);
                } else {
                    dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            TraceCommand::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    tracing::debug!("trace persister stopped");
}
