//! Chunking edge records into payloads and shipping them to a store.
//!
//! Synchronous delivery runs inline and reports the first rejected payload.
//! Asynchronous delivery goes through a [`DeliveryWorker`]: a dedicated thread
//! fed by a bounded channel, with no completion signal to the submitter.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::error::Error;
use crate::flatten::EdgeRecord;
use crate::store::{Binding, Store};

/// Most rows a serverless engine accepts in one insert.
pub const SERVERLESS_PARAMETER_CEILING: usize = 999;

/// Rows handed to a single [`Store::insert`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// The whole invocation in one flat sequence.
    Rows(Vec<EdgeRecord>),
    /// An outer batch; chunked deliveries always hold exactly one chunk.
    Batched(Vec<Vec<EdgeRecord>>),
}

impl Payload {
    /// Every row, batches flattened, in order.
    pub fn rows(&self) -> Box<dyn Iterator<Item = &EdgeRecord> + '_> {
        match self {
            Payload::Rows(rows) => Box::new(rows.iter()),
            Payload::Batched(batches) => Box::new(batches.iter().flatten()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Rows(rows) => rows.len(),
            Payload::Batched(batches) => batches.iter().map(Vec::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Split `records` into the payloads one delivery inserts, in order.
///
/// A serverless binding with at least [`SERVERLESS_PARAMETER_CEILING`] rows
/// gets consecutive chunks of that size (the last one may be shorter), each
/// wrapped as a single-element batch. Anything else is one flat payload.
pub fn partition(records: Vec<EdgeRecord>, binding: &Binding) -> Vec<Payload> {
    if !binding.is_serverless() || records.len() < SERVERLESS_PARAMETER_CEILING {
        return vec![Payload::Rows(records)];
    }

    let mut payloads = Vec::with_capacity(records.len().div_ceil(SERVERLESS_PARAMETER_CEILING));
    let mut rest = records;
    while !rest.is_empty() {
        let tail = rest.split_off(rest.len().min(SERVERLESS_PARAMETER_CEILING));
        payloads.push(Payload::Batched(vec![rest]));
        rest = tail;
    }
    payloads
}

/// Insert `records` inline. Returns the number of inserts made.
///
/// Stops at the first rejected payload; earlier payloads stay written.
pub fn deliver(store: &dyn Store, binding: &Binding, records: Vec<EdgeRecord>) -> Result<usize, Error> {
    let payloads = partition(records, binding);
    for payload in &payloads {
        store.insert(payload, binding)?;
    }
    tracing::debug!(
        database = %binding.database_name,
        inserts = payloads.len(),
        "delivered payload"
    );
    Ok(payloads.len())
}

/// One invocation's records, bound for one store.
pub struct DeliveryJob {
    pub store: Arc<dyn Store>,
    pub binding: Binding,
    pub records: Vec<EdgeRecord>,
}

impl std::fmt::Debug for DeliveryJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryJob")
            .field("binding", &self.binding)
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

/// Counters kept by a [`DeliveryWorker`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Jobs whose every payload was inserted.
    pub delivered: u64,
    /// Jobs with a rejected payload.
    pub failed: u64,
    /// Jobs refused because the queue was full or the worker gone.
    pub dropped: u64,
    /// Rows in delivered jobs.
    pub rows: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    rows: AtomicU64,
}

enum Message {
    Deliver(DeliveryJob),
    Flush(Sender<()>),
}

/// Background thread that batches and inserts submitted jobs.
///
/// Submitting never blocks. Dropping the worker lets it drain what is already
/// queued, then joins it.
pub struct DeliveryWorker {
    sender: Option<Sender<Message>>,
    counters: Arc<Counters>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryWorker {
    /// Start a worker whose queue holds at most `capacity` jobs.
    pub fn spawn(capacity: usize) -> Result<Self, Error> {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let handle = std::thread::Builder::new()
            .name("tempo-delivery".into())
            .spawn({
                let counters = Arc::clone(&counters);
                move || run(receiver, &counters)
            })?;
        tracing::debug!(capacity, "delivery worker started");
        Ok(Self {
            sender: Some(sender),
            counters,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue `job`. Returns `false` if it was dropped.
    pub fn submit(&self, job: DeliveryJob) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        match sender.try_send(Message::Deliver(job)) {
            Ok(()) => true,
            Err(TrySendError::Full(Message::Deliver(job))) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    database = %job.binding.database_name,
                    records = job.records.len(),
                    "delivery queue full, dropping payload"
                );
                false
            }
            Err(_) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("delivery worker stopped, dropping payload");
                false
            }
        }
    }

    /// Block until every job submitted before this call has been processed.
    pub fn flush(&self) {
        let Some(sender) = &self.sender else {
            return;
        };
        let (ack, done) = crossbeam_channel::bounded(1);
        if sender.send(Message::Flush(ack)).is_ok() {
            let _ = done.recv();
        }
    }

    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            rows: self.counters.rows.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for DeliveryWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryWorker")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Drop for DeliveryWorker {
    fn drop(&mut self) {
        self.sender.take();
        let handle = self
            .handle
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("delivery worker panicked");
            }
        }
    }
}

fn run(receiver: Receiver<Message>, counters: &Counters) {
    for message in receiver {
        match message {
            Message::Deliver(job) => {
                let rows = job.records.len() as u64;
                match deliver(job.store.as_ref(), &job.binding, job.records) {
                    Ok(_) => {
                        counters.delivered.fetch_add(1, Ordering::Relaxed);
                        counters.rows.fetch_add(rows, Ordering::Relaxed);
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            database = %job.binding.database_name,
                            error = %e,
                            "asynchronous payload delivery failed"
                        );
                    }
                }
            }
            Message::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
