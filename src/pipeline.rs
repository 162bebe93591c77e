//! Batch buffer and flusher.
//!
//! Decoded records accumulate in a shared buffer and are delivered to the
//! storage sink in batches. Two independent triggers drive a flush: the
//! buffer reaching its size threshold (checked on every append) and a
//! wall-clock interval. Delivery is at-least-once: a failed batch is
//! returned to the buffer, ahead of newer records, for the next cycle.
//!
//! The buffer lock is only ever held for the in-memory swap, never across
//! a network or database call.

use crate::dxlink::CandleRecord;
use crate::errors::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Poll interval for the shutdown flag in the intake loop.
const INTAKE_POLL: Duration = Duration::from_millis(500);

/// Append-only persistence target for candle batches.
///
/// Implementations must accept partial batches and tolerate repeated
/// delivery of overlapping content.
#[async_trait]
pub trait CandleSink: Send + Sync {
    /// Persist an ordered batch, returning the number of rows written.
    async fn insert_batch(&self, records: &[CandleRecord]) -> Result<usize>;
}

/// Shared record buffer between the stream consumer and the flusher.
pub struct BatchBuffer {
    records: Mutex<Vec<CandleRecord>>,
    /// Size threshold that triggers an eager flush
    flush_threshold: usize,
    /// Hard cap on records retained across failed flush cycles
    max_backlog: usize,
    /// Records discarded because the backlog cap was exceeded
    dropped: AtomicU64,
}

impl BatchBuffer {
    /// Create a buffer with the given flush threshold and backlog cap.
    pub fn new(flush_threshold: usize, max_backlog: usize) -> Self {
        let flush_threshold = flush_threshold.max(1);
        Self {
            records: Mutex::new(Vec::with_capacity(flush_threshold * 2)),
            flush_threshold,
            max_backlog: max_backlog.max(flush_threshold),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a record. Returns true when the buffer has reached the
    /// flush threshold.
    pub fn push(&self, record: CandleRecord) -> bool {
        let mut records = self.records.lock();
        records.push(record);
        records.len() >= self.flush_threshold
    }

    /// Snapshot-and-clear the entire current contents.
    pub fn take(&self) -> Vec<CandleRecord> {
        std::mem::take(&mut *self.records.lock())
    }

    /// Return a failed snapshot to the buffer, ahead of records that
    /// arrived during the flush attempt, preserving order. When the total
    /// would exceed the backlog cap the oldest records are discarded.
    pub fn requeue(&self, mut batch: Vec<CandleRecord>) {
        let mut records = self.records.lock();
        batch.append(&mut records);

        if batch.len() > self.max_backlog {
            let excess = batch.len() - self.max_backlog;
            batch.drain(..excess);
            self.dropped.fetch_add(excess as u64, Ordering::SeqCst);
            error!("backlog cap {} exceeded, dropped {excess} oldest records", self.max_backlog);
        }

        *records = batch;
    }

    /// Number of records currently buffered.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Records discarded under backlog pressure.
    pub fn dropped_records(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

/// Drains the batch buffer into the storage sink.
pub struct Flusher<S: CandleSink> {
    buffer: Arc<BatchBuffer>,
    sink: Arc<S>,
    /// Wall-clock interval between timed flushes
    interval: Duration,
    /// Serializes flush execution; a trigger arriving while a flush is
    /// in flight is a no-op
    flush_gate: tokio::sync::Mutex<()>,
    /// Shutdown signal
    shutdown: Arc<AtomicBool>,
    /// Total successful flushes
    flushes: AtomicU64,
    /// Total flush failures
    flush_failures: AtomicU64,
    /// Total records persisted
    records_written: AtomicU64,
    /// Whether the most recent delivery attempt succeeded
    sink_healthy: AtomicBool,
}

impl<S: CandleSink> Flusher<S> {
    /// Create a flusher draining `buffer` into `sink`.
    pub fn new(buffer: Arc<BatchBuffer>, sink: Arc<S>, interval: Duration) -> Self {
        Self {
            buffer,
            sink,
            interval,
            flush_gate: tokio::sync::Mutex::new(()),
            shutdown: Arc::new(AtomicBool::new(false)),
            flushes: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
            sink_healthy: AtomicBool::new(true),
        }
    }

    /// Signal both flusher loops to shutdown.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Total records persisted.
    pub fn records_written(&self) -> u64 {
        self.records_written.load(Ordering::SeqCst)
    }

    /// Total flush failures.
    pub fn flush_failures(&self) -> u64 {
        self.flush_failures.load(Ordering::SeqCst)
    }

    /// Whether the most recent delivery attempt succeeded.
    pub fn sink_healthy(&self) -> bool {
        self.sink_healthy.load(Ordering::SeqCst)
    }

    /// Accept one record, flushing eagerly when the threshold is reached.
    pub async fn ingest(&self, record: CandleRecord) {
        if self.buffer.push(record) {
            self.flush().await;
        }
    }

    /// Flush the buffered records to the sink.
    ///
    /// Exactly one flush executes at a time; a concurrent call returns
    /// immediately. On failure the snapshot is requeued in full and the
    /// pipeline keeps accepting records.
    pub async fn flush(&self) {
        let Ok(_guard) = self.flush_gate.try_lock() else {
            debug!("flush already in progress, skipping");
            return;
        };

        let mut batch = self.buffer.take();
        if batch.is_empty() {
            return;
        }

        for record in &mut batch {
            record.normalize();
        }

        let count = batch.len();
        let start = Instant::now();

        match self.sink.insert_batch(&batch).await {
            Ok(written) => {
                self.flushes.fetch_add(1, Ordering::SeqCst);
                self.records_written.fetch_add(written as u64, Ordering::SeqCst);
                self.sink_healthy.store(true, Ordering::SeqCst);
                debug!("flushed {written}/{count} records in {:?}", start.elapsed());
            }
            Err(e) => {
                self.flush_failures.fetch_add(1, Ordering::SeqCst);
                self.sink_healthy.store(false, Ordering::SeqCst);
                error!("flush of {count} records failed, requeueing: {e}");
                self.buffer.requeue(batch);
            }
        }
    }

    /// Consume records from the stream channel, flushing on the size
    /// threshold. Exits after a final drain when the channel closes or
    /// shutdown is signalled.
    pub async fn run_intake(&self, mut candle_rx: mpsc::Receiver<CandleRecord>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                self.flush().await;
                info!("flusher intake shutting down");
                break;
            }

            tokio::select! {
                record = candle_rx.recv() => {
                    match record {
                        Some(record) => self.ingest(record).await,
                        None => {
                            self.flush().await;
                            info!("candle channel closed");
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep(INTAKE_POLL) => {}
            }
        }
    }

    /// Flush on a wall-clock interval, independently of the intake loop.
    pub async fn run_timer(&self) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            interval.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                info!("flusher timer shutting down");
                break;
            }
            self.flush().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    struct RecordingSink {
        batches: Mutex<Vec<Vec<CandleRecord>>>,
        fail: AtomicBool,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            }
        }

        fn set_failing(&self, failing: bool) {
            self.fail.store(failing, Ordering::SeqCst);
        }

        fn batches(&self) -> Vec<Vec<CandleRecord>> {
            self.batches.lock().clone()
        }
    }

    #[async_trait]
    impl CandleSink for RecordingSink {
        async fn insert_batch(&self, records: &[CandleRecord]) -> Result<usize> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(std::io::Error::other("sink offline").into());
            }
            self.batches.lock().push(records.to_vec());
            Ok(records.len())
        }
    }

    fn record(sequence: i64) -> CandleRecord {
        CandleRecord {
            event_symbol: "AAPL{=1m}".to_string(),
            event_time: Utc.with_ymd_and_hms(2021, 5, 7, 0, 0, 0).unwrap(),
            time: Utc.with_ymd_and_hms(2021, 5, 7, 0, 0, 0).unwrap(),
            sequence,
            count: 10,
            open: Decimal::new(12650, 2),
            high: Decimal::new(12700, 2),
            low: Decimal::new(12610, 2),
            close: Decimal::new(12685, 2),
            volume: Decimal::new(1_000_000, 0),
            vwap: Decimal::new(12660, 2),
            bid_volume: Decimal::new(600_000, 0),
            ask_volume: Decimal::new(400_000, 0),
            imp_volatility: Some(0.25),
            open_interest: None,
            event_flags: String::new(),
        }
    }

    fn flusher(threshold: usize) -> (Arc<Flusher<RecordingSink>>, Arc<BatchBuffer>, Arc<RecordingSink>) {
        let buffer = Arc::new(BatchBuffer::new(threshold, 100));
        let sink = Arc::new(RecordingSink::new());
        let flusher = Arc::new(Flusher::new(
            buffer.clone(),
            sink.clone(),
            Duration::from_secs(30),
        ));
        (flusher, buffer, sink)
    }

    #[tokio::test]
    async fn below_threshold_nothing_is_flushed() {
        let (flusher, buffer, sink) = flusher(5);

        for seq in 0..4 {
            flusher.ingest(record(seq)).await;
        }

        assert!(sink.batches().is_empty());
        assert_eq!(buffer.len(), 4);
    }

    #[tokio::test]
    async fn reaching_threshold_flushes_exactly_once() {
        let (flusher, buffer, sink) = flusher(5);

        for seq in 0..5 {
            flusher.ingest(record(seq)).await;
        }

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 5);
        assert!(buffer.is_empty());
        assert_eq!(flusher.records_written(), 5);
    }

    #[tokio::test]
    async fn failed_flush_requeues_records_in_order() {
        let (flusher, buffer, sink) = flusher(5);
        sink.set_failing(true);

        for seq in 0..5 {
            flusher.ingest(record(seq)).await;
        }

        assert!(sink.batches().is_empty());
        assert_eq!(buffer.len(), 5);
        assert_eq!(flusher.flush_failures(), 1);
        assert!(!flusher.sink_healthy());
    }

    #[tokio::test]
    async fn requeued_records_lead_the_next_flush_exactly_once() {
        let (flusher, buffer, sink) = flusher(5);

        sink.set_failing(true);
        for seq in 0..5 {
            flusher.ingest(record(seq)).await;
        }
        assert_eq!(buffer.len(), 5);

        // Records keep arriving while the sink is down, then it recovers.
        flusher.ingest(record(5)).await;
        sink.set_failing(false);
        flusher.flush().await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        let sequences: Vec<i64> = batches[0].iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4, 5]);
        assert!(buffer.is_empty());
        assert!(flusher.sink_healthy());
    }

    #[tokio::test]
    async fn concurrent_flush_is_a_no_op() {
        let (flusher, buffer, sink) = flusher(5);

        for seq in 0..4 {
            flusher.ingest(record(seq)).await;
        }

        let _guard = flusher.flush_gate.try_lock().unwrap();
        flusher.flush().await;

        assert!(sink.batches().is_empty());
        assert_eq!(buffer.len(), 4);
    }

    #[tokio::test]
    async fn backlog_cap_drops_oldest_records() {
        let buffer = BatchBuffer::new(3, 5);

        for seq in 0..3 {
            buffer.push(record(seq));
        }
        let failed = buffer.take();

        for seq in 3..8 {
            buffer.push(record(seq));
        }
        buffer.requeue(failed);

        assert_eq!(buffer.len(), 5);
        assert_eq!(buffer.dropped_records(), 3);
        let sequences: Vec<i64> = buffer.take().iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn intake_drains_on_channel_close() {
        let (flusher, buffer, sink) = flusher(100);
        let (tx, rx) = mpsc::channel(16);

        let intake = {
            let flusher = flusher.clone();
            tokio::spawn(async move { flusher.run_intake(rx).await })
        };

        tx.send(record(0)).await.unwrap();
        tx.send(record(1)).await.unwrap();
        drop(tx);
        intake.await.unwrap();

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn flush_normalizes_non_finite_volatility() {
        let (flusher, _buffer, sink) = flusher(1);

        let mut rec = record(0);
        rec.imp_volatility = Some(f64::NAN);
        flusher.ingest(rec).await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert!(batches[0][0].imp_volatility.is_none());
    }
}
