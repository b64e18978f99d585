use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::{mpsc, Semaphore};

use super::{BatchSequence, TransformedBatch};
use crate::error::TrainingError;

type Delivery = (usize, Result<TransformedBatch, TrainingError>);

/// Prefetches one epoch of a [`BatchSequence`].
///
/// `read_workers` blocking tasks on a dedicated runtime claim batch indices
/// from a shared counter and push the results into a bounded channel.
/// Iterating yields batches in index order. At most `queue_size` batches are
/// read ahead of the consumer, counting those parked for reordering. A worker
/// error or an early shutdown of the pool ends the epoch with a `DataError`.
pub struct BatchQueue {
    receiver: mpsc::Receiver<Delivery>,
    pending: BTreeMap<usize, TransformedBatch>,
    slots: Arc<Semaphore>,
    next: usize,
    len: usize,
    runtime: Option<Runtime>,
}

impl BatchQueue {
    pub fn start(
        sequence: Arc<dyn BatchSequence>,
        read_workers: usize,
        queue_size: usize,
    ) -> Result<Self, TrainingError> {
        if read_workers == 0 {
            return Err(TrainingError::ConfigError("At least one read worker is required".into()));
        }
        if queue_size == 0 {
            return Err(TrainingError::ConfigError("Queue size must be positive".into()));
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(read_workers)
            .thread_name("batch-reader")
            .build()?;

        let len = sequence.len();
        let (sender, receiver) = mpsc::channel(queue_size);
        let cursor = Arc::new(AtomicUsize::new(0));
        // one permit per batch read but not yet handed out
        let slots = Arc::new(Semaphore::new(queue_size));

        for worker in 0..read_workers.min(len.max(1)) {
            let sequence = Arc::clone(&sequence);
            let sender = sender.clone();
            let cursor = Arc::clone(&cursor);
            let slots = Arc::clone(&slots);
            let handle = runtime.handle().clone();
            runtime.spawn_blocking(move || loop {
                match handle.block_on(slots.acquire()) {
                    Ok(permit) => permit.forget(),
                    Err(_) => {
                        debug!("Reader {} stopping, queue closed", worker);
                        break;
                    }
                }
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                if index >= len {
                    break;
                }
                let batch = sequence.get(index);
                let failed = batch.is_err();
                if sender.blocking_send((index, batch)).is_err() {
                    debug!("Reader {} stopping, queue closed", worker);
                    break;
                }
                if failed {
                    break;
                }
            });
        }

        Ok(Self { receiver, pending: BTreeMap::new(), slots, next: 0, len, runtime: Some(runtime) })
    }

    /// Number of batches this queue delivers.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Iterator for BatchQueue {
    type Item = Result<TransformedBatch, TrainingError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.len {
            return None;
        }
        loop {
            if let Some(batch) = self.pending.remove(&self.next) {
                self.next += 1;
                self.slots.add_permits(1);
                return Some(Ok(batch));
            }
            match self.receiver.blocking_recv() {
                Some((index, Ok(batch))) => {
                    self.pending.insert(index, batch);
                }
                Some((index, Err(e))) => {
                    error!("Reading batch {} failed: {}", index, e);
                    self.next = self.len;
                    return Some(Err(TrainingError::DataError(format!("Batch {}: {}", index, e))));
                }
                None => {
                    let missing = self.next;
                    self.next = self.len;
                    return Some(Err(TrainingError::DataError(format!(
                        "Reader pool stopped before producing batch {}",
                        missing
                    ))));
                }
            }
        }
    }
}

impl Drop for BatchQueue {
    fn drop(&mut self) {
        self.slots.close();
        self.receiver.close();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(5));
        }
    }
}
