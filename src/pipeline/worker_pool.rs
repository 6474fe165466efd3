//! Worker pool: deterministic spatial routing plus outbound batching.
//!
//! Each mesher worker gets one typed channel pair, decided once when the
//! pool is constructed. Dirty marks for a given section key always route to
//! the same worker (cache locality, FIFO rebuild order per key, no duplicate
//! builds); worker 0 is reserved as an overflow lane used only when a caller
//! asks to avoid its normal worker and the key is not currently in flight.
//!
//! Outbound messages produced within one orchestrator update accumulate per
//! worker and flush as a single batched send, amortizing channel overhead
//! under bursty dirty-marking: loading one column can mark dozens of
//! sections dirty in a single call.

use std::sync::mpsc::{channel, Receiver, Sender};

use log::warn;
use web_time::Duration;

use crate::config::StreamerConfig;
use crate::mesher::{spawn_worker, GeometryBuilder, WorkerHandle};
use crate::protocol::{FromWorker, MessageEnvelope, SectionKey, ToWorker};

/// Accumulates per-worker outbound messages and flushes them batched.
pub struct OutboundBatcher {
    senders: Vec<Sender<MessageEnvelope<ToWorker>>>,
    batches: Vec<Vec<ToWorker>>,
    max_batch_len: usize,
}

impl OutboundBatcher {
    /// Wraps the given per-worker senders.
    pub fn new(senders: Vec<Sender<MessageEnvelope<ToWorker>>>, max_batch_len: usize) -> Self {
        let batches = senders.iter().map(|_| Vec::new()).collect();
        OutboundBatcher {
            senders,
            batches,
            max_batch_len: max_batch_len.max(1),
        }
    }

    /// Number of workers the batcher feeds.
    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Queues a message for one worker, force-flushing that worker's batch
    /// when it reaches the configured bound.
    pub fn queue(&mut self, worker: usize, message: ToWorker) {
        self.batches[worker].push(message);
        if self.batches[worker].len() >= self.max_batch_len {
            self.flush_worker(worker);
        }
    }

    /// Queues a message for every worker.
    pub fn broadcast(&mut self, message: ToWorker) {
        for worker in 0..self.senders.len() {
            self.queue(worker, message.clone());
        }
    }

    /// Flushes one worker's accumulated batch as a single send.
    pub fn flush_worker(&mut self, worker: usize) {
        if self.batches[worker].is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.batches[worker]);
        if self.senders[worker]
            .send(MessageEnvelope::from_batch(batch))
            .is_err()
        {
            warn!("worker {worker} channel closed; dropping outbound batch");
        }
    }

    /// Flushes every worker's batch.
    pub fn flush(&mut self) {
        for worker in 0..self.senders.len() {
            self.flush_worker(worker);
        }
    }

    /// Messages currently queued for one worker (not yet flushed).
    pub fn queued_len(&self, worker: usize) -> usize {
        self.batches[worker].len()
    }
}

/// Deterministic worker index for a section key.
///
/// The spatial hash folds the section coordinates and maps them onto
/// workers `1..worker_count`, keeping index 0 free for the overflow lane.
/// Referentially stable: the same key and worker count always produce the
/// same index.
pub fn worker_for(key: SectionKey, worker_count: usize) -> usize {
    debug_assert!(worker_count >= 2);
    let coords = key.section_coords();
    let folded = coords.x + coords.y + coords.z;
    folded.rem_euclid(worker_count as i32 - 1) as usize + 1
}

/// The spawned mesher workers and their outbound batcher.
pub struct WorkerPool {
    batcher: OutboundBatcher,
    handles: Vec<WorkerHandle>,
}

impl WorkerPool {
    /// Spawns the configured number of workers, each with its own geometry
    /// builder, and returns the pool plus the shared result receiver.
    ///
    /// At least two workers are required (worker 0 is the overflow lane);
    /// smaller configurations are raised to two with a warning.
    pub fn spawn(
        config: &StreamerConfig,
        builder_factory: impl Fn(usize) -> Box<dyn GeometryBuilder>,
    ) -> (WorkerPool, Receiver<MessageEnvelope<FromWorker>>) {
        let worker_count = if config.worker_count < 2 {
            warn!(
                "worker_count {} too small; using 2 (worker 0 is the overflow lane)",
                config.worker_count
            );
            2
        } else {
            config.worker_count
        };

        let (results_tx, results_rx) = channel();
        let mut senders = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let (inbox_tx, inbox_rx) = channel();
            senders.push(inbox_tx);
            handles.push(spawn_worker(
                index,
                config.tick_interval,
                builder_factory(index),
                inbox_rx,
                results_tx.clone(),
            ));
        }

        let pool = WorkerPool {
            batcher: OutboundBatcher::new(senders, config.max_batch_len),
            handles,
        };
        (pool, results_rx)
    }

    /// Number of workers, overflow lane included.
    pub fn worker_count(&self) -> usize {
        self.batcher.worker_count()
    }

    /// The worker a dirty mark for `key` should go to.
    ///
    /// `avoid_collision` requests the overflow lane, which is honored only
    /// when the key is not currently in flight on its normal worker;
    /// rerouting a key mid-flight would let two workers build the same
    /// section concurrently.
    pub fn route(&self, key: SectionKey, avoid_collision: bool, in_flight: bool) -> usize {
        if avoid_collision && !in_flight {
            0
        } else {
            worker_for(key, self.worker_count())
        }
    }

    /// Queues a message for one worker.
    pub fn queue(&mut self, worker: usize, message: ToWorker) {
        self.batcher.queue(worker, message);
    }

    /// Queues a message for every worker.
    pub fn broadcast(&mut self, message: ToWorker) {
        self.batcher.broadcast(message);
    }

    /// Flushes all accumulated outbound batches.
    pub fn flush(&mut self) {
        self.batcher.flush();
    }

    /// Closes the channels and waits for every worker thread to exit.
    pub fn shutdown(mut self, grace: Duration) {
        self.batcher.flush();
        drop(self.batcher);
        let deadline = web_time::Instant::now() + grace;
        for handle in self.handles {
            if web_time::Instant::now() < deadline {
                handle.join();
            }
        }
    }
}
