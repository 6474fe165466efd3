//! Thread bootstrap and channel loop for a mesher worker.
//!
//! Each worker is spawned once with its own typed channel pair; there is no
//! per-message environment sniffing. The loop alternates between draining
//! inbound envelopes and running the fixed-tick rebuild pass, and batches
//! everything it produces between sends into a single envelope.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;

use log::debug;
use web_time::{Duration, Instant};

use super::{GeometryBuilder, MesherWorker};
use crate::protocol::{FromWorker, MessageEnvelope, ToWorker};

/// Handle to a spawned mesher worker thread.
///
/// Dropping the orchestrator-side sender ends the worker's loop; the join
/// handle is kept so shutdown can wait for it.
pub struct WorkerHandle {
    /// Index the worker stamps on its outgoing messages.
    pub index: usize,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Waits for the worker thread to exit. Call after dropping the sender.
    pub fn join(self) {
        if self.join.join().is_err() {
            debug!("worker {} thread panicked during shutdown", self.index);
        }
    }
}

/// Spawns a mesher worker thread around a geometry builder.
///
/// The worker reads [`ToWorker`] envelopes from `inbox`, runs its rebuild
/// tick every `tick_interval`, and sends produced [`FromWorker`] messages
/// back through `results` as batched envelopes. The loop ends when the
/// inbox disconnects or the result channel is closed.
pub fn spawn_worker(
    index: usize,
    tick_interval: Duration,
    builder: Box<dyn GeometryBuilder>,
    inbox: Receiver<MessageEnvelope<ToWorker>>,
    results: Sender<MessageEnvelope<FromWorker>>,
) -> WorkerHandle {
    let join = std::thread::Builder::new()
        .name(format!("mesher-{index}"))
        .spawn(move || worker_loop(index, tick_interval, builder, inbox, results))
        .expect("failed to spawn mesher worker thread");

    WorkerHandle { index, join }
}

fn worker_loop(
    index: usize,
    tick_interval: Duration,
    builder: Box<dyn GeometryBuilder>,
    inbox: Receiver<MessageEnvelope<ToWorker>>,
    results: Sender<MessageEnvelope<FromWorker>>,
) {
    let mut worker = MesherWorker::new(index, builder);
    let mut next_tick = Instant::now() + tick_interval;

    loop {
        let wait = next_tick.saturating_duration_since(Instant::now());
        match inbox.recv_timeout(wait) {
            Ok(envelope) => {
                let mut produced = Vec::new();
                for message in envelope {
                    produced.extend(worker.handle_message(message));
                }
                if !send_batch(&results, produced) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let produced = worker.tick();
                if !send_batch(&results, produced) {
                    break;
                }
                next_tick = Instant::now() + tick_interval;
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!("worker {index}: inbox closed, exiting");
                break;
            }
        }
    }
}

/// Sends a batch of produced messages; false when the orchestrator is gone.
fn send_batch(
    results: &Sender<MessageEnvelope<FromWorker>>,
    produced: Vec<FromWorker>,
) -> bool {
    if produced.is_empty() {
        return true;
    }
    results.send(MessageEnvelope::from_batch(produced)).is_ok()
}
