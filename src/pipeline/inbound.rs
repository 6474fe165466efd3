//! Inbound worker-result queue with time-sliced draining.
//!
//! Workers may produce far more results in one tick than a frame can absorb,
//! so envelopes are unpacked into a backlog and handed out one message at a
//! time; the orchestrator stops pulling when its wall-clock budget runs out
//! and the remainder carries over to the next frame. With smooth loading
//! enabled, a slow previous frame defers the drain by exactly one frame.

use std::collections::VecDeque;
use std::sync::mpsc::Receiver;

use log::trace;

use crate::protocol::{FromWorker, MessageEnvelope};

/// Buffers worker results between the channel and the orchestrator's
/// budgeted per-frame processing loop.
pub struct InboundQueue {
    receiver: Receiver<MessageEnvelope<FromWorker>>,
    backlog: VecDeque<FromWorker>,
    deferred: bool,
}

impl InboundQueue {
    /// Wraps the shared result receiver.
    pub fn new(receiver: Receiver<MessageEnvelope<FromWorker>>) -> Self {
        InboundQueue {
            receiver,
            backlog: VecDeque::new(),
            deferred: false,
        }
    }

    /// Moves everything currently sitting in the channel into the backlog,
    /// unpacking envelopes in arrival order. Never blocks.
    pub fn pump(&mut self) {
        let before = self.backlog.len();
        while let Ok(envelope) = self.receiver.try_recv() {
            self.backlog.extend(envelope);
        }
        let pulled = self.backlog.len() - before;
        if pulled > 0 {
            trace!("pumped {pulled} worker messages (backlog {})", self.backlog.len());
        }
    }

    /// Next buffered message, oldest first.
    pub fn pop(&mut self) -> Option<FromWorker> {
        self.backlog.pop_front()
    }

    /// True while messages remain buffered.
    pub fn has_backlog(&self) -> bool {
        !self.backlog.is_empty()
    }

    /// Buffered message count.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// One-shot smoothing deferral: the first call after a slow frame
    /// returns true (skip this frame's drain), the next call proceeds even
    /// if the frame is still slow, so the backlog cannot starve.
    pub fn maybe_defer(&mut self, slow_frame: bool) -> bool {
        if slow_frame && !self.deferred {
            self.deferred = true;
            true
        } else {
            self.deferred = false;
            false
        }
    }

    /// Drops the backlog without processing it.
    pub fn clear(&mut self) {
        self.backlog.clear();
        self.deferred = false;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;

    use super::*;
    use crate::protocol::SectionKey;

    fn finished(x: i32) -> FromWorker {
        FromWorker::SectionFinished {
            key: SectionKey { x, y: 0, z: 0 },
            worker_index: 1,
            process_time_ms: None,
        }
    }

    fn key_of(message: &FromWorker) -> i32 {
        match message {
            FromWorker::SectionFinished { key, .. } => key.x,
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn pump_unpacks_envelopes_in_order() {
        let (tx, rx) = channel();
        let mut queue = InboundQueue::new(rx);

        tx.send(MessageEnvelope::Single(finished(0))).unwrap();
        tx.send(MessageEnvelope::Batch(vec![finished(16), finished(32)]))
            .unwrap();

        queue.pump();
        assert_eq!(queue.backlog_len(), 3);
        let order: Vec<i32> = std::iter::from_fn(|| queue.pop()).map(|m| key_of(&m)).collect();
        assert_eq!(order, vec![0, 16, 32]);
        assert!(!queue.has_backlog());
    }

    #[test]
    fn backlog_carries_over_between_pumps() {
        let (tx, rx) = channel();
        let mut queue = InboundQueue::new(rx);

        tx.send(MessageEnvelope::Batch(vec![finished(0), finished(16)]))
            .unwrap();
        queue.pump();
        assert_eq!(key_of(&queue.pop().unwrap()), 0);

        tx.send(MessageEnvelope::Single(finished(32))).unwrap();
        queue.pump();
        let order: Vec<i32> = std::iter::from_fn(|| queue.pop()).map(|m| key_of(&m)).collect();
        assert_eq!(order, vec![16, 32]);
    }

    #[test]
    fn smoothing_defers_at_most_one_frame() {
        let (_tx, rx) = channel::<MessageEnvelope<FromWorker>>();
        let mut queue = InboundQueue::new(rx);

        assert!(!queue.maybe_defer(false));
        assert!(queue.maybe_defer(true));
        // Still slow, but already deferred once: drain anyway.
        assert!(!queue.maybe_defer(true));
        assert!(queue.maybe_defer(true));
        assert!(!queue.maybe_defer(false));
    }
}
