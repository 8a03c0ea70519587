//! The bounded hand-off between the acceptor and the session worker pool.
//!
//! A classic bounded buffer with one extra twist: `offer` does not return
//! until a worker has actually claimed the session. That rendezvous keeps
//! the acceptor from reading the next connect record while the previous
//! session is still unowned, which in turn guarantees the connect reply is
//! the first frame on the session's response channel. The bounded capacity
//! equals the worker pool size, so a saturated pool back-pressures the
//! acceptor instead of growing a backlog.

use std::sync::Arc;

use crossbeam::channel::{bounded, Receiver, Sender};

use crate::session::Session;
use crate::{KvsubError, Result};

/// FIFO hand-off buffer between the acceptor (producer) and the session
/// workers (consumers)
pub struct AdmissionQueue {
    slots_tx: Sender<Arc<Session>>,
    slots_rx: Receiver<Arc<Session>>,
    claims_tx: Sender<()>,
    claims_rx: Receiver<()>,
    capacity: usize,
}

impl AdmissionQueue {
    /// a queue holding at most `capacity` unclaimed sessions
    pub fn new(capacity: usize) -> AdmissionQueue {
        let (slots_tx, slots_rx) = bounded(capacity);
        let (claims_tx, claims_rx) = bounded(capacity);
        AdmissionQueue {
            slots_tx,
            slots_rx,
            claims_tx,
            claims_rx,
            capacity,
        }
    }

    /// the configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Hands a freshly accepted session to the worker pool.
    ///
    /// Blocks while the buffer is full, and then again until a worker has
    /// claimed this hand-off (the rendezvous).
    pub fn offer(&self, session: Arc<Session>) -> Result<()> {
        self.slots_tx
            .send(session)
            .map_err(|_| KvsubError::Resource("admission queue closed".to_string()))?;
        self.claims_rx
            .recv()
            .map_err(|_| KvsubError::Resource("admission queue closed".to_string()))
    }

    /// Claims the next session, blocking while the buffer is empty.
    /// Completes the producer's rendezvous before returning.
    pub fn take(&self) -> Result<Arc<Session>> {
        let session = self
            .slots_rx
            .recv()
            .map_err(|_| KvsubError::Resource("admission queue closed".to_string()))?;
        self.claims_tx
            .send(())
            .map_err(|_| KvsubError::Resource("admission queue closed".to_string()))?;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    fn dummy_session(id: u64) -> Arc<Session> {
        Arc::new(Session::new(
            id,
            tempfile::tempfile().unwrap(),
            tempfile::tempfile().unwrap(),
            tempfile::tempfile().unwrap(),
        ))
    }

    #[test]
    fn hand_off_is_fifo() {
        let queue = Arc::new(AdmissionQueue::new(4));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for id in 0..3 {
                    queue.offer(dummy_session(id)).unwrap();
                }
            })
        };

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(queue.take().unwrap().id);
        }
        producer.join().unwrap();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn offer_blocks_until_a_worker_claims() {
        let queue = Arc::new(AdmissionQueue::new(4));
        let offered = Arc::new(AtomicBool::new(false));

        let producer = {
            let queue = Arc::clone(&queue);
            let offered = Arc::clone(&offered);
            thread::spawn(move || {
                queue.offer(dummy_session(7)).unwrap();
                offered.store(true, Ordering::SeqCst);
            })
        };

        // no worker yet: the offer must still be parked in the rendezvous
        thread::sleep(Duration::from_millis(100));
        assert!(!offered.load(Ordering::SeqCst));

        let session = queue.take().unwrap();
        assert_eq!(session.id, 7);
        producer.join().unwrap();
        assert!(offered.load(Ordering::SeqCst));
    }

    #[test]
    fn take_blocks_until_something_is_offered() {
        let queue = Arc::new(AdmissionQueue::new(2));
        let taken = Arc::new(AtomicBool::new(false));

        let consumer = {
            let queue = Arc::clone(&queue);
            let taken = Arc::clone(&taken);
            thread::spawn(move || {
                let session = queue.take().unwrap();
                taken.store(true, Ordering::SeqCst);
                assert_eq!(session.id, 42);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!taken.load(Ordering::SeqCst));

        queue.offer(dummy_session(42)).unwrap();
        consumer.join().unwrap();
        assert!(taken.load(Ordering::SeqCst));
    }
}
