//! # Piece Work Queue
//!
//! The pieces still to download, shared by every worker.
//!
//! Taking an item checks it out to the caller: no other worker can see it
//! until it is put back. A worker puts an item back when its peer lacks the
//! piece, when the download fails, or when the bytes fail verification. A
//! successful download consumes the item.
//!
//! Separately from the items waiting in the channel, the queue counts the
//! pieces that are still *unresolved*: not yet accepted by the aggregator.
//! Checking an item out or putting it back never changes that count.

use crate::piece::PieceWork;

use crossbeam_channel::{select, unbounded, Receiver, Sender};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared handle to the work queue. Clones refer to the same queue.
#[derive(Clone)]
pub struct WorkQueue {
    sender: Sender<PieceWork>,
    receiver: Receiver<PieceWork>,
    /// Disconnects when the download is over
    shutdown: Receiver<()>,
    unresolved: Arc<AtomicUsize>,
}

/// Closes the queue for every worker when dropped or closed.
pub struct Shutdown {
    _sender: Sender<()>,
}

impl Shutdown {
    pub fn close(self) {}
}

impl WorkQueue {
    /// Seeds a queue with every piece to download.
    pub fn new(items: Vec<PieceWork>) -> (WorkQueue, Shutdown) {
        let (sender, receiver) = unbounded();
        let (shutdown_sender, shutdown) = unbounded();
        let unresolved = Arc::new(AtomicUsize::new(items.len()));

        for item in items {
            // Both ends are held here, the send cannot fail.
            let _ = sender.send(item);
        }

        let queue = WorkQueue {
            sender,
            receiver,
            shutdown,
            unresolved,
        };

        (
            queue,
            Shutdown {
                _sender: shutdown_sender,
            },
        )
    }

    /// Checks out the next item, blocking until one is available.
    ///
    /// Returns `None` once the queue has been shut down.
    pub fn take(&self) -> Option<PieceWork> {
        select! {
            recv(self.receiver) -> item => item.ok(),
            recv(self.shutdown) -> _ => None,
        }
    }

    /// Returns a checked-out item to the queue.
    pub fn put_back(&self, item: PieceWork) {
        // The queue holds its own receiver, so the channel never disconnects.
        let _ = self.sender.send(item);
    }

    /// Number of items waiting to be checked out.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Number of pieces not yet accepted by the aggregator.
    pub fn unresolved(&self) -> usize {
        self.unresolved.load(Ordering::SeqCst)
    }

    /// Records that one piece has been accepted.
    pub fn resolve(&self) {
        let _ = self
            .unresolved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn items(n: u32) -> Vec<PieceWork> {
        (0..n).map(|i| PieceWork::new(i, [i as u8; 20], 10)).collect()
    }

    #[test]
    fn take_checks_out_in_order() {
        let (queue, _shutdown) = WorkQueue::new(items(3));
        assert_eq!(queue.len(), 3);

        let first = queue.take().unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.unresolved(), 3);

        queue.put_back(first);
        let order: Vec<u32> = (0..3).map(|_| queue.take().unwrap().index).collect();
        assert_eq!(order, vec![1, 2, 0]);
        assert!(queue.is_empty());
        assert_eq!(queue.unresolved(), 3);
    }

    #[test]
    fn resolve_counts_down_to_zero() {
        let (queue, _shutdown) = WorkQueue::new(items(2));

        queue.resolve();
        queue.resolve();
        queue.resolve();

        assert_eq!(queue.unresolved(), 0);
    }

    #[test]
    fn shutdown_releases_blocked_takers() {
        let (queue, shutdown) = WorkQueue::new(vec![]);

        let takers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || queue.take())
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        shutdown.close();

        for taker in takers {
            assert!(taker.join().unwrap().is_none());
        }
    }

    #[test]
    fn put_back_wakes_blocked_taker() {
        let (queue, _shutdown) = WorkQueue::new(items(1));
        let item = queue.take().unwrap();

        let taker = {
            let queue = queue.clone();
            thread::spawn(move || queue.take())
        };

        thread::sleep(Duration::from_millis(50));
        queue.put_back(item.clone());

        assert_eq!(taker.join().unwrap(), Some(item));
    }
}
