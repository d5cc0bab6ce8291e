//! Hand-off queue between a background capture thread and a polling consumer.
//!
//! Unbounded and multi-producer; the receiving half is not `Clone`, so the
//! single-consumer contract is enforced by the type. Pushing never blocks,
//! which lets plain OS threads feed it. The consumer drains without waiting.

use tokio::sync::mpsc::{self, error::TryRecvError};

/// Create a connected sender/receiver pair.
pub fn handoff_queue<T>() -> (HandoffSender<T>, HandoffReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (HandoffSender { inner: tx }, HandoffReceiver { inner: rx })
}

/// Producer half. Cheap to clone.
#[derive(Debug)]
pub struct HandoffSender<T> {
    inner: mpsc::UnboundedSender<T>,
}

impl<T> Clone for HandoffSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> HandoffSender<T> {
    /// Enqueue an item. Hands the item back if the consumer is gone.
    pub fn push(&self, item: T) -> Result<(), T> {
        self.inner.send(item).map_err(|err| err.0)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Items taken by one [`HandoffReceiver::drain`] call.
#[derive(Debug)]
pub struct Drained<T> {
    pub items: Vec<T>,
    /// Every sender has been dropped and nothing more will arrive.
    pub producers_gone: bool,
}

/// Consumer half. Exactly one per queue.
#[derive(Debug)]
pub struct HandoffReceiver<T> {
    inner: mpsc::UnboundedReceiver<T>,
}

impl<T> HandoffReceiver<T> {
    /// Take everything currently queued, in push order, without waiting.
    ///
    /// Items pushed while the drain runs may land in this drain or the next
    /// one, never in both and never in neither.
    pub fn drain(&mut self) -> Drained<T> {
        let mut items = Vec::new();
        loop {
            match self.inner.try_recv() {
                Ok(item) => items.push(item),
                Err(TryRecvError::Empty) => {
                    return Drained {
                        items,
                        producers_gone: false,
                    };
                }
                Err(TryRecvError::Disconnected) => {
                    return Drained {
                        items,
                        producers_gone: true,
                    };
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn drain_returns_everything_pushed() {
        let (tx, mut rx) = handoff_queue();
        for n in 0..10 {
            tx.push(n).unwrap();
        }
        let drained = rx.drain();
        assert_eq!(drained.items, (0..10).collect::<Vec<_>>());
        assert!(!drained.producers_gone);
        assert!(rx.drain().items.is_empty());
    }

    #[test]
    fn concurrent_pushes_are_neither_lost_nor_duplicated() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 2_500;

        let (tx, mut rx) = handoff_queue();
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let tx = tx.clone();
                thread::spawn(move || {
                    for n in 0..PER_PRODUCER {
                        tx.push(p * PER_PRODUCER + n).unwrap();
                    }
                })
            })
            .collect();
        drop(tx);

        let mut seen = HashSet::new();
        let mut total = 0;
        loop {
            let drained = rx.drain();
            total += drained.items.len();
            seen.extend(drained.items);
            if drained.producers_gone {
                break;
            }
            thread::yield_now();
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(total, PRODUCERS * PER_PRODUCER);
        assert_eq!(seen.len(), PRODUCERS * PER_PRODUCER);
    }

    #[test]
    fn push_fails_once_consumer_is_dropped() {
        let (tx, rx) = handoff_queue();
        drop(rx);
        assert!(tx.is_closed());
        assert_eq!(tx.push("line"), Err("line"));
    }
}
