//! An unbounded blocking FIFO feeding the dispatch worker threads.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct FifoState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// A thread-safe FIFO.  Consumers block in [Fifo::deq] until an item arrives or the queue
/// closes.
pub struct Fifo<T> {
    state: Mutex<FifoState<T>>,
    available: Condvar,
}

impl<T> Fifo<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FifoState {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Append one item.  Items enqueued after close are dropped.
    pub fn enq(&self, item: T) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.items.push_back(item);
        self.available.notify_one();
    }

    /// Remove the oldest item, blocking until one exists.  Returns None once the queue is
    /// closed and drained.
    pub fn deq(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self.available.wait(state).unwrap();
        }
    }

    /// Close the queue, waking every blocked consumer.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.available.notify_all();
    }
}

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn first_in_first_out() {
        let fifo = Fifo::new();
        fifo.enq(1u64);
        fifo.enq(2u64);
        fifo.enq(3u64);
        assert_eq!(Some(1), fifo.deq());
        assert_eq!(Some(2), fifo.deq());
        assert_eq!(Some(3), fifo.deq());
    }

    #[test]
    fn deq_blocks_until_enq() {
        let fifo = Arc::new(Fifo::new());
        let consumer = {
            let fifo = Arc::clone(&fifo);
            std::thread::spawn(move || fifo.deq())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        fifo.enq(7u64);
        assert_eq!(Some(7), consumer.join().unwrap());
    }

    #[test]
    fn close_wakes_consumers() {
        let fifo: Arc<Fifo<u64>> = Arc::new(Fifo::new());
        let consumer = {
            let fifo = Arc::clone(&fifo);
            std::thread::spawn(move || fifo.deq())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        fifo.close();
        assert_eq!(None, consumer.join().unwrap());
        fifo.enq(1);
        assert_eq!(None, fifo.deq());
    }
}
