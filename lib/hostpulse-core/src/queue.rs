use std::{collections::VecDeque, sync::Mutex};

use metrics::{counter, Counter};
use tracing::error;

/// Number of drops between successive overflow log messages.
const DROP_LOG_EVERY: u64 = 1000;

struct State<T> {
    items: VecDeque<T>,
    dropped: u64,
}

/// A bounded FIFO queue that drops its oldest entries on overflow.
///
/// The reader loop pushes a cycle's worth of values at a time, and the writer loop drains the queue completely on
/// each of its cycles. Neither ever waits for space.
pub struct BoundedQueue<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    dropped_total: Counter,
}

impl<T> BoundedQueue<T> {
    /// Creates a new `BoundedQueue` holding at most `capacity` items.
    ///
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(State {
                items: VecDeque::new(),
                dropped: 0,
            }),
            dropped_total: counter!("queue_dropped_values_total"),
        }
    }

    /// Returns the capacity of the queue.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of queued items.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    /// Returns `true` if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of items dropped since the queue was created.
    pub fn dropped(&self) -> u64 {
        self.state.lock().unwrap().dropped
    }

    /// Appends all of `items`, in order, dropping the oldest queued items as needed to stay within capacity.
    pub fn push_all<I>(&self, items: I)
    where
        I: IntoIterator<Item = T>,
    {
        let mut state = self.state.lock().unwrap();
        for item in items {
            if state.items.len() >= self.capacity {
                state.items.pop_front();
                state.dropped += 1;
                self.dropped_total.increment(1);

                if state.dropped % DROP_LOG_EVERY == 0 {
                    error!(
                        dropped = state.dropped,
                        capacity = self.capacity,
                        "Value queue is full. Dropping oldest values."
                    );
                }
            }
            state.items.push_back(item);
        }
    }

    /// Removes and returns every queued item, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock().unwrap();
        std::mem::take(&mut state.items).into()
    }
}
