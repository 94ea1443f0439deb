use parking_lot::Mutex;
use std::collections::VecDeque;

/// FIFO queue of work items shared by every worker of a run.
///
/// Items keep their input position so failures can be attributed. Popping
/// under the lock hands each item to exactly one worker.
#[derive(Debug)]
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<(usize, T)>>,
}

impl<T> WorkQueue<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: Mutex::new(items.into_iter().enumerate().collect()),
        }
    }

    /// Removes and returns the oldest remaining item with its input position.
    pub fn pop(&self) -> Option<(usize, T)> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
