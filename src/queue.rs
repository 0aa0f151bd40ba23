// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! A thread-safe double-ended queue with a blocking `wait()`: a single mutex
//! guarding a deque, plus a condition variable that lets `ServerEndpoint::update`
//! sleep instead of spinning when told to wait for work.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

pub struct TSQueue<T> {
    deque: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> Default for TSQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TSQueue<T> {
    pub fn new() -> Self {
        TSQueue {
            deque: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    pub fn push_back(&self, item: T) {
        let mut guard = self.deque.lock().unwrap();
        guard.push_back(item);
        self.ready.notify_one();
    }

    pub fn push_front(&self, item: T) {
        let mut guard = self.deque.lock().unwrap();
        guard.push_front(item);
        self.ready.notify_one();
    }

    pub fn pop_front(&self) -> Option<T> {
        self.deque.lock().unwrap().pop_front()
    }

    pub fn pop_back(&self) -> Option<T> {
        self.deque.lock().unwrap().pop_back()
    }

    pub fn front(&self) -> Option<T>
    where
        T: Clone,
    {
        self.deque.lock().unwrap().front().cloned()
    }

    pub fn back(&self) -> Option<T>
    where
        T: Clone,
    {
        self.deque.lock().unwrap().back().cloned()
    }

    pub fn empty(&self) -> bool {
        self.deque.lock().unwrap().is_empty()
    }

    pub fn count(&self) -> usize {
        self.deque.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.deque.lock().unwrap().clear();
    }

    /// Blocks until the queue is non-empty. May return spuriously; callers
    /// must recheck (as with any condition variable wait), typically by
    /// calling `pop_front` in a loop.
    pub fn wait(&self) {
        let guard = self.deque.lock().unwrap();
        if !guard.is_empty() {
            return;
        }
        let _guard = self
            .ready
            .wait_while(guard, |q| q.is_empty())
            .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order_preserved_across_push_back_pop_front() {
        let q: TSQueue<u32> = TSQueue::new();
        q.push_back(1);
        q.push_back(2);
        q.push_back(3);

        assert_eq!(Some(1), q.pop_front());
        assert_eq!(Some(2), q.pop_front());
        assert_eq!(Some(3), q.pop_front());
        assert_eq!(None, q.pop_front());
    }

    #[test]
    fn push_front_takes_priority_over_existing_items() {
        let q: TSQueue<u32> = TSQueue::new();
        q.push_back(1);
        q.push_front(0);

        assert_eq!(Some(0), q.pop_front());
        assert_eq!(Some(1), q.pop_front());
    }

    #[test]
    fn front_and_back_peek_without_removing() {
        let q: TSQueue<u32> = TSQueue::new();
        q.push_back(1);
        q.push_back(2);
        q.push_back(3);

        assert_eq!(Some(1), q.front());
        assert_eq!(Some(3), q.back());
        assert_eq!(3, q.count());
    }

    #[test]
    fn wait_unblocks_when_another_thread_pushes() {
        let q = Arc::new(TSQueue::new());
        let producer = q.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            producer.push_back(99u32);
        });

        q.wait();
        assert_eq!(Some(99), q.pop_front());
        handle.join().unwrap();
    }

    #[test]
    fn empty_and_count_reflect_contents() {
        let q: TSQueue<u32> = TSQueue::new();
        assert!(q.empty());
        assert_eq!(0, q.count());

        q.push_back(1);
        q.push_back(2);
        assert!(!q.empty());
        assert_eq!(2, q.count());

        q.clear();
        assert!(q.empty());
    }
}
