//! Thread-safe FIFO with blocking, non-blocking and peek access.
//!
//! The list always holds a sentinel node. Producers only touch the tail lock
//! and consumers only touch the head lock, so a push never waits on a pop.
//! A counting semaphore tracks how many items are available; consumers
//! acquire a permit before touching the head.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use sealgram_common::{Error, Result};

struct Node<T> {
    value: Mutex<Option<T>>,
    next: Mutex<Option<Arc<Node<T>>>>,
}

impl<T> Node<T> {
    fn new(value: Option<T>) -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(value),
            next: Mutex::new(None),
        })
    }
}

/// Counting semaphore on a parking_lot mutex/condvar pair.
struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self {
            permits: Mutex::new(0),
            available: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    fn release(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.available.notify_one();
    }
}

/// Unbounded multi-producer multi-consumer FIFO queue.
pub struct ConcurrentQueue<T> {
    head: Mutex<Arc<Node<T>>>,
    tail: Mutex<Arc<Node<T>>>,
    permits: Semaphore,
    len: AtomicUsize,
}

impl<T> std::fmt::Debug for ConcurrentQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentQueue")
            .field("len", &self.len())
            .finish()
    }
}

impl<T> Default for ConcurrentQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConcurrentQueue<T> {
    pub fn new() -> Self {
        let sentinel = Node::new(None);
        Self {
            head: Mutex::new(sentinel.clone()),
            tail: Mutex::new(sentinel),
            permits: Semaphore::new(),
            len: AtomicUsize::new(0),
        }
    }

    /// Append an item and wake one waiting consumer.
    pub fn push(&self, item: T) {
        let node = Node::new(Some(item));
        {
            let mut tail = self.tail.lock();
            *tail.next.lock() = Some(node.clone());
            *tail = node;
        }
        self.len.fetch_add(1, Ordering::AcqRel);
        self.permits.release();
    }

    /// Remove the oldest item, blocking until one is available.
    pub fn pop(&self) -> T {
        self.permits.acquire();
        self.take_head()
    }

    /// Remove the oldest item, or fail with [`Error::WouldBlock`] when empty.
    pub fn try_pop(&self) -> Result<T> {
        if !self.permits.try_acquire() {
            return Err(Error::WouldBlock);
        }
        Ok(self.take_head())
    }

    /// Number of items pushed and not yet popped.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Caller must hold a permit.
    fn take_head(&self) -> T {
        let mut head = self.head.lock();
        let next = head
            .next
            .lock()
            .clone()
            .expect("a semaphore permit guarantees a queued node");
        let value = next.value.lock().take();
        *head = next;
        self.len.fetch_sub(1, Ordering::AcqRel);
        value.expect("queued nodes carry a value until popped")
    }
}

impl<T: Clone> ConcurrentQueue<T> {
    /// Return a copy of the oldest item without removing it, blocking until
    /// one is available.
    pub fn peek(&self) -> T {
        self.permits.acquire();
        let item = self.clone_head();
        self.permits.release();
        item
    }

    /// Non-blocking [`peek`](Self::peek).
    pub fn try_peek(&self) -> Result<T> {
        if !self.permits.try_acquire() {
            return Err(Error::WouldBlock);
        }
        let item = self.clone_head();
        self.permits.release();
        Ok(item)
    }

    /// Caller must hold a permit.
    fn clone_head(&self) -> T {
        let head = self.head.lock();
        let next = head.next.lock();
        let node = next
            .as_ref()
            .expect("a semaphore permit guarantees a queued node");
        let value = node.value.lock();
        value
            .clone()
            .expect("queued nodes carry a value until popped")
    }
}

impl<T> Drop for ConcurrentQueue<T> {
    fn drop(&mut self) {
        // Unlink iteratively so a long backlog does not recurse on drop.
        let mut cursor = self.head.get_mut().next.lock().take();
        while let Some(node) = cursor {
            cursor = node.next.lock().take();
        }
    }
}
