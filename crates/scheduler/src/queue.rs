//! Pending throttleable requests, ordered by tier then FIFO.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::request::Request;
use crate::types::PriorityTier;

/// Heap entry. `BinaryHeap` is a max-heap, so the comparison is reversed
/// to pop the most urgent, oldest request first.
struct Entry {
    key: (PriorityTier, Instant, u64),
    request: Request,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.key.cmp(&self.key)
    }
}

#[derive(Default)]
pub struct PriorityQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    available: Notify,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BinaryHeap<Entry>> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a request. Re-inserting keeps the original ordering key.
    pub fn push(&self, request: Request) {
        let key = request.ticket.order_key();
        self.lock().push(Entry { key, request });
        self.available.notify_one();
    }

    pub fn pop(&self) -> Option<Request> {
        self.lock().pop().map(|e| e.request)
    }

    /// Wait until something is pushed. A push that happened while nobody
    /// was waiting leaves a permit, so this never misses a wakeup.
    pub async fn notified(&self) {
        self.available.notified().await
    }

    /// Take every pending request, most urgent first.
    pub fn drain(&self) -> Vec<Request> {
        let mut heap = self.lock();
        let mut out = Vec::with_capacity(heap.len());
        while let Some(e) = heap.pop() {
            out.push(e.request);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn pending_by_tier(&self) -> BTreeMap<PriorityTier, usize> {
        let mut counts = BTreeMap::new();
        for e in self.lock().iter() {
            *counts.entry(e.key.0).or_insert(0) += 1;
        }
        counts
    }
}
