//! Min-heap of idle pool items ordered by `release_after`.
//!
//! Not thread-safe on its own — the pool is the only lock holder (§5). Extraction by
//! id is an O(n) scan followed by an O(log n) heap repair; that trade-off is explicit
//! in the component design and is fine at the pool sizes this daemon manages (tens to
//! low hundreds of idle items).

use crate::types::NetworkResource;
use std::time::Instant;

/// An idle resource plus the earliest moment it becomes eligible for disposal.
#[derive(Debug, Clone)]
pub struct PoolItem<R> {
    pub resource: R,
    pub release_after: Instant,
}

impl<R> PoolItem<R> {
    pub fn new(resource: R, release_after: Instant) -> Self {
        Self {
            resource,
            release_after,
        }
    }

    fn less_than(&self, other: &PoolItem<R>) -> bool {
        self.release_after < other.release_after
    }
}

#[derive(Debug)]
pub struct PriorityQueue<R> {
    slots: Vec<PoolItem<R>>,
}

impl<R> Default for PriorityQueue<R> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<R: NetworkResource> PriorityQueue<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn push(&mut self, item: PoolItem<R>) {
        self.slots.push(item);
        let mut index = self.slots.len() - 1;
        self.bubble_up(&mut index);
    }

    pub fn pop(&mut self) -> Option<PoolItem<R>> {
        if self.slots.is_empty() {
            return None;
        }
        let last = self.slots.len() - 1;
        self.slots.swap(0, last);
        let item = self.slots.pop();
        self.bubble_down(0);
        item
    }

    pub fn peek(&self) -> Option<&PoolItem<R>> {
        self.slots.first()
    }

    /// Remove and return the item with this id, wherever it sits in the heap.
    pub fn extract_by_id(&mut self, id: &str) -> Option<PoolItem<R>> {
        let index = self.slots.iter().position(|i| i.resource.resource_id() == id)?;
        let last = self.slots.len() - 1;
        self.slots.swap(index, last);
        let item = self.slots.pop();
        if index < self.slots.len() {
            self.bubble_down(index);
            let mut up = index;
            self.bubble_up(&mut up);
        }
        item
    }

    pub fn find(&self, id: &str) -> Option<&PoolItem<R>> {
        self.slots.iter().find(|i| i.resource.resource_id() == id)
    }

    pub fn list(&self) -> &[PoolItem<R>] {
        &self.slots
    }

    fn bubble_up(&mut self, index: &mut usize) {
        while *index > 0 {
            let parent = (*index - 1) / 2;
            if !self.slots[*index].less_than(&self.slots[parent]) {
                break;
            }
            self.slots.swap(*index, parent);
            *index = parent;
        }
    }

    fn bubble_down(&mut self, mut index: usize) {
        let len = self.slots.len();
        loop {
            let left = index * 2 + 1;
            let right = index * 2 + 2;
            let mut smallest = index;
            if left < len && self.slots[left].less_than(&self.slots[smallest]) {
                smallest = left;
            }
            if right < len && self.slots[right].less_than(&self.slots[smallest]) {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.slots.swap(index, smallest);
            index = smallest;
        }
    }
}
