//! Bounded priority backlog of composite nodes awaiting a worker slot (§4.A).
//!
//! A `BinaryHeap` ordered the same way a tuple-ordered priority queue would be, plus a
//! `node_ids_in_queue` set behind one lock to keep membership checks O(1).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Mutex;

use crate::composite_node::CompositeNode;
use crate::model::NodeId;

pub const DEFAULT_MAX_SIZE: usize = 1000;
const OVERLOAD_FACTOR: f64 = 0.8;

/// Public metadata for one queued entry, returned by [`NodeQueue::peek`].
#[derive(Debug, Clone)]
pub struct QueueEntrySnapshot {
    pub node_id: NodeId,
    pub olt_id: crate::model::OltId,
    pub name: String,
    pub delayed: bool,
    pub delay_time: i64,
    pub priority: i32,
    pub next_run_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<&CompositeNode> for QueueEntrySnapshot {
    fn from(cn: &CompositeNode) -> Self {
        Self {
            node_id: cn.master.id,
            olt_id: cn.olt.id,
            name: cn.master.name.clone(),
            delayed: cn.delayed,
            delay_time: cn.delay_time,
            priority: cn.priority(),
            next_run_at: cn.master.next_run_at,
        }
    }
}

/// Ordering key `(not delayed, -delay_time, -priority)`, smaller tuple sorts first. We store
/// the negated/inverted fields directly so the derived `Ord` gives us a min-heap-by-key via
/// `BinaryHeap`'s max-heap semantics (largest `OrderedEntry` key = smallest original tuple).
struct OrderedEntry {
    key: (bool, i64, i32),
    node: CompositeNode,
}

impl OrderedEntry {
    fn new(node: CompositeNode) -> Self {
        // BinaryHeap pops the greatest element; we want delayed-first, then larger delay,
        // then higher priority popped first, so those map to "greatest" directly.
        let key = (node.delayed, node.delay_time, node.priority());
        Self { key, node }
    }
}

impl PartialEq for OrderedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for OrderedEntry {}

impl PartialOrd for OrderedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

struct Inner {
    heap: BinaryHeap<OrderedEntry>,
    master_ids: HashSet<NodeId>,
}

pub struct NodeQueue {
    inner: Mutex<Inner>,
    max_size: usize,
}

impl NodeQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                master_ids: HashSet::new(),
            }),
            max_size,
        }
    }

    /// §4.A `put`: no-op if the master is already queued; drops silently if at capacity.
    pub fn put(&self, node: CompositeNode) {
        let mut inner = self.inner.lock().unwrap();
        if inner.master_ids.contains(&node.master.id) {
            return;
        }
        if inner.heap.len() >= self.max_size {
            return;
        }
        inner.master_ids.insert(node.master.id);
        inner.heap.push(OrderedEntry::new(node));
    }

    /// §4.A `get`: pops the highest-precedence entry.
    pub fn get(&self) -> Option<CompositeNode> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.heap.pop()?;
        inner.master_ids.remove(&entry.node.master.id);
        Some(entry.node)
    }

    /// Removes and returns the first queued entry belonging to `olt_id`, preserving the
    /// relative order of all other entries (§4.D `process_queue_for_olt`).
    pub fn take_for_olt(&self, olt_id: crate::model::OltId) -> Option<CompositeNode> {
        let mut inner = self.inner.lock().unwrap();
        let mut rest = Vec::new();
        let mut found = None;
        while let Some(entry) = inner.heap.pop() {
            if found.is_none() && entry.node.olt.id == olt_id {
                found = Some(entry.node);
            } else {
                rest.push(entry);
            }
        }
        if let Some(ref node) = found {
            inner.master_ids.remove(&node.master.id);
        }
        for entry in rest {
            inner.heap.push(entry);
        }
        found
    }

    /// §4.A `peek(n)`: non-destructive view of the first `n` entries in precedence order.
    pub fn peek(&self, n: usize) -> Vec<QueueEntrySnapshot> {
        let inner = self.inner.lock().unwrap();
        let mut drained: Vec<&OrderedEntry> = inner.heap.iter().collect();
        drained.sort_by(|a, b| b.key.cmp(&a.key));
        drained.into_iter().take(n).map(|e| QueueEntrySnapshot::from(&e.node)).collect()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn overload_threshold(&self) -> usize {
        (self.max_size as f64 * OVERLOAD_FACTOR) as usize
    }

    pub fn is_overload(&self) -> bool {
        self.size() > self.overload_threshold()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Default for NodeQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}
