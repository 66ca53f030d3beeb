//! Sorted waiter chain
//!
//! An ascending-by-deadline doubly linked list stored in an arena. Links are
//! arena indices, freed slots are recycled through a free list, and every
//! slot carries a generation so that a stale [`WaiterKey`] can never touch a
//! node that was reused for a different deadline.
//!
//! ```text
//!   head                                    tail
//!    |                                        |
//!    v                                        v
//!  +-----+  next  +-----+  next  +-----+  next  +-----+
//!  | 300 | -----> | 600 | -----> | 900 | -----> | 1.2k|
//!  | x2  | <----- | x1  | <----- | x5  | <----- | x1  |
//!  +-----+  prev  +-----+  prev  +-----+  prev  +-----+
//!   when / capacity
//! ```
//!
//! The chain is not synchronised. It is owned by exactly one task (the ticker
//! actor) and every mutation happens there.

use std::time::Duration;
use tokio::sync::watch;

/// Stable handle to a node in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterKey {
    index: usize,
    generation: u64,
}

struct Node {
    when: u64,
    capacity: usize,
    disabled: bool,
    generation: u64,
    signal: Option<watch::Sender<bool>>,
    next: Option<usize>,
    prev: Option<usize>,
}

impl Node {
    fn vacant() -> Self {
        Self {
            when: 0,
            capacity: 0,
            disabled: true,
            generation: 0,
            signal: None,
            next: None,
            prev: None,
        }
    }
}

/// Deadline chain with coalescing of equal (rounded) deadlines.
pub struct Chain {
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    resolution: u64,
    linked: usize,
}

impl Chain {
    /// Create an empty chain. Deadlines are rounded up to `resolution`.
    pub fn new(resolution: Duration) -> Self {
        let resolution = u64::try_from(resolution.as_nanos())
            .unwrap_or(u64::MAX)
            .max(1);
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            resolution,
            linked: 0,
        }
    }

    /// Round a deadline up to the next resolution boundary.
    ///
    /// Rounding up (rather than down) keeps the "never early" guarantee: a
    /// node fires at or after every deadline it absorbed.
    pub fn align(&self, when: u64) -> u64 {
        when.div_ceil(self.resolution).saturating_mul(self.resolution)
    }

    /// Number of linked nodes (not holders).
    pub fn len(&self) -> usize {
        self.linked
    }

    pub fn is_empty(&self) -> bool {
        self.linked == 0
    }

    /// Deadline of the earliest node.
    pub fn head(&self) -> Option<u64> {
        self.head.map(|i| self.nodes[i].when)
    }

    /// Deadline of the latest node.
    pub fn tail(&self) -> Option<u64> {
        self.tail.map(|i| self.nodes[i].when)
    }

    /// Next instant the owner has to wake up at, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.head()
    }

    /// Current holder count of a node, or `None` if the key is stale.
    pub fn capacity(&self, key: WaiterKey) -> Option<usize> {
        self.resolve(key).map(|i| self.nodes[i].capacity)
    }

    /// Insert a holder for `when` (nanoseconds on the owner's clock).
    ///
    /// Returns the key of the node the holder shares and a receiver that
    /// flips to `true` once the node fires.
    pub fn insert(&mut self, when: u64) -> (WaiterKey, watch::Receiver<bool>) {
        let when = self.align(when);

        let (head, tail) = match (self.head, self.tail) {
            (Some(head), Some(tail)) => (head, tail),
            _ => {
                let index = self.allocate(when);
                self.head = Some(index);
                self.tail = Some(index);
                return self.handle(index);
            }
        };

        if when < self.nodes[head].when {
            let index = self.allocate(when);
            self.link_before(head, index);
            return self.handle(index);
        }

        if when > self.nodes[tail].when {
            let index = self.allocate(when);
            self.link_after(tail, index);
            return self.handle(index);
        }

        // Somewhere in [head, tail]: walk from whichever end is closer.
        let from_head = when - self.nodes[head].when;
        let from_tail = self.nodes[tail].when - when;

        if from_head <= from_tail {
            let mut cursor = head;
            loop {
                let node = &self.nodes[cursor];
                if node.when == when {
                    return self.share(cursor);
                }
                if node.when > when {
                    let index = self.allocate(when);
                    self.link_before(cursor, index);
                    return self.handle(index);
                }
                match node.next {
                    Some(next) => cursor = next,
                    None => unreachable!("deadline bounded by tail"),
                }
            }
        } else {
            let mut cursor = tail;
            loop {
                let node = &self.nodes[cursor];
                if node.when == when {
                    return self.share(cursor);
                }
                if node.when < when {
                    let index = self.allocate(when);
                    self.link_after(cursor, index);
                    return self.handle(index);
                }
                match node.prev {
                    Some(prev) => cursor = prev,
                    None => unreachable!("deadline bounded by head"),
                }
            }
        }
    }

    /// Drop one holder of `key`. Unlinks the node once nobody holds it.
    ///
    /// Returns `true` if the node was unlinked. Keys of nodes that already
    /// fired or were reused are ignored.
    pub fn cancel(&mut self, key: WaiterKey) -> bool {
        let Some(index) = self.resolve(key) else {
            return false;
        };

        let node = &mut self.nodes[index];
        assert!(node.capacity > 0, "waiter capacity must be greater than zero");
        node.capacity -= 1;
        if node.capacity > 0 {
            return false;
        }

        self.unlink(index);
        self.release(index);
        true
    }

    /// Fire every node due at `now`, earliest first.
    ///
    /// Each fired node is disabled and its signal is raised; `visit` sees the
    /// deadline of each one in ascending order. The nodes stay linked until
    /// [`Chain::unlink_by`] is called with the returned index.
    pub fn retrieve(&mut self, now: u64, mut visit: impl FnMut(u64)) -> Option<usize> {
        let mut last = None;
        let mut cursor = self.head;

        while let Some(index) = cursor {
            let node = &mut self.nodes[index];
            if node.when > now {
                break;
            }
            node.disabled = true;
            if let Some(signal) = &node.signal {
                signal.send_replace(true);
            }
            visit(node.when);
            last = Some(index);
            cursor = node.next;
        }

        last
    }

    /// Detach the head run up to and including `last`.
    pub fn unlink_by(&mut self, last: usize) {
        let rest = self.nodes[last].next;

        let mut cursor = self.head;
        while let Some(index) = cursor {
            cursor = self.nodes[index].next;
            self.linked -= 1;
            self.release(index);
            if index == last {
                break;
            }
        }

        self.head = rest;
        match rest {
            Some(first) => self.nodes[first].prev = None,
            None => self.tail = None,
        }
    }

    /// Fire and detach everything due at `now`. Returns the number of nodes fired.
    pub fn expire(&mut self, now: u64) -> usize {
        let mut fired = 0;
        if let Some(last) = self.retrieve(now, |_| fired += 1) {
            self.unlink_by(last);
        }
        fired
    }

    fn resolve(&self, key: WaiterKey) -> Option<usize> {
        let node = self.nodes.get(key.index)?;
        (node.generation == key.generation && !node.disabled && node.signal.is_some())
            .then_some(key.index)
    }

    fn allocate(&mut self, when: u64) -> usize {
        let (signal, _) = watch::channel(false);
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.nodes.push(Node::vacant());
                self.nodes.len() - 1
            }
        };

        let node = &mut self.nodes[index];
        node.when = when;
        node.capacity = 1;
        node.disabled = false;
        node.signal = Some(signal);
        node.next = None;
        node.prev = None;
        self.linked += 1;
        index
    }

    fn release(&mut self, index: usize) {
        let node = &mut self.nodes[index];
        node.generation = node.generation.wrapping_add(1);
        node.capacity = 0;
        node.disabled = true;
        node.signal = None;
        node.next = None;
        node.prev = None;
        self.free.push(index);
    }

    fn share(&mut self, index: usize) -> (WaiterKey, watch::Receiver<bool>) {
        self.nodes[index].capacity += 1;
        self.handle(index)
    }

    fn handle(&self, index: usize) -> (WaiterKey, watch::Receiver<bool>) {
        let node = &self.nodes[index];
        let receiver = match &node.signal {
            Some(signal) => signal.subscribe(),
            None => unreachable!("handle of vacant node"),
        };
        (
            WaiterKey {
                index,
                generation: node.generation,
            },
            receiver,
        )
    }

    fn link_before(&mut self, at: usize, index: usize) {
        let prev = self.nodes[at].prev;
        self.nodes[index].next = Some(at);
        self.nodes[index].prev = prev;
        self.nodes[at].prev = Some(index);
        match prev {
            Some(prev) => self.nodes[prev].next = Some(index),
            None => self.head = Some(index),
        }
    }

    fn link_after(&mut self, at: usize, index: usize) {
        let next = self.nodes[at].next;
        self.nodes[index].prev = Some(at);
        self.nodes[index].next = next;
        self.nodes[at].next = Some(index);
        match next {
            Some(next) => self.nodes[next].prev = Some(index),
            None => self.tail = Some(index),
        }
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = (self.nodes[index].prev, self.nodes[index].next);
        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.tail = prev,
        }
        self.linked -= 1;
    }
}
