use std::collections::HashMap;

use slab::Slab;
use tandem_core::ConnectionId;

/// Strict FIFO of connections waiting for a peer.
///
/// Entries live in a slab and are threaded into a doubly linked list, with an
/// id-to-slot index alongside so membership tests and removal from the middle
/// (leave, disconnect) stay O(1) without disturbing arrival order.
#[derive(Default)]
pub struct WaitQueue {
    nodes: Slab<Node>,
    index: HashMap<ConnectionId, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

struct Node {
    id: ConnectionId,
    prev: Option<usize>,
    next: Option<usize>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.index.contains_key(&id)
    }

    /// Appends `id` unless it is already waiting. Returns whether it was added.
    pub fn push_back(&mut self, id: ConnectionId) -> bool {
        if self.index.contains_key(&id) {
            return false;
        }
        let key = self.nodes.insert(Node {
            id,
            prev: self.tail,
            next: None,
        });
        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
        self.index.insert(id, key);
        true
    }

    /// Removes and returns the longest-waiting connection.
    pub fn pop_front(&mut self) -> Option<ConnectionId> {
        let head = self.head?;
        Some(self.unlink(head))
    }

    pub fn remove(&mut self, id: ConnectionId) -> bool {
        match self.index.get(&id).copied() {
            Some(key) => {
                self.unlink(key);
                true
            }
            None => false,
        }
    }

    /// Waiting connections, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let key = cursor?;
            let node = &self.nodes[key];
            cursor = node.next;
            Some(node.id)
        })
    }

    fn unlink(&mut self, key: usize) -> ConnectionId {
        let node = self.nodes.remove(key);
        match node.prev {
            Some(prev) => self.nodes[prev].next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.nodes[next].prev = node.prev,
            None => self.tail = node.prev,
        }
        self.index.remove(&node.id);
        node.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(count: usize) -> Vec<ConnectionId> {
        (0..count).map(|_| ConnectionId::new()).collect()
    }

    #[test_timeout::timeout]
    fn pops_in_arrival_order() {
        let ids = ids(4);
        let mut queue = WaitQueue::new();
        for id in &ids {
            assert!(queue.push_back(*id));
        }
        let popped: Vec<_> = std::iter::from_fn(|| queue.pop_front()).collect();
        assert_eq!(popped, ids);
        assert!(queue.is_empty());
    }

    #[test_timeout::timeout]
    fn duplicate_push_keeps_original_position() {
        let ids = ids(3);
        let mut queue = WaitQueue::new();
        queue.push_back(ids[0]);
        queue.push_back(ids[1]);
        assert!(!queue.push_back(ids[0]));
        queue.push_back(ids[2]);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.iter().collect::<Vec<_>>(), ids);
    }

    #[test_timeout::timeout]
    fn removing_from_the_middle_relinks_neighbours() {
        let ids = ids(5);
        let mut queue = WaitQueue::new();
        for id in &ids {
            queue.push_back(*id);
        }
        assert!(queue.remove(ids[2]));
        assert!(queue.remove(ids[4]));
        assert!(queue.remove(ids[0]));
        assert!(!queue.remove(ids[0]));
        assert!(!queue.contains(ids[2]));
        assert_eq!(queue.iter().collect::<Vec<_>>(), vec![ids[1], ids[3]]);

        // Slots freed above are reused without corrupting order.
        let late = ConnectionId::new();
        queue.push_back(late);
        assert_eq!(queue.pop_front(), Some(ids[1]));
        assert_eq!(queue.pop_front(), Some(ids[3]));
        assert_eq!(queue.pop_front(), Some(late));
        assert_eq!(queue.pop_front(), None);
    }
}
